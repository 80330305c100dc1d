//! PostgreSQL backend. Locks are session-level advisory locks keyed by
//! `(namespace, repo_key)`, so each [`PostgresSession`] pins one pooled
//! connection for its lifetime.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, warn};

use super::{Lock, Session, Store, repo_key};
use crate::error::{StoreError, StoreResult};
use crate::query::{Condition, SymbolQuery, like_escape};
use crate::regex_dialect;
use crate::types::{CommitId, CommitNode, HopColumn, RepoId, StoreStats, SymbolId};

const SCHEMA: &str = include_str!("schema.sql");
const UNIQUE_VIOLATION: &str = "23505";

const RANKED_REPOS: &str = "SELECT repo, last_accessed_at, \
     RANK() OVER (ORDER BY last_accessed_at DESC) AS repo_rank \
     FROM rockskip_repos";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    log_queries: bool,
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            log_queries: false,
        }
    }

    /// Log every planned search query and its SQL at debug level.
    pub fn with_log_queries(mut self, log_queries: bool) -> Self {
        self.log_queries = log_queries;
        self
    }

    /// Create tables, indexes and helper functions if they are missing.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn session(&self) -> StoreResult<Box<dyn Session>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PostgresSession {
            conn: Some(conn),
            held: 0,
            in_tx: false,
            log_queries: self.log_queries,
        }))
    }
}

pub struct PostgresSession {
    conn: Option<PoolConnection<Postgres>>,
    held: usize,
    in_tx: bool,
    log_queries: bool,
}

impl PostgresSession {
    fn conn(&mut self) -> StoreResult<&mut PgConnection> {
        self.conn
            .as_mut()
            .map(|conn| &mut **conn)
            .ok_or(StoreError::Closed)
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        if self.held == 0 && !self.in_tx {
            return;
        }
        // Advisory locks and open transactions are scoped to the backend
        // connection; closing it is the only way to release them without
        // an await.
        if let Some(conn) = self.conn.take() {
            warn!(
                locks = self.held,
                in_transaction = self.in_tx,
                "closing session connection with outstanding state"
            );
            drop(conn.detach());
        }
    }
}

fn ids(commits: &[CommitId]) -> Vec<i32> {
    commits.iter().map(|commit| commit.0).collect()
}

fn height_from_db(height: i32) -> u32 {
    u32::try_from(height).unwrap_or_default()
}

#[async_trait]
impl Session for PostgresSession {
    async fn try_lock(&mut self, lock: Lock, repo: &str) -> StoreResult<bool> {
        let sql = if lock.shared() {
            "SELECT pg_try_advisory_lock_shared($1, $2)"
        } else {
            "SELECT pg_try_advisory_lock($1, $2)"
        };
        let acquired: bool = sqlx::query_scalar(sql)
            .bind(lock.namespace())
            .bind(repo_key(repo))
            .fetch_one(self.conn()?)
            .await?;
        if acquired {
            self.held += 1;
        }
        Ok(acquired)
    }

    async fn lock(&mut self, lock: Lock, repo: &str) -> StoreResult<()> {
        let sql = if lock.shared() {
            "SELECT pg_advisory_lock_shared($1, $2)"
        } else {
            "SELECT pg_advisory_lock($1, $2)"
        };
        sqlx::query(sql)
            .bind(lock.namespace())
            .bind(repo_key(repo))
            .execute(self.conn()?)
            .await?;
        self.held += 1;
        Ok(())
    }

    async fn unlock(&mut self, lock: Lock, repo: &str) -> StoreResult<()> {
        let sql = if lock.shared() {
            "SELECT pg_advisory_unlock_shared($1, $2)"
        } else {
            "SELECT pg_advisory_unlock($1, $2)"
        };
        let released: bool = sqlx::query_scalar(sql)
            .bind(lock.namespace())
            .bind(repo_key(repo))
            .fetch_one(self.conn()?)
            .await?;
        if !released {
            return Err(StoreError::LockNotHeld(format!("{lock}({repo})")));
        }
        self.held = self.held.saturating_sub(1);
        Ok(())
    }

    async fn begin(&mut self) -> StoreResult<()> {
        if self.in_tx {
            return Err(StoreError::NestedTransaction);
        }
        sqlx::Executor::execute(self.conn()?, sqlx::raw_sql("BEGIN")).await?;
        self.in_tx = true;
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        if !self.in_tx {
            return Err(StoreError::NoTransaction);
        }
        sqlx::Executor::execute(self.conn()?, sqlx::raw_sql("COMMIT")).await?;
        self.in_tx = false;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if !self.in_tx {
            return Err(StoreError::NoTransaction);
        }
        sqlx::Executor::execute(self.conn()?, sqlx::raw_sql("ROLLBACK")).await?;
        self.in_tx = false;
        Ok(())
    }

    async fn touch_repo(&mut self, repo: &str) -> StoreResult<RepoId> {
        let id: i32 = sqlx::query_scalar(
            "INSERT INTO rockskip_repos (repo, last_accessed_at) \
             VALUES ($1, clock_timestamp()) \
             ON CONFLICT (repo) DO UPDATE SET last_accessed_at = clock_timestamp() \
             RETURNING id",
        )
        .bind(repo)
        .fetch_one(self.conn()?)
        .await?;
        Ok(RepoId(id))
    }

    async fn find_repo(&mut self, repo: &str) -> StoreResult<Option<RepoId>> {
        let id: Option<i32> = sqlx::query_scalar("SELECT id FROM rockskip_repos WHERE repo = $1")
            .bind(repo)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(id.map(RepoId))
    }

    async fn get_commit(&mut self, repo_id: RepoId, hash: &str) -> StoreResult<Option<CommitNode>> {
        let row: Option<(i32, i32)> = sqlx::query_as(
            "SELECT id, height FROM rockskip_ancestry WHERE repo_id = $1 AND commit_id = $2",
        )
        .bind(repo_id.0)
        .bind(hash)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(row.map(|(id, height)| CommitNode {
            id: CommitId(id),
            hash: hash.to_string(),
            height: height_from_db(height),
        }))
    }

    async fn insert_commit(
        &mut self,
        repo_id: RepoId,
        hash: &str,
        height: u32,
        ancestor: CommitId,
    ) -> StoreResult<CommitId> {
        let height = i32::try_from(height).map_err(|_| StoreError::HeightOutOfRange(height))?;
        let inserted: Result<i32, sqlx::Error> = sqlx::query_scalar(
            "INSERT INTO rockskip_ancestry (commit_id, repo_id, height, ancestor) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(hash)
        .bind(repo_id.0)
        .bind(height)
        .bind(ancestor.0)
        .fetch_one(self.conn()?)
        .await;
        match inserted {
            Ok(id) => Ok(CommitId(id)),
            Err(sqlx::Error::Database(err)) if err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(StoreError::DuplicateCommit(hash.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_hops(&mut self, commit: CommitId) -> StoreResult<Vec<CommitId>> {
        let hops: Vec<i32> = sqlx::query_scalar(
            "WITH RECURSIVE hops(id, ancestor, height) AS ( \
                 SELECT id, ancestor, height FROM rockskip_ancestry WHERE id = $1 \
                 UNION \
                 SELECT a.id, a.ancestor, a.height \
                 FROM rockskip_ancestry a JOIN hops ON a.id = hops.ancestor \
             ) \
             SELECT id FROM hops ORDER BY height DESC",
        )
        .bind(commit.0)
        .fetch_all(self.conn()?)
        .await?;
        if hops.is_empty() {
            return Err(StoreError::UnknownCommit(commit));
        }
        Ok(hops.into_iter().map(CommitId).collect())
    }

    async fn append_hop(
        &mut self,
        repo_id: RepoId,
        hops: &[CommitId],
        column: HopColumn,
        commit: CommitId,
    ) -> StoreResult<u64> {
        let column = column.column();
        let sql = format!(
            "UPDATE rockskip_symbols SET {column} = array_append({column}, $1) \
             WHERE repo_id = $2 AND {column} && $3"
        );
        let result = sqlx::query(&sql)
            .bind(commit.0)
            .bind(repo_id.0)
            .bind(ids(hops))
            .execute(self.conn()?)
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_symbol(
        &mut self,
        repo_id: RepoId,
        path: &str,
        name: &str,
        hop: CommitId,
        visible_at: &[CommitId],
    ) -> StoreResult<Option<SymbolId>> {
        let id: Option<i32> = sqlx::query_scalar(
            "SELECT id FROM rockskip_symbols \
             WHERE repo_id = $1 AND path = $2 AND name = $3 \
               AND $4 = ANY(added) AND NOT (deleted && $5) \
             LIMIT 1",
        )
        .bind(repo_id.0)
        .bind(path)
        .bind(name)
        .bind(hop.0)
        .bind(ids(visible_at))
        .fetch_optional(self.conn()?)
        .await?;
        Ok(id.map(SymbolId))
    }

    async fn insert_symbol(
        &mut self,
        repo_id: RepoId,
        commit: CommitId,
        path: &str,
        name: &str,
    ) -> StoreResult<SymbolId> {
        let id: i32 = sqlx::query_scalar(
            "INSERT INTO rockskip_symbols (added, deleted, repo_id, path, name) \
             VALUES (ARRAY[$1]::integer[], '{}', $2, $3, $4) RETURNING id",
        )
        .bind(commit.0)
        .bind(repo_id.0)
        .bind(path)
        .bind(name)
        .fetch_one(self.conn()?)
        .await?;
        Ok(SymbolId(id))
    }

    async fn mark_deleted(&mut self, symbol: SymbolId, commit: CommitId) -> StoreResult<()> {
        sqlx::query("UPDATE rockskip_symbols SET deleted = array_append(deleted, $1) WHERE id = $2")
            .bind(commit.0)
            .bind(symbol.0)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn delete_redundant(&mut self, repo_id: RepoId, commit: CommitId) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE rockskip_symbols \
             SET added = array_remove(added, $1), deleted = array_remove(deleted, $1) \
             WHERE repo_id = $2 AND added @> ARRAY[$1]::integer[] AND deleted @> ARRAY[$1]::integer[]",
        )
        .bind(commit.0)
        .bind(repo_id.0)
        .execute(self.conn()?)
        .await?;
        Ok(result.rows_affected())
    }

    async fn search_paths(
        &mut self,
        repo_id: RepoId,
        hops: &[CommitId],
        query: &SymbolQuery,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let hops = ids(hops);
        let mut builder =
            QueryBuilder::<Postgres>::new("SELECT DISTINCT path FROM rockskip_symbols WHERE repo_id = ");
        builder.push_bind(repo_id.0);
        builder.push(" AND added && ");
        builder.push_bind(hops.clone());
        builder.push(" AND NOT (deleted && ");
        builder.push_bind(hops);
        builder.push(")");
        if let Some(name) = &query.name {
            push_condition(&mut builder, "name", name, false)?;
        }
        for include in &query.include {
            push_condition(&mut builder, "path", include, false)?;
        }
        if let Some(exclude) = &query.exclude {
            push_condition(&mut builder, "path", exclude, true)?;
        }
        builder.push(" ORDER BY path LIMIT ");
        builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        if self.log_queries {
            debug!(query = ?query, sql = builder.sql(), "symbol search");
        }

        let paths = builder
            .build_query_scalar::<String>()
            .fetch_all(self.conn()?)
            .await?;
        Ok(paths)
    }

    async fn evictable_repo(&mut self, max_repos: usize) -> StoreResult<Option<String>> {
        let sql = format!(
            "SELECT repo FROM ({RANKED_REPOS}) ranked \
             WHERE repo_rank > $1 ORDER BY last_accessed_at ASC LIMIT 1"
        );
        let repo: Option<String> = sqlx::query_scalar(&sql)
            .bind(i64::try_from(max_repos).unwrap_or(i64::MAX))
            .fetch_optional(self.conn()?)
            .await?;
        Ok(repo)
    }

    async fn repo_rank(&mut self, repo: &str) -> StoreResult<Option<usize>> {
        let sql = format!("SELECT repo_rank FROM ({RANKED_REPOS}) ranked WHERE repo = $1");
        let rank: Option<i64> = sqlx::query_scalar(&sql)
            .bind(repo)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(rank.map(|rank| usize::try_from(rank).unwrap_or(usize::MAX)))
    }

    async fn delete_repo(&mut self, repo: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let id: Option<i32> = sqlx::query_scalar("SELECT id FROM rockskip_repos WHERE repo = $1")
            .bind(repo)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(id) = id else {
            return Ok(());
        };
        sqlx::query("DELETE FROM rockskip_ancestry WHERE repo_id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM rockskip_symbols WHERE repo_id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM rockskip_repos WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn stats(&mut self) -> StoreResult<StoreStats> {
        let (repos, commits, symbols): (i64, i64, i64) = sqlx::query_as(
            "SELECT \
                 (SELECT COUNT(*) FROM rockskip_repos), \
                 (SELECT COUNT(*) FROM rockskip_ancestry WHERE id <> 0), \
                 (SELECT COUNT(*) FROM rockskip_symbols)",
        )
        .fetch_one(self.conn()?)
        .await?;
        Ok(StoreStats {
            repos,
            commits,
            symbols,
        })
    }
}

fn push_condition(
    builder: &mut QueryBuilder<'_, Postgres>,
    column: &'static str,
    condition: &Condition,
    negate: bool,
) -> StoreResult<()> {
    builder.push(if negate { " AND NOT (" } else { " AND (" });
    match condition {
        Condition::Exact {
            value,
            case_sensitive: true,
        } => {
            builder.push(column).push(" = ").push_bind(value.clone());
        }
        Condition::Exact {
            value,
            case_sensitive: false,
        } => {
            builder
                .push(format!("lower({column}) = lower("))
                .push_bind(value.clone())
                .push(")");
        }
        Condition::Prefix {
            value,
            case_sensitive,
        } => {
            let op = if *case_sensitive { " LIKE " } else { " ILIKE " };
            builder
                .push(column)
                .push(op)
                .push_bind(format!("{}%", like_escape(value)));
        }
        Condition::Extension {
            extensions,
            case_sensitive: true,
        } => {
            builder
                .push(format!("get_file_extension({column}) = ANY("))
                .push_bind(extensions.clone())
                .push(")");
        }
        Condition::Extension {
            extensions,
            case_sensitive: false,
        } => {
            let lowered: Vec<String> = extensions.iter().map(|ext| ext.to_lowercase()).collect();
            builder
                .push(format!("lower(get_file_extension({column})) = ANY("))
                .push_bind(lowered)
                .push(")");
        }
        Condition::Regex {
            pattern,
            case_sensitive,
        } => {
            let op = if *case_sensitive { " ~ " } else { " ~* " };
            builder
                .push(column)
                .push(op)
                .push_bind(regex_dialect::to_postgres(pattern)?);
        }
    }
    builder.push(")");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql_for(query: &SymbolQuery) -> String {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 WHERE TRUE");
        if let Some(name) = &query.name {
            push_condition(&mut builder, "name", name, false).unwrap();
        }
        for include in &query.include {
            push_condition(&mut builder, "path", include, false).unwrap();
        }
        if let Some(exclude) = &query.exclude {
            push_condition(&mut builder, "path", exclude, true).unwrap();
        }
        builder.sql().to_string()
    }

    #[test]
    fn exact_and_prefix_avoid_regex_operators() {
        let query = SymbolQuery::plan("^Foo$", true, true, &["^src/".to_string()], "");
        let sql = sql_for(&query);
        assert_eq!(sql, "SELECT 1 WHERE TRUE AND (name = $1) AND (path LIKE $2)");
    }

    #[test]
    fn case_insensitive_conditions_fold_case() {
        let query = SymbolQuery::plan("^foo$", true, false, &["^src/".to_string()], "");
        let sql = sql_for(&query);
        assert_eq!(
            sql,
            "SELECT 1 WHERE TRUE AND (lower(name) = lower($1)) AND (path ILIKE $2)"
        );
    }

    #[test]
    fn exclude_is_negated_and_regex_falls_back_to_tilde() {
        let query = SymbolQuery::plan("a.c", true, true, &[], r"\.(go|rs)$");
        let sql = sql_for(&query);
        assert_eq!(
            sql,
            "SELECT 1 WHERE TRUE AND (name ~ $1) AND NOT (get_file_extension(path) = ANY($2))"
        );
    }

    #[test]
    fn plain_substring_search_is_a_folded_regex() {
        let query = SymbolQuery::plan("x", false, false, &[], "");
        assert_eq!(sql_for(&query), "SELECT 1 WHERE TRUE AND (name ~* $1)");
        assert_eq!(sql_for(&SymbolQuery::default()), "SELECT 1 WHERE TRUE");
    }

    #[test]
    fn regex_conditions_need_a_postgres_equivalent() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 WHERE TRUE");
        let named = Condition::Regex {
            pattern: "(?P<verb>get|set)\\w+\\b".to_string(),
            case_sensitive: true,
        };
        push_condition(&mut builder, "name", &named, false).unwrap();
        assert_eq!(builder.sql(), "SELECT 1 WHERE TRUE AND (name ~ $1)");

        let unicode = Condition::Regex {
            pattern: "\\p{Greek}+".to_string(),
            case_sensitive: true,
        };
        assert!(matches!(
            push_condition(&mut builder, "name", &unicode, false),
            Err(StoreError::InvalidPattern(_))
        ));
    }

    /// Runs only when `ROCKSKIP_TEST_DATABASE_URL` points at a scratch
    /// database with the intarray and pg_trgm extensions available.
    async fn test_store() -> Option<PostgresStore> {
        let url = std::env::var("ROCKSKIP_TEST_DATABASE_URL").ok()?;
        let store = PostgresStore::connect(&url, 4).await.unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    #[tokio::test]
    async fn advisory_locks_conflict_across_sessions() {
        let Some(store) = test_store().await else {
            return;
        };
        let repo = format!("test/locks/{}", std::process::id());
        let mut a = store.session().await.unwrap();
        let mut b = store.session().await.unwrap();

        assert!(a.try_lock(Lock::Read, &repo).await.unwrap());
        assert!(b.try_lock(Lock::Read, &repo).await.unwrap());
        assert!(!b.try_lock(Lock::Write, &repo).await.unwrap());
        assert!(b.try_lock(Lock::Indexing, &repo).await.unwrap());
        a.unlock(Lock::Read, &repo).await.unwrap();
        b.unlock(Lock::Read, &repo).await.unwrap();
        b.unlock(Lock::Indexing, &repo).await.unwrap();
        assert!(matches!(
            a.unlock(Lock::Read, &repo).await,
            Err(StoreError::LockNotHeld(_))
        ));
    }

    #[tokio::test]
    async fn hops_and_visibility_round_trip() {
        let Some(store) = test_store().await else {
            return;
        };
        let repo = format!("test/hops/{}", std::process::id());
        let mut session = store.session().await.unwrap();
        session.delete_repo(&repo).await.unwrap();

        let repo_id = session.touch_repo(&repo).await.unwrap();
        session.begin().await.unwrap();
        let c1 = session
            .insert_commit(repo_id, "c1", 1, CommitId::ROOT)
            .await
            .unwrap();
        let c2 = session.insert_commit(repo_id, "c2", 2, CommitId::ROOT).await.unwrap();
        let id = session.insert_symbol(repo_id, c1, "a.go", "Foo").await.unwrap();
        session
            .append_hop(repo_id, &[c1], HopColumn::Added, c2)
            .await
            .unwrap();
        session.commit().await.unwrap();

        assert_eq!(session.get_hops(c2).await.unwrap(), vec![c2, CommitId::ROOT]);
        assert_eq!(
            session
                .find_symbol(repo_id, "a.go", "Foo", c2, &[c2, CommitId::ROOT])
                .await
                .unwrap(),
            Some(id)
        );
        let query = SymbolQuery::plan("^Foo$", true, true, &[], "");
        assert_eq!(
            session
                .search_paths(repo_id, &[c2, CommitId::ROOT], &query, 10)
                .await
                .unwrap(),
            vec!["a.go".to_string()]
        );
        assert!(matches!(
            session.insert_commit(repo_id, "c1", 1, CommitId::ROOT).await,
            Err(StoreError::DuplicateCommit(_))
        ));

        session.delete_repo(&repo).await.unwrap();
        assert_eq!(session.repo_rank(&repo).await.unwrap(), None);
    }
}
