use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rockskip::{RockskipConfig, SearchError, SearchParams, Server, SymbolMatch};
use rockskip_indexer::testing::{LineParser, ScriptedGit};
use rockskip_indexer::{Lock, MemoryStore, ParsedSymbol, Session, Store, SymbolParser};

fn config() -> RockskipConfig {
    RockskipConfig {
        indexing_workers: 2,
        timeout_secs: 10,
        ..RockskipConfig::default()
    }
}

fn spawn(store: &MemoryStore, git: &ScriptedGit, config: &RockskipConfig) -> Server {
    Server::spawn(
        Arc::new(store.clone()),
        Arc::new(git.clone()),
        Arc::new(LineParser),
        config,
    )
}

fn exact(repo: &str, commit: &str, name: &str) -> SearchParams {
    SearchParams {
        repo: repo.to_string(),
        commit: commit.to_string(),
        query: format!("^{name}$"),
        is_regexp: true,
        is_case_sensitive: true,
        ..SearchParams::default()
    }
}

fn paths(matches: &[SymbolMatch]) -> Vec<&str> {
    matches.iter().map(|m| m.path.as_str()).collect()
}

/// Retry while the repository is locked by an indexing run.
async fn search_retrying(server: &Server, params: SearchParams) -> Result<Vec<SymbolMatch>, SearchError> {
    loop {
        match server.search(params.clone()).await {
            Err(SearchError::RepositoryBusy(_)) => tokio::time::sleep(Duration::from_millis(5)).await,
            other => return other,
        }
    }
}

async fn wait_until_idle(server: &Server) {
    for _ in 0..500 {
        if server.pending_index_requests() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("indexing did not finish");
}

/// sym1 in a.txt, b.txt, c.txt; sym2 only in c.txt; then a.txt deleted.
fn scenario(git: &ScriptedGit) -> [String; 4] {
    [
        git.commit("repo", &[("a.txt", Some("sym1\n"))]),
        git.commit("repo", &[("b.txt", Some("sym1\n"))]),
        git.commit("repo", &[("c.txt", Some("sym1\nsym2\n"))]),
        git.commit("repo", &[("a.txt", None)]),
    ]
}

#[tokio::test]
async fn symbols_appear_at_the_commit_that_adds_them() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let [_, c2, c3, _] = scenario(&git);
    let server = spawn(&store, &git, &config());

    assert!(server.search(exact("repo", &c2, "sym2")).await.unwrap().is_empty());

    let found = server.search(exact("repo", &c3, "sym2")).await.unwrap();
    assert_eq!(
        found,
        vec![SymbolMatch {
            name: "sym2".to_string(),
            path: "c.txt".to_string(),
            line: 2,
            character: 0,
            kind: "function".to_string(),
            parent: String::new(),
            language: "Text".to_string(),
            parent_kind: String::new(),
        }]
    );
}

#[tokio::test]
async fn deleted_files_drop_out_of_results() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let [c1, _, c3, c4] = scenario(&git);
    let server = spawn(&store, &git, &config());

    let found = server.search(exact("repo", &c4, "sym1")).await.unwrap();
    assert_eq!(paths(&found), vec!["b.txt", "c.txt"]);

    // Older commits are unaffected by the later deletion.
    let found = server.search(exact("repo", &c3, "sym1")).await.unwrap();
    assert_eq!(paths(&found), vec!["a.txt", "b.txt", "c.txt"]);
    let found = server.search(exact("repo", &c1, "sym1")).await.unwrap();
    assert_eq!(paths(&found), vec!["a.txt"]);
}

#[tokio::test]
async fn limit_and_path_filters_apply() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let [_, _, c3, _] = scenario(&git);
    let server = spawn(&store, &git, &config());

    let mut params = exact("repo", &c3, "sym1");
    params.limit = Some(2);
    assert_eq!(paths(&server.search(params).await.unwrap()), vec!["a.txt", "b.txt"]);

    let mut params = exact("repo", &c3, "sym1");
    params.exclude_pattern = "^a\\.txt$".to_string();
    params.include_patterns = vec!["\\.txt$".to_string()];
    assert_eq!(paths(&server.search(params).await.unwrap()), vec!["b.txt", "c.txt"]);

    let params = SearchParams {
        repo: "repo".to_string(),
        commit: c3.clone(),
        query: "SYM".to_string(),
        ..SearchParams::default()
    };
    assert_eq!(server.search(params).await.unwrap().len(), 4);
}

#[tokio::test]
async fn concurrent_searches_share_one_index_run() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let [_, _, c3, _] = scenario(&git);
    let server = Arc::new(spawn(&store, &git, &config()));

    let searches: Vec<_> = (0..8)
        .map(|_| {
            let server = server.clone();
            let params = exact("repo", &c3, "sym2");
            tokio::spawn(async move { search_retrying(&server, params).await })
        })
        .collect();
    for search in searches {
        let found = search.await.unwrap().unwrap();
        assert_eq!(paths(&found), vec!["c.txt"]);
    }
    assert_eq!(git.log_calls(), 1);
}

#[tokio::test]
async fn searching_while_the_repository_is_locked_is_retryable() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let [_, c2, _, _] = scenario(&git);
    let server = spawn(&store, &git, &config());
    server.index("repo", &c2, None).await.unwrap();

    let mut evicting = store.session().await.unwrap();
    evicting.lock(Lock::Write, "repo").await.unwrap();
    let err = server.search(exact("repo", &c2, "sym1")).await.unwrap_err();
    assert!(matches!(err, SearchError::RepositoryBusy(ref repo) if repo == "repo"));
    assert!(err.is_retryable());

    evicting.unlock(Lock::Write, "repo").await.unwrap();
    assert_eq!(server.search(exact("repo", &c2, "sym1")).await.unwrap().len(), 2);
}

#[tokio::test]
async fn indexing_failures_reach_the_caller() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    git.commit("repo", &[("ok.txt", Some("fine\n"))]);
    let broken = git.commit("repo", &[("bad.txt", Some("!nope\n"))]);
    let server = spawn(&store, &git, &config());

    let err = server.search(exact("repo", &broken, "fine")).await.unwrap_err();
    match err {
        SearchError::IndexingFailed { reason } => assert!(reason.contains("bad.txt"), "{reason}"),
        other => panic!("expected an indexing failure, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_patterns_fail_before_indexing() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let [c1, _, _, _] = scenario(&git);
    let server = spawn(&store, &git, &config());

    let params = SearchParams {
        query: "(unclosed".to_string(),
        is_regexp: true,
        ..exact("repo", &c1, "x")
    };
    assert!(matches!(
        server.search(params).await,
        Err(SearchError::InvalidPattern(_))
    ));
    assert_eq!(git.log_calls(), 0);
}

/// Parses like [`LineParser`] after a delay.
struct SlowParser(Duration);

#[async_trait]
impl SymbolParser for SlowParser {
    async fn parse(&self, path: &str, content: &[u8]) -> Result<Vec<ParsedSymbol>> {
        tokio::time::sleep(self.0).await;
        LineParser.parse(path, content).await
    }
}

#[tokio::test]
async fn timeouts_do_not_cancel_indexing() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let [_, _, c3, _] = scenario(&git);
    let server = Server::spawn(
        Arc::new(store.clone()),
        Arc::new(git.clone()),
        Arc::new(SlowParser(Duration::from_millis(100))),
        &config(),
    );

    let mut params = exact("repo", &c3, "sym2");
    params.timeout = Some(Duration::from_millis(20));
    assert!(matches!(server.search(params).await, Err(SearchError::Timeout)));

    wait_until_idle(&server).await;
    assert_eq!(server.index("repo", &c3, None).await.unwrap(), 0);
    let found = search_retrying(&server, exact("repo", &c3, "sym2")).await.unwrap();
    assert_eq!(paths(&found), vec!["c.txt"]);
}

#[tokio::test]
async fn searches_waiting_on_indexing_hold_no_session() {
    // As many sessions as a small pool would hand out.
    let store = MemoryStore::with_session_limit(3, Duration::from_secs(2));
    let git = ScriptedGit::new();
    let [_, _, c3, _] = scenario(&git);
    let server = Arc::new(Server::spawn(
        Arc::new(store.clone()),
        Arc::new(git.clone()),
        Arc::new(SlowParser(Duration::from_millis(100))),
        &config(),
    ));

    let searches: Vec<_> = (0..8)
        .map(|_| {
            let server = server.clone();
            let params = exact("repo", &c3, "sym2");
            tokio::spawn(async move { search_retrying(&server, params).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(server.pending_index_requests() > 0);
    // The indexing run, and at most a passing evictor.
    assert!(store.open_sessions() <= 2, "{} sessions open", store.open_sessions());

    for search in searches {
        let found = search.await.unwrap().unwrap();
        assert_eq!(paths(&found), vec!["c.txt"]);
    }
}

#[tokio::test]
async fn last_indexed_commit_serves_while_indexing_catches_up() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let [_, c2, c3, _] = scenario(&git);
    let mut config = config();
    config.search_last_indexed_commit = true;
    let server = spawn(&store, &git, &config);
    assert_eq!(server.index("repo", &c2, None).await.unwrap(), 2);

    // c3 is not indexed yet, so c2 answers: no sym2 anywhere.
    let found = search_retrying(&server, exact("repo", &c3, "sym2")).await.unwrap();
    assert!(found.is_empty());

    wait_until_idle(&server).await;
    let found = search_retrying(&server, exact("repo", &c3, "sym2")).await.unwrap();
    assert_eq!(paths(&found), vec!["c.txt"]);
}

#[tokio::test]
async fn eviction_keeps_the_most_recent_repositories() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let mut config = config();
    config.max_repos = 2;
    let server = spawn(&store, &git, &config);

    let repos = ["r1", "r2", "r3", "r4", "r5"];
    for repo in repos {
        let head = git.commit(repo, &[("main.txt", Some(repo))]);
        loop {
            match server.index(repo, &head, None).await {
                Err(SearchError::RepositoryBusy(_)) => tokio::time::sleep(Duration::from_millis(5)).await,
                other => {
                    assert_eq!(other.unwrap(), 1);
                    break;
                }
            }
        }
    }
    server.evict_old_repos().await.unwrap();

    let report = server.status().await.unwrap();
    assert_eq!(report.totals.repos, 2);
    let mut session = store.session().await.unwrap();
    assert_eq!(session.repo_rank("r5").await.unwrap(), Some(1));
    assert_eq!(session.repo_rank("r4").await.unwrap(), Some(2));
    for evicted in ["r1", "r2", "r3"] {
        assert_eq!(session.repo_rank(evicted).await.unwrap(), None);
    }
}

#[tokio::test]
async fn status_lists_nothing_when_idle() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let [c1, _, _, _] = scenario(&git);
    let server = spawn(&store, &git, &config());
    server.index("repo", &c1, None).await.unwrap();

    let report = server.status().await.unwrap();
    assert!(report.operations.is_empty());
    assert_eq!(report.totals.repos, 1);
    assert_eq!(report.totals.commits, 1);
    assert_eq!(report.totals.symbols, 1);
}
