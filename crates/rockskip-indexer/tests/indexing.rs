use std::collections::BTreeSet;
use std::sync::Arc;

use rockskip_indexer::testing::{LineParser, ScriptedGit};
use rockskip_indexer::{
    CommitId, IndexError, Indexer, IndexerConfig, Lock, MemoryStore, Session, Store, SymbolQuery,
};

fn indexer(store: &MemoryStore, git: &ScriptedGit) -> Indexer {
    Indexer::new(
        Arc::new(store.clone()),
        Arc::new(git.clone()),
        Arc::new(LineParser),
        IndexerConfig::default(),
    )
}

/// Paths defining `name` at `commit`, as the index sees them.
async fn paths_defining(store: &MemoryStore, repo: &str, commit: &str, name: &str) -> Vec<String> {
    let mut session = store.session().await.unwrap();
    let repo_id = session.find_repo(repo).await.unwrap().expect("repo indexed");
    let node = session
        .get_commit(repo_id, commit)
        .await
        .unwrap()
        .expect("commit indexed");
    let hops = session.get_hops(node.id).await.unwrap();
    let query = SymbolQuery::plan(&format!("^{}$", regex::escape(name)), true, true, &[], "");
    session
        .search_paths(repo_id, &hops, &query, 1000)
        .await
        .unwrap()
}

/// Paths defining `name` at `commit`, straight from the scripted files.
fn expected_paths(git: &ScriptedGit, repo: &str, commit: &str, name: &str) -> Vec<String> {
    git.files_at(repo, commit)
        .into_iter()
        .filter(|(_, content)| content.lines().any(|line| line.trim() == name))
        .map(|(path, _)| path)
        .collect()
}

#[tokio::test]
async fn added_modified_and_deleted_paths() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let repo = "github.com/acme/widgets";
    let c1 = git.commit(repo, &[("a.go", Some("Foo\nBar")), ("b.go", Some("Baz"))]);
    let c2 = git.commit(repo, &[("a.go", Some("Foo\nQux"))]);
    let c3 = git.commit(repo, &[("b.go", None)]);

    let outcome = indexer(&store, &git).index(repo, &c3, &()).await.unwrap();
    assert_eq!(outcome.indexed, 3);

    assert_eq!(paths_defining(&store, repo, &c1, "Bar").await, vec!["a.go"]);
    assert!(paths_defining(&store, repo, &c2, "Bar").await.is_empty());
    assert_eq!(paths_defining(&store, repo, &c2, "Qux").await, vec!["a.go"]);
    assert_eq!(paths_defining(&store, repo, &c3, "Foo").await, vec!["a.go"]);
    assert_eq!(paths_defining(&store, repo, &c2, "Baz").await, vec!["b.go"]);
    assert!(paths_defining(&store, repo, &c3, "Baz").await.is_empty());
}

#[tokio::test]
async fn reindexing_is_a_no_op() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let repo = "github.com/acme/noop";
    git.commit(repo, &[("a.rs", Some("main"))]);
    let head = git.commit(repo, &[("b.rs", Some("helper"))]);

    let indexer = indexer(&store, &git);
    assert_eq!(indexer.index(repo, &head, &()).await.unwrap().indexed, 2);
    let stats = store.session().await.unwrap().stats().await.unwrap();
    let log_calls = git.log_calls();
    let archive_calls = git.archive_calls();

    assert_eq!(indexer.index(repo, &head, &()).await.unwrap().indexed, 0);
    let again = store.session().await.unwrap().stats().await.unwrap();
    assert_eq!(again.commits, stats.commits);
    assert_eq!(again.symbols, stats.symbols);
    assert_eq!(git.log_calls(), log_calls);
    assert_eq!(git.archive_calls(), archive_calls);
}

#[tokio::test]
async fn indexing_resumes_from_the_last_indexed_commit() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let repo = "github.com/acme/resume";
    let mut hashes = Vec::new();
    for i in 0..5 {
        let path = format!("f{i}.py");
        let content = format!("fn_{i}");
        hashes.push(git.commit(repo, &[(path.as_str(), Some(content.as_str()))]));
    }

    let indexer = indexer(&store, &git);
    assert_eq!(indexer.index(repo, &hashes[1], &()).await.unwrap().indexed, 2);
    assert_eq!(indexer.index(repo, &hashes[4], &()).await.unwrap().indexed, 3);
    assert_eq!(paths_defining(&store, repo, &hashes[4], "fn_0").await, vec!["f0.py"]);
    assert!(paths_defining(&store, repo, &hashes[1], "fn_3").await.is_empty());
}

#[tokio::test]
async fn hop_chains_stay_logarithmic() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let repo = "github.com/acme/hops";
    let mut head = String::new();
    for i in 0..7 {
        let content = format!("s{i}");
        head = git.commit(repo, &[("x.c", Some(content.as_str()))]);
    }
    indexer(&store, &git).index(repo, &head, &()).await.unwrap();

    let mut session = store.session().await.unwrap();
    let repo_id = session.find_repo(repo).await.unwrap().unwrap();
    let node = session.get_commit(repo_id, &head).await.unwrap().unwrap();
    assert_eq!(node.height, 7);
    let hops = session.get_hops(node.id).await.unwrap();
    assert_eq!(hops.len(), 4);
    assert_eq!(hops.first(), Some(&node.id));
    assert_eq!(hops.last(), Some(&CommitId::ROOT));
}

#[tokio::test]
async fn re_added_symbols_get_a_fresh_row() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let repo = "github.com/acme/readd";
    let c1 = git.commit(repo, &[("a.ts", Some("Widget"))]);
    let c2 = git.commit(repo, &[("a.ts", None)]);
    let c3 = git.commit(repo, &[("a.ts", Some("Widget"))]);
    let c4 = git.commit(repo, &[("a.ts", Some("Gadget"))]);

    indexer(&store, &git).index(repo, &c4, &()).await.unwrap();

    assert_eq!(paths_defining(&store, repo, &c1, "Widget").await, vec!["a.ts"]);
    assert!(paths_defining(&store, repo, &c2, "Widget").await.is_empty());
    assert_eq!(paths_defining(&store, repo, &c3, "Widget").await, vec!["a.ts"]);
    assert!(paths_defining(&store, repo, &c4, "Widget").await.is_empty());
}

#[tokio::test]
async fn parse_failure_rolls_back_the_commit_in_flight() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let repo = "github.com/acme/broken";
    let c1 = git.commit(repo, &[("ok.go", Some("Fine"))]);
    let c2 = git.commit(repo, &[("bad.go", Some("Half\n!garbage"))]);

    let err = indexer(&store, &git).index(repo, &c2, &()).await.unwrap_err();
    assert!(matches!(err, IndexError::Parse { ref path, .. } if path == "bad.go"));

    let mut session = store.session().await.unwrap();
    let repo_id = session.find_repo(repo).await.unwrap().unwrap();
    assert!(session.get_commit(repo_id, &c1).await.unwrap().is_some());
    assert!(session.get_commit(repo_id, &c2).await.unwrap().is_none());
    assert_eq!(session.stats().await.unwrap().symbols, 1);

    // Both locks were released.
    assert!(session.try_lock(Lock::Write, repo).await.unwrap());
    assert!(session.try_lock(Lock::Indexing, repo).await.unwrap());
}

#[tokio::test]
async fn unknown_revision_is_a_git_error() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let repo = "github.com/acme/missing";
    git.commit(repo, &[("a.go", Some("A"))]);

    let err = indexer(&store, &git)
        .index(repo, "deadbeef", &())
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Git(_)));
}

/// Deterministic pseudo-random edit script over a handful of files.
fn scripted_history(git: &ScriptedGit, repo: &str, commits: usize) -> Vec<String> {
    const NAMES: [&str; 8] = ["alpha", "beta", "gamma", "delta", "eps", "zeta", "eta", "theta"];
    const PATHS: [&str; 5] = ["src/a.rs", "src/b.rs", "lib/c.go", "d.py", "e.ts"];
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    let mut hashes = Vec::new();
    for _ in 0..commits {
        let mut edits: Vec<(String, Option<String>)> = Vec::new();
        for path in PATHS {
            match next() % 4 {
                0 => edits.push((path.to_string(), None)),
                1 | 2 => {
                    let names: Vec<&str> = NAMES
                        .iter()
                        .copied()
                        .filter(|_| next() % 3 == 0)
                        .collect();
                    edits.push((path.to_string(), Some(names.join("\n"))));
                }
                _ => {}
            }
        }
        let borrowed: Vec<(&str, Option<&str>)> = edits
            .iter()
            .map(|(path, content)| (path.as_str(), content.as_deref()))
            .collect();
        hashes.push(git.commit(repo, &borrowed));
    }
    hashes
}

#[tokio::test]
async fn every_indexed_commit_matches_ground_truth() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let repo = "github.com/acme/fuzz";
    let hashes = scripted_history(&git, repo, 40);
    let names = ["alpha", "beta", "gamma", "delta", "eps", "zeta", "eta", "theta"];

    let indexer = indexer(&store, &git);
    for stop in [9usize, 24, 39] {
        indexer.index(repo, &hashes[stop], &()).await.unwrap();
        for hash in &hashes[..=stop] {
            for name in names {
                assert_eq!(
                    paths_defining(&store, repo, hash, name).await,
                    expected_paths(&git, repo, hash, name),
                    "{name} at {hash}"
                );
            }
        }
    }
}

#[tokio::test]
async fn no_row_keeps_a_commit_in_both_arrays() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let repo = "github.com/acme/redundant";
    let hashes = scripted_history(&git, repo, 20);
    indexer(&store, &git)
        .index(repo, &hashes[19], &())
        .await
        .unwrap();

    let mut session = store.session().await.unwrap();
    let repo_id = session.find_repo(repo).await.unwrap().unwrap();
    let mut seen = BTreeSet::new();
    for hash in &hashes {
        let node = session.get_commit(repo_id, hash).await.unwrap().unwrap();
        assert!(seen.insert(node.id));
        assert_eq!(session.delete_redundant(repo_id, node.id).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn small_caches_do_not_change_results() {
    let store = MemoryStore::new();
    let git = ScriptedGit::new();
    let repo = "github.com/acme/tiny-cache";
    let hashes = scripted_history(&git, repo, 15);
    let indexer = Indexer::new(
        Arc::new(store.clone()),
        Arc::new(git.clone()),
        Arc::new(LineParser),
        IndexerConfig {
            symbols_cache_size: 1,
            path_symbols_cache_size: 1,
            max_total_paths_length: 4,
        },
    );
    indexer.index(repo, &hashes[14], &()).await.unwrap();

    for hash in &hashes {
        for name in ["alpha", "theta"] {
            assert_eq!(
                paths_defining(&store, repo, hash, name).await,
                expected_paths(&git, repo, hash, name)
            );
        }
    }
}
