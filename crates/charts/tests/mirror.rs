use std::path::Path;
use std::time::Duration;

use appstore_charts::{ChartCatalog, ChartMirror, MirrorConfig, PullOutcome};
use git2::{IndexAddOption, Repository, RepositoryInitOptions, Signature};
use tokio_util::sync::CancellationToken;

fn write_chart(root: &Path, name: &str, version: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(dir.join("templates")).unwrap();
    std::fs::write(dir.join("Chart.yaml"), format!("apiVersion: v2\nname: {name}\nversion: {version}\n")).unwrap();
    std::fs::write(dir.join("templates/.keep"), "").unwrap();
}

fn commit_all(repo: &Repository, msg: &str) {
    let mut index = repo.index().unwrap();
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("charts", "charts@example.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &parents).unwrap();
}

/// Upstream chart repo with two charts, a non-chart dir and a stray file.
fn upstream(dir: &Path) -> Repository {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(dir, &opts).unwrap();
    write_chart(dir, "postgresql", "12.1.0");
    write_chart(dir, "redis", "18.0.0");
    std::fs::create_dir_all(dir.join("docs")).unwrap();
    std::fs::write(dir.join("docs/index.md"), "# charts\n").unwrap();
    std::fs::write(dir.join("README.md"), "charts\n").unwrap();
    commit_all(&repo, "initial charts");
    repo
}

fn config(upstream: &Path, local: &Path) -> MirrorConfig {
    let mut cfg = MirrorConfig::new(upstream.to_str().unwrap(), local);
    // the local transport cannot do shallow fetches
    cfg.depth = None;
    cfg.sync_interval = Duration::from_secs(3600);
    cfg
}

#[tokio::test]
async fn clone_lists_only_chart_directories() {
    let up = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    upstream(up.path());
    let local = work.path().join("charts");

    let mirror = ChartMirror::new(config(up.path(), &local));
    let token = CancellationToken::new();
    let handle = mirror.start(token.clone()).await.unwrap();

    assert_eq!(mirror.list().await.unwrap(), vec!["postgresql".to_string(), "redis".to_string()]);
    assert!(mirror.state().await.head.is_some());

    // a hidden directory with a descriptor is still not a chart
    write_chart(&local, ".staging", "0.0.1");
    let listed = mirror.list().await.unwrap();
    for name in ["postgresql", "redis", "docs", "README.md", ".git", ".staging", "../charts", "mongodb", ""] {
        assert_eq!(mirror.exists(name).await, listed.iter().any(|n| n == name), "exists/list disagree on {name:?}");
    }

    assert_eq!(mirror.path("redis").await, Some(local.join("redis")));
    assert_eq!(mirror.path("docs").await, None);
    assert_eq!(mirror.descriptor("redis").await.unwrap().version, "18.0.0");

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn pull_picks_up_new_charts() {
    let up = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let repo = upstream(up.path());

    let mirror = ChartMirror::new(config(up.path(), &work.path().join("charts")));
    let token = CancellationToken::new();
    mirror.start(token.clone()).await.unwrap();
    assert!(!mirror.exists("mongodb").await);

    write_chart(up.path(), "mongodb", "14.0.0");
    commit_all(&repo, "add mongodb");

    let outcome = mirror.force_sync().await.unwrap();
    assert!(matches!(outcome, PullOutcome::Updated { .. }), "{outcome:?}");
    assert!(mirror.exists("mongodb").await);
    assert_eq!(mirror.state().await.head.as_deref(), Some(outcome.head()));

    assert!(matches!(mirror.pull().await.unwrap(), PullOutcome::UpToDate { .. }));
    token.cancel();
}

#[tokio::test]
async fn unusable_local_copy_is_recloned() {
    let up = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    upstream(up.path());
    let local = work.path().join("charts");

    // leftovers that are not a repository at all
    std::fs::create_dir_all(local.join(".git")).unwrap();
    std::fs::write(local.join("garbage"), "x").unwrap();

    let mirror = ChartMirror::new(config(up.path(), &local));
    let token = CancellationToken::new();
    mirror.start(token.clone()).await.unwrap();

    assert!(!local.join("garbage").exists());
    assert_eq!(mirror.list().await.unwrap(), vec!["postgresql".to_string(), "redis".to_string()]);
    token.cancel();
}

#[tokio::test]
async fn existing_copy_is_reused_and_refreshed() {
    let up = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let repo = upstream(up.path());
    let local = work.path().join("charts");

    let first = ChartMirror::new(config(up.path(), &local));
    let token = CancellationToken::new();
    first.start(token.clone()).await.unwrap();
    token.cancel();

    write_chart(up.path(), "kafka", "26.0.0");
    commit_all(&repo, "add kafka");

    let second = ChartMirror::new(config(up.path(), &local));
    let token = CancellationToken::new();
    second.start(token.clone()).await.unwrap();
    assert!(second.exists("kafka").await);
    token.cancel();
}

#[tokio::test]
async fn failed_pull_keeps_serving_previous_copy() {
    let up = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    upstream(up.path());

    let mirror = ChartMirror::new(config(up.path(), &work.path().join("charts")));
    let token = CancellationToken::new();
    mirror.start(token.clone()).await.unwrap();

    std::fs::remove_dir_all(up.path()).unwrap();
    assert!(mirror.pull().await.is_err());
    assert!(mirror.state().await.last_error.is_some());
    assert_eq!(mirror.list().await.unwrap(), vec!["postgresql".to_string(), "redis".to_string()]);
    token.cancel();
}

#[tokio::test]
async fn start_fails_without_reachable_upstream() {
    let work = tempfile::tempdir().unwrap();
    let missing = work.path().join("nope");
    let mirror = ChartMirror::new(config(&missing, &work.path().join("charts")));
    assert!(mirror.start(CancellationToken::new()).await.is_err());
}
