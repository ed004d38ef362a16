//! Blocking git2 operations. Callers run these on the blocking pool.

use std::path::Path;

use anyhow::{Context, Result};
use git2::{build::CheckoutBuilder, build::RepoBuilder, FetchOptions, Repository, ResetType};
use tracing::{debug, info, warn};

use crate::{MirrorConfig, PullOutcome};

fn branch_refspec(branch: &str) -> String {
    format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch)
}

fn fetch_options<'cb>(depth: Option<i32>) -> FetchOptions<'cb> {
    let mut fo = FetchOptions::new();
    if let Some(d) = depth {
        fo.depth(d);
    }
    fo
}

/// Reuse an existing working copy when it still pulls cleanly, otherwise
/// wipe the directory and clone afresh. Returns the checked-out commit.
pub(crate) fn open_or_clone(cfg: &MirrorConfig) -> Result<String> {
    let path = cfg.local_path.as_path();
    if path.join(".git").exists() {
        match pull(path, &cfg.branch, cfg.depth) {
            Ok(outcome) => {
                info!(path = %path.display(), head = %outcome.head(), "reusing existing chart mirror");
                return Ok(outcome.head().to_string());
            }
            Err(e) => warn!(path = %path.display(), error = %e, "existing chart mirror unusable; re-cloning"),
        }
    }
    if path.exists() {
        std::fs::remove_dir_all(path).with_context(|| format!("removing stale mirror at {}", path.display()))?;
    }
    clone(cfg)
}

fn clone(cfg: &MirrorConfig) -> Result<String> {
    let path = cfg.local_path.as_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let refspec = branch_refspec(&cfg.branch);
    let mut builder = RepoBuilder::new();
    builder.branch(&cfg.branch).fetch_options(fetch_options(cfg.depth));
    builder.remote_create(move |repo, name, url| repo.remote_with_fetch(name, url, &refspec));
    let repo = builder
        .clone(&cfg.repo_url, path)
        .with_context(|| format!("cloning {} (branch {}) into {}", cfg.repo_url, cfg.branch, path.display()))?;
    let head = repo.head().context("reading HEAD after clone")?.peel_to_commit()?.id().to_string();
    info!(url = %cfg.repo_url, branch = %cfg.branch, head = %head, "chart repository cloned");
    Ok(head)
}

/// Fetch the tracked branch and hard-reset the working tree onto it.
pub(crate) fn pull(path: &Path, branch: &str, depth: Option<i32>) -> Result<PullOutcome> {
    let repo = Repository::open(path).with_context(|| format!("opening mirror at {}", path.display()))?;
    {
        let mut remote = repo.find_remote("origin").context("mirror has no origin remote")?;
        let mut fo = fetch_options(depth);
        remote.fetch(&[branch_refspec(branch).as_str()], Some(&mut fo), None).context("fetching origin")?;
    }
    let fetched = repo
        .find_reference(&format!("refs/remotes/origin/{}", branch))
        .with_context(|| format!("branch {} missing on origin", branch))?
        .peel_to_commit()?;
    let before = repo.head().ok().and_then(|h| h.target());
    if before == Some(fetched.id()) {
        debug!(head = %fetched.id(), "chart mirror already up to date");
        return Ok(PullOutcome::UpToDate { head: fetched.id().to_string() });
    }

    let local_ref = format!("refs/heads/{}", branch);
    repo.reference(&local_ref, fetched.id(), true, "appstore: sync chart mirror")?;
    repo.set_head(&local_ref)?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force().remove_untracked(true);
    repo.reset(fetched.as_object(), ResetType::Hard, Some(&mut checkout)).context("resetting working tree")?;
    Ok(PullOutcome::Updated { from: before.map(|o| o.to_string()), to: fetched.id().to_string() })
}
