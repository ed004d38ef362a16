use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{git, is_chart_dir, valid_entry_name, ChartCatalog, ChartDescriptor, PullOutcome};

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub repo_url: String,
    pub branch: String,
    pub local_path: PathBuf,
    pub sync_interval: Duration,
    /// Shallow fetch depth; `None` fetches full history.
    pub depth: Option<i32>,
}

impl MirrorConfig {
    pub fn new(repo_url: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_url: repo_url.into(),
            branch: "main".to_string(),
            local_path: local_path.into(),
            sync_interval: Duration::from_secs(300),
            depth: Some(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorState {
    pub head: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Local git copy of the chart repository. Readers share the lock; a sync
/// holds it exclusively, so lookups never observe a half-updated tree.
pub struct ChartMirror {
    cfg: MirrorConfig,
    state: RwLock<MirrorState>,
}

impl ChartMirror {
    pub fn new(cfg: MirrorConfig) -> Arc<Self> {
        Arc::new(Self { cfg, state: RwLock::new(MirrorState::default()) })
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.cfg
    }

    /// Bring the local copy up (open + pull, or clone) and spawn the
    /// periodic sync loop. Fails only when no usable copy could be produced.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Result<JoinHandle<()>> {
        self.initial_sync().await?;
        let me = Arc::clone(self);
        Ok(tokio::spawn(async move { me.sync_loop(token).await }))
    }

    async fn initial_sync(&self) -> Result<()> {
        let mut st = self.state.write().await;
        let cfg = self.cfg.clone();
        let head = tokio::task::spawn_blocking(move || git::open_or_clone(&cfg))
            .await
            .context("chart mirror init task panicked")??;
        st.head = Some(head);
        st.last_sync = Some(Utc::now());
        st.last_error = None;
        counter!("chart_sync_total", 1u64, "result" => "initial");
        Ok(())
    }

    async fn sync_loop(self: Arc<Self>, token: CancellationToken) {
        let mut tick = tokio::time::interval(self.cfg.sync_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; the initial sync already ran.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("chart mirror sync loop stopped");
                    return;
                }
                _ = tick.tick() => {
                    // Failures are recorded in state and logged by pull().
                    let _ = self.pull().await;
                }
            }
        }
    }

    /// Fetch and fast-forward the local copy. On failure the previous tree
    /// stays in place and keeps being served.
    pub async fn pull(&self) -> Result<PullOutcome> {
        let mut st = self.state.write().await;
        let path = self.cfg.local_path.clone();
        let branch = self.cfg.branch.clone();
        let depth = self.cfg.depth;
        let res = tokio::task::spawn_blocking(move || git::pull(&path, &branch, depth))
            .await
            .context("chart mirror pull task panicked")
            .and_then(|r| r);
        match &res {
            Ok(outcome) => {
                if let PullOutcome::Updated { from, to } = outcome {
                    info!(from = from.as_deref().unwrap_or("-"), to = %to, "chart mirror updated");
                    counter!("chart_sync_total", 1u64, "result" => "updated");
                } else {
                    debug!("chart mirror up to date");
                    counter!("chart_sync_total", 1u64, "result" => "unchanged");
                }
                st.head = Some(outcome.head().to_string());
                st.last_sync = Some(Utc::now());
                st.last_error = None;
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "chart mirror pull failed; serving previous copy");
                counter!("chart_sync_total", 1u64, "result" => "error");
                st.last_error = Some(format!("{:#}", e));
            }
        }
        res
    }

    /// Out-of-band sync, e.g. on SIGHUP.
    pub async fn force_sync(&self) -> Result<PullOutcome> {
        info!("forced chart mirror sync");
        self.pull().await
    }

    pub async fn state(&self) -> MirrorState {
        self.state.read().await.clone()
    }

    pub async fn descriptor(&self, name: &str) -> Result<ChartDescriptor> {
        let _guard = self.state.read().await;
        anyhow::ensure!(is_chart_dir(&self.cfg.local_path, name), "chart {} not found", name);
        ChartDescriptor::load(&self.cfg.local_path.join(name))
    }
}

#[async_trait]
impl ChartCatalog for ChartMirror {
    async fn exists(&self, name: &str) -> bool {
        let _guard = self.state.read().await;
        is_chart_dir(&self.cfg.local_path, name)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let _guard = self.state.read().await;
        let root = &self.cfg.local_path;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(root).with_context(|| format!("listing {}", root.display()))? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
            if valid_entry_name(&name) && is_chart_dir(root, &name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn path(&self, name: &str) -> Option<PathBuf> {
        let _guard = self.state.read().await;
        is_chart_dir(&self.cfg.local_path, name).then(|| self.cfg.local_path.join(name))
    }
}
