use std::path::PathBuf;
use std::time::Duration;

use appstore_charts::MirrorConfig;
use appstore_engine::EngineConfig;
use appstore_ingest::ConsumerConfig;
use appstore_release::{LockScope, ManagerConfig};
use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct MirrorArgs {
    /// Git URL of the chart repository
    #[arg(long, env = "APPSTORE_CHARTS_REPO_URL")]
    pub charts_repo_url: String,

    #[arg(long, env = "APPSTORE_CHARTS_BRANCH", default_value = "main")]
    pub charts_branch: String,

    /// Local working copy of the chart repository
    #[arg(long, env = "APPSTORE_CHARTS_PATH", default_value = "/var/lib/appstore/charts")]
    pub charts_path: PathBuf,

    #[arg(long, env = "APPSTORE_CHARTS_SYNC_SECS", default_value_t = 300)]
    pub charts_sync_secs: u64,
}

impl MirrorArgs {
    pub fn mirror_config(&self) -> MirrorConfig {
        let mut cfg = MirrorConfig::new(&self.charts_repo_url, &self.charts_path);
        cfg.branch = self.charts_branch.clone();
        cfg.sync_interval = Duration::from_secs(self.charts_sync_secs.max(1));
        cfg
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub mirror: MirrorArgs,

    #[arg(long, env = "APPSTORE_HELM_BIN", default_value = "helm")]
    pub helm_bin: PathBuf,

    /// Chart repository used when a chart is not in the mirror
    #[arg(long, env = "APPSTORE_HELM_REPO_URL")]
    pub helm_repo_url: Option<String>,

    #[arg(long, env = "APPSTORE_CHART_CACHE_DIR", default_value = "/var/cache/appstore/charts")]
    pub chart_cache_dir: PathBuf,

    #[arg(long, env = "APPSTORE_HELM_TIMEOUT_SECS", default_value_t = 300)]
    pub helm_timeout_secs: u64,

    /// Serialize Helm mutations per release or process-wide (release|global)
    #[arg(long, env = "APPSTORE_RELEASE_LOCK", default_value = "release")]
    pub release_lock: LockScope,

    /// Broker URL; without it no messages are consumed
    #[arg(long, env = "APPSTORE_AMQP_URL")]
    pub amqp_url: Option<String>,

    #[arg(long, env = "APPSTORE_AMQP_EXCHANGE", default_value = "appstore")]
    pub amqp_exchange: String,

    #[arg(long, env = "APPSTORE_AMQP_QUEUE", default_value = "appstore.deployments")]
    pub amqp_queue: String,

    #[arg(long, env = "APPSTORE_AMQP_PREFETCH", default_value_t = 10)]
    pub amqp_prefetch: u16,

    #[arg(long, env = "APPSTORE_AMQP_RETRY_SECS", default_value_t = 5)]
    pub amqp_retry_secs: u64,

    /// Dead-letter exchange for rejected messages
    #[arg(long, env = "APPSTORE_AMQP_DLX")]
    pub amqp_dlx: Option<String>,

    #[arg(long, env = "APPSTORE_REQUEUE_SUCCESS_SECS", default_value_t = 300)]
    pub requeue_success_secs: u64,

    #[arg(long, env = "APPSTORE_REQUEUE_FAILURE_SECS", default_value_t = 30)]
    pub requeue_failure_secs: u64,

    /// Publish status.update messages after settled reconciles
    #[arg(long, env = "APPSTORE_PUBLISH_STATUS", default_value_t = false)]
    pub publish_status: bool,
}

impl RunArgs {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            timeout: Duration::from_secs(self.helm_timeout_secs.max(1)),
            lock_scope: self.release_lock,
            chart_repo_url: self.helm_repo_url.clone().filter(|u| !u.is_empty()),
            cache_dir: self.chart_cache_dir.clone(),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            success_interval: Duration::from_secs(self.requeue_success_secs),
            failure_interval: Duration::from_secs(self.requeue_failure_secs),
        }
    }

    pub fn consumer_config(&self) -> Option<ConsumerConfig> {
        let url = self.amqp_url.as_deref().filter(|u| !u.is_empty())?;
        let mut cfg = ConsumerConfig::new(url);
        cfg.exchange = self.amqp_exchange.clone();
        cfg.queue = self.amqp_queue.clone();
        cfg.prefetch = self.amqp_prefetch.max(1);
        cfg.retry_delay = Duration::from_secs(self.amqp_retry_secs);
        cfg.dead_letter_exchange = self.amqp_dlx.clone().filter(|d| !d.is_empty());
        Some(cfg)
    }
}
