use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use appstore_charts::{ChartCatalog, ChartDescriptor};
use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::helm::{ChartOp, HelmDriver};
use crate::locks::{LockScope, ReleaseLocks};
use crate::{ReleaseError, ReleaseInfo, ReleaseLifecycle, ReleaseRequest, DEFAULT_TIMEOUT};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub timeout: Duration,
    pub lock_scope: LockScope,
    /// Chart repository to pull from when the mirror lacks a chart.
    pub chart_repo_url: Option<String>,
    /// Where remotely pulled charts are unpacked.
    pub cache_dir: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            lock_scope: LockScope::Release,
            chart_repo_url: None,
            cache_dir: std::env::temp_dir().join("appstore-chart-cache"),
        }
    }
}

pub struct ReleaseManager {
    driver: Arc<dyn HelmDriver>,
    catalog: Arc<dyn ChartCatalog>,
    cfg: ManagerConfig,
    locks: ReleaseLocks,
}

impl ReleaseManager {
    pub fn new(driver: Arc<dyn HelmDriver>, catalog: Arc<dyn ChartCatalog>, cfg: ManagerConfig) -> Self {
        let locks = ReleaseLocks::new(cfg.lock_scope);
        Self { driver, catalog, cfg, locks }
    }

    /// Mirror first, then the configured chart repository.
    async fn resolve_chart(&self, req: &ReleaseRequest) -> Result<PathBuf, ReleaseError> {
        if let Some(dir) = self.catalog.path(&req.chart).await {
            debug!(chart = %req.chart, dir = %dir.display(), "chart resolved from mirror");
            return Ok(dir);
        }
        let Some(repo_url) = self.cfg.chart_repo_url.as_deref() else {
            return Err(ReleaseError::PackageNotFound(req.chart.clone()));
        };
        let version = req.version.as_deref().filter(|v| !v.is_empty());
        let dest = self.cfg.cache_dir.join(format!("{}-{}", req.chart, version.unwrap_or("latest")));
        let cached = dest.join(&req.chart);
        if version.is_some() && cached.join(appstore_charts::DESCRIPTOR_FILE).is_file() {
            debug!(chart = %req.chart, dir = %cached.display(), "chart resolved from pull cache");
            return Ok(cached);
        }
        if dest.exists() {
            tokio::fs::remove_dir_all(&dest).await.map_err(|e| ReleaseError::Load {
                chart: req.chart.clone(),
                reason: format!("clearing {}: {}", dest.display(), e),
            })?;
        }
        info!(chart = %req.chart, version = version.unwrap_or("latest"), repo = %repo_url, "pulling chart");
        self.driver.pull(repo_url, &req.chart, version, &dest).await.map_err(|e| ReleaseError::Load {
            chart: req.chart.clone(),
            reason: format!("{:#}", e),
        })
    }

    async fn prepare(&self, req: &ReleaseRequest) -> Result<PathBuf, ReleaseError> {
        let dir = self.resolve_chart(req).await?;
        let descriptor = ChartDescriptor::load(&dir)
            .map_err(|e| ReleaseError::Load { chart: req.chart.clone(), reason: format!("{:#}", e) })?;
        if let Some(wanted) = req.version.as_deref().filter(|v| !v.is_empty()) {
            if wanted != descriptor.version {
                warn!(chart = %req.chart, wanted, available = %descriptor.version, "requested chart version differs from source");
            }
        }
        Ok(dir)
    }

    /// Run `fut` under the configured timeout and record the outcome.
    async fn bounded<T, F>(&self, op: &'static str, release: &str, fut: F) -> Result<anyhow::Result<T>, ReleaseError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let res = tokio::time::timeout(self.cfg.timeout, fut).await;
        histogram!("release_op_latency_ms", started.elapsed().as_millis() as f64, "op" => op);
        let result = match &res {
            Err(_) => "timeout",
            Ok(Err(_)) => "error",
            Ok(Ok(_)) => "ok",
        };
        counter!("release_ops_total", 1u64, "op" => op, "result" => result);
        res.map_err(|_| ReleaseError::Timeout { op, release: release.to_string(), after: self.cfg.timeout })
    }

    fn chart_op<'a>(&self, req: &'a ReleaseRequest, chart_dir: &'a std::path::Path) -> ChartOp<'a> {
        ChartOp {
            release: &req.release,
            namespace: &req.namespace,
            chart_dir,
            values: &req.values,
            timeout: self.cfg.timeout,
        }
    }
}

#[async_trait]
impl ReleaseLifecycle for ReleaseManager {
    async fn install(&self, req: &ReleaseRequest) -> Result<ReleaseInfo, ReleaseError> {
        let _guard = self.locks.acquire(&req.namespace, &req.release).await;
        let dir = self.prepare(req).await?;
        let info = self
            .bounded("install", &req.release, self.driver.install(self.chart_op(req, &dir)))
            .await?
            .map_err(|e| ReleaseError::Install { release: req.release.clone(), reason: format!("{:#}", e) })?;
        info!(release = %info.name, ns = %info.namespace, revision = info.revision, chart = %info.chart_version, "release installed");
        Ok(info)
    }

    async fn upgrade(&self, req: &ReleaseRequest) -> Result<ReleaseInfo, ReleaseError> {
        let _guard = self.locks.acquire(&req.namespace, &req.release).await;
        let current = self.driver.status(&req.release, &req.namespace).await.map_err(|e| ReleaseError::Query {
            release: req.release.clone(),
            reason: format!("{:#}", e),
        })?;
        if current.is_none() {
            return Err(ReleaseError::NotInstalled { release: req.release.clone(), namespace: req.namespace.clone() });
        }
        let dir = self.prepare(req).await?;
        let info = self
            .bounded("upgrade", &req.release, self.driver.upgrade(self.chart_op(req, &dir)))
            .await?
            .map_err(|e| ReleaseError::Upgrade { release: req.release.clone(), reason: format!("{:#}", e) })?;
        info!(release = %info.name, ns = %info.namespace, revision = info.revision, chart = %info.chart_version, "release upgraded");
        Ok(info)
    }

    async fn uninstall(&self, name: &str, namespace: &str) -> Result<(), ReleaseError> {
        let _guard = self.locks.acquire(namespace, name).await;
        let removed = self
            .bounded("uninstall", name, self.driver.uninstall(name, namespace, self.cfg.timeout))
            .await?
            .map_err(|e| ReleaseError::Uninstall { release: name.to_string(), reason: format!("{:#}", e) })?;
        if removed {
            info!(release = %name, ns = %namespace, "release uninstalled");
        } else {
            debug!(release = %name, ns = %namespace, "release already absent");
        }
        Ok(())
    }

    async fn get(&self, name: &str, namespace: &str) -> Result<Option<ReleaseInfo>, ReleaseError> {
        self.bounded("get", name, self.driver.status(name, namespace))
            .await?
            .map_err(|e| ReleaseError::Query { release: name.to_string(), reason: format!("{:#}", e) })
    }
}
