//! Appstore release lifecycle: install, upgrade, uninstall and query named
//! Helm releases. `ReleaseManager` resolves charts, serializes mutations and
//! bounds every operation; `HelmDriver` is the raw Helm seam.

#![forbid(unsafe_code)]

use std::time::Duration;

use appstore_core::Values;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod helm;
mod locks;
mod manager;

pub use helm::{ChartOp, HelmCli, HelmDriver};
pub use locks::LockScope;
pub use manager::{ManagerConfig, ReleaseManager};

/// Upper bound for a single Helm operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub name: String,
    pub namespace: String,
    pub revision: i64,
    pub status: String,
    pub chart_name: String,
    pub chart_version: String,
    pub app_version: Option<String>,
    /// When Helm last deployed this revision.
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRequest {
    pub release: String,
    pub chart: String,
    pub namespace: String,
    pub values: Values,
    /// Empty means whatever version the chart source provides.
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReleaseError {
    #[error("chart {0} not found")]
    PackageNotFound(String),
    #[error("loading chart {chart}: {reason}")]
    Load { chart: String, reason: String },
    #[error("installing release {release}: {reason}")]
    Install { release: String, reason: String },
    #[error("upgrading release {release}: {reason}")]
    Upgrade { release: String, reason: String },
    #[error("uninstalling release {release}: {reason}")]
    Uninstall { release: String, reason: String },
    #[error("querying release {release}: {reason}")]
    Query { release: String, reason: String },
    #[error("release {release} is not installed in namespace {namespace}")]
    NotInstalled { release: String, namespace: String },
    #[error("{op} of release {release} timed out after {}s", .after.as_secs())]
    Timeout { op: &'static str, release: String, after: Duration },
}

#[async_trait]
pub trait ReleaseLifecycle: Send + Sync {
    async fn install(&self, req: &ReleaseRequest) -> Result<ReleaseInfo, ReleaseError>;

    /// Fails with `NotInstalled` when no release exists.
    async fn upgrade(&self, req: &ReleaseRequest) -> Result<ReleaseInfo, ReleaseError>;

    /// Absent releases count as uninstalled.
    async fn uninstall(&self, name: &str, namespace: &str) -> Result<(), ReleaseError>;

    async fn get(&self, name: &str, namespace: &str) -> Result<Option<ReleaseInfo>, ReleaseError>;

    async fn exists(&self, name: &str, namespace: &str) -> Result<bool, ReleaseError> {
        Ok(self.get(name, namespace).await?.is_some())
    }
}
