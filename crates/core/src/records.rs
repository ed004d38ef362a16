//! Storage seams for `AppDeployment` records and values references.
//!
//! The engine and the ingest pipeline talk to these traits; the kube-backed
//! implementations live in `appstore-kubehub`.

use async_trait::async_trait;

use crate::crd::{AppDeployment, AppDeploymentStatus, ValuesReference};
use crate::values::ValuesError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency failure; the caller should re-read and retry later.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Deletion accepted (may still be pending on finalizers).
    Deleted,
    Absent,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<AppDeployment>, StoreError>;

    async fn create(&self, record: &AppDeployment) -> Result<CreateOutcome, StoreError>;

    /// Replace metadata and spec. Conflicts when `resourceVersion` is stale.
    async fn replace(&self, record: &AppDeployment) -> Result<(), StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<DeleteOutcome, StoreError>;

    async fn set_finalizers(&self, record: &AppDeployment, finalizers: Vec<String>) -> Result<(), StoreError>;

    async fn write_status(&self, record: &AppDeployment, status: &AppDeploymentStatus) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ValuesSource: Send + Sync {
    /// Raw values document behind `reference` in `namespace`.
    async fn fetch(&self, namespace: &str, reference: &ValuesReference) -> Result<String, ValuesError>;
}
