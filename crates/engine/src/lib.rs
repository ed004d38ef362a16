//! Appstore engine: the reconcile state machine that converges an
//! `AppDeployment` onto a Helm release and records what it observed.

#![forbid(unsafe_code)]

use std::time::Duration;

use appstore_core::StoreError;

mod reconciler;
mod status;
mod values;

pub use reconciler::Reconciler;
pub use values::resolve_values;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Steady-state poll interval after a successful pass.
    pub success_interval: Duration,
    /// Retry interval after a failed pass.
    pub failure_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { success_interval: Duration::from_secs(300), failure_interval: Duration::from_secs(30) }
    }
}

/// What the caller should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    RequeueNow,
    RequeueAfter(Duration),
    /// Nothing scheduled; wait for the record to change.
    AwaitChange,
}

impl Next {
    pub fn label(&self) -> &'static str {
        match self {
            Next::RequeueNow => "requeue_now",
            Next::RequeueAfter(_) => "requeue_after",
            Next::AwaitChange => "await_change",
        }
    }
}

/// Failures the engine cannot record on the resource itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("writing status of {name}: {source}")]
    Status { name: String, source: StoreError },
    #[error("updating finalizers of {name}: {source}")]
    Finalizers { name: String, source: StoreError },
}
