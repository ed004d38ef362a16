//! Appstore core types: the `AppDeployment` resource, values handling,
//! broker messages and the storage seams shared by the engine and ingest.

#![forbid(unsafe_code)]

pub mod crd;
pub mod messages;
pub mod naming;
pub mod records;
pub mod values;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use crd::{
    set_condition, AppDeployment, AppDeploymentSpec, AppDeploymentStatus, Condition, ConditionStatus, Phase,
    ValuesKind, ValuesReference,
};
pub use records::{CreateOutcome, DeleteOutcome, RecordStore, StoreError, ValuesSource};
pub use values::{Values, ValuesError};

/// API group of the `AppDeployment` resource; also the prefix of every label we own.
pub const GROUP: &str = "appstore.bitpipe.no";

/// Finalizer guarding Helm cleanup.
pub const FINALIZER: &str = "appstore.bitpipe.no/finalizer";

pub const LABEL_TEAM: &str = "appstore.bitpipe.no/team";
pub const LABEL_APP: &str = "appstore.bitpipe.no/app";
pub const LABEL_REQUEST_ID: &str = "appstore.bitpipe.no/request-id";
pub const ANNOTATION_REQUESTED_BY: &str = "appstore.bitpipe.no/requested-by";

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_RECONCILING: &str = "Reconciling";

pub mod prelude {
    pub use super::{
        AppDeployment, AppDeploymentSpec, AppDeploymentStatus, Phase, RecordStore, ValuesReference, ValuesSource,
    };
}
