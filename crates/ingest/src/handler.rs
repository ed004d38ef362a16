use std::collections::BTreeMap;
use std::sync::Arc;

use appstore_core::messages::{DeploymentDelete, DeploymentRequest, DeploymentUpdate, Envelope};
use appstore_core::naming::{record_name, validate_release_name};
use appstore_core::{
    AppDeployment, AppDeploymentSpec, CreateOutcome, DeleteOutcome, RecordStore, StoreError, ANNOTATION_REQUESTED_BY,
    LABEL_APP, LABEL_REQUEST_ID, LABEL_TEAM,
};
use async_trait::async_trait;
use tracing::{debug, info};

/// What to tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Negative ack with requeue; the message comes back later.
    Requeue,
    /// Negative ack without requeue; dead-lettered if the queue has a DLX.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("team {team} does not own {namespace}/{name}")]
    Forbidden { team: String, namespace: String, name: String },
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("transient failure: {0}")]
    Transient(String),
}

impl HandleError {
    /// Only transient failures can succeed on redelivery.
    pub fn disposition(&self) -> Disposition {
        match self {
            HandleError::Transient(_) => Disposition::Requeue,
            _ => Disposition::Reject,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HandleError::Malformed(_) => "malformed",
            HandleError::UnknownType(_) => "unknown_type",
            HandleError::Forbidden { .. } => "forbidden",
            HandleError::Invalid(_) => "invalid",
            HandleError::Transient(_) => "transient",
        }
    }
}

impl From<StoreError> for HandleError {
    fn from(e: StoreError) -> Self {
        HandleError::Transient(e.to_string())
    }
}

/// One method per deployment message type. Implementations must be safe
/// under redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_request(&self, env: &Envelope, req: DeploymentRequest) -> Result<(), HandleError>;
    async fn on_update(&self, env: &Envelope, upd: DeploymentUpdate) -> Result<(), HandleError>;
    async fn on_delete(&self, env: &Envelope, del: DeploymentDelete) -> Result<(), HandleError>;
}

/// Applies deployment messages to `AppDeployment` records.
pub struct DeploymentHandler {
    records: Arc<dyn RecordStore>,
}

impl DeploymentHandler {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    async fn owned(&self, team: &str, namespace: &str, name: &str) -> Result<Option<AppDeployment>, HandleError> {
        let Some(record) = self.records.get(namespace, name).await? else {
            return Ok(None);
        };
        if record.spec.team_id != team {
            return Err(HandleError::Forbidden {
                team: team.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        Ok(Some(record))
    }
}

fn require(field: &str, value: &str) -> Result<(), HandleError> {
    if value.trim().is_empty() {
        return Err(HandleError::Invalid(format!("{} is required", field)));
    }
    Ok(())
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

#[async_trait]
impl MessageHandler for DeploymentHandler {
    async fn on_request(&self, env: &Envelope, req: DeploymentRequest) -> Result<(), HandleError> {
        require("appName", &req.app_name)?;
        require("namespace", &req.namespace)?;
        require("teamId", &req.team_id)?;
        require("requestId", &req.request_id)?;
        let name = record_name(&req.app_name, &req.request_id, req.release_name.as_deref());
        validate_release_name(&name).map_err(|e| HandleError::Invalid(e.to_string()))?;

        let requested_by = non_empty(Some(req.user_id.clone()));
        let mut record = AppDeployment::new(
            &name,
            AppDeploymentSpec {
                app_name: req.app_name.clone(),
                chart_version: non_empty(req.version),
                team_id: req.team_id.clone(),
                requested_by: requested_by.clone(),
                release_name: Some(name.clone()),
                values: req.values.map(serde_json::Value::Object),
                values_from: vec![],
                auto_upgrade: false,
                suspend: false,
            },
        );
        record.metadata.namespace = Some(req.namespace.clone());
        record.metadata.labels = Some(BTreeMap::from([
            (LABEL_TEAM.to_string(), req.team_id.clone()),
            (LABEL_APP.to_string(), req.app_name.clone()),
            (LABEL_REQUEST_ID.to_string(), req.request_id.clone()),
        ]));
        if let Some(user) = requested_by {
            record.metadata.annotations = Some(BTreeMap::from([(ANNOTATION_REQUESTED_BY.to_string(), user)]));
        }

        match self.records.create(&record).await? {
            CreateOutcome::Created => {
                info!(msg_id = %env.id, name = %name, ns = %req.namespace, app = %req.app_name, team = %req.team_id, "deployment record created");
            }
            CreateOutcome::AlreadyExists => {
                info!(msg_id = %env.id, name = %name, ns = %req.namespace, "deployment record already exists; treating as delivered");
            }
        }
        Ok(())
    }

    async fn on_update(&self, env: &Envelope, upd: DeploymentUpdate) -> Result<(), HandleError> {
        require("name", &upd.name)?;
        require("namespace", &upd.namespace)?;
        let Some(mut record) = self.owned(&upd.team_id, &upd.namespace, &upd.name).await? else {
            return Err(HandleError::Invalid(format!("deployment {}/{} does not exist", upd.namespace, upd.name)));
        };
        // An empty version means "not provided"; the pinned version stays.
        if let Some(version) = non_empty(upd.version) {
            record.spec.chart_version = Some(version);
        }
        if let Some(values) = upd.values {
            record.spec.values = Some(serde_json::Value::Object(values));
        }
        if !upd.user_id.is_empty() {
            record
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(ANNOTATION_REQUESTED_BY.to_string(), upd.user_id.clone());
        }
        self.records.replace(&record).await?;
        info!(msg_id = %env.id, name = %upd.name, ns = %upd.namespace, "deployment record updated");
        Ok(())
    }

    async fn on_delete(&self, env: &Envelope, del: DeploymentDelete) -> Result<(), HandleError> {
        require("name", &del.name)?;
        require("namespace", &del.namespace)?;
        if self.owned(&del.team_id, &del.namespace, &del.name).await?.is_none() {
            debug!(msg_id = %env.id, name = %del.name, ns = %del.namespace, "deployment already gone");
            return Ok(());
        }
        match self.records.delete(&del.namespace, &del.name).await? {
            DeleteOutcome::Deleted => info!(msg_id = %env.id, name = %del.name, ns = %del.namespace, "deployment deletion requested"),
            DeleteOutcome::Absent => debug!(msg_id = %env.id, name = %del.name, ns = %del.namespace, "deployment already gone"),
        }
        Ok(())
    }
}
