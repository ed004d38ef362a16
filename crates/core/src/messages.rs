//! Broker wire format: a JSON envelope around typed payloads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::values::Values;

pub const EXCHANGE: &str = "appstore";
pub const QUEUE_DEPLOYMENTS: &str = "appstore.deployments";
pub const QUEUE_STATUS: &str = "appstore.status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "deployment.request")]
    DeploymentRequest,
    #[serde(rename = "deployment.update")]
    DeploymentUpdate,
    #[serde(rename = "deployment.delete")]
    DeploymentDelete,
    #[serde(rename = "status.update")]
    StatusUpdate,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Routing key on the topic exchange; identical to the type tag.
    pub fn routing_key(&self) -> &'static str {
        match self {
            MessageType::DeploymentRequest => "deployment.request",
            MessageType::DeploymentUpdate => "deployment.update",
            MessageType::DeploymentDelete => "deployment.delete",
            MessageType::StatusUpdate => "status.update",
            MessageType::Unknown => "unknown",
        }
    }

    /// Keys the operator's deployment queue is bound to.
    pub fn deployment_keys() -> [&'static str; 3] {
        [
            MessageType::DeploymentRequest.routing_key(),
            MessageType::DeploymentUpdate.routing_key(),
            MessageType::DeploymentDelete.routing_key(),
        ]
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.routing_key())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<P: Serialize>(kind: MessageType, id: impl Into<String>, source: &str, payload: &P) -> serde_json::Result<Self> {
        Ok(Self { kind, id: id.into(), timestamp: Utc::now(), source: source.to_string(), payload: serde_json::to_value(payload)? })
    }

    pub fn payload_as<P: DeserializeOwned>(&self) -> serde_json::Result<P> {
        P::deserialize(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub request_id: String,
    pub team_id: String,
    #[serde(default)]
    pub user_id: String,
    pub app_name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Values>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentUpdate {
    pub request_id: String,
    pub team_id: String,
    #[serde(default)]
    pub user_id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Values>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDelete {
    pub request_id: String,
    pub team_id: String,
    #[serde(default)]
    pub user_id: String,
    pub name: String,
    pub namespace: String,
}

/// Engine → caller notification after a settled status write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_release_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_release_revision: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_chart_version: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Sink for status updates. Best effort: implementations log their own failures.
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, update: StatusUpdate);
}
