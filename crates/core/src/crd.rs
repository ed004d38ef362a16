//! `AppDeployment` custom resource (appstore.bitpipe.no/v1alpha1).

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject, StringValidation};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::naming::{RELEASE_NAME_MAX_LEN, RELEASE_NAME_PATTERN};
use crate::FINALIZER;

/// Desired state of an application deployment.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "appstore.bitpipe.no",
    version = "v1alpha1",
    kind = "AppDeployment",
    namespaced,
    status = "AppDeploymentStatus",
    shortname = "appdep",
    derive = "PartialEq",
    printcolumn = r#"{"name":"App","type":"string","jsonPath":".spec.appName"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.chartVersion"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Release","type":"string","jsonPath":".status.helmReleaseName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploymentSpec {
    /// Chart name in the catalog; checked against the mirror at reconcile time.
    #[schemars(length(min = 1))]
    pub app_name: String,

    /// Chart version to deploy; empty means whatever the source provides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,

    pub team_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,

    /// Helm release name; falls back to the resource name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "release_name_schema")]
    pub release_name: Option<String>,

    /// Inline Helm values, merged last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub values: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_from: Vec<ValuesReference>,

    #[serde(default)]
    pub auto_upgrade: bool,

    /// Stops reconciliation while set.
    #[serde(default)]
    pub suspend: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ValuesKind {
    ConfigMap,
    Secret,
}

impl std::fmt::Display for ValuesKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValuesKind::ConfigMap => f.write_str("ConfigMap"),
            ValuesKind::Secret => f.write_str("Secret"),
        }
    }
}

/// Reference to a ConfigMap or Secret key holding a values document.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValuesReference {
    pub kind: ValuesKind,
    pub name: String,
    #[serde(default = "default_values_key")]
    pub values_key: String,
    /// Skip the reference instead of failing when it cannot be read.
    #[serde(default)]
    pub optional: bool,
}

fn default_values_key() -> String {
    "values.yaml".to_string()
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    Pending,
    Installing,
    Upgrading,
    Deployed,
    Failed,
    Uninstalling,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Installing => "Installing",
            Phase::Upgrading => "Upgrading",
            Phase::Deployed => "Deployed",
            Phase::Failed => "Failed",
            Phase::Uninstalling => "Uninstalling",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state, written only by the engine.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploymentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_release_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_release_revision: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_chart_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_chart_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_values_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AppDeploymentStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(v: bool) -> Self {
        if v { ConditionStatus::True } else { ConditionStatus::False }
    }
}

/// Kubernetes-style status condition.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(type_: &str, status: impl Into<ConditionStatus>, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: status.into(),
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
            observed_generation: None,
        }
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }
}

/// Insert or update a condition by type. The transition time moves only when
/// the status value flips.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status != new.status {
                existing.status = new.status;
                existing.last_transition_time = new.last_transition_time;
            }
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
        }
        None => conditions.push(new),
    }
}

impl AppDeployment {
    /// Helm release name: explicit spec value, else the resource name.
    pub fn release_name(&self) -> String {
        match self.spec.release_name.as_deref() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => self.name_any(),
        }
    }

    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn requested_version(&self) -> Option<&str> {
        self.spec.chart_version.as_deref().filter(|v| !v.is_empty())
    }

    pub fn status_or_default(&self) -> AppDeploymentStatus {
        self.status.clone().unwrap_or_default()
    }
}

fn preserve_unknown_object(_: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject { instance_type: Some(InstanceType::Object.into()), ..Default::default() };
    obj.extensions.insert("x-kubernetes-preserve-unknown-fields".to_string(), serde_json::Value::Bool(true));
    Schema::Object(obj)
}

fn release_name_schema(_: &mut SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::String.into()),
        string: Some(Box::new(StringValidation {
            max_length: Some(RELEASE_NAME_MAX_LEN as u32),
            min_length: None,
            pattern: Some(RELEASE_NAME_PATTERN.to_string()),
        })),
        ..Default::default()
    })
}
