//! Appstore kubehub: kube client bootstrap plus kube-backed `RecordStore`
//! and `ValuesSource` implementations.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use appstore_core::{
    AppDeployment, AppDeploymentStatus, CreateOutcome, DeleteOutcome, RecordStore, StoreError, ValuesError,
    ValuesKind, ValuesReference, ValuesSource,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use metrics::counter;
use once_cell::sync::OnceCell;
use tracing::{debug, info};

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared kube client (kubeconfig or in-cluster), built on first use.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let client = Client::try_default().await.context("building kube client from kubeconfig/in-cluster env")?;
    let _ = CLIENT.set(client.clone());
    info!(namespace = %client.default_namespace(), "kube client ready");
    Ok(client)
}

fn store_err(e: kube::Error) -> StoreError {
    match &e {
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(resp.message.clone()),
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(resp.message.clone()),
        _ => StoreError::Backend(e.to_string()),
    }
}

fn is_status(e: &kube::Error, code: u16) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == code)
}

/// `AppDeployment` records through the API server.
#[derive(Clone)]
pub struct KubeRecords {
    client: Client,
}

impl KubeRecords {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<AppDeployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl RecordStore for KubeRecords {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<AppDeployment>, StoreError> {
        self.api(namespace).get_opt(name).await.map_err(store_err)
    }

    async fn create(&self, record: &AppDeployment) -> Result<CreateOutcome, StoreError> {
        let ns = record.namespace_or_default();
        match self.api(&ns).create(&PostParams::default(), record).await {
            Ok(_) => {
                counter!("records_created_total", 1u64);
                Ok(CreateOutcome::Created)
            }
            Err(e) if is_status(&e, 409) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn replace(&self, record: &AppDeployment) -> Result<(), StoreError> {
        let ns = record.namespace_or_default();
        self.api(&ns).replace(&record.name_any(), &PostParams::default(), record).await.map_err(store_err)?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<DeleteOutcome, StoreError> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) if is_status(&e, 404) => Ok(DeleteOutcome::Absent),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn set_finalizers(&self, record: &AppDeployment, finalizers: Vec<String>) -> Result<(), StoreError> {
        let ns = record.namespace_or_default();
        // No resourceVersion precondition: status writes bump the version
        // between reading the record and patching its finalizers.
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        debug!(name = %record.name_any(), ns = %ns, ?finalizers, "patching finalizers");
        self.api(&ns)
            .patch(&record.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn write_status(&self, record: &AppDeployment, status: &AppDeploymentStatus) -> Result<(), StoreError> {
        let ns = record.namespace_or_default();
        let patch = serde_json::json!({ "status": status });
        self.api(&ns)
            .patch_status(&record.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

/// Values documents from ConfigMaps and Secrets.
#[derive(Clone)]
pub struct KubeValues {
    client: Client,
}

impl KubeValues {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ValuesSource for KubeValues {
    async fn fetch(&self, namespace: &str, reference: &ValuesReference) -> Result<String, ValuesError> {
        let missing_key = || ValuesError::MissingKey {
            kind: reference.kind.to_string(),
            name: reference.name.clone(),
            key: reference.values_key.clone(),
        };
        let missing_object =
            || ValuesError::MissingObject { kind: reference.kind.to_string(), name: reference.name.clone() };
        match reference.kind {
            ValuesKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                let cm = api
                    .get_opt(&reference.name)
                    .await
                    .map_err(|e| ValuesError::Read(e.to_string()))?
                    .ok_or_else(missing_object)?;
                cm.data.and_then(|mut d| d.remove(&reference.values_key)).ok_or_else(missing_key)
            }
            ValuesKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let secret = api
                    .get_opt(&reference.name)
                    .await
                    .map_err(|e| ValuesError::Read(e.to_string()))?
                    .ok_or_else(missing_object)?;
                let bytes = secret.data.and_then(|mut d| d.remove(&reference.values_key)).ok_or_else(missing_key)?;
                String::from_utf8(bytes.0).map_err(|e| ValuesError::Parse {
                    origin: format!("Secret/{}", reference.name),
                    reason: e.to_string(),
                })
            }
        }
    }
}
