//! In-memory `RecordStore` with API-server-like finalizer semantics.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use crate::crd::{AppDeployment, AppDeploymentStatus};
use crate::records::{CreateOutcome, DeleteOutcome, RecordStore, StoreError};

type Key = (String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, AppDeployment>,
    next_version: u64,
    status_writes: Vec<AppDeploymentStatus>,
    creates: usize,
}

#[derive(Default)]
pub struct MemoryRecords {
    inner: Mutex<Inner>,
}

fn key_of(record: &AppDeployment) -> Key {
    (record.namespace().unwrap_or_default(), record.name_any())
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as if it had been created through the API.
    pub fn insert(&self, record: AppDeployment) -> AppDeployment {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = Self::admit(&mut inner, record);
        inner.objects.insert(key_of(&stored), stored.clone());
        stored
    }

    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<AppDeployment> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).objects.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every status written so far, oldest first.
    pub fn status_writes(&self) -> Vec<AppDeploymentStatus> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).status_writes.clone()
    }

    /// Number of successful creates.
    pub fn creates(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).creates
    }

    fn bump(inner: &mut Inner) -> String {
        inner.next_version += 1;
        inner.next_version.to_string()
    }

    fn admit(inner: &mut Inner, mut record: AppDeployment) -> AppDeployment {
        let rv = Self::bump(inner);
        let meta = &mut record.metadata;
        meta.generation = Some(meta.generation.unwrap_or(1));
        meta.uid.get_or_insert_with(|| format!("uid-{}", rv));
        meta.creation_timestamp.get_or_insert_with(|| Time(Utc::now()));
        meta.resource_version = Some(rv);
        record
    }
}

#[async_trait]
impl RecordStore for MemoryRecords {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<AppDeployment>, StoreError> {
        Ok(self.snapshot(namespace, name))
    }

    async fn create(&self, record: &AppDeployment) -> Result<CreateOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = key_of(record);
        if inner.objects.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let mut fresh = record.clone();
        fresh.metadata.generation = None;
        fresh.metadata.resource_version = None;
        fresh.status = None;
        let stored = Self::admit(&mut inner, fresh);
        inner.objects.insert(key, stored);
        inner.creates += 1;
        Ok(CreateOutcome::Created)
    }

    async fn replace(&self, record: &AppDeployment) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = key_of(record);
        let current = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.1.clone()))?;
        if let Some(rv) = record.metadata.resource_version.as_deref() {
            if current.metadata.resource_version.as_deref() != Some(rv) {
                return Err(StoreError::Conflict(format!("{} has been modified", key.1)));
            }
        }
        let mut next = current.clone();
        if next.spec != record.spec {
            next.metadata.generation = Some(current.generation() + 1);
            next.spec = record.spec.clone();
        }
        next.metadata.labels = record.metadata.labels.clone();
        next.metadata.annotations = record.metadata.annotations.clone();
        next.metadata.resource_version = Some(Self::bump(&mut inner));
        inner.objects.insert(key, next);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<DeleteOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (namespace.to_string(), name.to_string());
        let Some(current) = inner.objects.get(&key).cloned() else {
            return Ok(DeleteOutcome::Absent);
        };
        if current.finalizers().is_empty() {
            inner.objects.remove(&key);
        } else if current.metadata.deletion_timestamp.is_none() {
            let mut next = current;
            next.metadata.deletion_timestamp = Some(Time(Utc::now()));
            next.metadata.resource_version = Some(Self::bump(&mut inner));
            inner.objects.insert(key, next);
        }
        Ok(DeleteOutcome::Deleted)
    }

    async fn set_finalizers(&self, record: &AppDeployment, finalizers: Vec<String>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = key_of(record);
        let mut next = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.1.clone()))?;
        if next.metadata.deletion_timestamp.is_some() && finalizers.is_empty() {
            inner.objects.remove(&key);
            return Ok(());
        }
        next.metadata.finalizers = if finalizers.is_empty() { None } else { Some(finalizers) };
        next.metadata.resource_version = Some(Self::bump(&mut inner));
        inner.objects.insert(key, next);
        Ok(())
    }

    async fn write_status(&self, record: &AppDeployment, status: &AppDeploymentStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = key_of(record);
        let mut next = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.1.clone()))?;
        next.status = Some(status.clone());
        next.metadata.resource_version = Some(Self::bump(&mut inner));
        inner.objects.insert(key, next);
        inner.status_writes.push(status.clone());
        Ok(())
    }
}
