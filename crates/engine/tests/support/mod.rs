#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use appstore_charts::ChartCatalog;
use appstore_core::memory::MemoryRecords;
use appstore_core::messages::{StatusNotifier, StatusUpdate};
use appstore_core::{AppDeployment, AppDeploymentSpec, RecordStore, Values, ValuesError, ValuesReference, ValuesSource};
use appstore_engine::{EngineConfig, Next, Reconciler};
use appstore_release::{ReleaseError, ReleaseInfo, ReleaseLifecycle, ReleaseRequest};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Install(String, Values),
    Upgrade(String, Values, Option<String>),
    Uninstall(String),
}

/// Helm stand-in keeping releases in memory.
#[derive(Default)]
pub struct FakeReleases {
    releases: Mutex<BTreeMap<(String, String), ReleaseInfo>>,
    calls: Mutex<Vec<Call>>,
    fail_next: Mutex<Option<ReleaseError>>,
}

impl FakeReleases {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls().len()
    }

    pub fn fail_next(&self, err: ReleaseError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn release(&self, ns: &str, name: &str) -> Option<ReleaseInfo> {
        self.releases.lock().unwrap().get(&(ns.to_string(), name.to_string())).cloned()
    }

    fn take_failure(&self) -> Result<(), ReleaseError> {
        match self.fail_next.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn put(&self, req: &ReleaseRequest) -> ReleaseInfo {
        let key = (req.namespace.clone(), req.release.clone());
        let mut releases = self.releases.lock().unwrap();
        let revision = releases.get(&key).map(|r| r.revision + 1).unwrap_or(1);
        let info = ReleaseInfo {
            name: req.release.clone(),
            namespace: req.namespace.clone(),
            revision,
            status: "deployed".into(),
            chart_name: req.chart.clone(),
            chart_version: req.version.clone().unwrap_or_else(|| "12.1.0".into()),
            app_version: Some("15.3.0".into()),
            updated: Some(chrono::Utc::now()),
        };
        releases.insert(key, info.clone());
        info
    }
}

#[async_trait]
impl ReleaseLifecycle for FakeReleases {
    async fn install(&self, req: &ReleaseRequest) -> Result<ReleaseInfo, ReleaseError> {
        self.calls.lock().unwrap().push(Call::Install(req.release.clone(), req.values.clone()));
        self.take_failure()?;
        Ok(self.put(req))
    }

    async fn upgrade(&self, req: &ReleaseRequest) -> Result<ReleaseInfo, ReleaseError> {
        self.calls.lock().unwrap().push(Call::Upgrade(req.release.clone(), req.values.clone(), req.version.clone()));
        self.take_failure()?;
        if self.release(&req.namespace, &req.release).is_none() {
            return Err(ReleaseError::NotInstalled { release: req.release.clone(), namespace: req.namespace.clone() });
        }
        Ok(self.put(req))
    }

    async fn uninstall(&self, name: &str, namespace: &str) -> Result<(), ReleaseError> {
        self.calls.lock().unwrap().push(Call::Uninstall(name.to_string()));
        self.take_failure()?;
        self.releases.lock().unwrap().remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn get(&self, name: &str, namespace: &str) -> Result<Option<ReleaseInfo>, ReleaseError> {
        Ok(self.release(namespace, name))
    }
}

pub struct FakeCharts(pub Vec<String>);

#[async_trait]
impl ChartCatalog for FakeCharts {
    async fn exists(&self, name: &str) -> bool {
        self.0.iter().any(|c| c == name)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = self.0.clone();
        names.sort();
        Ok(names)
    }

    async fn path(&self, name: &str) -> Option<PathBuf> {
        self.exists(name).await.then(|| PathBuf::from("/charts").join(name))
    }
}

/// ConfigMap/Secret documents keyed by (namespace, name, key).
#[derive(Default)]
pub struct FakeValues {
    docs: Mutex<BTreeMap<(String, String, String), String>>,
}

impl FakeValues {
    pub fn put(&self, ns: &str, name: &str, key: &str, text: &str) {
        self.docs.lock().unwrap().insert((ns.into(), name.into(), key.into()), text.into());
    }
}

#[async_trait]
impl ValuesSource for FakeValues {
    async fn fetch(&self, namespace: &str, reference: &ValuesReference) -> Result<String, ValuesError> {
        self.docs
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), reference.name.clone(), reference.values_key.clone()))
            .cloned()
            .ok_or_else(|| ValuesError::MissingObject { kind: reference.kind.to_string(), name: reference.name.clone() })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub updates: Mutex<Vec<StatusUpdate>>,
}

#[async_trait]
impl StatusNotifier for RecordingNotifier {
    async fn notify(&self, update: StatusUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

pub struct Harness {
    pub store: Arc<MemoryRecords>,
    pub releases: Arc<FakeReleases>,
    pub values: Arc<FakeValues>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_charts(&["postgresql", "redis", "mongodb"])
    }

    pub fn with_charts(charts: &[&str]) -> Self {
        let store = Arc::new(MemoryRecords::new());
        let releases = Arc::new(FakeReleases::default());
        let values = Arc::new(FakeValues::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let catalog = Arc::new(FakeCharts(charts.iter().map(|c| c.to_string()).collect()));
        let engine =
            Reconciler::new(releases.clone(), store.clone(), values.clone(), catalog, EngineConfig::default())
                .with_notifier(notifier.clone());
        Self { store, releases, values, notifier, engine }
    }

    /// Reconcile the stored record once, as the controller would.
    pub async fn pass(&self, ns: &str, name: &str) -> Next {
        let record = self.store.get(ns, name).await.unwrap().expect("record exists");
        self.engine.reconcile(&record).await.unwrap()
    }

    /// Passes until the record settles (finalizer registration included).
    pub async fn converge(&self, ns: &str, name: &str) -> Next {
        let mut next = self.pass(ns, name).await;
        while next == Next::RequeueNow {
            next = self.pass(ns, name).await;
        }
        next
    }

    pub fn record(&self, ns: &str, name: &str) -> AppDeployment {
        self.store.snapshot(ns, name).expect("record exists")
    }

    pub async fn edit(&self, ns: &str, name: &str, f: impl FnOnce(&mut AppDeploymentSpec)) {
        let mut record = self.record(ns, name);
        f(&mut record.spec);
        self.store.replace(&record).await.unwrap();
    }
}

pub fn spec(app: &str, team: &str) -> AppDeploymentSpec {
    AppDeploymentSpec {
        app_name: app.into(),
        chart_version: None,
        team_id: team.into(),
        requested_by: None,
        release_name: None,
        values: None,
        values_from: vec![],
        auto_upgrade: false,
        suspend: false,
    }
}

pub fn record(ns: &str, name: &str, spec: AppDeploymentSpec) -> AppDeployment {
    let mut d = AppDeployment::new(name, spec);
    d.metadata.namespace = Some(ns.into());
    d
}
