use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use appstore_charts::ChartCatalog;
use appstore_core::Values;
use appstore_release::{
    ChartOp, HelmDriver, LockScope, ManagerConfig, ReleaseError, ReleaseInfo, ReleaseLifecycle, ReleaseManager,
    ReleaseRequest,
};
use async_trait::async_trait;
use serde_json::json;

struct DirCatalog {
    root: PathBuf,
}

#[async_trait]
impl ChartCatalog for DirCatalog {
    async fn exists(&self, name: &str) -> bool {
        self.root.join(name).join("Chart.yaml").is_file()
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }

    async fn path(&self, name: &str) -> Option<PathBuf> {
        self.exists(name).await.then(|| self.root.join(name))
    }
}

#[derive(Default)]
struct FakeHelm {
    releases: Mutex<BTreeMap<(String, String), ReleaseInfo>>,
    calls: Mutex<Vec<String>>,
    last_values: Mutex<Option<Values>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl FakeHelm {
    fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Default::default() }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn busy(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn store(&self, op: &ChartOp<'_>) -> ReleaseInfo {
        let key = (op.namespace.to_string(), op.release.to_string());
        let mut releases = self.releases.lock().unwrap();
        let revision = releases.get(&key).map(|r| r.revision + 1).unwrap_or(1);
        let info = ReleaseInfo {
            name: op.release.to_string(),
            namespace: op.namespace.to_string(),
            revision,
            status: "deployed".into(),
            chart_name: op.chart_dir.file_name().unwrap().to_string_lossy().into_owned(),
            chart_version: "1.0.0".into(),
            app_version: None,
            updated: Some(chrono::Utc::now()),
        };
        releases.insert(key, info.clone());
        *self.last_values.lock().unwrap() = Some(op.values.clone());
        info
    }
}

#[async_trait]
impl HelmDriver for FakeHelm {
    async fn install(&self, op: ChartOp<'_>) -> Result<ReleaseInfo> {
        self.calls.lock().unwrap().push(format!("install {}", op.release));
        self.busy().await;
        Ok(self.store(&op))
    }

    async fn upgrade(&self, op: ChartOp<'_>) -> Result<ReleaseInfo> {
        self.calls.lock().unwrap().push(format!("upgrade {}", op.release));
        self.busy().await;
        Ok(self.store(&op))
    }

    async fn uninstall(&self, name: &str, namespace: &str, _timeout: Duration) -> Result<bool> {
        self.calls.lock().unwrap().push(format!("uninstall {}", name));
        Ok(self.releases.lock().unwrap().remove(&(namespace.to_string(), name.to_string())).is_some())
    }

    async fn status(&self, name: &str, namespace: &str) -> Result<Option<ReleaseInfo>> {
        Ok(self.releases.lock().unwrap().get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn pull(&self, _repo_url: &str, chart: &str, version: Option<&str>, dest: &Path) -> Result<PathBuf> {
        self.calls.lock().unwrap().push(format!("pull {}", chart));
        let dir = dest.join(chart);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("Chart.yaml"), format!("name: {}\nversion: {}\n", chart, version.unwrap_or("9.9.9")))?;
        Ok(dir)
    }
}

struct Fixture {
    _charts: tempfile::TempDir,
    cache: tempfile::TempDir,
    helm: Arc<FakeHelm>,
    manager: Arc<ReleaseManager>,
}

fn fixture(helm: FakeHelm, tweak: impl FnOnce(&mut ManagerConfig)) -> Fixture {
    let charts = tempfile::tempdir().unwrap();
    for (name, version) in [("postgresql", "12.1.0"), ("redis", "18.0.0")] {
        let dir = charts.path().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Chart.yaml"), format!("apiVersion: v2\nname: {name}\nversion: {version}\n")).unwrap();
    }
    std::fs::create_dir_all(charts.path().join("broken")).unwrap();
    std::fs::write(charts.path().join("broken/Chart.yaml"), "name: [unterminated").unwrap();

    let cache = tempfile::tempdir().unwrap();
    let mut cfg = ManagerConfig { cache_dir: cache.path().to_path_buf(), ..Default::default() };
    tweak(&mut cfg);
    let helm = Arc::new(helm);
    let catalog = Arc::new(DirCatalog { root: charts.path().to_path_buf() });
    let manager = Arc::new(ReleaseManager::new(helm.clone(), catalog, cfg));
    Fixture { _charts: charts, cache, helm, manager }
}

fn request(release: &str, chart: &str) -> ReleaseRequest {
    let values = json!({"replicas": 3}).as_object().unwrap().clone();
    ReleaseRequest { release: release.into(), chart: chart.into(), namespace: "ns1".into(), values, version: None }
}

#[tokio::test]
async fn install_then_get() {
    let fx = fixture(FakeHelm::default(), |_| {});
    let info = fx.manager.install(&request("pg", "postgresql")).await.unwrap();
    assert_eq!(info.revision, 1);
    assert_eq!(info.chart_name, "postgresql");
    assert_eq!(fx.helm.last_values.lock().unwrap().as_ref().unwrap()["replicas"], 3);

    assert!(fx.manager.exists("pg", "ns1").await.unwrap());
    assert!(!fx.manager.exists("pg", "other").await.unwrap());
}

#[tokio::test]
async fn missing_chart_is_package_not_found() {
    let fx = fixture(FakeHelm::default(), |_| {});
    let err = fx.manager.install(&request("x", "mongodb")).await.unwrap_err();
    assert_eq!(err, ReleaseError::PackageNotFound("mongodb".into()));
    assert!(fx.helm.calls().is_empty());
}

#[tokio::test]
async fn unreadable_descriptor_is_load_error() {
    let fx = fixture(FakeHelm::default(), |_| {});
    let err = fx.manager.install(&request("b", "broken")).await.unwrap_err();
    assert!(matches!(err, ReleaseError::Load { ref chart, .. } if chart == "broken"), "{err:?}");
    assert!(fx.helm.calls().is_empty());
}

#[tokio::test]
async fn remote_repository_fills_mirror_gaps() {
    let fx = fixture(FakeHelm::default(), |cfg| cfg.chart_repo_url = Some("https://charts.example.com".into()));
    let mut req = request("mongo", "mongodb");
    req.version = Some("14.0.0".into());

    fx.manager.install(&req).await.unwrap();
    assert!(fx.cache.path().join("mongodb-14.0.0/mongodb/Chart.yaml").is_file());

    // pinned versions are served from the cache afterwards
    fx.manager.upgrade(&req).await.unwrap();
    assert_eq!(fx.helm.calls(), vec!["pull mongodb", "install mongo", "upgrade mongo"]);
}

#[tokio::test]
async fn upgrade_requires_existing_release() {
    let fx = fixture(FakeHelm::default(), |_| {});
    let err = fx.manager.upgrade(&request("pg", "postgresql")).await.unwrap_err();
    assert_eq!(err, ReleaseError::NotInstalled { release: "pg".into(), namespace: "ns1".into() });

    fx.manager.install(&request("pg", "postgresql")).await.unwrap();
    let info = fx.manager.upgrade(&request("pg", "postgresql")).await.unwrap();
    assert_eq!(info.revision, 2);
}

#[tokio::test]
async fn uninstall_of_absent_release_succeeds() {
    let fx = fixture(FakeHelm::default(), |_| {});
    fx.manager.uninstall("ghost", "ns1").await.unwrap();

    fx.manager.install(&request("pg", "postgresql")).await.unwrap();
    fx.manager.uninstall("pg", "ns1").await.unwrap();
    assert!(fx.manager.get("pg", "ns1").await.unwrap().is_none());
}

#[tokio::test]
async fn slow_operations_time_out() {
    let fx = fixture(FakeHelm::with_delay(Duration::from_millis(500)), |cfg| cfg.timeout = Duration::from_millis(20));
    let err = fx.manager.install(&request("pg", "postgresql")).await.unwrap_err();
    assert!(matches!(err, ReleaseError::Timeout { op: "install", .. }), "{err:?}");
}

async fn run_pair(fx: &Fixture, a: &str, b: &str) {
    let (m1, m2) = (fx.manager.clone(), fx.manager.clone());
    let (r1, r2) = (request(a, "redis"), request(b, "redis"));
    let t1 = tokio::spawn(async move { m1.install(&r1).await });
    let t2 = tokio::spawn(async move { m2.install(&r2).await });
    t1.await.unwrap().unwrap();
    t2.await.unwrap().unwrap();
}

#[tokio::test]
async fn mutations_on_one_release_are_serialized() {
    let fx = fixture(FakeHelm::with_delay(Duration::from_millis(50)), |_| {});
    run_pair(&fx, "cache", "cache").await;
    assert_eq!(fx.helm.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn distinct_releases_proceed_in_parallel() {
    let fx = fixture(FakeHelm::with_delay(Duration::from_millis(100)), |_| {});
    run_pair(&fx, "cache-a", "cache-b").await;
    assert_eq!(fx.helm.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn global_scope_serializes_everything() {
    let fx = fixture(FakeHelm::with_delay(Duration::from_millis(50)), |cfg| cfg.lock_scope = LockScope::Global);
    run_pair(&fx, "cache-a", "cache-b").await;
    assert_eq!(fx.helm.max_in_flight.load(Ordering::SeqCst), 1);
}
