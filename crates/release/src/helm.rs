use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use appstore_core::Values;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::ReleaseInfo;

/// Everything Helm needs to render and apply a chart.
#[derive(Debug, Clone, Copy)]
pub struct ChartOp<'a> {
    pub release: &'a str,
    pub namespace: &'a str,
    pub chart_dir: &'a Path,
    pub values: &'a Values,
    pub timeout: Duration,
}

/// Raw Helm operations. No locking, no chart resolution.
#[async_trait]
pub trait HelmDriver: Send + Sync {
    async fn install(&self, op: ChartOp<'_>) -> Result<ReleaseInfo>;
    async fn upgrade(&self, op: ChartOp<'_>) -> Result<ReleaseInfo>;
    /// `Ok(false)` when there was nothing to remove.
    async fn uninstall(&self, name: &str, namespace: &str, timeout: Duration) -> Result<bool>;
    async fn status(&self, name: &str, namespace: &str) -> Result<Option<ReleaseInfo>>;
    /// Download and unpack `chart` from a chart repository under `dest`;
    /// returns the chart directory.
    async fn pull(&self, repo_url: &str, chart: &str, version: Option<&str>, dest: &Path) -> Result<PathBuf>;
}

/// Drives the `helm` binary. Operations never wait for workload readiness.
#[derive(Debug, Clone)]
pub struct HelmCli {
    bin: PathBuf,
    kube_context: Option<String>,
}

impl HelmCli {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into(), kube_context: None }
    }

    pub fn with_kube_context(mut self, ctx: impl Into<String>) -> Self {
        self.kube_context = Some(ctx.into());
        self
    }

    async fn run(&self, args: &[String]) -> Result<Output> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args).kill_on_drop(true);
        if let Some(ctx) = &self.kube_context {
            cmd.arg("--kube-context").arg(ctx);
        }
        debug!(bin = %self.bin.display(), ?args, "running helm");
        cmd.output().await.with_context(|| format!("spawning {}", self.bin.display()))
    }

    async fn apply(&self, verb: &str, op: ChartOp<'_>) -> Result<ReleaseInfo> {
        // helm reads values from a file; JSON is valid YAML.
        let mut values_file = tempfile::Builder::new().prefix("appstore-values-").suffix(".json").tempfile()?;
        serde_json::to_writer(&mut values_file, op.values)?;
        values_file.flush()?;

        let args = apply_args(verb, &op, values_file.path());
        let out = self.run(&args).await?;
        if !out.status.success() {
            bail!("helm {} failed: {}", verb, stderr_of(&out));
        }
        parse_release(&out.stdout)
    }
}

#[async_trait]
impl HelmDriver for HelmCli {
    async fn install(&self, op: ChartOp<'_>) -> Result<ReleaseInfo> {
        self.apply("install", op).await
    }

    async fn upgrade(&self, op: ChartOp<'_>) -> Result<ReleaseInfo> {
        self.apply("upgrade", op).await
    }

    async fn uninstall(&self, name: &str, namespace: &str, timeout: Duration) -> Result<bool> {
        let args = vec![
            "uninstall".to_string(),
            name.to_string(),
            "--namespace".into(),
            namespace.to_string(),
            "--timeout".into(),
            helm_duration(timeout),
        ];
        let out = self.run(&args).await?;
        if out.status.success() {
            return Ok(true);
        }
        let err = stderr_of(&out);
        if is_not_found(&err) {
            return Ok(false);
        }
        bail!("helm uninstall failed: {}", err)
    }

    async fn status(&self, name: &str, namespace: &str) -> Result<Option<ReleaseInfo>> {
        let args = vec![
            "status".to_string(),
            name.to_string(),
            "--namespace".into(),
            namespace.to_string(),
            "--output".into(),
            "json".into(),
        ];
        let out = self.run(&args).await?;
        if out.status.success() {
            return parse_release(&out.stdout).map(Some);
        }
        let err = stderr_of(&out);
        if is_not_found(&err) {
            return Ok(None);
        }
        bail!("helm status failed: {}", err)
    }

    async fn pull(&self, repo_url: &str, chart: &str, version: Option<&str>, dest: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest).await.with_context(|| format!("creating {}", dest.display()))?;
        let mut args = vec![
            "pull".to_string(),
            chart.to_string(),
            "--repo".into(),
            repo_url.to_string(),
            "--untar".into(),
            "--untardir".into(),
            dest.display().to_string(),
        ];
        if let Some(v) = version {
            args.push("--version".into());
            args.push(v.to_string());
        }
        let out = self.run(&args).await?;
        if !out.status.success() {
            bail!("helm pull {} from {} failed: {}", chart, repo_url, stderr_of(&out));
        }
        Ok(dest.join(chart))
    }
}

/// Arguments for `helm install|upgrade`.
fn apply_args(verb: &str, op: &ChartOp<'_>, values_file: &Path) -> Vec<String> {
    let mut args = vec![
        verb.to_string(),
        op.release.to_string(),
        op.chart_dir.display().to_string(),
        "--namespace".into(),
        op.namespace.to_string(),
        "--values".into(),
        values_file.display().to_string(),
        "--timeout".into(),
        helm_duration(op.timeout),
        "--output".into(),
        "json".into(),
    ];
    if verb == "install" {
        args.push("--create-namespace".into());
    }
    args
}

fn stderr_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).trim().to_string()
}

/// Helm's `driver.ErrReleaseNotFound`. Other "not found" errors (kube
/// context, namespace) mean the release state is unknown.
fn is_not_found(stderr: &str) -> bool {
    stderr.contains("release: not found")
}

/// Go duration string understood by `--timeout`.
fn helm_duration(d: Duration) -> String {
    format!("{}s", d.as_secs().max(1))
}

#[derive(Deserialize)]
struct HelmRelease {
    name: String,
    namespace: String,
    version: i64,
    info: HelmInfo,
    chart: HelmChart,
}

#[derive(Deserialize)]
struct HelmInfo {
    status: String,
    #[serde(default)]
    last_deployed: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct HelmChart {
    metadata: HelmChartMeta,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HelmChartMeta {
    name: String,
    version: String,
    #[serde(default)]
    app_version: Option<String>,
}

fn parse_release(stdout: &[u8]) -> Result<ReleaseInfo> {
    let r: HelmRelease = serde_json::from_slice(stdout).context("decoding helm release JSON")?;
    Ok(ReleaseInfo {
        name: r.name,
        namespace: r.namespace,
        revision: r.version,
        status: r.info.status,
        chart_name: r.chart.metadata.name,
        chart_version: r.chart.metadata.version,
        app_version: r.chart.metadata.app_version,
        updated: r.info.last_deployed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_helm_release_json() {
        let raw = br#"{
            "name": "postgresql",
            "namespace": "ns1",
            "version": 3,
            "info": {"status": "deployed", "first_deployed": "2026-01-01T00:00:00Z", "last_deployed": "2026-02-03T04:05:06.123456789Z", "notes": ""},
            "chart": {"metadata": {"name": "postgresql", "version": "12.1.0", "appVersion": "15.3.0"}, "values": {}},
            "config": {"auth": {"database": "app"}}
        }"#;
        let info = parse_release(raw).unwrap();
        assert_eq!(info.revision, 3);
        assert_eq!(info.status, "deployed");
        assert_eq!(info.chart_version, "12.1.0");
        assert_eq!(info.app_version.as_deref(), Some("15.3.0"));
        let updated = info.updated.unwrap();
        assert_eq!(updated.to_rfc3339_opts(chrono::SecondsFormat::Secs, true), "2026-02-03T04:05:06Z");
    }

    #[test]
    fn missing_last_deployed_is_tolerated() {
        let raw = br#"{"name": "r", "namespace": "ns1", "version": 1, "info": {"status": "pending-install"},
            "chart": {"metadata": {"name": "redis", "version": "1.0.0"}}}"#;
        assert_eq!(parse_release(raw).unwrap().updated, None);
    }

    #[test]
    fn garbage_output_is_an_error() {
        assert!(parse_release(b"Error: something").is_err());
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found("Error: release: not found"));
        assert!(is_not_found("Error: uninstall: Release not loaded: pg: release: not found"));
        assert!(!is_not_found("Error: Kubernetes cluster unreachable"));
        assert!(!is_not_found(r#"Error: Kubernetes cluster unreachable: context "prod" not found"#));
        assert!(!is_not_found(r#"Error: create: failed to create: namespaces "ns1" not found"#));
    }

    #[test]
    fn only_install_creates_the_namespace() {
        let values = Values::new();
        let op = ChartOp {
            release: "pg",
            namespace: "ns1",
            chart_dir: Path::new("/charts/postgresql"),
            values: &values,
            timeout: Duration::from_secs(300),
        };
        let install = apply_args("install", &op, Path::new("/tmp/v.json"));
        assert_eq!(&install[..3], &["install", "pg", "/charts/postgresql"]);
        assert!(install.iter().any(|a| a == "--create-namespace"));
        assert!(install.windows(2).any(|w| w == ["--timeout", "300s"]));

        let upgrade = apply_args("upgrade", &op, Path::new("/tmp/v.json"));
        assert!(!upgrade.iter().any(|a| a == "--create-namespace"));
    }

    #[test]
    fn durations_are_whole_seconds() {
        assert_eq!(helm_duration(Duration::from_secs(300)), "300s");
        assert_eq!(helm_duration(Duration::from_millis(10)), "1s");
    }
}
