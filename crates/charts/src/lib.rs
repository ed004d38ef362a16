//! Appstore charts: a local, periodically refreshed git mirror of the chart
//! repository, queried by the engine (existence) and the release manager
//! (on-disk path).

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};

mod git;
mod mirror;

pub use mirror::{ChartMirror, MirrorConfig, MirrorState};

/// File whose presence at a directory root marks a chart.
pub const DESCRIPTOR_FILE: &str = "Chart.yaml";

/// Read-only view over installable charts.
#[async_trait]
pub trait ChartCatalog: Send + Sync {
    async fn exists(&self, name: &str) -> bool;
    /// Sorted chart names.
    async fn list(&self) -> Result<Vec<String>>;
    /// Directory of the chart, if it exists.
    async fn path(&self, name: &str) -> Option<PathBuf>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate { head: String },
    Updated { from: Option<String>, to: String },
}

impl PullOutcome {
    pub fn head(&self) -> &str {
        match self {
            PullOutcome::UpToDate { head } => head,
            PullOutcome::Updated { to, .. } => to,
        }
    }
}

/// Subset of `Chart.yaml` we care about.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartDescriptor {
    pub name: String,
    #[serde(deserialize_with = "stringish")]
    pub version: String,
    #[serde(default, deserialize_with = "opt_stringish")]
    pub app_version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ChartDescriptor {
    pub fn load(chart_dir: &Path) -> Result<Self> {
        let file = chart_dir.join(DESCRIPTOR_FILE);
        let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", file.display()))
    }
}

// Chart.yaml versions are sometimes unquoted (`version: 1.0`).
fn stringish<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = serde_yaml::Value::deserialize(d)?;
    match v {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected a version string, got {:?}", other))),
    }
}

fn opt_stringish<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    stringish(d).map(Some)
}

/// Entry names that may denote a chart: non-empty, not hidden, a single path component.
pub(crate) fn valid_entry_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains('/') && !name.contains('\\')
}

pub(crate) fn is_chart_dir(root: &Path, name: &str) -> bool {
    if !valid_entry_name(name) {
        return false;
    }
    let dir = root.join(name);
    dir.is_dir() && dir.join(DESCRIPTOR_FILE).is_file()
}
