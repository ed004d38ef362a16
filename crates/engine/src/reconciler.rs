use std::sync::Arc;
use std::time::Instant;

use appstore_charts::ChartCatalog;
use appstore_core::messages::StatusNotifier;
use appstore_core::naming::validate_release_name;
use appstore_core::values::values_hash;
use appstore_core::{AppDeployment, AppDeploymentStatus, Phase, RecordStore, ValuesSource, FINALIZER};
use appstore_release::{ReleaseError, ReleaseInfo, ReleaseLifecycle, ReleaseRequest};
use chrono::Utc;
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use kube::ResourceExt;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::status;
use crate::values::resolve_values;
use crate::{EngineConfig, EngineError, Next};

#[derive(Clone, Copy)]
enum Op {
    Install,
    Upgrade,
}

pub struct Reconciler {
    releases: Arc<dyn ReleaseLifecycle>,
    records: Arc<dyn RecordStore>,
    values: Arc<dyn ValuesSource>,
    charts: Arc<dyn ChartCatalog>,
    notifier: Option<Arc<dyn StatusNotifier>>,
    cfg: EngineConfig,
}

impl Reconciler {
    pub fn new(
        releases: Arc<dyn ReleaseLifecycle>,
        records: Arc<dyn RecordStore>,
        values: Arc<dyn ValuesSource>,
        charts: Arc<dyn ChartCatalog>,
        cfg: EngineConfig,
    ) -> Self {
        Self { releases, records, values, charts, notifier: None, cfg }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn StatusNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// One pass over `record`. Deployment failures end up in status; only
    /// failures to persist status or finalizers are returned as errors.
    pub async fn reconcile(&self, record: &AppDeployment) -> Result<Next, EngineError> {
        let started = Instant::now();
        let res = self.step(record).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_millis() as f64);
        let outcome = match &res {
            Ok(next) => next.label(),
            Err(_) => "error",
        };
        counter!("reconcile_total", 1u64, "outcome" => outcome);
        res
    }

    async fn step(&self, record: &AppDeployment) -> Result<Next, EngineError> {
        if record.is_deleting() {
            if record.has_finalizer() {
                return self.finalize(record).await;
            }
            return Ok(Next::AwaitChange);
        }
        if !record.has_finalizer() {
            let mut finalizers = record.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            self.records
                .set_finalizers(record, finalizers)
                .await
                .map_err(|source| EngineError::Finalizers { name: record.name_any(), source })?;
            debug!(name = %record.name_any(), "finalizer added");
            return Ok(Next::RequeueNow);
        }
        if record.spec.suspend {
            debug!(name = %record.name_any(), "suspended; skipping");
            return Ok(Next::AwaitChange);
        }
        self.converge(record).await
    }

    async fn finalize(&self, record: &AppDeployment) -> Result<Next, EngineError> {
        let ns = record.namespace_or_default();
        let generation = record.generation();
        let mut st = record.status_or_default();
        // The release we actually installed, if we got that far.
        let release = st.helm_release_name.clone().unwrap_or_else(|| record.release_name());

        status::begin(&mut st, Phase::Uninstalling, generation, format!("uninstalling release {}", release));
        self.write(record, &st).await?;

        let res = match self.releases.get(&release, &ns).await {
            Ok(Some(_)) => self.releases.uninstall(&release, &ns).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        match res {
            Ok(()) => {
                let finalizers = record.finalizers().iter().filter(|f| *f != FINALIZER).cloned().collect();
                self.records
                    .set_finalizers(record, finalizers)
                    .await
                    .map_err(|source| EngineError::Finalizers { name: record.name_any(), source })?;
                info!(name = %record.name_any(), ns = %ns, release = %release, "cleanup complete; finalizer removed");
                Ok(Next::AwaitChange)
            }
            Err(e) => {
                warn!(name = %record.name_any(), ns = %ns, release = %release, error = %e, "uninstall failed; will retry");
                st.message = Some(e.to_string());
                st.failure_count = st.failure_count.saturating_add(1);
                self.write(record, &st).await?;
                Ok(Next::RequeueAfter(self.cfg.failure_interval))
            }
        }
    }

    async fn converge(&self, record: &AppDeployment) -> Result<Next, EngineError> {
        let ns = record.namespace_or_default();
        let chart = record.spec.app_name.as_str();

        if !self.charts.exists(chart).await {
            let available = match self.charts.list().await {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "listing charts failed");
                    Vec::new()
                }
            };
            return self.fail(record, "ChartNotFound", chart_not_found(chart, &available)).await;
        }

        let release = record.release_name();
        if let Err(e) = validate_release_name(&release) {
            return self.fail(record, "InvalidReleaseName", e.to_string()).await;
        }

        let values = match resolve_values(self.values.as_ref(), record).await {
            Ok(v) => v,
            Err(e) => return self.fail(record, "ValuesError", e.to_string()).await,
        };
        let hash = values_hash(&values);

        let existing = match self.releases.get(&release, &ns).await {
            Ok(r) => r,
            Err(e) => return self.fail(record, "ReleaseQueryFailed", e.to_string()).await,
        };
        let req = ReleaseRequest {
            release,
            chart: chart.to_string(),
            namespace: ns,
            values,
            version: record.requested_version().map(str::to_string),
        };

        let Some(current) = existing else {
            return self.apply(record, Op::Install, req, hash).await;
        };
        let stored = record.status_or_default();
        let deployed_version = stored.deployed_chart_version.as_deref().unwrap_or(current.chart_version.as_str());
        let hash_changed = stored.last_applied_values_hash.as_deref() != Some(hash.as_str());
        let version_changed = req.version.as_deref().map_or(false, |v| v != deployed_version);
        if hash_changed || version_changed {
            debug!(release = %req.release, hash_changed, version_changed, "upgrade needed");
            return self.apply(record, Op::Upgrade, req, hash).await;
        }
        self.settle(record, &current, &hash).await
    }

    async fn apply(&self, record: &AppDeployment, op: Op, req: ReleaseRequest, hash: String) -> Result<Next, EngineError> {
        let generation = record.generation();
        let mut st = record.status_or_default();
        let (phase, verb) = match op {
            Op::Install => (Phase::Installing, "installing"),
            Op::Upgrade => (Phase::Upgrading, "upgrading"),
        };
        status::begin(&mut st, phase, generation, format!("{} release {} (chart {})", verb, req.release, req.chart));
        st.last_attempted_chart_version = req.version.clone();
        self.write(record, &st).await?;

        let res = match op {
            Op::Install => self.releases.install(&req).await,
            Op::Upgrade => self.releases.upgrade(&req).await,
        };
        match res {
            Ok(info) => {
                status::deployed(&mut st, &info, &hash, generation);
                st.last_reconcile_time = Some(Utc::now());
                self.write(record, &st).await?;
                self.notify(record, &st).await;
                info!(name = %record.name_any(), release = %info.name, revision = info.revision, "deployed");
                Ok(Next::RequeueAfter(self.cfg.success_interval))
            }
            Err(e) => {
                let reason = match (&e, op) {
                    (ReleaseError::PackageNotFound(_), _) => "ChartNotFound",
                    (ReleaseError::Load { .. }, _) => "ChartLoadFailed",
                    (ReleaseError::Timeout { .. }, _) => "Timeout",
                    (_, Op::Install) => "InstallFailed",
                    (_, Op::Upgrade) => "UpgradeFailed",
                };
                self.fail_with(record, st, reason, e.to_string()).await
            }
        }
    }

    /// Nothing to change in Helm; write status only if it would differ.
    async fn settle(&self, record: &AppDeployment, current: &ReleaseInfo, hash: &str) -> Result<Next, EngineError> {
        let stored = record.status_or_default();
        let mut st = stored.clone();
        let mut observed = current.clone();
        if let Some(v) = stored.deployed_chart_version.as_ref() {
            observed.chart_version = v.clone();
        }
        status::deployed(&mut st, &observed, hash, record.generation());
        if !status::same_settled(&st, &stored) {
            st.last_reconcile_time = Some(Utc::now());
            self.write(record, &st).await?;
            self.notify(record, &st).await;
            debug!(name = %record.name_any(), "status refreshed");
        }
        Ok(Next::RequeueAfter(self.cfg.success_interval))
    }

    async fn fail(&self, record: &AppDeployment, reason: &str, message: String) -> Result<Next, EngineError> {
        self.fail_with(record, record.status_or_default(), reason, message).await
    }

    async fn fail_with(
        &self,
        record: &AppDeployment,
        mut st: AppDeploymentStatus,
        reason: &str,
        message: String,
    ) -> Result<Next, EngineError> {
        warn!(name = %record.name_any(), ns = %record.namespace_or_default(), reason, message = %message, "reconcile failed");
        status::failed(&mut st, reason, message, record.generation());
        self.write(record, &st).await?;
        self.notify(record, &st).await;
        Ok(Next::RequeueAfter(self.cfg.failure_interval))
    }

    async fn write(&self, record: &AppDeployment, st: &AppDeploymentStatus) -> Result<(), EngineError> {
        self.records.write_status(record, st).await.map_err(|source| EngineError::Status { name: record.name_any(), source })
    }

    async fn notify(&self, record: &AppDeployment, st: &AppDeploymentStatus) {
        let Some(notifier) = &self.notifier else { return };
        if let Some(update) = status::update_for(record, st) {
            notifier.notify(update).await;
        }
    }
}

fn chart_not_found(chart: &str, available: &[String]) -> String {
    let listed = if available.is_empty() { "none".to_string() } else { available.join(", ") };
    let mut msg = format!("chart {} not found in catalog; available charts: {}", chart, listed);
    let matcher = SkimMatcherV2::default();
    let best = available
        .iter()
        .filter_map(|c| matcher.fuzzy_match(c, chart).map(|score| (score, c)))
        .max_by_key(|(score, _)| *score);
    if let Some((_, suggestion)) = best {
        msg.push_str(&format!(" (did you mean {}?)", suggestion));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_lists_and_suggests() {
        let available = vec!["mongodb".to_string(), "postgresql".to_string(), "redis".to_string()];
        let msg = chart_not_found("postgres", &available);
        assert!(msg.contains("available charts: mongodb, postgresql, redis"), "{msg}");
        assert!(msg.ends_with("(did you mean postgresql?)"), "{msg}");

        let msg = chart_not_found("zzz", &[]);
        assert_eq!(msg, "chart zzz not found in catalog; available charts: none");
    }
}
