//! Status transitions. Phases and conditions always move together.

use appstore_core::messages::StatusUpdate;
use appstore_core::{
    set_condition, AppDeployment, AppDeploymentStatus, Condition, Phase, CONDITION_READY, CONDITION_RECONCILING,
};
use appstore_release::ReleaseInfo;
use chrono::Utc;
use kube::ResourceExt;

/// Install, upgrade or uninstall under way.
pub(crate) fn begin(status: &mut AppDeploymentStatus, phase: Phase, generation: i64, message: String) {
    status.phase = Some(phase);
    status.message = Some(message.clone());
    status.last_reconcile_time = Some(Utc::now());
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_RECONCILING, true, phase.as_str(), message).with_generation(generation),
    );
}

pub(crate) fn deployed(status: &mut AppDeploymentStatus, info: &ReleaseInfo, hash: &str, generation: i64) {
    let message = format!("release {} at revision {} (chart {})", info.name, info.revision, info.chart_version);
    status.phase = Some(Phase::Deployed);
    status.helm_release_name = Some(info.name.clone());
    status.helm_release_revision = Some(info.revision);
    status.deployed_chart_version = Some(info.chart_version.clone());
    status.last_applied_values_hash = Some(hash.to_string());
    status.observed_generation = generation;
    status.failure_count = 0;
    status.message = Some(message.clone());
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_READY, true, "Deployed", message.clone()).with_generation(generation),
    );
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_RECONCILING, false, "Deployed", message).with_generation(generation),
    );
}

pub(crate) fn failed(status: &mut AppDeploymentStatus, reason: &str, message: String, generation: i64) {
    status.phase = Some(Phase::Failed);
    status.observed_generation = generation;
    status.failure_count = status.failure_count.saturating_add(1);
    status.message = Some(message.clone());
    status.last_reconcile_time = Some(Utc::now());
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_READY, false, reason, message.clone()).with_generation(generation),
    );
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_RECONCILING, false, reason, message).with_generation(generation),
    );
}

/// Equal apart from the reconcile timestamp.
pub(crate) fn same_settled(a: &AppDeploymentStatus, b: &AppDeploymentStatus) -> bool {
    let strip = |s: &AppDeploymentStatus| AppDeploymentStatus { last_reconcile_time: None, ..s.clone() };
    strip(a) == strip(b)
}

pub(crate) fn update_for(record: &AppDeployment, status: &AppDeploymentStatus) -> Option<StatusUpdate> {
    let phase = status.phase?;
    Some(StatusUpdate {
        name: record.name_any(),
        namespace: record.namespace_or_default(),
        phase: phase.to_string(),
        message: status.message.clone(),
        helm_release_name: status.helm_release_name.clone(),
        helm_release_revision: status.helm_release_revision,
        deployed_chart_version: status.deployed_chart_version.clone(),
        updated_at: status.last_reconcile_time.unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use appstore_core::ConditionStatus;

    fn info(revision: i64) -> ReleaseInfo {
        ReleaseInfo {
            name: "pg".into(),
            namespace: "ns1".into(),
            revision,
            status: "deployed".into(),
            chart_name: "postgresql".into(),
            chart_version: "12.1.0".into(),
            app_version: None,
            updated: None,
        }
    }

    #[test]
    fn failure_then_success_resets_counter_and_flips_ready() {
        let mut s = AppDeploymentStatus::default();
        failed(&mut s, "InstallFailed", "boom".into(), 1);
        failed(&mut s, "InstallFailed", "boom".into(), 1);
        assert_eq!(s.failure_count, 2);
        assert_eq!(s.condition(CONDITION_READY).unwrap().status, ConditionStatus::False);

        deployed(&mut s, &info(1), "abc", 1);
        assert_eq!(s.failure_count, 0);
        assert_eq!(s.phase, Some(Phase::Deployed));
        let ready = s.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, "Deployed");
        assert_eq!(s.condition(CONDITION_RECONCILING).unwrap().status, ConditionStatus::False);
    }

    #[test]
    fn begin_marks_reconciling_with_phase_reason() {
        let mut s = AppDeploymentStatus::default();
        begin(&mut s, Phase::Installing, 3, "installing".into());
        let c = s.condition(CONDITION_RECONCILING).unwrap();
        assert_eq!(c.status, ConditionStatus::True);
        assert_eq!(c.reason, "Installing");
        assert_eq!(c.observed_generation, Some(3));
        assert!(s.condition(CONDITION_READY).is_none());
    }

    #[test]
    fn settled_comparison_ignores_reconcile_time() {
        let mut a = AppDeploymentStatus::default();
        deployed(&mut a, &info(1), "abc", 1);
        let mut b = a.clone();
        b.last_reconcile_time = Some(Utc::now());
        assert!(same_settled(&a, &b));
        b.helm_release_revision = Some(2);
        assert!(!same_settled(&a, &b));
    }
}
