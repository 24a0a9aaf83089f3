//! Deployment lifecycle (§4.10): when to create, cancel, and complete a
//! deployment, and the status-description vocabulary that goes with each
//! transition.

use crate::model::{DeploymentGroupState, DeploymentStatus, Job, JobVersion, TaskGroup};
use crate::plan::deployment_description;

/// Whether a fresh deployment should be created for this group, per §4.10:
/// no existing deployment, the group has an update strategy, desired count
/// is nonzero, and either there were no running allocs at this version yet
/// or this pass introduced destructive/in-place changes.
pub fn should_create_deployment(
    existing_deployment_present: bool,
    task_group: &TaskGroup,
    desired_total: u32,
    had_running_allocs_of_version: bool,
    pass_introduced_changes: bool,
) -> bool {
    !existing_deployment_present
        && task_group.update.is_some()
        && desired_total > 0
        && (!had_running_allocs_of_version || pass_introduced_changes)
}

/// The status and description a newly created deployment starts with.
pub fn initial_deployment_status(
    job: &Job,
    requires_promotion: bool,
    auto_promote: bool,
) -> (DeploymentStatus, String) {
    if job.is_multiregion_deploy_gated() {
        return (
            DeploymentStatus::Pending,
            deployment_description::PENDING_FOR_PEER.to_string(),
        );
    }
    if requires_promotion {
        let description = if auto_promote {
            deployment_description::RUNNING_AUTO_PROMOTION
        } else {
            deployment_description::RUNNING_NEEDS_PROMOTION
        };
        return (DeploymentStatus::Running, description.to_string());
    }
    (DeploymentStatus::Running, String::new())
}

/// Why an existing deployment is being cancelled, or detached silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Already terminal and successful: clear the reference, propose
    /// nothing.
    DetachSilently,
    /// Actively cancel with a status update carrying this description.
    Cancel(&'static str),
}

/// Whether the current deployment should be superseded this pass (§4.10).
pub fn check_cancel(
    job_stopped: bool,
    deployment_status: DeploymentStatus,
    deployment_job_version: JobVersion,
    deployment_job_create_index: crate::model::CreateIndex,
    current_job_version: JobVersion,
    current_job_create_index: crate::model::CreateIndex,
) -> Option<CancelOutcome> {
    if deployment_status == DeploymentStatus::Successful {
        return Some(CancelOutcome::DetachSilently);
    }
    if !deployment_status.is_active() {
        return None;
    }
    if job_stopped {
        return Some(CancelOutcome::Cancel(deployment_description::STOPPED_JOB));
    }
    if deployment_job_version < current_job_version || deployment_job_create_index < current_job_create_index {
        return Some(CancelOutcome::Cancel(deployment_description::NEWER_JOB));
    }
    None
}

/// A group is complete (§4.10) iff this pass proposed no churn for it, no
/// canary is still required, and (when deployment state exists for the
/// group) its health/promotion targets are met.
pub fn is_group_complete(
    counters: &crate::plan::DesiredGroupCounters,
    reschedule_now_count: u32,
    reschedule_later_count: u32,
    canary_still_required: bool,
    deployment_group: Option<&DeploymentGroupState>,
) -> bool {
    let no_pending_changes = counters.destructive == 0
        && counters.in_place == 0
        && counters.place == 0
        && counters.migrate == 0
        && reschedule_now_count == 0
        && reschedule_later_count == 0;

    if !no_pending_changes || canary_still_required {
        return false;
    }

    if let Some(dg) = deployment_group {
        if dg.healthy_allocs < dg.desired_total.max(dg.desired_canaries) {
            return false;
        }
        if dg.desired_canaries > 0 && !dg.promoted {
            return false;
        }
    }

    true
}

/// Whether, given every group's completion, the whole deployment should be
/// marked complete, and with what status/description (§4.10).
pub fn completion_status(
    all_groups_complete: bool,
    job_multiregion_gated: bool,
    deployment_status: DeploymentStatus,
) -> Option<(DeploymentStatus, &'static str)> {
    if !all_groups_complete {
        return None;
    }
    if job_multiregion_gated
        && !matches!(deployment_status, DeploymentStatus::Unblocking | DeploymentStatus::Successful)
    {
        return Some((DeploymentStatus::Blocked, deployment_description::BLOCKED));
    }
    Some((DeploymentStatus::Successful, deployment_description::SUCCESSFUL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::plan::DesiredGroupCounters;

    #[test]
    fn deployment_not_created_without_update_strategy() {
        let tg = TaskGroup {
            name: "web".to_string(),
            count: 3,
            update: None,
            reschedule_policy: None,
            migrate: None,
            stop_after_client_disconnect: None,
            resume_after_client_reconnect: None,
        };
        assert!(!should_create_deployment(false, &tg, 3, false, false));
    }

    #[test]
    fn deployment_created_when_pass_introduces_changes() {
        let tg = TaskGroup {
            name: "web".to_string(),
            count: 3,
            update: Some(UpdateStrategy::default()),
            reschedule_policy: None,
            migrate: None,
            stop_after_client_disconnect: None,
            resume_after_client_reconnect: None,
        };
        assert!(should_create_deployment(false, &tg, 3, true, true));
    }

    #[test]
    fn successful_deployment_detaches_silently() {
        let outcome = check_cancel(
            false,
            DeploymentStatus::Successful,
            JobVersion(1),
            CreateIndex(1),
            JobVersion(1),
            CreateIndex(1),
        );
        assert_eq!(outcome, Some(CancelOutcome::DetachSilently));
    }

    #[test]
    fn stopped_job_cancels_active_deployment() {
        let outcome = check_cancel(
            true,
            DeploymentStatus::Running,
            JobVersion(1),
            CreateIndex(1),
            JobVersion(1),
            CreateIndex(1),
        );
        assert_eq!(
            outcome,
            Some(CancelOutcome::Cancel(deployment_description::STOPPED_JOB))
        );
    }

    #[test]
    fn newer_job_version_cancels_active_deployment() {
        let outcome = check_cancel(
            false,
            DeploymentStatus::Running,
            JobVersion(1),
            CreateIndex(1),
            JobVersion(2),
            CreateIndex(1),
        );
        assert_eq!(
            outcome,
            Some(CancelOutcome::Cancel(deployment_description::NEWER_JOB))
        );
    }

    #[test]
    fn group_with_no_churn_and_no_deployment_state_is_complete() {
        let counters = DesiredGroupCounters::default();
        assert!(is_group_complete(&counters, 0, 0, false, None));
    }

    #[test]
    fn group_incomplete_while_canary_still_required() {
        let counters = DesiredGroupCounters::default();
        assert!(!is_group_complete(&counters, 0, 0, true, None));
    }
}
