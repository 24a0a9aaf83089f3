//! Placement & limit computation (§4.9). Pure computation only; the commit
//! rule that decides which of these proposed placements actually make it
//! into the `Plan` lives in `reconciler`, since it needs the deployment's
//! pause/fail/canary state and mutates the plan directly.

use crate::alloc_set::AllocSet;
use crate::model::{alloc_name, Allocation, JobId, TaskGroup};
use crate::name_index::NameIndex;
use crate::plan::Placement;

/// `computeLimit` (§4.9): how many destructive updates may be committed
/// this pass. `current_deployment_allocs` are the group's allocs tagged
/// with the current deployment id, used to detect in-flight/unhealthy
/// allocations already part of the rollout.
pub fn compute_limit(
    task_group: &TaskGroup,
    has_destructive_or_migrating: bool,
    canarying: bool,
    deployment_paused_or_failed: bool,
    current_deployment_allocs: &[Allocation],
) -> u32 {
    let Some(strategy) = &task_group.update else {
        return task_group.count;
    };
    if !has_destructive_or_migrating {
        return task_group.count;
    }
    if deployment_paused_or_failed {
        return 0;
    }
    if canarying {
        return 0;
    }

    let mut limit: i64 = strategy.max_parallel as i64;
    for alloc in current_deployment_allocs {
        match alloc.deployment_status {
            Some(s) if s.is_unhealthy() => return 0,
            Some(s) if s.is_healthy() => {}
            _ => limit -= 1,
        }
    }
    limit.max(0) as u32
}

/// `computePlacements` (§4.9). Pulls fresh names from `name_index`, so it
/// must run in the deterministic order the spec lists: reschedule-now,
/// then lost backfill, then fresh names.
pub fn compute_placements(
    job_id: JobId,
    task_group: &TaskGroup,
    name_index: &mut NameIndex,
    untainted: &AllocSet,
    migrating: &AllocSet,
    reschedule_now: &AllocSet,
    reconnecting: &AllocSet,
    canarying: bool,
    lost: &AllocSet,
) -> Vec<Placement> {
    let mut placements = Vec::new();

    for alloc in reschedule_now.name_order() {
        placements.push(Placement {
            name: alloc.name(),
            task_group: task_group.name.clone(),
            previous_alloc: Some(alloc.id),
            canary: false,
            reschedule: true,
            lost: false,
            downgrade_non_canary: canarying && !alloc.is_canary(),
            min_job_version: Some(alloc.job_version),
        });
    }

    let mut existing =
        untainted.len() + migrating.len() + reschedule_now.len() + reconnecting.len();

    for alloc in lost.name_order() {
        if existing >= task_group.count as usize {
            break;
        }
        placements.push(Placement {
            name: alloc.name(),
            task_group: task_group.name.clone(),
            previous_alloc: Some(alloc.id),
            canary: false,
            reschedule: false,
            lost: true,
            downgrade_non_canary: false,
            min_job_version: None,
        });
        existing += 1;
    }

    if existing < task_group.count as usize {
        let need = task_group.count - existing as u32;
        for idx in name_index.next(need) {
            placements.push(Placement {
                name: alloc_name(&job_id, &task_group.name, idx),
                task_group: task_group.name.clone(),
                previous_alloc: None,
                canary: false,
                reschedule: false,
                lost: false,
                downgrade_non_canary: canarying,
                min_job_version: None,
            });
        }
    }

    placements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use plfm_id::EnvId;
    use std::time::Duration;

    #[test]
    fn unconstrained_limit_when_no_update_strategy() {
        let tg = TaskGroup {
            name: "web".to_string(),
            count: 3,
            update: None,
            reschedule_policy: None,
            migrate: None,
            stop_after_client_disconnect: None,
            resume_after_client_reconnect: None,
        };
        assert_eq!(compute_limit(&tg, true, false, false, &[]), 3);
    }

    #[test]
    fn paused_deployment_has_zero_limit() {
        let tg = TaskGroup {
            name: "web".to_string(),
            count: 3,
            update: Some(UpdateStrategy::default()),
            reschedule_policy: None,
            migrate: None,
            stop_after_client_disconnect: None,
            resume_after_client_reconnect: None,
        };
        assert_eq!(compute_limit(&tg, true, false, true, &[]), 0);
    }

    #[test]
    fn max_parallel_decremented_by_in_flight_allocs() {
        let tg = TaskGroup {
            name: "web".to_string(),
            count: 3,
            update: Some(UpdateStrategy {
                canary: 0,
                max_parallel: 2,
                auto_promote: false,
                auto_revert: false,
                progress_deadline: Duration::from_secs(600),
            }),
            reschedule_policy: None,
            migrate: None,
            stop_after_client_disconnect: None,
            resume_after_client_reconnect: None,
        };
        let in_flight = Allocation {
            id: AllocId::new(),
            job_id: EnvId::new(),
            task_group: "web".to_string(),
            index: 0,
            job_version: JobVersion(2),
            create_index: CreateIndex(1),
            deployment_id: None,
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Running,
            client_status_updated_at: chrono::Utc::now(),
            desired_transition: DesiredTransition::default(),
            deployment_status: Some(AllocDeploymentStatus { healthy: None, canary: false }),
            previous_alloc: None,
            node_id: None,
            reschedule_tracker: RescheduleTracker::default(),
            follow_up_eval_id: None,
            metrics: PlacementMetrics::default(),
        };
        assert_eq!(compute_limit(&tg, true, false, false, &[in_flight]), 1);
    }

    #[test]
    fn unhealthy_alloc_drops_limit_to_zero() {
        let tg = TaskGroup {
            name: "web".to_string(),
            count: 3,
            update: Some(UpdateStrategy::default()),
            reschedule_policy: None,
            migrate: None,
            stop_after_client_disconnect: None,
            resume_after_client_reconnect: None,
        };
        let unhealthy = Allocation {
            id: AllocId::new(),
            job_id: EnvId::new(),
            task_group: "web".to_string(),
            index: 0,
            job_version: JobVersion(2),
            create_index: CreateIndex(1),
            deployment_id: None,
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Running,
            client_status_updated_at: chrono::Utc::now(),
            desired_transition: DesiredTransition::default(),
            deployment_status: Some(AllocDeploymentStatus { healthy: Some(false), canary: false }),
            previous_alloc: None,
            node_id: None,
            reschedule_tracker: RescheduleTracker::default(),
            follow_up_eval_id: None,
            metrics: PlacementMetrics::default(),
        };
        assert_eq!(compute_limit(&tg, true, false, false, &[unhealthy]), 0);
    }

    #[test]
    fn fresh_names_fill_remaining_count() {
        let job_id = EnvId::new();
        let tg = TaskGroup {
            name: "web".to_string(),
            count: 3,
            update: None,
            reschedule_policy: None,
            migrate: None,
            stop_after_client_disconnect: None,
            resume_after_client_reconnect: None,
        };
        let mut name_index = NameIndex::new(3, &AllocSet::new());
        let empty = AllocSet::new();
        let placements = compute_placements(
            job_id,
            &tg,
            &mut name_index,
            &empty,
            &empty,
            &empty,
            &empty,
            false,
            &empty,
        );
        assert_eq!(placements.len(), 3);
        assert_eq!(placements[0].name, format!("{}.web[0]", job_id));
    }
}
