//! Canary policy (§4.6): stops canaries superseded by a newer or failed
//! deployment, extracts the current deployment's canaries out of the
//! taint-classified sets, and decides whether more canaries are required
//! before destructive updates may proceed.

use std::collections::BTreeSet;

use crate::alloc_set::AllocSet;
use crate::model::{AllocId, ClientStatus, Deployment, DeploymentGroupState, UpdateStrategy};
use crate::plan::{stop_reason, Stop};

fn placed_canaries_for_group(deployment: &Deployment, group: &str) -> Vec<AllocId> {
    deployment
        .group(group)
        .map(|g: &DeploymentGroupState| g.placed_canaries.clone())
        .unwrap_or_default()
}

/// Stops for canaries left over from a superseded or failed deployment.
/// These never belong to the current rollout, so they are stopped
/// unconditionally rather than routed through taint classification.
pub fn stop_superseded_canaries(
    old_deployment: Option<&Deployment>,
    current_deployment: Option<&Deployment>,
    group: &str,
    all_group_allocs: &AllocSet,
) -> Vec<Stop> {
    let mut ids: BTreeSet<AllocId> = BTreeSet::new();
    if let Some(d) = old_deployment {
        ids.extend(placed_canaries_for_group(d, group));
    }
    if let Some(d) = current_deployment {
        if d.status == crate::model::DeploymentStatus::Failed {
            ids.extend(placed_canaries_for_group(d, group));
        }
    }

    ids.into_iter()
        .filter_map(|id| all_group_allocs.get(&id))
        .filter(|a| !a.client_status.is_terminal())
        .map(|a| Stop {
            alloc: a.id,
            client_status_override: None,
            reason: stop_reason::ALLOC_UPDATING,
            follow_up_eval_id: None,
        })
        .collect()
}

/// Result of pulling the current deployment's canaries out of the
/// taint-classified sets.
pub struct ExtractedCanaries {
    /// Canaries still untainted: the ones that remain candidates for
    /// promotion.
    pub canaries: AllocSet,
    pub stops: Vec<Stop>,
}

/// Removes the current deployment's placed canaries from `untainted`,
/// `migrating`, and `lost` in place, stopping the ones that landed in
/// `migrating`/`lost` and returning the rest as the live canary set.
pub fn extract_canaries(
    untainted: &mut AllocSet,
    migrating: &mut AllocSet,
    lost: &mut AllocSet,
    current_deployment: Option<&Deployment>,
    group: &str,
) -> ExtractedCanaries {
    let placed = current_deployment
        .map(|d| placed_canaries_for_group(d, group))
        .unwrap_or_default();

    let mut canaries = AllocSet::new();
    let mut stops = Vec::new();

    for id in placed {
        if let Some(a) = migrating.remove(&id) {
            stops.push(Stop {
                alloc: a.id,
                client_status_override: None,
                reason: stop_reason::ALLOC_MIGRATING,
                follow_up_eval_id: None,
            });
        } else if let Some(a) = lost.remove(&id) {
            stops.push(Stop {
                alloc: a.id,
                client_status_override: Some(ClientStatus::Lost),
                reason: stop_reason::ALLOC_LOST,
                follow_up_eval_id: None,
            });
        } else if let Some(a) = untainted.remove(&id) {
            canaries.insert(a);
        }
    }

    ExtractedCanaries { canaries, stops }
}

/// What the orchestrator must do to satisfy the canary requirement, if any.
pub struct CanaryRequirement {
    pub desired_canaries: u32,
    pub new_placements: u32,
}

/// Decides whether the group needs to place more canaries before
/// destructive updates proceed (§4.6).
pub fn require_canaries(
    has_destructive_pending: bool,
    canaries: &AllocSet,
    strategy: &UpdateStrategy,
    canaries_promoted: bool,
    deployment_paused_or_failed: bool,
) -> Option<CanaryRequirement> {
    if !has_destructive_pending {
        return None;
    }
    if canaries_promoted {
        return None;
    }
    let have = canaries.len() as u32;
    if have >= strategy.canary {
        return None;
    }

    let new_placements = if deployment_paused_or_failed {
        0
    } else {
        strategy.canary - have
    };

    Some(CanaryRequirement {
        desired_canaries: strategy.canary,
        new_placements,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use plfm_id::EnvId;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn alloc(id: AllocId) -> Allocation {
        Allocation {
            id,
            job_id: EnvId::new(),
            task_group: "web".to_string(),
            index: 0,
            job_version: JobVersion(1),
            create_index: CreateIndex(1),
            deployment_id: None,
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Running,
            client_status_updated_at: chrono::Utc::now(),
            desired_transition: DesiredTransition::default(),
            deployment_status: Some(AllocDeploymentStatus { healthy: None, canary: true }),
            previous_alloc: None,
            node_id: None,
            reschedule_tracker: RescheduleTracker::default(),
            follow_up_eval_id: None,
            metrics: PlacementMetrics::default(),
        }
    }

    fn deployment_with_canaries(ids: Vec<AllocId>, status: DeploymentStatus) -> Deployment {
        let mut groups = BTreeMap::new();
        groups.insert(
            "web".to_string(),
            DeploymentGroupState {
                desired_total: 3,
                desired_canaries: 1,
                placed_canaries: ids,
                healthy_allocs: 0,
                promoted: false,
                auto_revert: false,
                auto_promote: false,
                progress_deadline: Duration::from_secs(600),
            },
        );
        Deployment {
            id: plfm_id::DeployId::new(),
            job_version: JobVersion(2),
            job_create_index: CreateIndex(1),
            status,
            status_description: String::new(),
            groups,
        }
    }

    #[test]
    fn extract_pulls_canary_out_of_untainted() {
        let canary = alloc(AllocId::new());
        let mut untainted = AllocSet::from_vec(vec![canary.clone()]);
        let mut migrating = AllocSet::new();
        let mut lost = AllocSet::new();
        let deployment = deployment_with_canaries(vec![canary.id], DeploymentStatus::Running);

        let out = extract_canaries(&mut untainted, &mut migrating, &mut lost, Some(&deployment), "web");
        assert_eq!(out.canaries.len(), 1);
        assert!(out.stops.is_empty());
        assert!(untainted.is_empty());
    }

    #[test]
    fn migrating_canary_is_stopped_with_migrating_reason() {
        let canary = alloc(AllocId::new());
        let mut untainted = AllocSet::new();
        let mut migrating = AllocSet::from_vec(vec![canary.clone()]);
        let mut lost = AllocSet::new();
        let deployment = deployment_with_canaries(vec![canary.id], DeploymentStatus::Running);

        let out = extract_canaries(&mut untainted, &mut migrating, &mut lost, Some(&deployment), "web");
        assert!(out.canaries.is_empty());
        assert_eq!(out.stops.len(), 1);
        assert_eq!(out.stops[0].reason, stop_reason::ALLOC_MIGRATING);
        assert!(migrating.is_empty());
    }

    #[test]
    fn requires_canaries_when_below_strategy_count() {
        let strategy = UpdateStrategy { canary: 1, ..UpdateStrategy::default() };
        let canaries = AllocSet::new();
        let req = require_canaries(true, &canaries, &strategy, false, false).expect("should require");
        assert_eq!(req.desired_canaries, 1);
        assert_eq!(req.new_placements, 1);
    }

    #[test]
    fn paused_deployment_requires_canaries_but_no_new_placements() {
        let strategy = UpdateStrategy { canary: 1, ..UpdateStrategy::default() };
        let canaries = AllocSet::new();
        let req = require_canaries(true, &canaries, &strategy, false, true).expect("should require");
        assert_eq!(req.new_placements, 0);
    }

    #[test]
    fn promoted_group_does_not_require_more_canaries() {
        let strategy = UpdateStrategy { canary: 1, ..UpdateStrategy::default() };
        let canaries = AllocSet::new();
        assert!(require_canaries(true, &canaries, &strategy, true, false).is_none());
    }
}
