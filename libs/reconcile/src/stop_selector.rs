//! Stop selector (§4.7): the eight-step algorithm that picks which
//! allocations to stop when a group is over its desired count or is
//! replacing tainted allocations.

use std::collections::BTreeMap;

use plfm_id::NodeId;

use crate::alloc_set::AllocSet;
use crate::disconnect::node_is_now_down;
use crate::model::{AllocId, Allocation, ClientStatus, EvalId, TaintedNode};
use crate::name_index::NameIndex;
use crate::plan::{stop_reason, Stop};

/// Inputs to one group's stop selection pass. `untainted` must already have
/// canaries and acknowledged reconnects folded in/out as appropriate by the
/// caller; `reconnecting` holds only the allocs that fell through
/// disconnect-planning's acknowledge check (§4.5) and still need
/// resolution here.
pub struct StopSelectorInput<'a> {
    pub count: u32,
    pub name_index: &'a mut NameIndex,
    pub untainted: AllocSet,
    pub migrating: AllocSet,
    pub lost: AllocSet,
    pub reconnecting: AllocSet,
    pub canaries: &'a AllocSet,
    pub is_canarying: bool,
    pub lost_follow_up_evals: &'a BTreeMap<AllocId, EvalId>,
    pub tainted_nodes: &'a BTreeMap<NodeId, TaintedNode>,
}

pub struct StopSelectorOutcome {
    pub stops: Vec<Stop>,
    /// The untainted set after every stop decision, ready for update
    /// classification and placement computation.
    pub untainted: AllocSet,
    /// Reconnecting allocs resolved as "keep" by the score comparison in
    /// step 7, to be recorded in `Plan::reconnect_updates`.
    pub reconnect_updates: Vec<Allocation>,
    /// Migrating allocs step 6 did not convert into outright stops (the
    /// group was not shrinking enough to absorb them); the caller still
    /// owes each of these a migrate-stop and replacement placement.
    pub remaining_migrating: AllocSet,
}

pub fn select_stops(mut input: StopSelectorInput) -> StopSelectorOutcome {
    let mut stops = Vec::new();
    let mut reconnect_updates = Vec::new();

    // Step 1: every lost alloc stops, carrying its follow-up eval id if the
    // disconnect/reschedule planner batched one for it.
    for alloc in input.lost.iter() {
        stops.push(Stop {
            alloc: alloc.id,
            client_status_override: Some(ClientStatus::Lost),
            reason: stop_reason::ALLOC_LOST,
            follow_up_eval_id: input.lost_follow_up_evals.get(&alloc.id).copied(),
        });
    }

    // Step 4 (done up front so the surplus in step 3 reflects reality):
    // drop allocs already marked terminal so they are never double-stopped.
    let mut untainted = input.untainted.drop_terminal_desired();

    // Step 3: surplus.
    let mut surplus = untainted.len() as i64 + input.migrating.len() as i64 + input.reconnecting.len() as i64
        - input.count as i64;

    if surplus <= 0 {
        return StopSelectorOutcome {
            stops,
            untainted,
            reconnect_updates,
            remaining_migrating: input.migrating,
        };
    }

    // Step 5: canary-match preference, post-promotion tail.
    if !input.is_canarying && !input.canaries.is_empty() {
        let canary_names: std::collections::BTreeSet<String> =
            input.canaries.iter().map(|a| a.name()).collect();
        let matches: Vec<AllocId> = untainted
            .name_order()
            .into_iter()
            .filter(|a| canary_names.contains(&a.name()))
            .map(|a| a.id)
            .collect();
        for id in matches {
            if surplus <= 0 {
                break;
            }
            if let Some(a) = untainted.remove(&id) {
                input.name_index.unset_index(a.index);
                stops.push(Stop {
                    alloc: a.id,
                    client_status_override: None,
                    reason: stop_reason::ALLOC_UPDATING,
                    follow_up_eval_id: None,
                });
                surplus -= 1;
            }
        }
    }

    // Step 6: migrate-prefer. Convert the highest-indexed migrating allocs
    // directly into stops rather than migrate-and-replace, since the group
    // is shrinking and no longer needs that name.
    if surplus > 0 {
        let mut migrating_index = NameIndex::new(0, &input.migrating);
        let highest = migrating_index.highest(surplus.max(0) as u32);
        for idx in highest {
            if surplus <= 0 {
                break;
            }
            if let Some(a) = remove_by_index(&mut input.migrating, idx) {
                input.name_index.unset_index(a.index);
                stops.push(Stop {
                    alloc: a.id,
                    client_status_override: None,
                    reason: stop_reason::ALLOC_NOT_NEEDED,
                    follow_up_eval_id: None,
                });
                surplus -= 1;
            }
        }
    }

    // Step 7: reconnecting resolution.
    let pending_reconnects: Vec<Allocation> = input.reconnecting.into_vec();
    for alloc in pending_reconnects {
        if surplus <= 0 {
            reconnect_updates.push(alloc);
            continue;
        }

        if alloc.desired_status != crate::model::DesiredStatus::Run
            || alloc.desired_transition.should_migrate_or_reschedule()
        {
            input.name_index.unset_index(alloc.index);
            stops.push(Stop {
                alloc: alloc.id,
                client_status_override: None,
                reason: stop_reason::ALLOC_NOT_NEEDED,
                follow_up_eval_id: None,
            });
            surplus -= 1;
            continue;
        }

        if node_is_now_down(alloc.node_id, input.tainted_nodes) {
            input.name_index.unset_index(alloc.index);
            stops.push(Stop {
                alloc: alloc.id,
                client_status_override: Some(ClientStatus::Lost),
                reason: stop_reason::ALLOC_LOST,
                follow_up_eval_id: None,
            });
            surplus -= 1;
            continue;
        }

        let replacement = untainted
            .iter()
            .find(|a| a.name() == alloc.name() && a.id != alloc.id)
            .cloned();

        match replacement {
            None => reconnect_updates.push(alloc),
            Some(replacement) => match (alloc.metrics.norm_score, replacement.metrics.norm_score) {
                (Some(reconnect_score), Some(replacement_score)) => {
                    // Tie keeps the reconnecting alloc and stops the replacement.
                    if reconnect_score >= replacement_score {
                        untainted.remove(&replacement.id);
                        input.name_index.unset_index(replacement.index);
                        stops.push(Stop {
                            alloc: replacement.id,
                            client_status_override: None,
                            reason: stop_reason::ALLOC_NOT_NEEDED,
                            follow_up_eval_id: None,
                        });
                        reconnect_updates.push(alloc);
                    } else {
                        input.name_index.unset_index(alloc.index);
                        stops.push(Stop {
                            alloc: alloc.id,
                            client_status_override: None,
                            reason: stop_reason::ALLOC_NOT_NEEDED,
                            follow_up_eval_id: None,
                        });
                    }
                    surplus -= 1;
                }
                _ => {
                    // Missing placement metric: keep both, skip this
                    // candidate (§7).
                    reconnect_updates.push(alloc);
                }
            },
        }
    }

    // Step 8: fill remaining surplus from the tail of the name index.
    if surplus > 0 {
        let mut remaining: Vec<&Allocation> = untainted.iter().collect();
        remaining.sort_by(|a, b| {
            b.index
                .cmp(&a.index)
                .then(a.create_index.cmp(&b.create_index))
                .then(a.id.cmp(&b.id))
        });
        let to_stop: Vec<AllocId> = remaining
            .into_iter()
            .take(surplus.max(0) as usize)
            .map(|a| a.id)
            .collect();
        for id in to_stop {
            if let Some(a) = untainted.remove(&id) {
                input.name_index.unset_index(a.index);
                stops.push(Stop {
                    alloc: a.id,
                    client_status_override: None,
                    reason: stop_reason::ALLOC_NOT_NEEDED,
                    follow_up_eval_id: None,
                });
            }
        }
    }

    StopSelectorOutcome {
        stops,
        untainted,
        reconnect_updates,
        remaining_migrating: input.migrating,
    }
}

fn remove_by_index(set: &mut AllocSet, index: u32) -> Option<Allocation> {
    let id = set.iter().find(|a| a.index == index).map(|a| a.id)?;
    set.remove(&id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use plfm_id::EnvId;

    fn alloc(id: AllocId, index: u32) -> Allocation {
        Allocation {
            id,
            job_id: EnvId::new(),
            task_group: "web".to_string(),
            index,
            job_version: JobVersion(1),
            create_index: CreateIndex(index as u64),
            deployment_id: None,
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Running,
            client_status_updated_at: chrono::Utc::now(),
            desired_transition: DesiredTransition::default(),
            deployment_status: None,
            previous_alloc: None,
            node_id: None,
            reschedule_tracker: RescheduleTracker::default(),
            follow_up_eval_id: None,
            metrics: PlacementMetrics::default(),
        }
    }

    #[test]
    fn no_surplus_returns_only_lost_stops() {
        let a0 = alloc(AllocId::new(), 0);
        let untainted = AllocSet::from_vec(vec![a0.clone()]);
        let seed = untainted.clone();
        let mut name_index = NameIndex::new(1, &seed);
        let canaries = AllocSet::new();
        let out = select_stops(StopSelectorInput {
            count: 1,
            name_index: &mut name_index,
            untainted,
            migrating: AllocSet::new(),
            lost: AllocSet::new(),
            reconnecting: AllocSet::new(),
            canaries: &canaries,
            is_canarying: false,
            lost_follow_up_evals: &BTreeMap::new(),
            tainted_nodes: &BTreeMap::new(),
        });
        assert!(out.stops.is_empty());
        assert_eq!(out.untainted.len(), 1);
    }

    #[test]
    fn surplus_stops_highest_index_tail() {
        let a0 = alloc(AllocId::new(), 0);
        let a1 = alloc(AllocId::new(), 1);
        let a2 = alloc(AllocId::new(), 2);
        let untainted = AllocSet::from_vec(vec![a0, a1, a2.clone()]);
        let seed = untainted.clone();
        let mut name_index = NameIndex::new(3, &seed);
        let canaries = AllocSet::new();
        let out = select_stops(StopSelectorInput {
            count: 2,
            name_index: &mut name_index,
            untainted,
            migrating: AllocSet::new(),
            lost: AllocSet::new(),
            reconnecting: AllocSet::new(),
            canaries: &canaries,
            is_canarying: false,
            lost_follow_up_evals: &BTreeMap::new(),
            tainted_nodes: &BTreeMap::new(),
        });
        assert_eq!(out.stops.len(), 1);
        assert_eq!(out.stops[0].alloc, a2.id);
        assert_eq!(out.untainted.len(), 2);
    }

    #[test]
    fn lost_allocs_always_stop_with_client_status_lost() {
        let lost_alloc = alloc(AllocId::new(), 0);
        let lost = AllocSet::from_vec(vec![lost_alloc.clone()]);
        let mut name_index = NameIndex::new(0, &AllocSet::new());
        let canaries = AllocSet::new();
        let out = select_stops(StopSelectorInput {
            count: 0,
            name_index: &mut name_index,
            untainted: AllocSet::new(),
            migrating: AllocSet::new(),
            lost,
            reconnecting: AllocSet::new(),
            canaries: &canaries,
            is_canarying: false,
            lost_follow_up_evals: &BTreeMap::new(),
            tainted_nodes: &BTreeMap::new(),
        });
        assert_eq!(out.stops.len(), 1);
        assert_eq!(out.stops[0].client_status_override, Some(ClientStatus::Lost));
    }
}
