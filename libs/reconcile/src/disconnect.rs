//! Disconnect/reconnect planner (§4.5): computes per-alloc disconnect
//! timeouts for allocs on disconnected nodes, batches them into follow-up
//! evals the same way the reschedule planner does, and resolves the
//! reconnecting set into either a non-destructive acknowledgement or a
//! pass-through to the stop selector.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::alloc_set::AllocSet;
use crate::clock::FollowUpEvalIdGen;
use crate::model::{AllocId, Allocation, ClientStatus, NodeStatus, TaintedNode};
use crate::plan::{eval_trigger, FollowUpEval};
use crate::reschedule::FAILED_ALLOC_WINDOW;

/// Output of planning the disconnecting set for one group.
pub struct DisconnectPlan {
    /// Allocs patched to `client_status = unknown` with a follow-up eval id
    /// recorded, keyed by alloc id.
    pub disconnect_updates: BTreeMap<AllocId, Allocation>,
    pub follow_up_evals: Vec<(FollowUpEval, Vec<AllocId>)>,
}

/// Per-alloc disconnect timeout: observed-at + min(node max-disconnect,
/// group resume timeout). `None` if either input needed to compute it is
/// missing — per §7, this degrades to "treat as empty" for the affected
/// alloc, not a fatal error.
fn disconnect_timeout(node: &TaintedNode, group_resume_timeout: Duration) -> Option<DateTime<Utc>> {
    let observed_at = node.disconnected_at?;
    let bound = match node.max_client_disconnect {
        Some(node_max) => node_max.min(group_resume_timeout),
        None => group_resume_timeout,
    };
    Some(observed_at + chrono_duration(bound))
}

pub fn plan_disconnects(
    disconnecting: &AllocSet,
    tainted_nodes: &BTreeMap<plfm_id::NodeId, TaintedNode>,
    group_resume_timeout: Duration,
    task_group: &str,
    id_gen: &mut dyn FollowUpEvalIdGen,
) -> DisconnectPlan {
    let mut timed: Vec<(DateTime<Utc>, Allocation)> = Vec::new();

    for alloc in disconnecting.iter() {
        let Some(node_id) = alloc.node_id else {
            debug!(alloc = %alloc.id, "disconnecting alloc has no node id, skipping");
            continue;
        };
        let Some(node) = tainted_nodes.get(&node_id) else {
            debug!(alloc = %alloc.id, node = %node_id, "disconnecting alloc's node missing from taint index, skipping");
            continue;
        };
        match disconnect_timeout(node, group_resume_timeout) {
            Some(timeout) => timed.push((timeout, alloc.clone())),
            None => {
                debug!(alloc = %alloc.id, "could not compute disconnect timeout, leaving alloc pending a future eval");
            }
        }
    }

    timed.sort_by_key(|(t, a)| (*t, a.id));

    let mut follow_up_evals = Vec::new();
    let mut disconnect_updates = BTreeMap::new();
    let mut i = 0;
    while i < timed.len() {
        let batch_start = timed[i].0;
        let mut members = vec![timed[i].clone()];
        let mut j = i + 1;
        while j < timed.len() && timed[j].0 < batch_start + chrono_duration(FAILED_ALLOC_WINDOW) {
            members.push(timed[j].clone());
            j += 1;
        }
        i = j;

        let eval_id = id_gen.next_id();
        let eval = FollowUpEval {
            id: eval_id,
            task_group: task_group.to_string(),
            wait_until: batch_start,
            trigger: eval_trigger::RESUME_TIMEOUT,
            status_description: format!("{} allocs awaiting client reconnect", members.len()),
        };
        let mut alloc_ids = Vec::with_capacity(members.len());
        for (_, alloc) in &members {
            let mut patched = alloc.clone();
            patched.client_status = ClientStatus::Unknown;
            patched.follow_up_eval_id = Some(eval_id);
            alloc_ids.push(patched.id);
            disconnect_updates.insert(patched.id, patched);
        }
        follow_up_evals.push((eval, alloc_ids));
    }

    DisconnectPlan {
        disconnect_updates,
        follow_up_evals,
    }
}

/// Outcome of resolving one reconnecting alloc (§4.5, second half).
pub enum ReconnectResolution {
    /// Non-destructive: the alloc simply resumes, acknowledged in place.
    Acknowledge(Allocation),
    /// Falls through to the stop selector (§4.7 step 7).
    PassThrough,
}

pub fn resolve_reconnect(alloc: &Allocation) -> ReconnectResolution {
    let wants_migrate_or_reschedule = alloc.desired_transition.should_migrate_or_reschedule();
    if alloc.client_status == ClientStatus::Unknown
        && !wants_migrate_or_reschedule
        && alloc.desired_status == crate::model::DesiredStatus::Run
    {
        ReconnectResolution::Acknowledge(alloc.clone())
    } else {
        ReconnectResolution::PassThrough
    }
}

/// Whether `node` is now observed down, used by stop-selector step 7 to
/// decide whether a reconnecting alloc's node flipped before resolution
/// (SPEC_FULL.md Open Question decision #2: accepted as an inherent race
/// given one snapshot per call).
pub fn node_is_now_down(node_id: Option<plfm_id::NodeId>, tainted_nodes: &BTreeMap<plfm_id::NodeId, TaintedNode>) -> bool {
    node_id
        .and_then(|id| tainted_nodes.get(&id))
        .map(|n| n.status == NodeStatus::Down)
        .unwrap_or(false)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SequentialEvalIdGen;
    use crate::model::*;
    use plfm_id::{EnvId, NodeId};

    fn disconnecting_alloc(node_id: NodeId) -> Allocation {
        Allocation {
            id: AllocId::new(),
            job_id: EnvId::new(),
            task_group: "web".to_string(),
            index: 0,
            job_version: JobVersion(1),
            create_index: CreateIndex(1),
            deployment_id: None,
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Running,
            client_status_updated_at: Utc::now(),
            desired_transition: DesiredTransition::default(),
            deployment_status: None,
            previous_alloc: None,
            node_id: Some(node_id),
            reschedule_tracker: RescheduleTracker::default(),
            follow_up_eval_id: None,
            metrics: PlacementMetrics::default(),
        }
    }

    #[test]
    fn timeout_uses_min_of_node_and_group_bounds() {
        let node_id = NodeId::new();
        let observed_at = Utc::now();
        let node = TaintedNode {
            id: node_id,
            status: NodeStatus::Disconnected,
            draining: false,
            disconnected_at: Some(observed_at),
            max_client_disconnect: Some(Duration::from_secs(10)),
        };
        let alloc = disconnecting_alloc(node_id);
        let set = AllocSet::from_vec(vec![alloc]);
        let mut nodes = BTreeMap::new();
        nodes.insert(node_id, node);
        let mut id_gen = SequentialEvalIdGen::new();
        let plan = plan_disconnects(&set, &nodes, Duration::from_secs(3600), "web", &mut id_gen);
        assert_eq!(plan.disconnect_updates.len(), 1);
        let (eval, _) = &plan.follow_up_evals[0];
        assert_eq!(eval.wait_until, observed_at + chrono::Duration::seconds(10));
    }

    #[test]
    fn missing_node_entry_is_skipped_not_fatal() {
        let alloc = disconnecting_alloc(NodeId::new());
        let set = AllocSet::from_vec(vec![alloc]);
        let mut id_gen = SequentialEvalIdGen::new();
        let plan = plan_disconnects(&set, &BTreeMap::new(), Duration::from_secs(60), "web", &mut id_gen);
        assert!(plan.disconnect_updates.is_empty());
        assert!(plan.follow_up_evals.is_empty());
    }

    #[test]
    fn reconnect_acknowledged_when_run_and_no_transition_flags() {
        let mut alloc = disconnecting_alloc(NodeId::new());
        alloc.client_status = ClientStatus::Unknown;
        match resolve_reconnect(&alloc) {
            ReconnectResolution::Acknowledge(_) => {}
            ReconnectResolution::PassThrough => panic!("expected acknowledge"),
        }
    }

    #[test]
    fn reconnect_falls_through_when_migrate_requested() {
        let mut alloc = disconnecting_alloc(NodeId::new());
        alloc.client_status = ClientStatus::Unknown;
        alloc.desired_transition.migrate = true;
        match resolve_reconnect(&alloc) {
            ReconnectResolution::PassThrough => {}
            ReconnectResolution::Acknowledge(_) => panic!("expected pass-through"),
        }
    }
}
