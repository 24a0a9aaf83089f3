//! Taint classification (§4.1, §4.3): partitions an alloc set into
//! `{untainted, migrating, lost, disconnecting, reconnecting}` using the
//! node health index. Terminal allocations are dropped entirely — they are
//! not part of any of the five subsets.

use std::collections::BTreeMap;

use plfm_id::NodeId;

use crate::alloc_set::AllocSet;
use crate::model::{Allocation, ClientStatus, NodeStatus, TaintedNode};

/// The five disjoint subsets produced by one classification pass.
#[derive(Debug, Clone, Default)]
pub struct TaintedGroups {
    pub untainted: AllocSet,
    pub migrating: AllocSet,
    pub lost: AllocSet,
    pub disconnecting: AllocSet,
    pub reconnecting: AllocSet,
}

/// Classify `allocs` using `tainted_nodes` (only tainted nodes appear in
/// the index; an id absent from it is implicitly `Ready`) and
/// `has_reconnect_policy`, the owning task group's
/// `resume_after_client_reconnect` presence.
pub fn classify(
    allocs: &AllocSet,
    tainted_nodes: &BTreeMap<NodeId, TaintedNode>,
    has_reconnect_policy: bool,
) -> TaintedGroups {
    let mut groups = TaintedGroups::default();

    for alloc in allocs.iter() {
        if alloc.client_status.is_terminal() && alloc.client_status != ClientStatus::Lost {
            // Complete/Failed allocations are handled by the reschedule
            // planner, not the taint classifier; they are dropped from
            // this pass's output entirely (policy table: "terminal ->
            // dropped").
            continue;
        }

        let node = alloc.node_id.as_ref().and_then(|id| tainted_nodes.get(id));

        if alloc.client_status == ClientStatus::Unknown {
            // Reconnecting iff the node is once again ready (i.e. either
            // untracked, or tracked but not currently tainted for a
            // disconnect/down reason).
            if node.is_none() {
                groups.reconnecting.insert(alloc.clone());
            }
            continue;
        }

        if alloc.client_status == ClientStatus::Lost {
            groups.lost.insert(alloc.clone());
            continue;
        }

        match node {
            None => {
                groups.untainted.insert(alloc.clone());
            }
            Some(node) => classify_on_tainted_node(alloc, node, has_reconnect_policy, &mut groups),
        }
    }

    groups
}

fn classify_on_tainted_node(
    alloc: &Allocation,
    node: &TaintedNode,
    has_reconnect_policy: bool,
    groups: &mut TaintedGroups,
) {
    if !alloc.is_running_or_pending() {
        return;
    }

    if node.is_drain_or_ineligible() {
        groups.migrating.insert(alloc.clone());
        return;
    }

    match node.status {
        NodeStatus::Down => {
            groups.lost.insert(alloc.clone());
        }
        NodeStatus::Disconnected => {
            if has_reconnect_policy {
                groups.disconnecting.insert(alloc.clone());
            } else {
                groups.lost.insert(alloc.clone());
            }
        }
        NodeStatus::Ineligible | NodeStatus::Initializing => {
            // Ineligible-but-not-draining and initializing nodes keep
            // their current allocations in place; they simply cannot
            // receive new ones (enforced by the placement ranker, out of
            // scope).
            groups.untainted.insert(alloc.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use plfm_id::EnvId;

    fn base_alloc(client_status: ClientStatus, node_id: Option<NodeId>) -> Allocation {
        Allocation {
            id: AllocId::new(),
            job_id: EnvId::new(),
            task_group: "web".to_string(),
            index: 0,
            job_version: JobVersion(1),
            create_index: CreateIndex(1),
            deployment_id: None,
            desired_status: DesiredStatus::Run,
            client_status,
            client_status_updated_at: chrono::Utc::now(),
            desired_transition: DesiredTransition::default(),
            deployment_status: None,
            previous_alloc: None,
            node_id,
            reschedule_tracker: RescheduleTracker::default(),
            follow_up_eval_id: None,
            metrics: PlacementMetrics::default(),
        }
    }

    #[test]
    fn node_absent_from_index_is_untainted() {
        let alloc = base_alloc(ClientStatus::Running, Some(NodeId::new()));
        let set = AllocSet::from_vec(vec![alloc]);
        let groups = classify(&set, &BTreeMap::new(), false);
        assert_eq!(groups.untainted.len(), 1);
    }

    #[test]
    fn down_node_is_lost() {
        let node_id = NodeId::new();
        let alloc = base_alloc(ClientStatus::Running, Some(node_id));
        let set = AllocSet::from_vec(vec![alloc]);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            node_id,
            TaintedNode {
                id: node_id,
                status: NodeStatus::Down,
                draining: false,
                disconnected_at: None,
                max_client_disconnect: None,
            },
        );
        let groups = classify(&set, &nodes, true);
        assert_eq!(groups.lost.len(), 1);
    }

    #[test]
    fn disconnected_with_reconnect_policy_is_disconnecting() {
        let node_id = NodeId::new();
        let alloc = base_alloc(ClientStatus::Running, Some(node_id));
        let set = AllocSet::from_vec(vec![alloc]);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            node_id,
            TaintedNode {
                id: node_id,
                status: NodeStatus::Disconnected,
                draining: false,
                disconnected_at: Some(chrono::Utc::now()),
                max_client_disconnect: None,
            },
        );
        let groups = classify(&set, &nodes, true);
        assert_eq!(groups.disconnecting.len(), 1);
        assert!(groups.lost.is_empty());
    }

    #[test]
    fn disconnected_without_reconnect_policy_is_lost() {
        let node_id = NodeId::new();
        let alloc = base_alloc(ClientStatus::Running, Some(node_id));
        let set = AllocSet::from_vec(vec![alloc]);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            node_id,
            TaintedNode {
                id: node_id,
                status: NodeStatus::Disconnected,
                draining: false,
                disconnected_at: Some(chrono::Utc::now()),
                max_client_disconnect: None,
            },
        );
        let groups = classify(&set, &nodes, false);
        assert_eq!(groups.lost.len(), 1);
    }

    #[test]
    fn draining_node_is_migrating() {
        let node_id = NodeId::new();
        let alloc = base_alloc(ClientStatus::Running, Some(node_id));
        let set = AllocSet::from_vec(vec![alloc]);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            node_id,
            TaintedNode {
                id: node_id,
                status: NodeStatus::Initializing,
                draining: true,
                disconnected_at: None,
                max_client_disconnect: None,
            },
        );
        let groups = classify(&set, &nodes, false);
        assert_eq!(groups.migrating.len(), 1);
    }

    #[test]
    fn unknown_status_with_node_now_untracked_is_reconnecting() {
        let alloc = base_alloc(ClientStatus::Unknown, None);
        let set = AllocSet::from_vec(vec![alloc]);
        let groups = classify(&set, &BTreeMap::new(), false);
        assert_eq!(groups.reconnecting.len(), 1);
    }

    #[test]
    fn lost_client_status_always_lost_regardless_of_node() {
        let alloc = base_alloc(ClientStatus::Lost, None);
        let set = AllocSet::from_vec(vec![alloc]);
        let groups = classify(&set, &BTreeMap::new(), false);
        assert_eq!(groups.lost.len(), 1);
    }
}
