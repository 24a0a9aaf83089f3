//! Alloc set algebra (§4.1): a set of allocations is semantically a mapping
//! from allocation id to allocation. Order is irrelevant for membership
//! operations; only `name_order` imposes one, for operations that need to
//! "choose k allocs" deterministically (§9).

use std::collections::BTreeSet;

use plfm_id::DeployId;

use crate::model::{Allocation, AllocId};

/// A set of allocations, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct AllocSet(std::collections::BTreeMap<AllocId, Allocation>);

impl AllocSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(allocs: Vec<Allocation>) -> Self {
        let mut set = Self::new();
        for a in allocs {
            set.insert(a);
        }
        set
    }

    pub fn insert(&mut self, alloc: Allocation) {
        self.0.insert(alloc.id, alloc);
    }

    pub fn remove(&mut self, id: &AllocId) -> Option<Allocation> {
        self.0.remove(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &AllocId) -> bool {
        self.0.contains_key(id)
    }

    pub fn get(&self, id: &AllocId) -> Option<&Allocation> {
        self.0.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Allocation> {
        self.0.values()
    }

    pub fn into_vec(self) -> Vec<Allocation> {
        self.0.into_values().collect()
    }

    pub fn ids(&self) -> BTreeSet<AllocId> {
        self.0.keys().copied().collect()
    }

    /// Union of two sets. On id collision, `other`'s value wins (matching
    /// the common "overlay newer observations" use at call sites).
    pub fn union(&self, other: &AllocSet) -> AllocSet {
        let mut out = self.clone();
        for a in other.iter() {
            out.insert(a.clone());
        }
        out
    }

    /// `self` minus every id present in `other`.
    pub fn difference(&self, other: &AllocSet) -> AllocSet {
        let mut out = AllocSet::new();
        for a in self.iter() {
            if !other.contains(&a.id) {
                out.insert(a.clone());
            }
        }
        out
    }

    /// Construct the subset of `universe` named by `ids`.
    pub fn from_keys(universe: &AllocSet, ids: &BTreeSet<AllocId>) -> AllocSet {
        let mut out = AllocSet::new();
        for id in ids {
            if let Some(a) = universe.get(id) {
                out.insert(a.clone());
            }
        }
        out
    }

    /// The set of positional names currently held by this set's members.
    pub fn name_set(&self) -> BTreeSet<String> {
        self.iter().map(|a| a.name()).collect()
    }

    /// Deterministic ordering: name ascending, then create-index ascending,
    /// then id ascending (§9). Used anywhere the spec says "choose k
    /// allocs" without naming its own comparator.
    pub fn name_order(&self) -> Vec<&Allocation> {
        let mut v: Vec<&Allocation> = self.iter().collect();
        v.sort_by(|a, b| {
            a.name()
                .cmp(&b.name())
                .then(a.create_index.cmp(&b.create_index))
                .then(a.id.cmp(&b.id))
        });
        v
    }

    /// Split into `(terminal, non_terminal)` by client status.
    pub fn filter_by_terminal(&self) -> (AllocSet, AllocSet) {
        let mut terminal = AllocSet::new();
        let mut non_terminal = AllocSet::new();
        for a in self.iter() {
            if a.client_status.is_terminal() {
                terminal.insert(a.clone());
            } else {
                non_terminal.insert(a.clone());
            }
        }
        (terminal, non_terminal)
    }

    /// Drop allocs already marked terminal at the desired-status level
    /// (`Stop`/`Evict`), so a later pass never stops the same alloc twice.
    pub fn drop_terminal_desired(&self) -> AllocSet {
        self.iter()
            .filter(|a| !a.desired_status.is_terminal())
            .cloned()
            .collect()
    }

    /// Split into `(in, out)` by whether the allocation belongs to the
    /// given deployment.
    pub fn filter_by_deployment(&self, deployment_id: DeployId) -> (AllocSet, AllocSet) {
        let mut in_set = AllocSet::new();
        let mut out_set = AllocSet::new();
        for a in self.iter() {
            if a.deployment_id == Some(deployment_id) {
                in_set.insert(a.clone());
            } else {
                out_set.insert(a.clone());
            }
        }
        (in_set, out_set)
    }
}

impl FromIterator<Allocation> for AllocSet {
    fn from_iter<T: IntoIterator<Item = Allocation>>(iter: T) -> Self {
        let mut set = AllocSet::new();
        for a in iter {
            set.insert(a);
        }
        set
    }
}

impl IntoIterator for AllocSet {
    type Item = Allocation;
    type IntoIter = std::vec::IntoIter<Allocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.into_vec().into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use proptest::prelude::*;

    fn alloc(id: AllocId, name_index: u32, create_index: u64) -> Allocation {
        Allocation {
            id,
            job_id: plfm_id::EnvId::new(),
            task_group: "web".to_string(),
            index: name_index,
            job_version: JobVersion(1),
            create_index: CreateIndex(create_index),
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
    fn difference_removes_members_of_other() {
        let a1 = alloc(AllocId::new(), 0, 1);
        let a2 = alloc(AllocId::new(), 1, 1);
        let left = AllocSet::from_vec(vec![a1.clone(), a2.clone()]);
        let right = AllocSet::from_vec(vec![a2]);
        let diff = left.difference(&right);
        assert_eq!(diff.len(), 1);
        assert!(diff.contains(&a1.id));
    }

    #[test]
    fn name_order_is_stable_by_index_then_create_index_then_id() {
        let id_a = AllocId::new();
        let id_b = AllocId::new();
        let a = alloc(id_a, 1, 5);
        let b = alloc(id_b, 0, 5);
        let set = AllocSet::from_vec(vec![a, b]);
        let ordered = set.name_order();
        assert_eq!(ordered[0].index, 0);
        assert_eq!(ordered[1].index, 1);
    }

    proptest! {
        #[test]
        fn union_is_commutative_on_ids(n1 in 0u8..5, n2 in 0u8..5) {
            let left: AllocSet = (0..n1).map(|_| alloc(AllocId::new(), 0, 0)).collect();
            let right: AllocSet = (0..n2).map(|_| alloc(AllocId::new(), 0, 0)).collect();
            let a = left.union(&right).ids();
            let b = right.union(&left).ids();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn difference_then_union_recovers_when_disjoint(n1 in 0u8..5, n2 in 0u8..5) {
            let left: AllocSet = (0..n1).map(|_| alloc(AllocId::new(), 0, 0)).collect();
            let right: AllocSet = (0..n2).map(|_| alloc(AllocId::new(), 0, 0)).collect();
            let union = left.union(&right);
            let recovered = union.difference(&right);
            prop_assert_eq!(recovered.len(), left.len());
        }
    }
}
