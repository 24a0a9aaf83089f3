//! Name index (§4.2): assigns and reclaims the stable positional names
//! `group[i]` for `0 <= i < count`.

use std::collections::BTreeSet;

use crate::alloc_set::AllocSet;
use crate::model::AllocId;

/// Tracks which positional indices within one task group are currently in
/// use, so new placements can be given the lowest free index and
/// scale-downs can release indices back to the pool.
#[derive(Debug, Clone)]
pub struct NameIndex {
    count: u32,
    in_use: BTreeSet<u32>,
}

impl NameIndex {
    /// Seed the index from the positional indices already held by `seed`.
    pub fn new(count: u32, seed: &AllocSet) -> Self {
        let in_use = seed.iter().map(|a| a.index).collect();
        Self { count, in_use }
    }

    /// The `k` lowest free names: first any gap below `count`, then new
    /// indices up to `count - 1`, then (if still short) indices are reused
    /// starting back at 0 — this only happens under the §7 "duplicate
    /// names" tolerance, since under normal operation the caller never
    /// asks for more names than there is room for.
    pub fn next(&mut self, k: u32) -> Vec<u32> {
        let mut out = Vec::with_capacity(k as usize);
        let mut candidate = 0u32;
        while out.len() < k as usize {
            if !self.in_use.contains(&candidate) {
                self.in_use.insert(candidate);
                out.push(candidate);
            }
            candidate += 1;
            if candidate > self.count.saturating_mul(2).saturating_add(k) {
                // Defensive bound: avoids an infinite loop on pathological
                // input (count == 0 but k > 0). Remaining slots just reuse
                // index 0 upward past any reasonable bound.
                break;
            }
        }
        out
    }

    /// Like `next`, but prefers indices currently held by allocations in
    /// `destructive_candidates` that are not already held by an existing
    /// canary, so a canary previews the index its replacement will land
    /// on.
    pub fn next_canaries(
        &mut self,
        k: u32,
        existing_canaries: &AllocSet,
        destructive_candidates: &[crate::model::Allocation],
    ) -> Vec<u32> {
        let existing_indices: BTreeSet<u32> = existing_canaries.iter().map(|a| a.index).collect();
        let mut preferred: Vec<u32> = destructive_candidates
            .iter()
            .map(|a| a.index)
            .filter(|i| !existing_indices.contains(i) && !self.in_use.contains(i))
            .collect();
        preferred.sort_unstable();
        preferred.dedup();

        let mut out = Vec::with_capacity(k as usize);
        for idx in preferred {
            if out.len() == k as usize {
                break;
            }
            self.in_use.insert(idx);
            out.push(idx);
        }
        if out.len() < k as usize {
            out.extend(self.next(k - out.len() as u32));
        }
        out
    }

    /// The `k` names with the largest index currently in use, descending.
    /// Used to scale down by stopping the tail.
    pub fn highest(&mut self, k: u32) -> Vec<u32> {
        let mut used: Vec<u32> = self.in_use.iter().copied().collect();
        used.sort_unstable_by(|a, b| b.cmp(a));
        used.truncate(k as usize);
        used
    }

    /// Release a name back to the free pool.
    pub fn unset_index(&mut self, i: u32) {
        self.in_use.remove(&i);
    }

    pub fn is_in_use(&self, i: u32) -> bool {
        self.in_use.contains(&i)
    }
}

/// Release every index held by `allocs` into `index`, as part of a stop
/// (the allocation no longer occupies its positional name).
pub fn release_all(index: &mut NameIndex, ids: &[AllocId], universe: &AllocSet) {
    for id in ids {
        if let Some(a) = universe.get(id) {
            index.unset_index(a.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use plfm_id::EnvId;

    fn alloc_at(index: u32) -> Allocation {
        Allocation {
            id: AllocId::new(),
            job_id: EnvId::new(),
            task_group: "web".to_string(),
            index,
            job_version: JobVersion(1),
            create_index: CreateIndex(1),
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
    fn next_fills_lowest_free_names() {
        let seed = AllocSet::from_vec(vec![alloc_at(0), alloc_at(2)]);
        let mut idx = NameIndex::new(5, &seed);
        let names = idx.next(2);
        assert_eq!(names, vec![1, 3]);
    }

    #[test]
    fn highest_returns_descending_tail() {
        let seed = AllocSet::from_vec(vec![alloc_at(0), alloc_at(1), alloc_at(2)]);
        let mut idx = NameIndex::new(3, &seed);
        assert_eq!(idx.highest(2), vec![2, 1]);
    }

    #[test]
    fn unset_index_frees_name_for_reuse() {
        let seed = AllocSet::from_vec(vec![alloc_at(0), alloc_at(1)]);
        let mut idx = NameIndex::new(2, &seed);
        idx.unset_index(0);
        assert_eq!(idx.next(1), vec![0]);
    }

    #[test]
    fn next_canaries_prefers_destructive_candidate_indices() {
        let candidate = alloc_at(3);
        let seed = AllocSet::new();
        let mut idx = NameIndex::new(4, &seed);
        let names = idx.next_canaries(1, &AllocSet::new(), std::slice::from_ref(&candidate));
        assert_eq!(names, vec![3]);
    }
}
