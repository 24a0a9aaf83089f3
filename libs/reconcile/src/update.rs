//! Update classifier (§4.8): for each still-untainted allocation, decides
//! ignore / in-place / destructive by calling an injected oracle. The
//! oracle lives outside this crate so batch-vs-service semantics and any
//! connect/sidecar checks stay out of the pure reconciler.

use crate::model::{Allocation, Job, TaskGroup};

/// What the oracle decided for one allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateDecision {
    Ignore,
    /// The allocation can be rewritten in place; carries the rewritten
    /// allocation the oracle produced.
    InPlace(Allocation),
    Destructive,
}

/// `(existing, new_job, new_task_group) -> decision`. Implementations may
/// return inconsistent internal state (e.g. claim "in-place" without
/// actually changing anything); per §7 this crate treats any decision it
/// cannot take at face value as destructive, the safe default.
pub trait AllocUpdateFn {
    fn decide(&self, existing: &Allocation, new_job: &Job, new_tg: &TaskGroup) -> UpdateDecision;
}

/// Classifies every alloc in `untainted`, returning `(ignored, in_place,
/// destructive_candidates)`.
pub fn classify_updates(
    untainted: &[Allocation],
    job: &Job,
    task_group: &TaskGroup,
    oracle: &dyn AllocUpdateFn,
) -> (Vec<Allocation>, Vec<Allocation>, Vec<Allocation>) {
    let mut ignored = Vec::new();
    let mut in_place = Vec::new();
    let mut destructive = Vec::new();

    for alloc in untainted {
        match oracle.decide(alloc, job, task_group) {
            UpdateDecision::Ignore => ignored.push(alloc.clone()),
            UpdateDecision::InPlace(updated) => in_place.push(updated),
            UpdateDecision::Destructive => destructive.push(alloc.clone()),
        }
    }

    (ignored, in_place, destructive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use plfm_id::EnvId;
    use std::collections::BTreeMap;

    struct AlwaysDestructive;
    impl AllocUpdateFn for AlwaysDestructive {
        fn decide(&self, _existing: &Allocation, _new_job: &Job, _new_tg: &TaskGroup) -> UpdateDecision {
            UpdateDecision::Destructive
        }
    }

    fn alloc() -> Allocation {
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

    fn job() -> Job {
        Job {
            id: EnvId::new(),
            version: JobVersion(2),
            create_index: CreateIndex(1),
            modify_index: 1,
            namespace: "default".to_string(),
            job_type: JobType::Service,
            stopped: false,
            multiregion: false,
            periodic: false,
            parameterized: false,
            task_groups: BTreeMap::new(),
        }
    }

    #[test]
    fn destructive_oracle_produces_destructive_candidates() {
        let tg = TaskGroup {
            name: "web".to_string(),
            count: 1,
            update: None,
            reschedule_policy: None,
            migrate: None,
            stop_after_client_disconnect: None,
            resume_after_client_reconnect: None,
        };
        let (ignored, in_place, destructive) =
            classify_updates(&[alloc()], &job(), &tg, &AlwaysDestructive);
        assert!(ignored.is_empty());
        assert!(in_place.is_empty());
        assert_eq!(destructive.len(), 1);
    }
}
