//! Reschedule planner (§4.4): splits untainted into
//! `{still-untainted, reschedule-now, reschedule-later}` and batches the
//! later ones into follow-up evaluations.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::alloc_set::AllocSet;
use crate::clock::FollowUpEvalIdGen;
use crate::model::{AllocId, Allocation, ClientStatus, JobType, ReschedulePolicy};
use crate::plan::{eval_trigger, FollowUpEval};

/// Tolerance absorbing clock skew between "the delay elapsed" and "now"
/// (§6, `reschedule-window`).
pub const RESCHEDULE_WINDOW: Duration = Duration::from_secs(1);

/// Maximum span of one follow-up-eval batch (§6, `failed-alloc-window`),
/// shared with the disconnect/reconnect planner per SPEC_FULL.md's Open
/// Question decision #3.
pub const FAILED_ALLOC_WINDOW: Duration = Duration::from_secs(5);

/// Outcome of splitting one group's untainted set by reschedule eligibility.
pub struct ReschedulePlan {
    pub still_untainted: AllocSet,
    pub reschedule_now: AllocSet,
    /// Follow-up evals to schedule for the later batch, plus the alloc ids
    /// each one covers (for the attribute-update step).
    pub follow_up_evals: Vec<(FollowUpEval, Vec<AllocId>)>,
    /// Allocs that were status-eligible for reschedule but have exhausted
    /// their policy's attempt budget (§6 counter
    /// `scheduler.allocs.reschedule.limit`).
    pub limit_hit: Vec<AllocId>,
}

fn status_eligible_for_reschedule(alloc: &Allocation, job_type: JobType) -> bool {
    match alloc.client_status {
        ClientStatus::Failed => true,
        ClientStatus::Complete => job_type.is_batch(),
        _ => false,
    }
}

/// Whether `alloc` is reschedule-eligible: failed (service) or
/// failed-or-complete-with-attempts-remaining (batch), not already
/// rescheduled by this evaluation, and not already replaced by another
/// alloc in `all_group_allocs`.
pub fn is_reschedule_eligible(
    alloc: &Allocation,
    job_type: JobType,
    policy: Option<&ReschedulePolicy>,
    now: DateTime<Utc>,
    already_replaced: &BTreeSet<AllocId>,
) -> bool {
    let Some(policy) = policy else {
        return false;
    };

    if !status_eligible_for_reschedule(alloc, job_type) {
        return false;
    }

    if already_replaced.contains(&alloc.id) {
        return false;
    }

    if alloc.follow_up_eval_id.is_some() {
        // Already batched into a pending follow-up eval by a prior pass.
        return false;
    }

    alloc.reschedule_tracker.has_attempts_left(policy, now)
}

/// True when `alloc` would otherwise qualify for `is_reschedule_eligible`
/// but has exhausted its reschedule-policy attempt budget.
pub fn is_reschedule_limit_hit(
    alloc: &Allocation,
    job_type: JobType,
    policy: Option<&ReschedulePolicy>,
    now: DateTime<Utc>,
    already_replaced: &BTreeSet<AllocId>,
) -> bool {
    let Some(policy) = policy else {
        return false;
    };

    if !status_eligible_for_reschedule(alloc, job_type) {
        return false;
    }

    if already_replaced.contains(&alloc.id) {
        return false;
    }

    if alloc.follow_up_eval_id.is_some() {
        return false;
    }

    !alloc.reschedule_tracker.has_attempts_left(policy, now)
}

/// The ids already used as `previous_alloc` by some other allocation in the
/// group, i.e. allocs that have already been replaced and must not be
/// rescheduled again.
pub fn already_replaced_ids(all_group_allocs: &AllocSet) -> BTreeSet<AllocId> {
    all_group_allocs
        .iter()
        .filter_map(|a| a.previous_alloc)
        .collect()
}

/// Plan reschedules for `untainted`, given the full group alloc set (used
/// to detect already-replaced allocs) and the group's reschedule policy.
pub fn plan_reschedules(
    untainted: &AllocSet,
    all_group_allocs: &AllocSet,
    job_type: JobType,
    policy: Option<&ReschedulePolicy>,
    now: DateTime<Utc>,
    task_group: &str,
    id_gen: &mut dyn FollowUpEvalIdGen,
) -> ReschedulePlan {
    let already_replaced = already_replaced_ids(all_group_allocs);

    let mut still_untainted = AllocSet::new();
    let mut reschedule_now = AllocSet::new();
    let mut later: Vec<(DateTime<Utc>, Allocation)> = Vec::new();
    let mut limit_hit = Vec::new();

    for alloc in untainted.iter() {
        if !is_reschedule_eligible(alloc, job_type, policy, now, &already_replaced) {
            if is_reschedule_limit_hit(alloc, job_type, policy, now, &already_replaced) {
                limit_hit.push(alloc.id);
            }
            still_untainted.insert(alloc.clone());
            continue;
        }

        let policy = policy.expect("eligibility implies a policy");
        let delay = alloc.reschedule_tracker.next_delay(policy);
        let reschedule_time = alloc.client_status_updated_at + chrono_duration(delay);

        if reschedule_time <= now + chrono_duration(RESCHEDULE_WINDOW) {
            reschedule_now.insert(alloc.clone());
        } else {
            later.push((reschedule_time, alloc.clone()));
            still_untainted.insert(alloc.clone());
        }
    }

    later.sort_by_key(|(t, a)| (*t, a.id));

    let mut follow_up_evals = Vec::new();
    let mut i = 0;
    while i < later.len() {
        let batch_start = later[i].0;
        let mut members = vec![later[i].clone()];
        let mut j = i + 1;
        while j < later.len() && later[j].0 < batch_start + chrono_duration(FAILED_ALLOC_WINDOW) {
            members.push(later[j].clone());
            j += 1;
        }
        i = j;

        let eval = FollowUpEval {
            id: id_gen.next_id(),
            task_group: task_group.to_string(),
            wait_until: batch_start,
            trigger: eval_trigger::RETRY_FAILED_ALLOC,
            status_description: format!("{} allocs pending reschedule", members.len()),
        };
        let alloc_ids = members.iter().map(|(_, a)| a.id).collect();
        follow_up_evals.push((eval, alloc_ids));
    }

    ReschedulePlan {
        still_untainted,
        reschedule_now,
        follow_up_evals,
        limit_hit,
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SequentialEvalIdGen;
    use crate::model::*;
    use plfm_id::EnvId;

    fn failed_alloc(updated_at: DateTime<Utc>) -> Allocation {
        Allocation {
            id: AllocId::new(),
            job_id: EnvId::new(),
            task_group: "web".to_string(),
            index: 0,
            job_version: JobVersion(1),
            create_index: CreateIndex(1),
            deployment_id: None,
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Failed,
            client_status_updated_at: updated_at,
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
    fn within_window_reschedules_now() {
        let now = Utc::now();
        let policy = ReschedulePolicy {
            attempts: Some(2),
            interval: Duration::from_secs(86400),
            delay: Duration::from_secs(0),
            max_delay: Duration::from_secs(3600),
            delay_function: DelayFunction::Constant,
        };
        let alloc = failed_alloc(now);
        let set = AllocSet::from_vec(vec![alloc]);
        let mut id_gen = SequentialEvalIdGen::new();
        let plan = plan_reschedules(&set, &set, JobType::Service, Some(&policy), now, "web", &mut id_gen);
        assert_eq!(plan.reschedule_now.len(), 1);
        assert!(plan.still_untainted.is_empty());
        assert!(plan.follow_up_evals.is_empty());
    }

    #[test]
    fn outside_window_batches_into_follow_up_eval() {
        let now = Utc::now();
        let policy = ReschedulePolicy {
            attempts: Some(2),
            interval: Duration::from_secs(86400),
            delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            delay_function: DelayFunction::Constant,
        };
        let alloc = failed_alloc(now);
        let set = AllocSet::from_vec(vec![alloc.clone()]);
        let mut id_gen = SequentialEvalIdGen::new();
        let plan = plan_reschedules(&set, &set, JobType::Service, Some(&policy), now, "web", &mut id_gen);
        assert!(plan.reschedule_now.is_empty());
        assert_eq!(plan.still_untainted.len(), 1);
        assert_eq!(plan.follow_up_evals.len(), 1);
        let (eval, ids) = &plan.follow_up_evals[0];
        assert_eq!(eval.wait_until, now + chrono::Duration::seconds(30));
        assert_eq!(ids, &vec![alloc.id]);
    }

    #[test]
    fn complete_is_eligible_only_for_batch_jobs() {
        let now = Utc::now();
        let policy = ReschedulePolicy::default();
        let mut alloc = failed_alloc(now);
        alloc.client_status = ClientStatus::Complete;
        let set = AllocSet::from_vec(vec![alloc.clone()]);
        let replaced = already_replaced_ids(&set);
        assert!(!is_reschedule_eligible(&alloc, JobType::Service, Some(&policy), now, &replaced));
        assert!(is_reschedule_eligible(&alloc, JobType::Batch, Some(&policy), now, &replaced));
    }

    #[test]
    fn already_replaced_alloc_is_not_eligible() {
        let now = Utc::now();
        let policy = ReschedulePolicy::default();
        let original = failed_alloc(now);
        let mut replacement = failed_alloc(now);
        replacement.previous_alloc = Some(original.id);
        let set = AllocSet::from_vec(vec![original.clone(), replacement]);
        let replaced = already_replaced_ids(&set);
        assert!(!is_reschedule_eligible(&original, JobType::Service, Some(&policy), now, &replaced));
    }
}
