//! The orchestrator (§4.11, §2): the per-job driver that runs every other
//! component in sequence, for every task group, and rolls the result up
//! into one `Plan`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use plfm_id::NodeId;

use crate::alloc_set::AllocSet;
use crate::canary;
use crate::clock::FollowUpEvalIdGen;
use crate::deployment::{self, CancelOutcome};
use crate::disconnect::{self, ReconnectResolution};
use crate::error::{ReconcileError, ReconcileResult};
use crate::metrics::{ReconcileMetrics, RescheduleWaitObservation};
use crate::model::{
    AllocId, ClientStatus, Deployment, DeploymentGroupState, EvalId, Job, JobId, TaintedNode,
    TaskGroup, UpdateStrategy,
};
use crate::name_index::NameIndex;
use crate::placement;
use crate::plan::{stop_reason, AttributeUpdate, DeploymentStatusUpdate, Plan, Placement, Stop};
use crate::reschedule;
use crate::stop_selector::{self, StopSelectorInput};
use crate::taint;
use crate::update::{self, AllocUpdateFn};

/// Upper bound on a task group's desired count. `NameIndex::next`'s
/// defensive scan bound (`count.saturating_mul(2).saturating_add(k)`)
/// assumes `count` leaves headroom below `u32::MAX`; this is also well
/// beyond any count a real cluster would run a single task group at.
const MAX_TASK_GROUP_COUNT: u32 = 1 << 20;

/// Groups a flat alloc set by task group name.
fn group_by_task_group(allocs: &AllocSet) -> BTreeMap<String, AllocSet> {
    let mut out: BTreeMap<String, AllocSet> = BTreeMap::new();
    for alloc in allocs.iter() {
        out.entry(alloc.task_group.clone()).or_default().insert(alloc.clone());
    }
    out
}

/// Drives one Compute call for a single job (§5: pure, single-threaded,
/// one-call-in one-plan-out). `job`, `current_deployment`, `now`, and the
/// follow-up eval id generator are the only sources of truth the
/// reconciler is allowed to consult; everything else is derived.
pub struct AllocReconciler<'a> {
    job_id: JobId,
    job: Option<Job>,
    current_deployment: Option<Deployment>,
    existing_allocs: AllocSet,
    tainted_nodes: BTreeMap<NodeId, TaintedNode>,
    /// Carried for parity with the triggering evaluation context; this
    /// crate mints its own follow-up eval ids rather than reusing this one.
    #[allow(dead_code)]
    eval_id: EvalId,
    #[allow(dead_code)]
    eval_priority: u8,
    oracle: &'a dyn AllocUpdateFn,
    now: DateTime<Utc>,
    id_gen: &'a mut dyn FollowUpEvalIdGen,
}

impl<'a> AllocReconciler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: JobId,
        job: Option<Job>,
        current_deployment: Option<Deployment>,
        existing_allocs: AllocSet,
        tainted_nodes: BTreeMap<NodeId, TaintedNode>,
        eval_id: EvalId,
        eval_priority: u8,
        oracle: &'a dyn AllocUpdateFn,
        now: DateTime<Utc>,
        id_gen: &'a mut dyn FollowUpEvalIdGen,
    ) -> Self {
        Self {
            job_id,
            job,
            current_deployment,
            existing_allocs,
            tainted_nodes,
            eval_id,
            eval_priority,
            oracle,
            now,
            id_gen,
        }
    }

    fn validate(&self) -> ReconcileResult<()> {
        if let Some(job) = &self.job {
            for (name, tg) in &job.task_groups {
                if tg.count > MAX_TASK_GROUP_COUNT {
                    return Err(ReconcileError::InvalidCount {
                        task_group: name.clone(),
                        count: tg.count,
                        limit: MAX_TASK_GROUP_COUNT,
                    });
                }
            }
        }
        Ok(())
    }

    /// Runs one reconciliation pass, producing a plan and the metrics
    /// observed while computing it (§6).
    #[instrument(skip(self), fields(job_id = %self.job_id))]
    pub fn compute(mut self) -> ReconcileResult<(Plan, ReconcileMetrics)> {
        self.validate()?;

        let mut plan = Plan::default();
        let mut metrics = ReconcileMetrics::default();

        let job_stopped_or_missing = self.job.as_ref().map(|j| j.stopped).unwrap_or(true);

        let groups_by_name = group_by_task_group(&self.existing_allocs);

        if job_stopped_or_missing {
            for (group_name, allocs) in &groups_by_name {
                stop_purged_group(group_name, allocs, &mut plan);
            }
            if let Some(deployment) = &self.current_deployment {
                if deployment.status.is_active() {
                    plan.set_deployment_status_update(DeploymentStatusUpdate {
                        deployment_id: deployment.id,
                        status: crate::model::DeploymentStatus::Cancelled,
                        status_description: crate::plan::deployment_description::STOPPED_JOB,
                    });
                }
            }
            return Ok((plan, metrics));
        }

        let job = self.job.clone().expect("checked above");

        let mut old_deployment: Option<Deployment> = None;
        if let Some(deployment) = self.current_deployment.clone() {
            match deployment::check_cancel(
                false,
                deployment.status,
                deployment.job_version,
                deployment.job_create_index,
                job.version,
                job.create_index,
            ) {
                Some(CancelOutcome::DetachSilently) => {
                    self.current_deployment = None;
                }
                Some(CancelOutcome::Cancel(description)) => {
                    plan.set_deployment_status_update(DeploymentStatusUpdate {
                        deployment_id: deployment.id,
                        status: crate::model::DeploymentStatus::Cancelled,
                        status_description: description,
                    });
                    old_deployment = Some(deployment);
                    self.current_deployment = None;
                }
                None => {}
            }
        }

        // Deployment creation is decided once per pass, not per group: a
        // single `Deployment` covers every group, so whether one already
        // existed going into this pass has to be fixed before the loop
        // starts rather than flipped by whichever group is processed first.
        let deployment_existed = self.current_deployment.is_some();

        let mut group_names: BTreeSet<String> = job.task_groups.keys().cloned().collect();
        group_names.extend(groups_by_name.keys().cloned());

        let mut all_groups_complete = true;
        let mut new_deployment_groups: BTreeMap<String, DeploymentGroupState> = BTreeMap::new();
        let empty = AllocSet::new();

        for group_name in &group_names {
            match job.task_groups.get(group_name) {
                None => {
                    let allocs = groups_by_name.get(group_name).unwrap_or(&empty);
                    stop_purged_group(group_name, allocs, &mut plan);
                }
                Some(tg) => {
                    let allocs = groups_by_name.get(group_name).unwrap_or(&empty);
                    let outcome = reconcile_group(
                        self.job_id,
                        &job,
                        tg,
                        allocs,
                        old_deployment.as_ref(),
                        self.current_deployment.as_ref(),
                        deployment_existed,
                        &self.tainted_nodes,
                        self.oracle,
                        self.now,
                        &mut *self.id_gen,
                        &mut plan,
                        &mut metrics,
                    );
                    if !outcome.complete {
                        all_groups_complete = false;
                    }
                    if let Some(group_state) = outcome.new_deployment_group {
                        new_deployment_groups.insert(tg.name.clone(), group_state);
                    }
                }
            }
        }

        if !deployment_existed && !new_deployment_groups.is_empty() {
            let requires_promotion = new_deployment_groups.values().any(|g| g.requires_promotion());
            let auto_promote = new_deployment_groups.values().all(|g| g.auto_promote);
            let (status, description) =
                deployment::initial_deployment_status(&job, requires_promotion, auto_promote);
            let new_deployment = Deployment {
                id: plfm_id::DeployId::new(),
                job_version: job.version,
                job_create_index: job.create_index,
                status,
                status_description: description,
                groups: new_deployment_groups,
            };
            plan.set_deployment(new_deployment.clone());
            self.current_deployment = Some(new_deployment);
        }

        if let Some(deployment) = &self.current_deployment {
            if plan.deployment_status_update().is_none() {
                if let Some((status, description)) = deployment::completion_status(
                    all_groups_complete,
                    job.is_multiregion_deploy_gated(),
                    deployment.status,
                ) {
                    plan.set_deployment_status_update(DeploymentStatusUpdate {
                        deployment_id: deployment.id,
                        status,
                        status_description: description,
                    });
                }
            }
        }

        Ok((plan, metrics))
    }
}

/// What one group's reconcile pass decided, fed back into the job-level
/// roll-up.
struct GroupOutcome {
    complete: bool,
    /// Present when this group needs a brand-new deployment created for it
    /// this pass. Only populated when no deployment existed going into the
    /// pass; a group reconciled against an already-existing deployment
    /// never sets this.
    new_deployment_group: Option<DeploymentGroupState>,
}

#[allow(clippy::too_many_arguments)]
fn reconcile_group(
    job_id: JobId,
    job: &Job,
    tg: &TaskGroup,
    allocs: &AllocSet,
    old_deployment: Option<&Deployment>,
    current_deployment: Option<&Deployment>,
    deployment_existed: bool,
    tainted_nodes: &BTreeMap<NodeId, TaintedNode>,
    oracle: &dyn AllocUpdateFn,
    now: DateTime<Utc>,
    id_gen: &mut dyn FollowUpEvalIdGen,
    plan: &mut Plan,
    metrics: &mut ReconcileMetrics,
) -> GroupOutcome {
    let deployment_group_state: Option<&DeploymentGroupState> =
        current_deployment.and_then(|d| d.group(&tg.name));

    let (_terminal, non_terminal) = allocs.filter_by_terminal();

    let taint_groups = taint::classify(&non_terminal, tainted_nodes, tg.has_reconnect_policy());
    let mut untainted = taint_groups.untainted;
    let mut migrating = taint_groups.migrating;
    let mut lost = taint_groups.lost;

    let superseded_stops =
        canary::stop_superseded_canaries(old_deployment, current_deployment, &tg.name, allocs);
    plan_stops(plan, &tg.name, superseded_stops);

    let extracted =
        canary::extract_canaries(&mut untainted, &mut migrating, &mut lost, current_deployment, &tg.name);
    plan_stops(plan, &tg.name, extracted.stops);
    let canaries = extracted.canaries;

    let is_canarying = current_deployment.map(|d| d.is_canarying(&tg.name)).unwrap_or(false);
    let deployment_paused_or_failed = current_deployment.map(|d| d.is_paused_or_failed()).unwrap_or(false);

    // Reconnect resolution: acknowledge the straightforward cases by
    // merging them back into untainted; everything else passes through to
    // the stop selector. A same-named untainted alloc means the scheduler
    // already placed a replacement while this one was disconnected, so the
    // fast acknowledge path is skipped in favor of stop selector step 7's
    // health-score comparison, even when the alloc's own transition flags
    // would otherwise qualify it for acknowledgement.
    let mut reconnect_passthrough = AllocSet::new();
    for alloc in taint_groups.reconnecting.into_vec() {
        let has_untainted_replacement = untainted.iter().any(|a| a.name() == alloc.name());
        if has_untainted_replacement {
            reconnect_passthrough.insert(alloc);
            continue;
        }
        match disconnect::resolve_reconnect(&alloc) {
            ReconnectResolution::Acknowledge(a) => {
                plan.set_reconnect_update(a.clone());
                untainted.insert(a);
            }
            ReconnectResolution::PassThrough => {
                reconnect_passthrough.insert(alloc);
            }
        }
    }

    if let Some(resume_timeout) = tg.resume_after_client_reconnect {
        let disconnect_plan = disconnect::plan_disconnects(
            &taint_groups.disconnecting,
            tainted_nodes,
            resume_timeout,
            &tg.name,
            id_gen,
        );
        for alloc in disconnect_plan.disconnect_updates.into_values() {
            plan.set_disconnect_update(alloc);
        }
        for (eval, _) in disconnect_plan.follow_up_evals {
            plan.push_follow_up_evals(&tg.name, vec![eval]);
        }
    } else {
        debug_assert!(taint_groups.disconnecting.is_empty());
    }

    let reschedule_plan = reschedule::plan_reschedules(
        &untainted,
        allocs,
        job.job_type,
        tg.reschedule_policy.as_ref(),
        now,
        &tg.name,
        id_gen,
    );
    let still_untainted = reschedule_plan.still_untainted;
    let reschedule_now = reschedule_plan.reschedule_now;
    let mut reschedule_later_count = 0u32;

    for _ in &reschedule_plan.limit_hit {
        metrics.record_limit_hit();
    }

    for (eval, alloc_ids) in reschedule_plan.follow_up_evals {
        metrics.record_attempt();
        reschedule_later_count += alloc_ids.len() as u32;
        for alloc_id in &alloc_ids {
            plan.set_attribute_update(AttributeUpdate {
                alloc: *alloc_id,
                follow_up_eval_id: eval.id,
            });
            if let Some(alloc) = allocs.get(alloc_id) {
                metrics.record_wait_until(RescheduleWaitObservation {
                    alloc_id: *alloc_id,
                    job_id: alloc.job_id,
                    namespace: job.namespace.clone(),
                    task_group: tg.name.clone(),
                    follow_up_eval_id: eval.id,
                    wait_until: eval.wait_until,
                });
            }
        }
        plan.push_follow_up_evals(&tg.name, vec![eval]);
    }

    // Captured before `migrating` is moved into the stop selector input:
    // compute_limit needs to know whether *any* migrating alloc existed
    // this pass, independent of how many the stop selector converts into
    // outright stops.
    let migrating_was_nonempty = !migrating.is_empty();
    let lost_for_placement = lost.clone();

    let seed = allocs.clone();
    let mut name_index = NameIndex::new(tg.count, &seed);
    let lost_follow_up_evals: BTreeMap<AllocId, EvalId> = BTreeMap::new();

    let stop_outcome = stop_selector::select_stops(StopSelectorInput {
        count: tg.count,
        name_index: &mut name_index,
        untainted: still_untainted,
        migrating,
        lost,
        reconnecting: reconnect_passthrough,
        canaries: &canaries,
        is_canarying,
        lost_follow_up_evals: &lost_follow_up_evals,
        tainted_nodes,
    });
    plan_stops(plan, &tg.name, stop_outcome.stops);
    for alloc in &stop_outcome.reconnect_updates {
        plan.set_reconnect_update(alloc.clone());
    }
    let untainted = stop_outcome.untainted;
    let reconnecting_kept: AllocSet = stop_outcome.reconnect_updates.iter().cloned().collect();

    let untainted_vec: Vec<_> = untainted.iter().cloned().collect();
    let (ignored, in_place, destructive_candidates) = update::classify_updates(&untainted_vec, job, tg, oracle);
    plan.add_ignore(&tg.name, ignored.len() as u32);
    for alloc in &in_place {
        plan.push_in_place(&tg.name, alloc.clone());
    }

    let has_destructive_or_migrating = !destructive_candidates.is_empty() || migrating_was_nonempty;
    let current_deployment_allocs: Vec<_> = current_deployment
        .map(|d| allocs.filter_by_deployment(d.id).0.into_vec())
        .unwrap_or_default();

    let default_strategy = UpdateStrategy::default();
    let canary_requirement = canary::require_canaries(
        !destructive_candidates.is_empty(),
        &canaries,
        tg.update.as_ref().unwrap_or(&default_strategy),
        deployment_group_state.map(|dg| dg.promoted).unwrap_or(false),
        deployment_paused_or_failed,
    );
    // A group that requires canaries this pass is canarying for the purpose
    // of §4.9's limit/commit gate even before a `Deployment` record exists
    // to read `is_canarying` from (deployment creation happens after the
    // whole per-group loop, so `current_deployment` is still `None` on a
    // fresh canary rollout's first pass).
    let canarying_for_limit = is_canarying || canary_requirement.is_some();
    let limit = placement::compute_limit(
        tg,
        has_destructive_or_migrating,
        canarying_for_limit,
        deployment_paused_or_failed,
        &current_deployment_allocs,
    );

    let proposed_placements = placement::compute_placements(
        job_id,
        tg,
        &mut name_index,
        &untainted,
        &stop_outcome.remaining_migrating,
        &reschedule_now,
        &reconnecting_kept,
        is_canarying,
        &lost_for_placement,
    );

    // Lost backfill and reschedule replacement address already-tainted or
    // already-failed capacity and proceed regardless of rollout state;
    // fresh/canary fill paces the rollout and pauses while canarying or
    // while the deployment is paused/failed.
    let fill_blocked = is_canarying || deployment_paused_or_failed;
    for placement in proposed_placements {
        if placement.lost {
            plan.push_placement(&tg.name, placement);
        } else if placement.reschedule {
            if let Some(prev) = placement.previous_alloc {
                plan.push_stop(
                    &tg.name,
                    Stop {
                        alloc: prev,
                        client_status_override: None,
                        reason: stop_reason::ALLOC_RESCHEDULED,
                        follow_up_eval_id: None,
                    },
                );
            }
            plan.push_placement(&tg.name, placement);
        } else if fill_blocked {
            plan.add_ignore(&tg.name, 1);
        } else {
            plan.push_placement(&tg.name, placement);
        }
    }

    let mut ordered_destructive = destructive_candidates.clone();
    ordered_destructive.sort_by(|a, b| {
        a.name()
            .cmp(&b.name())
            .then(a.create_index.cmp(&b.create_index))
            .then(a.id.cmp(&b.id))
    });
    let mut committed = 0u32;
    for alloc in ordered_destructive {
        if committed >= limit {
            plan.add_ignore(&tg.name, 1);
            continue;
        }
        plan.push_destructive(
            &tg.name,
            crate::plan::DestructiveUpdate {
                place_name: alloc.name(),
                place_task_group: tg.name.clone(),
                stop_alloc: alloc.id,
                stop_reason: stop_reason::ALLOC_UPDATING,
            },
        );
        committed += 1;
    }

    // Migrating allocs the stop selector didn't absorb into an outright
    // stop still need to move: stop the old copy and place its
    // replacement under the same name, on whatever node the scheduler
    // picks next.
    for alloc in stop_outcome.remaining_migrating.into_vec() {
        plan.push_migrate_stop(
            &tg.name,
            Stop {
                alloc: alloc.id,
                client_status_override: None,
                reason: stop_reason::ALLOC_MIGRATING,
                follow_up_eval_id: None,
            },
        );
        plan.push_placement(
            &tg.name,
            Placement {
                name: alloc.name(),
                task_group: tg.name.clone(),
                previous_alloc: Some(alloc.id),
                canary: false,
                reschedule: false,
                lost: false,
                downgrade_non_canary: is_canarying && !alloc.is_canary(),
                min_job_version: None,
            },
        );
    }

    if let Some(requirement) = &canary_requirement {
        debug!(task_group = %tg.name, desired_canaries = requirement.desired_canaries, "group requires canaries");
        if requirement.new_placements > 0 {
            let names = name_index.next_canaries(requirement.new_placements, &canaries, &destructive_candidates);
            for idx in names {
                plan.push_canary_placement(
                    &tg.name,
                    Placement {
                        name: crate::model::alloc_name(&job_id, &tg.name, idx),
                        task_group: tg.name.clone(),
                        previous_alloc: None,
                        canary: true,
                        reschedule: false,
                        lost: false,
                        downgrade_non_canary: false,
                        min_job_version: None,
                    },
                );
            }
        }
    }

    let had_running_allocs_of_version = allocs
        .iter()
        .any(|a| a.job_version == job.version && a.client_status == ClientStatus::Running);
    let counters_after = plan.desired_tg_updates().get(&tg.name).cloned().unwrap_or_default();
    let pass_introduced_changes =
        counters_after.destructive > 0 || counters_after.in_place > 0 || counters_after.canary > 0;

    let new_deployment_group = if !deployment_existed
        && deployment::should_create_deployment(false, tg, tg.count, had_running_allocs_of_version, pass_introduced_changes)
    {
        Some(DeploymentGroupState {
            desired_total: tg.count,
            desired_canaries: canary_requirement.as_ref().map(|r| r.desired_canaries).unwrap_or(0),
            placed_canaries: Vec::new(),
            healthy_allocs: 0,
            promoted: false,
            auto_revert: tg.update.as_ref().map(|u| u.auto_revert).unwrap_or(false),
            auto_promote: tg.update.as_ref().map(|u| u.auto_promote).unwrap_or(false),
            progress_deadline: tg.update.as_ref().map(|u| u.progress_deadline).unwrap_or_default(),
        })
    } else {
        None
    };

    let complete = deployment::is_group_complete(
        &counters_after,
        reschedule_now.len() as u32,
        reschedule_later_count,
        canary_requirement.is_some(),
        deployment_group_state,
    );

    GroupOutcome { complete, new_deployment_group }
}

fn plan_stops(plan: &mut Plan, group: &str, stops: Vec<Stop>) {
    for stop in stops {
        plan.push_stop(group, stop);
    }
}

/// Stop-path for a purged job (§4.11): every non-terminal alloc in every
/// group stops; lost allocs get `client_status = lost`, the rest get no
/// override.
fn stop_purged_group(group: &str, allocs: &AllocSet, plan: &mut Plan) {
    for alloc in allocs.iter() {
        if alloc.client_status.is_terminal() {
            continue;
        }
        let override_status = if alloc.client_status == ClientStatus::Lost {
            Some(ClientStatus::Lost)
        } else {
            None
        };
        plan.push_stop(
            group,
            Stop {
                alloc: alloc.id,
                client_status_override: override_status,
                reason: stop_reason::ALLOC_NOT_NEEDED,
                follow_up_eval_id: None,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SequentialEvalIdGen;
    use crate::model::*;
    use crate::update::UpdateDecision;
    use plfm_id::EnvId;

    struct NeverUpdate;
    impl AllocUpdateFn for NeverUpdate {
        fn decide(&self, _existing: &Allocation, _new_job: &Job, _new_tg: &TaskGroup) -> UpdateDecision {
            UpdateDecision::Ignore
        }
    }

    fn base_job(job_id: JobId, groups: BTreeMap<String, TaskGroup>) -> Job {
        Job {
            id: job_id,
            version: JobVersion(1),
            create_index: CreateIndex(1),
            modify_index: 1,
            namespace: "default".to_string(),
            job_type: JobType::Service,
            stopped: false,
            multiregion: false,
            periodic: false,
            parameterized: false,
            task_groups: groups,
        }
    }

    fn basic_group(name: &str, count: u32) -> TaskGroup {
        TaskGroup {
            name: name.to_string(),
            count,
            update: None,
            reschedule_policy: None,
            migrate: None,
            stop_after_client_disconnect: None,
            resume_after_client_reconnect: None,
        }
    }

    fn running_alloc(job_id: JobId, group: &str, index: u32) -> Allocation {
        Allocation {
            id: AllocId::new(),
            job_id,
            task_group: group.to_string(),
            index,
            job_version: JobVersion(1),
            create_index: CreateIndex(1),
            deployment_id: None,
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Running,
            client_status_updated_at: Utc::now(),
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
    fn fresh_deploy_places_full_count() {
        let job_id = EnvId::new();
        let mut groups = BTreeMap::new();
        groups.insert("web".to_string(), basic_group("web", 3));
        let job = base_job(job_id, groups);
        let mut id_gen = SequentialEvalIdGen::new();
        let reconciler = AllocReconciler::new(
            job_id,
            Some(job),
            None,
            AllocSet::new(),
            BTreeMap::new(),
            EvalId::new(),
            50,
            &NeverUpdate,
            Utc::now(),
            &mut id_gen,
        );
        let (plan, _metrics) = reconciler.compute().expect("valid input");
        assert_eq!(plan.placements().len(), 3);
        assert_eq!(plan.desired_tg_updates().get("web").unwrap().place, 3);
    }

    #[test]
    fn scale_down_stops_the_index_tail() {
        let job_id = EnvId::new();
        let mut groups = BTreeMap::new();
        groups.insert("web".to_string(), basic_group("web", 1));
        let job = base_job(job_id, groups);
        let allocs = AllocSet::from_vec(vec![
            running_alloc(job_id, "web", 0),
            running_alloc(job_id, "web", 1),
            running_alloc(job_id, "web", 2),
        ]);
        let mut id_gen = SequentialEvalIdGen::new();
        let reconciler = AllocReconciler::new(
            job_id,
            Some(job),
            None,
            allocs,
            BTreeMap::new(),
            EvalId::new(),
            50,
            &NeverUpdate,
            Utc::now(),
            &mut id_gen,
        );
        let (plan, _metrics) = reconciler.compute().expect("valid input");
        assert_eq!(plan.stops().len(), 2);
        assert_eq!(plan.placements().len(), 0);
    }

    #[test]
    fn stopped_job_stops_every_non_terminal_alloc() {
        let job_id = EnvId::new();
        let mut groups = BTreeMap::new();
        groups.insert("web".to_string(), basic_group("web", 2));
        let mut job = base_job(job_id, groups);
        job.stopped = true;
        let allocs = AllocSet::from_vec(vec![running_alloc(job_id, "web", 0), running_alloc(job_id, "web", 1)]);
        let mut id_gen = SequentialEvalIdGen::new();
        let reconciler = AllocReconciler::new(
            job_id,
            Some(job),
            None,
            allocs,
            BTreeMap::new(),
            EvalId::new(),
            50,
            &NeverUpdate,
            Utc::now(),
            &mut id_gen,
        );
        let (plan, _metrics) = reconciler.compute().expect("valid input");
        assert_eq!(plan.stops().len(), 2);
        assert_eq!(plan.placements().len(), 0);
    }

    #[test]
    fn missing_job_takes_the_stop_path() {
        let job_id = EnvId::new();
        let allocs = AllocSet::from_vec(vec![running_alloc(job_id, "web", 0)]);
        let mut id_gen = SequentialEvalIdGen::new();
        let reconciler = AllocReconciler::new(
            job_id,
            None,
            None,
            allocs,
            BTreeMap::new(),
            EvalId::new(),
            50,
            &NeverUpdate,
            Utc::now(),
            &mut id_gen,
        );
        let (plan, _metrics) = reconciler.compute().expect("valid input");
        assert_eq!(plan.stops().len(), 1);
    }
}
