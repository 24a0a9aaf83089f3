//! End-to-end coverage for the six reference scenarios driving a whole
//! `AllocReconciler::compute` call through a realistic fixture rather than
//! exercising one component in isolation.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;

use plfm_id::{DeployId, EnvId};
use plfm_reconcile::{
    AllocId, AllocReconciler, AllocSet, AllocUpdateFn, Allocation, ClientStatus, CreateIndex,
    Deployment, DeploymentGroupState, DeploymentStatus, DesiredStatus, DesiredTransition, EvalId,
    Job, JobId, JobType, JobVersion, PlacementMetrics, RescheduleTracker, SequentialEvalIdGen,
    TaskGroup, UpdateDecision, UpdateStrategy,
};

fn base_job(job_id: JobId, version: u64, groups: BTreeMap<String, TaskGroup>) -> Job {
    Job {
        id: job_id,
        version: JobVersion(version),
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

fn group(name: &str, count: u32) -> TaskGroup {
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

fn running_alloc(job_id: JobId, group: &str, index: u32, version: u64) -> Allocation {
    Allocation {
        id: AllocId::new(),
        job_id,
        task_group: group.to_string(),
        index,
        job_version: JobVersion(version),
        create_index: CreateIndex(index as u64 + 1),
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

struct NeverUpdate;
impl AllocUpdateFn for NeverUpdate {
    fn decide(&self, _existing: &Allocation, _new_job: &Job, _new_tg: &TaskGroup) -> UpdateDecision {
        UpdateDecision::Ignore
    }
}

/// Destructive whenever the alloc's job version lags the job's.
struct DestructiveOnVersionBump;
impl AllocUpdateFn for DestructiveOnVersionBump {
    fn decide(&self, existing: &Allocation, new_job: &Job, _new_tg: &TaskGroup) -> UpdateDecision {
        if existing.job_version < new_job.version {
            UpdateDecision::Destructive
        } else {
            UpdateDecision::Ignore
        }
    }
}

#[test]
fn s1_fresh_deploy_places_full_count_with_no_update_strategy() {
    let job_id = EnvId::new();
    let mut groups = BTreeMap::new();
    groups.insert("g".to_string(), group("g", 3));
    let job = base_job(job_id, 1, groups);
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
    assert!(plan.stops().is_empty());
    assert!(plan.deployment().is_none());
    let counters = plan.desired_tg_updates().get("g").unwrap();
    assert_eq!(counters.place, 3);
    let mut names: Vec<_> = plan.placements().iter().map(|p| p.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec![format!("{job_id}.g[0]"), format!("{job_id}.g[1]"), format!("{job_id}.g[2]")]);
}

#[test]
fn s2_scale_down_stops_the_tail() {
    let job_id = EnvId::new();
    let mut groups = BTreeMap::new();
    groups.insert("g".to_string(), group("g", 2));
    let job = base_job(job_id, 1, groups);
    let allocs = AllocSet::from_vec(vec![
        running_alloc(job_id, "g", 0, 1),
        running_alloc(job_id, "g", 1, 1),
        running_alloc(job_id, "g", 2, 1),
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

    assert_eq!(plan.stops().len(), 1);
    assert_eq!(plan.stops()[0].reason, plfm_reconcile::stop_reason::ALLOC_NOT_NEEDED);
    assert!(plan.placements().is_empty());
    let counters = plan.desired_tg_updates().get("g").unwrap();
    assert_eq!(counters.stop, 1);
    assert_eq!(counters.ignore, 2);
}

#[test]
fn s3_destructive_rolling_update_requires_canary_before_any_destructive_commit() {
    let job_id = EnvId::new();
    let strategy = UpdateStrategy {
        canary: 1,
        max_parallel: 2,
        auto_promote: false,
        auto_revert: false,
        progress_deadline: Duration::from_secs(600),
    };
    let mut tg = group("g", 4);
    tg.update = Some(strategy);
    let mut groups = BTreeMap::new();
    groups.insert("g".to_string(), tg);
    let job = base_job(job_id, 2, groups);

    let allocs = AllocSet::from_vec(vec![
        running_alloc(job_id, "g", 0, 1),
        running_alloc(job_id, "g", 1, 1),
        running_alloc(job_id, "g", 2, 1),
        running_alloc(job_id, "g", 3, 1),
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
        &DestructiveOnVersionBump,
        Utc::now(),
        &mut id_gen,
    );
    let (plan, _metrics) = reconciler.compute().expect("valid input");

    assert!(plan.destructive_updates().is_empty());
    assert_eq!(plan.placements().iter().filter(|p| p.canary).count(), 1);
    let deployment = plan.deployment().expect("deployment should be created");
    assert_eq!(deployment.status_description, plfm_reconcile::deployment_description::RUNNING_NEEDS_PROMOTION);
    let group_state = deployment.groups.get("g").expect("group state recorded");
    assert_eq!(group_state.desired_canaries, 1);
    assert!(!group_state.promoted);
    let counters = plan.desired_tg_updates().get("g").unwrap();
    assert_eq!(counters.canary, 1);
    assert_eq!(counters.destructive, 0);
}

#[test]
fn s4_lost_alloc_on_paused_deployment_backfills_but_does_not_churn() {
    let job_id = EnvId::new();
    let strategy = UpdateStrategy {
        canary: 0,
        max_parallel: 1,
        auto_promote: false,
        auto_revert: false,
        progress_deadline: Duration::from_secs(600),
    };
    let mut tg = group("g", 3);
    tg.update = Some(strategy);
    let mut groups = BTreeMap::new();
    groups.insert("g".to_string(), tg);
    let job = base_job(job_id, 1, groups);

    let mut lost = running_alloc(job_id, "g", 0, 1);
    lost.client_status = ClientStatus::Lost;
    let healthy_a = running_alloc(job_id, "g", 1, 1);
    let healthy_b = running_alloc(job_id, "g", 2, 1);
    let allocs = AllocSet::from_vec(vec![lost.clone(), healthy_a, healthy_b]);

    let mut deployment_groups = BTreeMap::new();
    deployment_groups.insert(
        "g".to_string(),
        DeploymentGroupState {
            desired_total: 3,
            desired_canaries: 0,
            placed_canaries: Vec::new(),
            healthy_allocs: 2,
            promoted: true,
            auto_revert: false,
            auto_promote: false,
            progress_deadline: Duration::from_secs(600),
        },
    );
    let deployment = Deployment {
        id: DeployId::new(),
        job_version: JobVersion(1),
        job_create_index: CreateIndex(1),
        status: DeploymentStatus::Paused,
        status_description: String::new(),
        groups: deployment_groups,
    };

    let mut id_gen = SequentialEvalIdGen::new();
    let reconciler = AllocReconciler::new(
        job_id,
        Some(job),
        Some(deployment),
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
    assert_eq!(plan.stops()[0].alloc, lost.id);
    assert_eq!(plan.stops()[0].client_status_override, Some(ClientStatus::Lost));
    assert_eq!(plan.placements().len(), 1);
    assert!(plan.placements()[0].lost);
    assert!(plan.destructive_updates().is_empty());
}

#[test]
fn s5_failed_alloc_reschedules_later_via_follow_up_eval() {
    let job_id = EnvId::new();
    let policy = plfm_reconcile::ReschedulePolicy {
        attempts: Some(2),
        interval: Duration::from_secs(86400),
        delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(3600),
        delay_function: plfm_reconcile::DelayFunction::Constant,
    };
    let mut tg = group("g", 1);
    tg.reschedule_policy = Some(policy);
    let mut groups = BTreeMap::new();
    groups.insert("g".to_string(), tg);
    let job = base_job(job_id, 1, groups);

    let now = Utc::now();
    let mut failed = running_alloc(job_id, "g", 0, 1);
    failed.client_status = ClientStatus::Failed;
    failed.client_status_updated_at = now;
    let failed_id = failed.id;
    let allocs = AllocSet::from_vec(vec![failed]);

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
        now,
        &mut id_gen,
    );
    let (plan, _metrics) = reconciler.compute().expect("valid input");

    assert!(plan.placements().is_empty());
    assert!(plan.stops().is_empty());
    let evals = plan.desired_follow_up_evals().get("g").expect("batched follow-up eval");
    assert_eq!(evals.len(), 1);
    assert_eq!(evals[0].wait_until, now + chrono::Duration::seconds(30));
    let attr = plan.attribute_updates().get(&failed_id).expect("attribute update recorded");
    assert_eq!(attr.follow_up_eval_id, evals[0].id);
}

#[test]
fn s6_reconnect_after_disconnect_keeps_the_higher_scoring_alloc() {
    let job_id = EnvId::new();
    let mut tg = group("g", 1);
    tg.resume_after_client_reconnect = Some(Duration::from_secs(3600));
    let mut groups = BTreeMap::new();
    groups.insert("g".to_string(), tg);
    let job = base_job(job_id, 1, groups);

    let mut a = running_alloc(job_id, "g", 0, 1);
    a.client_status = ClientStatus::Unknown;
    a.node_id = None;
    a.metrics = PlacementMetrics { norm_score: Some(0.9) };

    let mut b = running_alloc(job_id, "g", 0, 1);
    b.metrics = PlacementMetrics { norm_score: Some(0.7) };

    let allocs = AllocSet::from_vec(vec![a.clone(), b.clone()]);
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

    assert_eq!(plan.stops().len(), 1);
    assert_eq!(plan.stops()[0].alloc, b.id);
    assert!(plan.reconnect_updates().contains_key(&a.id));
    assert!(plan.placements().is_empty());
}
