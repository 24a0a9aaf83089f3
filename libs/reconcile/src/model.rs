//! Data model: the typed vocabulary the rest of the crate operates on.
//!
//! Nothing here performs reconciliation; this module only describes the
//! shapes. `plfm_id` supplies the stable, prefixed ID types used everywhere
//! else in the workspace (`InstanceId`, `NodeId`, `DeployId`, `EnvId`); the
//! one addition is `EvalId`, defined the same way every other typed ID in
//! the platform is defined.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use plfm_id::{define_id, DeployId, EnvId, InstanceId, NodeId};
use serde::{Deserialize, Serialize};

define_id!(EvalId, "eval");

/// A job, in this platform's vocabulary, is one environment's desired
/// release: its identity is the environment's.
pub type JobId = EnvId;

/// An allocation's identity is an instance's.
pub type AllocId = InstanceId;

/// Monotonically increasing job version. A new version never mutates an
/// existing allocation's recorded version; it only ever causes new
/// allocations to be placed at the new version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobVersion(pub u64);

impl std::fmt::Display for JobVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The raft/log index a job was created or last promoted at. Used, together
/// with `JobVersion`, to recognize a deployment that refers to a job the
/// caller has already superseded (§4.10, "newer-job").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CreateIndex(pub u64);

impl std::fmt::Display for CreateIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job type. Only `is_batch` (service vs batch reschedule semantics, §4.4)
/// is actually branched on inside the reconciler; the remaining variants
/// exist because the caller's job snapshot carries them and a truncated
/// enum would force a lossy conversion at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Service,
    Batch,
    System,
    SysBatch,
}

impl JobType {
    /// Whether this job type uses batch reschedule-eligibility rules
    /// (failed *or* complete-with-remaining-attempts) rather than service
    /// rules (failed only).
    pub fn is_batch(&self) -> bool {
        matches!(self, JobType::Batch | JobType::SysBatch)
    }
}

/// An allocation's desired status. Monotonic with respect to termination:
/// once `Stop` or `Evict`, an allocation is never moved back to `Run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    Run,
    Stop,
    Evict,
}

impl DesiredStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DesiredStatus::Stop | DesiredStatus::Evict)
    }
}

/// An allocation's observed client status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
    Unknown,
}

impl ClientStatus {
    /// Terminal client statuses are final: the allocation will not run
    /// again under this id.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientStatus::Complete | ClientStatus::Failed | ClientStatus::Lost
        )
    }
}

/// Operator/system-requested transition flags carried on an allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredTransition {
    pub migrate: bool,
    pub reschedule: bool,
    pub force_reschedule: bool,
}

impl DesiredTransition {
    pub fn should_migrate_or_reschedule(&self) -> bool {
        self.migrate || self.reschedule || self.force_reschedule
    }
}

/// Deployment-scoped allocation health, as tracked by the deployment
/// watcher (out of scope) and read here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocDeploymentStatus {
    /// `None` until the deployment watcher has made a healthy/unhealthy
    /// determination for this allocation.
    pub healthy: Option<bool>,
    pub canary: bool,
}

impl AllocDeploymentStatus {
    pub fn is_unhealthy(&self) -> bool {
        self.healthy == Some(false)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy == Some(true)
    }
}

/// Backoff shape for the reschedule policy's delay function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayFunction {
    Constant,
    Exponential,
    Fibonacci,
}

/// Per-task-group reschedule policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReschedulePolicy {
    /// Maximum reschedule attempts within `interval`. `None` = unlimited.
    pub attempts: Option<u32>,
    pub interval: Duration,
    pub delay: Duration,
    pub max_delay: Duration,
    pub delay_function: DelayFunction,
}

impl Default for ReschedulePolicy {
    fn default() -> Self {
        Self {
            attempts: Some(2),
            interval: Duration::from_secs(24 * 60 * 60),
            delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
            delay_function: DelayFunction::Exponential,
        }
    }
}

/// A single past reschedule attempt, kept so eligibility and next-delay can
/// be computed without a back-reference to the previous allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastRescheduleEvent {
    pub reschedule_time: DateTime<Utc>,
}

/// Tracks reschedule attempts for one allocation across its lineage
/// (original placement plus every replacement chained to it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleTracker {
    pub past_attempts: Vec<PastRescheduleEvent>,
}

impl RescheduleTracker {
    pub fn attempt_count(&self) -> u32 {
        self.past_attempts.len() as u32
    }

    /// Attempts within the policy's interval of `now`, the count that's
    /// actually compared against `policy.attempts`.
    pub fn attempts_in_window(&self, policy: &ReschedulePolicy, now: DateTime<Utc>) -> u32 {
        let window_start = now - chrono_duration(policy.interval);
        self.past_attempts
            .iter()
            .filter(|a| a.reschedule_time >= window_start)
            .count() as u32
    }

    /// Whether another reschedule attempt is still allowed under `policy`.
    pub fn has_attempts_left(&self, policy: &ReschedulePolicy, now: DateTime<Utc>) -> bool {
        match policy.attempts {
            None => true,
            Some(max) => self.attempts_in_window(policy, now) < max,
        }
    }

    /// The delay to apply before the *next* attempt, per `policy.delay_function`.
    pub fn next_delay(&self, policy: &ReschedulePolicy) -> Duration {
        let attempt = self.attempt_count();
        let delay = match policy.delay_function {
            DelayFunction::Constant => policy.delay,
            DelayFunction::Exponential => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                policy.delay.saturating_mul(factor.max(1))
            }
            DelayFunction::Fibonacci => {
                let (mut a, mut b) = (1u64, 1u64);
                for _ in 0..attempt {
                    let next = a.saturating_add(b);
                    a = b;
                    b = next;
                }
                Duration::from_secs_f64(policy.delay.as_secs_f64() * a as f64)
            }
        };
        delay.min(policy.max_delay)
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000))
}

/// Placement-ranker output carried on an allocation, used by the stop
/// selector's reconnect-vs-replacement comparison (§4.7 step 7).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementMetrics {
    pub norm_score: Option<f64>,
}

/// One instance of a task group on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocId,
    pub job_id: JobId,
    pub task_group: String,
    /// Stable positional index, `0 <= index < group.count` for the common
    /// case (names can briefly exceed `count` after a scale-down race,
    /// §7's "duplicate allocation names" tolerance covers the fallout).
    pub index: u32,
    pub job_version: JobVersion,
    pub create_index: CreateIndex,
    pub deployment_id: Option<DeployId>,
    pub desired_status: DesiredStatus,
    pub client_status: ClientStatus,
    /// When `client_status` was last set. Used as the basis time for the
    /// first reschedule attempt's eligibility window.
    pub client_status_updated_at: DateTime<Utc>,
    pub desired_transition: DesiredTransition,
    pub deployment_status: Option<AllocDeploymentStatus>,
    pub previous_alloc: Option<AllocId>,
    pub node_id: Option<NodeId>,
    pub reschedule_tracker: RescheduleTracker,
    pub follow_up_eval_id: Option<EvalId>,
    pub metrics: PlacementMetrics,
}

impl Allocation {
    /// `<jobID>.<group>[<index>]`
    pub fn name(&self) -> String {
        alloc_name(&self.job_id, &self.task_group, self.index)
    }

    pub fn is_canary(&self) -> bool {
        self.deployment_status.map(|s| s.canary).unwrap_or(false)
    }

    pub fn is_running_or_pending(&self) -> bool {
        matches!(self.client_status, ClientStatus::Running | ClientStatus::Pending)
    }
}

/// Format an allocation name for a given job/group/index.
pub fn alloc_name(job_id: &JobId, group: &str, index: u32) -> String {
    format!("{}.{}[{}]", job_id, group, index)
}

/// Node health as tracked by the heartbeat tracker (out of scope). Only
/// tainted nodes appear in the index the reconciler is given — a `Ready`
/// node is simply absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Initializing,
    Down,
    Disconnected,
    Ineligible,
}

/// A tainted node entry. `draining` is independent of `status` — a node can
/// be `Ineligible` (no new placements) while also draining its existing
/// allocations, or simply draining while otherwise healthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaintedNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub draining: bool,
    /// When this node was first observed disconnected, used to compute the
    /// disconnect timeout (§4.5). `None` if the node is tainted for a
    /// reason other than disconnection.
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Maximum time the cluster will wait for this node to reconnect before
    /// treating its allocations as lost. `None` means no limit.
    pub max_client_disconnect: Option<Duration>,
}

impl TaintedNode {
    pub fn is_drain_or_ineligible(&self) -> bool {
        self.draining || matches!(self.status, NodeStatus::Ineligible)
    }
}

/// Canary count, rollout pacing, and promotion behavior for one task group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStrategy {
    pub canary: u32,
    pub max_parallel: u32,
    pub auto_promote: bool,
    pub auto_revert: bool,
    pub progress_deadline: Duration,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            canary: 0,
            max_parallel: 1,
            auto_promote: false,
            auto_revert: false,
            progress_deadline: Duration::from_secs(10 * 60),
        }
    }
}

/// Migration pacing for allocations on draining/ineligible nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigratePolicy {
    pub max_parallel: u32,
    pub min_healthy_time: Duration,
    pub healthy_deadline: Duration,
}

impl Default for MigratePolicy {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            min_healthy_time: Duration::from_secs(10),
            healthy_deadline: Duration::from_secs(5 * 60),
        }
    }
}

/// One task group within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub count: u32,
    pub update: Option<UpdateStrategy>,
    pub reschedule_policy: Option<ReschedulePolicy>,
    pub migrate: Option<MigratePolicy>,
    pub stop_after_client_disconnect: Option<Duration>,
    /// Presence of this policy is what §4.1/§4.3 call "the group has a
    /// resume-after-client-reconnect policy".
    pub resume_after_client_reconnect: Option<Duration>,
}

impl TaskGroup {
    pub fn has_reconnect_policy(&self) -> bool {
        self.resume_after_client_reconnect.is_some()
    }
}

/// The target spec driving reconciliation. Absence of a `Job` (the caller
/// passes `None`) means the job has been deleted outright; `stopped = true`
/// means the job still exists but is being torn down. Both take the §4.11
/// stop-path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub version: JobVersion,
    pub create_index: CreateIndex,
    pub modify_index: u64,
    pub namespace: String,
    pub job_type: JobType,
    pub stopped: bool,
    pub multiregion: bool,
    pub periodic: bool,
    pub parameterized: bool,
    pub task_groups: BTreeMap<String, TaskGroup>,
}

impl Job {
    pub fn task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.get(name)
    }

    /// Multi-region, non-periodic/parameterized jobs start deployments
    /// `pending` rather than `running` (§4.10) so peers can coordinate.
    pub fn is_multiregion_deploy_gated(&self) -> bool {
        self.multiregion && !self.periodic && !self.parameterized
    }
}

/// Deployment lifecycle status (§3, §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Paused,
    Blocked,
    Unblocking,
    Successful,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Successful | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Per-group progress tracked inside a `Deployment`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentGroupState {
    pub desired_total: u32,
    pub desired_canaries: u32,
    pub placed_canaries: Vec<AllocId>,
    pub healthy_allocs: u32,
    pub promoted: bool,
    pub auto_revert: bool,
    pub auto_promote: bool,
    pub progress_deadline: Duration,
}

impl DeploymentGroupState {
    pub fn requires_promotion(&self) -> bool {
        self.desired_canaries > 0 && !self.promoted
    }
}

/// A rollout record. Owned by the deployment watcher; the reconciler reads
/// it and proposes mutations (`Plan::deployment`,
/// `Plan::deployment_status_update`) rather than mutating it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeployId,
    pub job_version: JobVersion,
    pub job_create_index: CreateIndex,
    pub status: DeploymentStatus,
    pub status_description: String,
    pub groups: BTreeMap<String, DeploymentGroupState>,
}

impl Deployment {
    pub fn group(&self, name: &str) -> Option<&DeploymentGroupState> {
        self.groups.get(name)
    }

    pub fn is_paused_or_failed(&self) -> bool {
        matches!(
            self.status,
            DeploymentStatus::Paused | DeploymentStatus::Failed
        )
    }

    /// True if the group has unpromoted canaries outstanding, i.e. the
    /// group is "canarying" (§4.9, §4.6).
    pub fn is_canarying(&self, group: &str) -> bool {
        self.group(group)
            .map(|g| g.requires_promotion())
            .unwrap_or(false)
    }
}
