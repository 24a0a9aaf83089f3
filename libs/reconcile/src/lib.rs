//! # plfm-reconcile
//!
//! Pure allocation reconciler for the plfm-vt scheduler.
//!
//! Given a job spec, its existing allocations, the cluster's tainted-node
//! view, and an in-flight deployment (if any), `AllocReconciler::compute`
//! produces one `Plan` describing every placement, stop, in-place update,
//! destructive update, and deployment transition needed to drive observed
//! state toward desired state. The call is synchronous and side-effect
//! free: no I/O, no ambient clock, no ambient randomness. `now` and
//! follow-up evaluation id generation are injected so the same inputs
//! always produce the same plan.
//!
//! ## Layout
//!
//! - [`model`] — the data types the reconciler reads (`Job`, `Allocation`,
//!   `Deployment`, ...) and the few derived properties it needs from them
//! - [`plan`] — the reconciler's sole output type
//! - [`reconciler`] — the orchestrator that drives every other module
//! - `alloc_set`, `taint`, `name_index`, `reschedule`, `disconnect`,
//!   `canary`, `stop_selector`, `update`, `placement`, `deployment` — the
//!   individual algorithms the orchestrator composes, each independently
//!   testable
//! - [`clock`] — the `now` / follow-up-id injection seam
//! - [`metrics`] — observations recorded during a pass, for callers that
//!   want reschedule-latency visibility without parsing the plan
//! - [`error`] — the crate's error type

mod alloc_set;
mod canary;
mod clock;
mod deployment;
mod disconnect;
mod error;
mod metrics;
mod model;
mod name_index;
mod placement;
mod plan;
mod reconciler;
mod reschedule;
mod stop_selector;
mod taint;
mod update;

pub use alloc_set::AllocSet;
pub use clock::{FollowUpEvalIdGen, SequentialEvalIdGen, UlidEvalIdGen};
pub use deployment::{CancelOutcome, check_cancel, completion_status, initial_deployment_status, is_group_complete, should_create_deployment};
pub use error::{ReconcileError, ReconcileResult};
pub use metrics::{ReconcileMetrics, RescheduleWaitObservation};
pub use model::{
    alloc_name, AllocDeploymentStatus, AllocId, Allocation, ClientStatus, CreateIndex,
    DelayFunction, Deployment, DeploymentGroupState, DeploymentStatus, DesiredStatus,
    DesiredTransition, EvalId, Job, JobId, JobType, JobVersion, NodeStatus, PlacementMetrics,
    ReschedulePolicy, RescheduleTracker, TaintedNode, TaskGroup, UpdateStrategy,
};
pub use plan::{
    deployment_description, eval_trigger, stop_reason, AttributeUpdate, DeploymentStatusUpdate,
    DesiredGroupCounters, DestructiveUpdate, FollowUpEval, Plan, Placement, Stop,
};
pub use reconciler::AllocReconciler;
pub use update::{AllocUpdateFn, UpdateDecision};
