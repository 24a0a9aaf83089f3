//! The reconciler's sole output: a value describing the changes needed to
//! drive observed state toward desired state. Built in one pass inside
//! `reconciler::compute`, returned, never mutated again (§9, "plan as
//! value").

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use plfm_id::DeployId;

use crate::model::{AllocId, ClientStatus, Deployment, DeploymentStatus, EvalId, JobVersion};

// ---------------------------------------------------------------------
// Stop reason / eval trigger / deployment status description vocabularies
// ---------------------------------------------------------------------

/// Exact stop-reason strings; callers match on these.
pub mod stop_reason {
    pub const ALLOC_NOT_NEEDED: &str = "alloc-not-needed";
    pub const ALLOC_MIGRATING: &str = "alloc-migrating";
    pub const ALLOC_LOST: &str = "alloc-lost";
    pub const ALLOC_UPDATING: &str = "alloc-updating";
    pub const ALLOC_RESCHEDULED: &str = "alloc-rescheduled";
}

/// Exact deployment status-description strings; callers match on these.
pub mod deployment_description {
    pub const STOPPED_JOB: &str = "stopped-job";
    pub const NEWER_JOB: &str = "newer-job";
    pub const RUNNING_NEEDS_PROMOTION: &str = "running-needs-promotion";
    pub const RUNNING_AUTO_PROMOTION: &str = "running-auto-promotion";
    pub const PENDING_FOR_PEER: &str = "pending-for-peer";
    pub const BLOCKED: &str = "blocked";
    pub const SUCCESSFUL: &str = "successful";
}

/// Exact follow-up eval trigger strings.
pub mod eval_trigger {
    pub const RETRY_FAILED_ALLOC: &str = "retry-failed-alloc";
    pub const RESUME_TIMEOUT: &str = "resume-timeout";
}

/// A proposed new placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub name: String,
    pub task_group: String,
    pub previous_alloc: Option<AllocId>,
    pub canary: bool,
    pub reschedule: bool,
    pub lost: bool,
    pub downgrade_non_canary: bool,
    pub min_job_version: Option<JobVersion>,
}

/// A destructive update: one stop paired with one placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestructiveUpdate {
    pub place_name: String,
    pub place_task_group: String,
    pub stop_alloc: AllocId,
    pub stop_reason: &'static str,
}

/// A requested stop of an existing allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub alloc: AllocId,
    pub client_status_override: Option<ClientStatus>,
    pub reason: &'static str,
    pub follow_up_eval_id: Option<EvalId>,
}

/// A non-restarting patch recording a follow-up eval id on an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub alloc: AllocId,
    pub follow_up_eval_id: EvalId,
}

/// A scheduled follow-up evaluation, binding a batch of delayed actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpEval {
    pub id: EvalId,
    pub task_group: String,
    pub wait_until: DateTime<Utc>,
    pub trigger: &'static str,
    pub status_description: String,
}

/// Per-group tally of what happened to each allocation considered this
/// pass. Every allocation considered is counted in exactly one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredGroupCounters {
    pub ignore: u32,
    pub place: u32,
    pub in_place: u32,
    pub destructive: u32,
    pub stop: u32,
    pub migrate: u32,
    pub canary: u32,
}

impl DesiredGroupCounters {
    pub fn total(&self) -> u32 {
        self.ignore
            + self.place
            + self.in_place
            + self.destructive
            + self.stop
            + self.migrate
            + self.canary
    }
}

/// A proposed change to the current deployment's overall status (as
/// opposed to `Plan::deployment`, which proposes creating or replacing it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatusUpdate {
    pub deployment_id: DeployId,
    pub status: DeploymentStatus,
    pub status_description: &'static str,
}

/// The reconciler's sole output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub(crate) placements: Vec<Placement>,
    pub(crate) destructive_updates: Vec<DestructiveUpdate>,
    pub(crate) in_place_updates: Vec<crate::model::Allocation>,
    pub(crate) stops: Vec<Stop>,
    pub(crate) attribute_updates: BTreeMap<AllocId, AttributeUpdate>,
    pub(crate) disconnect_updates: BTreeMap<AllocId, crate::model::Allocation>,
    pub(crate) reconnect_updates: BTreeMap<AllocId, crate::model::Allocation>,
    pub(crate) desired_tg_updates: BTreeMap<String, DesiredGroupCounters>,
    pub(crate) desired_follow_up_evals: BTreeMap<String, Vec<FollowUpEval>>,
    pub(crate) deployment: Option<Deployment>,
    pub(crate) deployment_status_update: Option<DeploymentStatusUpdate>,
}

impl Plan {
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub fn destructive_updates(&self) -> &[DestructiveUpdate] {
        &self.destructive_updates
    }

    pub fn in_place_updates(&self) -> &[crate::model::Allocation] {
        &self.in_place_updates
    }

    pub fn stops(&self) -> &[Stop] {
        &self.stops
    }

    pub fn attribute_updates(&self) -> &BTreeMap<AllocId, AttributeUpdate> {
        &self.attribute_updates
    }

    pub fn disconnect_updates(&self) -> &BTreeMap<AllocId, crate::model::Allocation> {
        &self.disconnect_updates
    }

    pub fn reconnect_updates(&self) -> &BTreeMap<AllocId, crate::model::Allocation> {
        &self.reconnect_updates
    }

    pub fn desired_tg_updates(&self) -> &BTreeMap<String, DesiredGroupCounters> {
        &self.desired_tg_updates
    }

    pub fn desired_follow_up_evals(&self) -> &BTreeMap<String, Vec<FollowUpEval>> {
        &self.desired_follow_up_evals
    }

    pub fn deployment(&self) -> Option<&Deployment> {
        self.deployment.as_ref()
    }

    pub fn deployment_status_update(&self) -> Option<&DeploymentStatusUpdate> {
        self.deployment_status_update.as_ref()
    }

    /// Total mutating changes proposed by this plan. Disconnect/reconnect
    /// attribute updates are deliberately excluded — see SPEC_FULL.md
    /// "Open Question decisions" #1: they acknowledge existing state, they
    /// don't move the cluster toward a different one, so a plan consisting
    /// only of those is a no-op plan for the purposes of property 9
    /// (idempotence) and for a caller deciding whether applying is worth
    /// it.
    pub fn changes(&self) -> usize {
        self.placements.len()
            + self.destructive_updates.len()
            + self.in_place_updates.len()
            + self.stops.len()
            + self
                .desired_follow_up_evals
                .values()
                .map(|v| v.len())
                .sum::<usize>()
            + usize::from(self.deployment.is_some())
            + usize::from(self.deployment_status_update.is_some())
    }

    pub(crate) fn counters_mut(&mut self, group: &str) -> &mut DesiredGroupCounters {
        self.desired_tg_updates.entry(group.to_string()).or_default()
    }

    pub(crate) fn push_placement(&mut self, group: &str, p: Placement) {
        self.counters_mut(group).place += 1;
        self.placements.push(p);
    }

    pub(crate) fn push_canary_placement(&mut self, group: &str, p: Placement) {
        self.counters_mut(group).canary += 1;
        self.placements.push(p);
    }

    pub(crate) fn push_destructive(&mut self, group: &str, d: DestructiveUpdate) {
        self.counters_mut(group).destructive += 1;
        self.destructive_updates.push(d);
    }

    pub(crate) fn push_in_place(&mut self, group: &str, a: crate::model::Allocation) {
        self.counters_mut(group).in_place += 1;
        self.in_place_updates.push(a);
    }

    pub(crate) fn push_stop(&mut self, group: &str, s: Stop) {
        self.counters_mut(group).stop += 1;
        self.stops.push(s);
    }

    pub(crate) fn push_migrate_stop(&mut self, group: &str, s: Stop) {
        self.counters_mut(group).migrate += 1;
        self.stops.push(s);
    }

    pub(crate) fn add_ignore(&mut self, group: &str, n: u32) {
        self.counters_mut(group).ignore += n;
    }

    pub(crate) fn set_attribute_update(&mut self, u: AttributeUpdate) {
        self.attribute_updates.insert(u.alloc, u);
    }

    pub(crate) fn set_disconnect_update(&mut self, a: crate::model::Allocation) {
        self.disconnect_updates.insert(a.id, a);
    }

    pub(crate) fn set_reconnect_update(&mut self, a: crate::model::Allocation) {
        self.reconnect_updates.insert(a.id, a);
    }

    pub(crate) fn push_follow_up_evals(&mut self, group: &str, evals: Vec<FollowUpEval>) {
        if evals.is_empty() {
            return;
        }
        self.desired_follow_up_evals
            .entry(group.to_string())
            .or_default()
            .extend(evals);
    }

    pub(crate) fn set_deployment(&mut self, d: Deployment) {
        self.deployment = Some(d);
    }

    pub(crate) fn set_deployment_status_update(&mut self, u: DeploymentStatusUpdate) {
        self.deployment_status_update = Some(u);
    }
}
