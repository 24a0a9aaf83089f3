//! Metrics (§6). This crate does no I/O and has no metrics-exporter
//! dependency of its own, so `compute` returns a plain value the caller
//! feeds into whatever sink it already uses — the same "return a value,
//! let the caller act" shape as `Plan` itself.

use chrono::{DateTime, Utc};

use crate::model::{AllocId, EvalId, JobId};

/// One observation of `scheduler.allocs.reschedule.wait_until`.
#[derive(Debug, Clone, PartialEq)]
pub struct RescheduleWaitObservation {
    pub alloc_id: AllocId,
    pub job_id: JobId,
    pub namespace: String,
    pub task_group: String,
    pub follow_up_eval_id: EvalId,
    pub wait_until: DateTime<Utc>,
}

/// Counters and gauge observations emitted by one `compute` call.
#[derive(Debug, Clone, Default)]
pub struct ReconcileMetrics {
    pub reschedule_attempted: u64,
    pub reschedule_limit: u64,
    pub reschedule_wait_until: Vec<RescheduleWaitObservation>,
}

impl ReconcileMetrics {
    pub(crate) fn record_attempt(&mut self) {
        self.reschedule_attempted += 1;
    }

    pub(crate) fn record_limit_hit(&mut self) {
        self.reschedule_limit += 1;
    }

    pub(crate) fn record_wait_until(&mut self, obs: RescheduleWaitObservation) {
        self.reschedule_wait_until.push(obs);
    }
}
