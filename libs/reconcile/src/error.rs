//! Errors for the small slice of reconciliation inputs that are malformed
//! at construction time, as opposed to the irregular-but-handled conditions
//! in spec §7 (those never produce an `Err`; they degrade gracefully and
//! are logged at `debug`/`warn` from within `compute`).

use thiserror::Error;

/// Errors raised by `AllocReconciler::validate` before a reconciliation
/// pass begins.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A task group's desired count is large enough that `NameIndex::next`'s
    /// defensive scan bound (`count.saturating_mul(2).saturating_add(k)`,
    /// see `name_index.rs`) would itself saturate to `u32::MAX`, at which
    /// point the scan's `u32` candidate counter can wrap instead of
    /// terminating. Kept well below any count a real cluster would ever run.
    #[error("task group {task_group:?} has count {count} exceeding the name-index limit {limit}")]
    InvalidCount {
        task_group: String,
        count: u32,
        limit: u32,
    },
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
