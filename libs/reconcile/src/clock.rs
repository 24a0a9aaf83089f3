//! Clock and id-generation injection (§5, §9): `now` and follow-up eval id
//! generation are inputs to `compute`, never read from the ambient
//! environment, so tests are deterministic.

use crate::model::EvalId;

/// Generates follow-up evaluation ids. Implementations are free to be
/// non-deterministic in production (`UlidEvalIdGen`) or fully deterministic
/// in tests (`SequentialEvalIdGen`).
pub trait FollowUpEvalIdGen {
    fn next_id(&mut self) -> EvalId;
}

/// Production default: a fresh ULID-backed id per call.
#[derive(Debug, Default)]
pub struct UlidEvalIdGen;

impl FollowUpEvalIdGen for UlidEvalIdGen {
    fn next_id(&mut self) -> EvalId {
        EvalId::new()
    }
}

/// Deterministic generator for tests: hands out ids parsed from a fixed
/// sequence, wrapping to regenerate fresh ones if exhausted.
#[derive(Debug, Default)]
pub struct SequentialEvalIdGen {
    next: u64,
}

impl SequentialEvalIdGen {
    pub fn new() -> Self {
        Self { next: 0 }
    }
}

impl FollowUpEvalIdGen for SequentialEvalIdGen {
    fn next_id(&mut self) -> EvalId {
        self.next += 1;
        let ulid = plfm_id::Ulid::from_parts(self.next, 0);
        EvalId::from_ulid(ulid)
    }
}
