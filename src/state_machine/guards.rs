//! Status transition guard.
//!
//! Status changes only move forward (`pending -> running -> terminal`). Once a terminal
//! status is stored every later write is absorbed as a no-op, which is what makes repeated
//! or racing status writes for the same job harmless.

use super::states::JobStatus;

/// Outcome of evaluating a requested status change against the stored status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionDecision {
    /// The write should be committed
    Apply,
    /// Stored status is terminal; the request is ignored
    AlreadyTerminal,
    /// Requested status equals the stored status
    Unchanged,
    /// Requested status would move the job backwards (e.g. running -> pending)
    Regression,
    /// The job's tree is being cancelled; only `cancelled` may still be written
    ScopeCancelled,
}

impl TransitionDecision {
    pub fn should_apply(&self) -> bool {
        matches!(self, Self::Apply)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Apply => "applied",
            Self::AlreadyTerminal => "job already in a terminal status",
            Self::Unchanged => "status unchanged",
            Self::Regression => "status transitions are forward-only",
            Self::ScopeCancelled => "job tree is being cancelled",
        }
    }
}

/// Decide whether `requested` may replace `current`
pub fn evaluate_transition(current: JobStatus, requested: JobStatus) -> TransitionDecision {
    if current.is_terminal() {
        return TransitionDecision::AlreadyTerminal;
    }
    if current == requested {
        return TransitionDecision::Unchanged;
    }
    if requested.rank() < current.rank() {
        return TransitionDecision::Regression;
    }
    TransitionDecision::Apply
}
