// Job status state machine
//
// Manager, step and worker jobs share one closed status enum and one forward-only
// transition guard. Degraded completion is recorded in metadata, never as a status.

pub mod guards;
pub mod states;

pub use guards::{evaluate_transition, TransitionDecision};
pub use states::JobStatus;
