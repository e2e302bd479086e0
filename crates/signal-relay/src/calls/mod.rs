//! Call records and the orchestrator actor.
//!
//! The orchestrator is the relay's single source of truth for call
//! existence and terminal-ness. All transitions flow through one actor
//! mailbox, which is what makes them atomic per call and what closes the
//! disconnect-vs-end race.

pub mod orchestrator;
pub mod record;

pub use orchestrator::{CallOrchestrator, CallOrchestratorHandle};
pub use record::{CallRecord, CallSnapshot, CallState};
