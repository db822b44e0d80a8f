//! Controller Module - Periodischer Control Loop
//!
//! - `barrier`: einmalig feuernde Phasen-Barriere
//! - `control_loop`: Snapshot, Barriere, Reconciliation, Bulk-Advance

mod barrier;
mod control_loop;

pub use barrier::PhaseBarrier;
pub use control_loop::{ControlLoop, TickOutcome, RELEASE_PHASE, RESOURCE_PHASE};
