//! Remote command dispatch

mod correlator;

pub use correlator::{CommandCorrelator, PendingCommand, ResolveOutcome};
