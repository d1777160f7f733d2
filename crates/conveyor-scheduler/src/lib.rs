//! Job scheduling for Conveyor.
//!
//! Owns the bounded admission queue and dispatches jobs up to the
//! configured concurrency cap.

pub mod queue;

pub use queue::{CancelReport, JobQueue};
