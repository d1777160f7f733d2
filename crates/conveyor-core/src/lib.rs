//! Core domain types for the Conveyor CI orchestrator.
//!
//! This crate contains:
//! - Resource identifiers and error types
//! - The update/watcher publish-subscribe protocol
//! - Build, Job and Project entities
//! - The JobRunner trait implemented by executors

pub mod build;
pub mod error;
pub mod id;
pub mod job;
pub mod project;
pub mod runner;
pub mod update;
pub mod watcher;

pub use build::{Build, Scheduler};
pub use error::{Error, Result};
pub use id::ResourceId;
pub use job::Job;
pub use project::Project;
pub use runner::JobRunner;
pub use update::{Delivery, RunStatus, Update};
pub use watcher::{ChannelWatcher, WatchHub, Watcher, WatcherId};
