//! Epic orchestration.
//!
//! The reconciler owns the epic snapshot, the supervisor owns worker
//! sessions, and pipeline automation owns per-issue work items. The
//! [`engine::Orchestrator`] composes them, runs their timers, and publishes
//! change notifications.

pub mod completion;
pub mod engine;
pub mod notifier;
pub mod phase;
pub mod pipeline;
pub mod reconciler;
pub mod single_flight;
pub mod supervisor;
pub mod ticker;
