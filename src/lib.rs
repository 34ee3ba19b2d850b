#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod gateway;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
pub use orchestrator::engine::Orchestrator;
