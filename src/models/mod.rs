//! Domain model module declarations.

pub mod epic;
pub mod pipeline;
pub mod session;
pub mod snapshot;
