//! Shared domain types for the peerwork queue.
//!
//! Pure types, constants, and functions with no I/O so every other crate
//! in the workspace can depend on them without pulling in a runtime.

pub mod error;
pub mod load;
pub mod node;
pub mod scheduling;
pub mod types;
