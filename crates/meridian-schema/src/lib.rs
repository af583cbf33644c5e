//! Meridian schema model
//!
//! Per-platform type declarations as produced by the metadata document parser,
//! relationship edges derived from them, and the serializable execution plans
//! produced by the planner. Everything here is plain data: deterministic to
//! serialize, cheap to clone, shared by every other crate of the workspace.

mod plan;
mod types;

pub use plan::*;
pub use types::*;
