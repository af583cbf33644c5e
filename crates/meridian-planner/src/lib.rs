//! Join-Path Planner
//!
//! Turns a query (root type, requested fields, filters) into an ordered
//! [`ExecutionPlan`](meridian_schema::ExecutionPlan) of per-platform fetches
//! and key-based merges, using only declared keys, capabilities and
//! relationship edges from the registry.

mod config;
mod error;
mod planner;
mod tree;

pub use config::PlannerConfig;
pub use error::PlanningError;
pub use planner::{PlanRequest, Planner};
