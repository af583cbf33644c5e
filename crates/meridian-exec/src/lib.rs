//! Execution of planned fetches against platform clients
//!
//! [`Executor::execute`] walks an [`ExecutionPlan`](meridian_schema::ExecutionPlan)
//! in dependency order, calls each step's [`PlatformClient`] under a shared
//! in-flight bound and per-fetch timeout, then merges the returned records
//! by key into nested root records.

mod cancel;
mod client;
mod error;
mod executor;
mod merge;

pub use cancel::CancelToken;
pub use client::{FetchError, FetchRequest, PlatformClient, Record};
pub use error::{DegradedBranch, ExecError};
pub use executor::{ExecutionConfig, ExecutionResult, Executor};
