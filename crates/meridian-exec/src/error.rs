use meridian_schema::PlatformId;
use serde::Serialize;
use thiserror::Error;

use crate::client::Record;

/// A failed step contributing optional fields only
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DegradedBranch {
    pub step: usize,
    pub platform: PlatformId,
    pub type_name: String,
    pub reason: String,
    pub missing_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    /// A step supplying keys to downstream joins failed; those joins never ran
    #[error("Step {step} ({platform}/{type_name}) failed: {reason}; missing fields: {missing_fields:?}")]
    PartialFetchFailure {
        step: usize,
        platform: PlatformId,
        type_name: String,
        reason: String,
        missing_fields: Vec<String>,
        /// Whatever could be assembled without the failed branch
        partial: Vec<Record>,
    },

    #[error("Plan cancelled")]
    PlanCancelled,

    #[error("No client registered for platform {0}")]
    MissingClient(PlatformId),
}
