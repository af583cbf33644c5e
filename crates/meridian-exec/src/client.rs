//! Seam to the transport layer (XML-RPC, SQL, ...)

use async_trait::async_trait;
use meridian_schema::{Filter, Operation, PlatformId};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// One result row; references may hold key values or nested records
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchRequest {
    pub step: usize,
    pub platform: PlatformId,
    pub type_name: String,
    pub operation: Operation,
    pub key: Vec<String>,
    /// Key values to fetch; `None` for a root fetch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<Value>>,
    pub fields: BTreeSet<String>,
    /// Filters the platform must apply itself
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    /// Return only `fields`
    pub projection: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Fetch failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<Vec<Record>, FetchError>;
}
