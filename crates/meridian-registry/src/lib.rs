//! Type Registry, Capability Matrix, Relationship Graph and Schema Merger
//!
//! Platforms register the types they expose through [`Registry::merge`];
//! the registry reconciles declarations of the same type name into one
//! [`CanonicalType`], records per-platform capabilities and derives
//! relationship edges from reference fields. The planner reads it.

mod alias;
mod canonical;
mod error;
mod graph;
mod merge;
mod registry;

pub use alias::AliasTable;
pub use canonical::{CanonicalField, CanonicalType, SchemaConflict, TypeState};
pub use error::SchemaError;
pub use graph::{FieldLocation, GraphError, LogicalEdge};
pub use merge::MergeReport;
pub use registry::{CanonicalEnum, PlatformRecord, Registry, RegistrySnapshot, TypeView};
