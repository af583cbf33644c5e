use meridian_schema::Capability;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    #[error("Query requests no fields")]
    EmptyRequest,

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Type '{type_name}' has no requestable field '{field}'")]
    UnknownField { type_name: String, field: String },

    #[error("No relationship path from '{from}' to '{to}'")]
    UnreachableType { from: String, to: String },

    /// `type_name` is declared, but no platform serving it offers `capability`
    /// together with the listed fields
    #[error("No platform can {capability} '{type_name}' (fields: {fields:?})")]
    NoCapablePlatform {
        type_name: String,
        capability: Capability,
        fields: Vec<String>,
    },

    #[error("Cyclic dependency between types {types:?}")]
    CyclicDependency { types: Vec<String> },
}
