use meridian_schema::PlatformId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// Fatal for the offending platform's load only; the registry is left untouched
    #[error("Malformed schema from platform {platform}: type '{type_name}': {reason}")]
    MalformedSchema {
        platform: PlatformId,
        type_name: String,
        reason: String,
    },

    #[error("Dangling reference from platform {platform}: {type_name}.{field} -> unknown type '{target}'")]
    DanglingReference {
        platform: PlatformId,
        type_name: String,
        field: String,
        target: String,
    },

    #[error("Platform not registered: {0}")]
    UnknownPlatform(PlatformId),
}

impl SchemaError {
    pub(crate) fn malformed(
        platform: &str,
        type_name: &str,
        reason: impl Into<String>,
    ) -> Self {
        SchemaError::MalformedSchema {
            platform: platform.to_string(),
            type_name: type_name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn platform(&self) -> &str {
        match self {
            SchemaError::MalformedSchema { platform, .. }
            | SchemaError::DanglingReference { platform, .. }
            | SchemaError::UnknownPlatform(platform) => platform,
        }
    }
}
