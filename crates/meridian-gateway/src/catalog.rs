//! Loading platform schema documents into the registry

use meridian_registry::{MergeReport, Registry, SchemaError};
use meridian_schema::SchemaDocument;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Config, PlatformSource};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Unsupported document extension: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Document {path} declares platform '{declared}', configured as '{configured}'")]
    PlatformMismatch {
        path: PathBuf,
        declared: String,
        configured: String,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Read a schema document, choosing the parser by file extension
pub async fn read_document(path: &Path) -> Result<SchemaDocument, LoadError> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_error = |reason: String| LoadError::Parse {
        path: path.to_path_buf(),
        reason,
    };
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&contents).map_err(|e| parse_error(e.to_string())),
        Some("yaml") | Some("yml") => serde_yaml::from_str(&contents).map_err(|e| parse_error(e.to_string())),
        _ => Err(LoadError::UnsupportedFormat(path.to_path_buf())),
    }
}

/// What happened to each configured platform
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub loaded: Vec<MergeReport>,
    pub failed: Vec<(String, LoadError)>,
}

impl LoadSummary {
    pub fn conflicts(&self) -> usize {
        self.loaded.iter().map(|r| r.conflicts.len()).sum()
    }
}

/// Register every configured platform.
///
/// A document that fails to load is logged and skipped. Documents rejected
/// for a dangling reference are retried once the others are in, so the
/// order of `platforms` in the config does not matter.
pub async fn load_platforms(registry: &Registry, config: &Config) -> LoadSummary {
    let mut summary = LoadSummary::default();
    let mut pending: Vec<(&PlatformSource, SchemaDocument)> = Vec::new();

    for source in &config.platforms {
        let path = config.document_path(source);
        match read_document(&path).await {
            Ok(document) if document.platform != source.id => {
                let err = LoadError::PlatformMismatch {
                    path,
                    declared: document.platform,
                    configured: source.id.clone(),
                };
                warn!(platform = %source.id, error = %err, "Skipping platform");
                summary.failed.push((source.id.clone(), err));
            }
            Ok(document) => pending.push((source, document)),
            Err(err) => {
                warn!(platform = %source.id, error = %err, "Skipping platform");
                summary.failed.push((source.id.clone(), err));
            }
        }
    }

    loop {
        let before = pending.len();
        let mut deferred = Vec::new();
        for (source, document) in pending {
            match registry.merge_document(&document) {
                Ok(report) => summary.loaded.push(report),
                Err(err @ SchemaError::DanglingReference { .. }) => deferred.push((source, document, err)),
                Err(err) => {
                    warn!(platform = %source.id, error = %err, "Skipping platform");
                    summary.failed.push((source.id.clone(), err.into()));
                }
            }
        }

        if deferred.is_empty() {
            break;
        }
        if deferred.len() == before {
            for (source, _, err) in deferred {
                warn!(platform = %source.id, error = %err, "Skipping platform");
                summary.failed.push((source.id.clone(), err.into()));
            }
            break;
        }
        pending = deferred.into_iter().map(|(source, document, _)| (source, document)).collect();
    }

    info!(
        loaded = summary.loaded.len(),
        failed = summary.failed.len(),
        conflicts = summary.conflicts(),
        types = registry.type_names().len(),
        "Platforms loaded"
    );
    summary
}
