//! Explicit type-name aliases supplied by platform registration config

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maps a platform-specific type name onto the canonical one.
///
/// Aliases are never inferred: "node" and "resource" only collapse into
/// one canonical type if the configuration says so.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasTable {
    aliases: BTreeMap<String, String>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.aliases.insert(alias.into(), canonical.into());
    }

    pub fn with(mut self, alias: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.insert(alias, canonical);
        self
    }

    /// Canonical name for `name`; names without an alias map to themselves
    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }
}

impl FromIterator<(String, String)> for AliasTable {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            aliases: iter.into_iter().collect(),
        }
    }
}
