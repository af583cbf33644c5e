use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Planner settings, usually read from the `planner` section of meridian.yaml
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Answer a whole sub-tree with one call when a platform can
    pub collapse_full_query: bool,
    /// Key tuple to join each type on, when platforms disagree
    pub key_preferences: BTreeMap<String, Vec<String>>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            collapse_full_query: true,
            key_preferences: BTreeMap::new(),
        }
    }
}

impl PlannerConfig {
    pub fn with_key_preference<I, S>(mut self, type_name: impl Into<String>, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_preferences
            .insert(type_name.into(), key.into_iter().map(Into::into).collect());
        self
    }

    pub fn without_full_query(mut self) -> Self {
        self.collapse_full_query = false;
        self
    }
}
