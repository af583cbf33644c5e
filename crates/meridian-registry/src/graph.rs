//! Relationship Graph queries
//!
//! Edges are stored with their owning type (type name -> outgoing edges), so
//! cycles such as authority -> slice -> user -> authority are plain data.
//! Searches are breadth-first and never revisit a type.

use meridian_schema::{Cardinality, PlatformId, RelationshipEdge};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use thiserror::Error;

use crate::registry::Registry;

/// Edges with the same (from, to, via_field) merged across platforms
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalEdge {
    pub from_type: String,
    pub to_type: String,
    pub via_field: String,
    pub cardinality: Cardinality,
    pub platforms: BTreeSet<PlatformId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("No relationship path from '{from}' to '{to}'")]
    NotFound { from: String, to: String },
}

/// Result of a nearest-declaring-type search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLocation {
    pub type_name: String,
    pub path: Vec<LogicalEdge>,
}

impl Registry {
    /// Outgoing edges with their provenance
    pub fn edges_from(&self, type_name: &str) -> Vec<RelationshipEdge> {
        self.read_type(type_name)
            .map(|view| view.edges.clone())
            .unwrap_or_default()
    }

    pub fn logical_edges_from(&self, type_name: &str) -> Vec<LogicalEdge> {
        let mut merged: BTreeMap<(String, String), LogicalEdge> = BTreeMap::new();
        for edge in self.edges_from(type_name) {
            merged
                .entry((edge.via_field.clone(), edge.to_type.clone()))
                .or_insert_with(|| LogicalEdge {
                    from_type: edge.from_type.clone(),
                    to_type: edge.to_type.clone(),
                    via_field: edge.via_field.clone(),
                    cardinality: edge.cardinality,
                    platforms: BTreeSet::new(),
                })
                .platforms
                .insert(edge.source_platform);
        }
        merged.into_values().collect()
    }

    /// Shortest edge path from `from` to `to`.
    ///
    /// Among equally short paths, prefers edges whose platforms come earliest
    /// in `preferred` (the platforms the current query already touches).
    pub fn reachable(
        &self,
        from: &str,
        to: &str,
        preferred: &[PlatformId],
    ) -> Result<Vec<LogicalEdge>, GraphError> {
        let from = self.aliases().canonical(from).to_string();
        let to = self.aliases().canonical(to).to_string();
        let not_found = || GraphError::NotFound {
            from: from.clone(),
            to: to.clone(),
        };
        if !self.contains_type(&from) || !self.contains_type(&to) {
            return Err(not_found());
        }
        if from == to {
            return Ok(Vec::new());
        }
        self.search(&from, preferred, |name| name == to)
            .into_iter()
            .next()
            .map(|(_, path)| path)
            .ok_or_else(not_found)
    }

    /// Nearest type other than `from` that declares a requestable `field`
    pub fn locate_field(
        &self,
        from: &str,
        field: &str,
        preferred: &[PlatformId],
    ) -> Option<FieldLocation> {
        let from = self.aliases().canonical(from).to_string();
        let declares = |name: &str| {
            self.read_type(name).map_or(false, |view| {
                view.canonical
                    .field(field)
                    .map_or(false, |f| !f.is_local)
            })
        };
        self.search(&from, preferred, |name| name != from && declares(name))
            .into_iter()
            .next()
            .map(|(type_name, path)| FieldLocation { type_name, path })
    }

    /// Layered BFS; returns every goal type of the shallowest matching
    /// layer with its best path, best first.
    fn search<F>(&self, from: &str, preferred: &[PlatformId], is_goal: F) -> Vec<(String, Vec<LogicalEdge>)>
    where
        F: Fn(&str) -> bool,
    {
        let mut visited: HashSet<String> = HashSet::from([from.to_string()]);
        let mut frontier: VecDeque<(String, Vec<LogicalEdge>)> = VecDeque::from([(from.to_string(), Vec::new())]);

        while !frontier.is_empty() {
            // Best path to each type first reached in this layer
            let mut layer: BTreeMap<String, Vec<LogicalEdge>> = BTreeMap::new();
            for (type_name, path) in frontier.drain(..) {
                for edge in self.logical_edges_from(&type_name) {
                    if visited.contains(&edge.to_type) || !self.contains_type(&edge.to_type) {
                        continue;
                    }
                    let mut candidate = path.clone();
                    candidate.push(edge.clone());
                    match layer.get(&edge.to_type) {
                        Some(best) if path_rank(best, preferred) <= path_rank(&candidate, preferred) => {}
                        _ => {
                            layer.insert(edge.to_type.clone(), candidate);
                        }
                    }
                }
            }

            let mut goals: Vec<(String, Vec<LogicalEdge>)> = layer
                .iter()
                .filter(|(name, _)| is_goal(name))
                .map(|(name, path)| (name.clone(), path.clone()))
                .collect();
            if !goals.is_empty() {
                goals.sort_by(|a, b| {
                    path_rank(&a.1, preferred)
                        .cmp(&path_rank(&b.1, preferred))
                        .then_with(|| a.0.cmp(&b.0))
                });
                return goals;
            }

            for (name, path) in layer {
                visited.insert(name.clone());
                frontier.push_back((name, path));
            }
        }
        Vec::new()
    }
}

/// Per-edge position of the earliest preferred platform serving it
fn path_rank(path: &[LogicalEdge], preferred: &[PlatformId]) -> Vec<usize> {
    path.iter()
        .map(|edge| {
            preferred
                .iter()
                .position(|p| edge.platforms.contains(p))
                .unwrap_or(preferred.len())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_schema::{FieldDecl, ScalarType, TypeDecl};

    fn registry() -> Registry {
        let registry = Registry::new();
        registry
            .merge(
                "ple",
                "1",
                &[
                    TypeDecl::new("authority")
                        .field(FieldDecl::scalar("authority_hrn", ScalarType::String))
                        .field(FieldDecl::reference_list("slices", "slice"))
                        .key(["authority_hrn"]),
                    TypeDecl::new("slice")
                        .field(FieldDecl::scalar("slice_hrn", ScalarType::String))
                        .field(FieldDecl::reference_list("users", "user"))
                        .key(["slice_hrn"]),
                    TypeDecl::new("user")
                        .field(FieldDecl::scalar("user_hrn", ScalarType::String))
                        .field(FieldDecl::scalar("email", ScalarType::String))
                        .field(FieldDecl::reference("parent_authority", "authority"))
                        .key(["user_hrn"]),
                ],
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_reachable_through_cycle_terminates() {
        let registry = registry();

        let path = registry.reachable("authority", "user", &[]).unwrap();
        let vias: Vec<&str> = path.iter().map(|e| e.via_field.as_str()).collect();
        assert_eq!(vias, vec!["slices", "users"]);

        let path = registry.reachable("user", "slice", &[]).unwrap();
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn test_reachable_unknown_type() {
        let registry = registry();
        assert_eq!(
            registry.reachable("slice", "node", &[]),
            Err(GraphError::NotFound {
                from: "slice".to_string(),
                to: "node".to_string()
            })
        );
    }

    #[test]
    fn test_tie_break_prefers_query_platforms() {
        let registry = Registry::new();
        registry
            .merge(
                "p1",
                "1",
                &[
                    TypeDecl::new("target").field(FieldDecl::scalar("id", ScalarType::Int)),
                    TypeDecl::new("root")
                        .field(FieldDecl::reference("a", "target")),
                ],
            )
            .unwrap();
        registry
            .merge(
                "p2",
                "1",
                &[TypeDecl::new("root").field(FieldDecl::reference("b", "target"))],
            )
            .unwrap();

        let path = registry.reachable("root", "target", &["p2".to_string()]).unwrap();
        assert_eq!(path[0].via_field, "b");

        let path = registry.reachable("root", "target", &["p1".to_string()]).unwrap();
        assert_eq!(path[0].via_field, "a");
    }

    #[test]
    fn test_locate_field_nearest() {
        let registry = registry();
        let location = registry.locate_field("slice", "email", &[]).unwrap();
        assert_eq!(location.type_name, "user");
        assert_eq!(location.path.len(), 1);

        assert!(registry.locate_field("slice", "nothing", &[]).is_none());
    }

    #[test]
    fn test_logical_edges_merge_provenance() {
        let registry = registry();
        registry
            .merge(
                "myslice",
                "1",
                &[TypeDecl::new("slice").field(FieldDecl::reference_list("users", "user"))],
            )
            .unwrap();

        assert_eq!(registry.edges_from("slice").len(), 2);
        let logical = registry.logical_edges_from("slice");
        assert_eq!(logical.len(), 1);
        assert_eq!(
            logical[0].platforms,
            BTreeSet::from(["myslice".to_string(), "ple".to_string()])
        );
    }
}
