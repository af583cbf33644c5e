//! Query tree: every type a request touches, keyed by the reference path
//! that reaches it from the root type.
//!
//! The same type reached through two different paths is two nodes here;
//! the planner shares their fetches later when platform and key agree.

use meridian_registry::{LogicalEdge, Registry};
use meridian_schema::{Filter, PlatformId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::PlanningError;
use crate::planner::PlanRequest;

#[derive(Debug, Clone)]
pub(crate) struct QueryNode {
    pub type_name: String,
    pub parent: Option<usize>,
    /// Edge followed from the parent
    pub edge: Option<LogicalEdge>,
    pub children: Vec<usize>,
    /// Requested field name -> request strings it answers
    pub requested: BTreeMap<String, Vec<String>>,
    pub filters: Vec<Filter>,
}

impl QueryNode {
    fn new(type_name: &str, parent: Option<usize>, edge: Option<LogicalEdge>) -> Self {
        Self {
            type_name: type_name.to_string(),
            parent,
            edge,
            children: Vec::new(),
            requested: BTreeMap::new(),
            filters: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct QueryTree {
    pub nodes: Vec<QueryNode>,
}

impl QueryTree {
    /// Resolve every requested field and filter of `request` from `root`
    pub fn resolve(registry: &Registry, root: &str, request: &PlanRequest) -> Result<Self, PlanningError> {
        let mut tree = QueryTree {
            nodes: vec![QueryNode::new(root, None, None)],
        };

        for requested in &request.fields {
            let (path, field) = if requested.contains('.') {
                resolve_dotted(registry, root, requested)?
            } else {
                resolve_bare(registry, root, requested, &tree.platforms(registry))?
            };
            let node = tree.insert_path(&path);
            debug!(field = %requested, type_name = %tree.nodes[node].type_name, depth = path.len(), "Field resolved");
            tree.nodes[node]
                .requested
                .entry(field)
                .or_default()
                .push(requested.clone());
        }

        for filter in &request.filters {
            let type_name = registry.aliases().canonical(&filter.type_name).to_string();
            if !registry.contains_type(&type_name) {
                return Err(PlanningError::UnknownType(type_name));
            }
            ensure_requestable(registry, &type_name, &filter.field)?;

            let mut targets = tree.nodes_of_type(&type_name);
            if targets.is_empty() {
                let path = registry
                    .reachable(root, &type_name, &tree.platforms(registry))
                    .map_err(|_| PlanningError::UnreachableType {
                        from: root.to_string(),
                        to: type_name.clone(),
                    })?;
                targets.push(tree.insert_path(&path));
            }
            let mut filter = filter.clone();
            filter.type_name = type_name;
            for node in targets {
                tree.nodes[node].filters.push(filter.clone());
            }
        }

        Ok(tree)
    }

    pub fn root(&self) -> &QueryNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: usize) -> &QueryNode {
        &self.nodes[id]
    }

    /// Follow `path` from the root, creating missing nodes
    fn insert_path(&mut self, path: &[LogicalEdge]) -> usize {
        let mut current = 0;
        for edge in path {
            let existing = self.nodes[current].children.iter().copied().find(|child| {
                self.nodes[*child]
                    .edge
                    .as_ref()
                    .map_or(false, |e| e.via_field == edge.via_field)
            });
            current = match existing {
                Some(child) => child,
                None => {
                    let id = self.nodes.len();
                    self.nodes
                        .push(QueryNode::new(&edge.to_type, Some(current), Some(edge.clone())));
                    self.nodes[current].children.push(id);
                    id
                }
            };
        }
        current
    }

    fn nodes_of_type(&self, type_name: &str) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|id| self.nodes[*id].type_name == type_name)
            .collect()
    }

    /// Node and all its descendants, pre-order
    pub fn subtree(&self, id: usize) -> Vec<usize> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            out.extend(self.nodes[out[i]].children.iter().copied());
            i += 1;
        }
        out
    }

    /// Reference fields leading from `ancestor` down to `id`
    pub fn relative_path(&self, ancestor: usize, id: usize) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = id;
        while current != ancestor {
            let node = &self.nodes[current];
            match (&node.edge, node.parent) {
                (Some(edge), Some(parent)) => {
                    path.push(edge.via_field.clone());
                    current = parent;
                }
                _ => break,
            }
        }
        path.reverse();
        path
    }

    /// Fields a fetch of this node must return: requested, filtered and
    /// the reference fields carrying its children's keys
    pub fn needed_fields(&self, id: usize) -> BTreeSet<String> {
        let node = &self.nodes[id];
        let mut fields: BTreeSet<String> = node.requested.keys().cloned().collect();
        fields.extend(node.filters.iter().map(|f| f.field.clone()));
        fields.extend(
            node.children
                .iter()
                .filter_map(|child| self.nodes[*child].edge.as_ref())
                .map(|edge| edge.via_field.clone()),
        );
        fields
    }

    /// Platforms declaring the types touched so far, in order of first touch
    fn platforms(&self, registry: &Registry) -> Vec<PlatformId> {
        let mut platforms: Vec<PlatformId> = Vec::new();
        for node in &self.nodes {
            if let Some(view) = registry.read_type(&node.type_name) {
                for platform in &view.canonical.sources {
                    if !platforms.contains(platform) {
                        platforms.push(platform.clone());
                    }
                }
            }
        }
        platforms
    }
}

fn ensure_requestable(registry: &Registry, type_name: &str, field: &str) -> Result<(), PlanningError> {
    let requestable = registry.read_type(type_name).map_or(false, |view| {
        view.canonical.field(field).map_or(false, |f| !f.is_local)
    });
    if requestable {
        Ok(())
    } else {
        Err(PlanningError::UnknownField {
            type_name: type_name.to_string(),
            field: field.to_string(),
        })
    }
}

/// `via.via.field`: follow the named reference fields explicitly
fn resolve_dotted(
    registry: &Registry,
    root: &str,
    requested: &str,
) -> Result<(Vec<LogicalEdge>, String), PlanningError> {
    let mut segments: Vec<&str> = requested.split('.').collect();
    let field = segments.pop().unwrap_or_default().to_string();

    let mut current = root.to_string();
    let mut visited = vec![root.to_string()];
    let mut path = Vec::new();
    for via in segments {
        let edge = registry
            .logical_edges_from(&current)
            .into_iter()
            .find(|e| e.via_field == via)
            .ok_or_else(|| PlanningError::UnknownField {
                type_name: current.clone(),
                field: via.to_string(),
            })?;
        if !registry.contains_type(&edge.to_type) {
            return Err(PlanningError::UnreachableType {
                from: root.to_string(),
                to: edge.to_type,
            });
        }
        let revisits = visited.contains(&edge.to_type);
        visited.push(edge.to_type.clone());
        if revisits {
            return Err(PlanningError::CyclicDependency { types: visited });
        }
        current = edge.to_type.clone();
        path.push(edge);
    }

    ensure_requestable(registry, &current, &field)?;
    Ok((path, field))
}

/// Bare name: the root type, otherwise the nearest reachable type declaring it
fn resolve_bare(
    registry: &Registry,
    root: &str,
    field: &str,
    preferred: &[PlatformId],
) -> Result<(Vec<LogicalEdge>, String), PlanningError> {
    if ensure_requestable(registry, root, field).is_ok() {
        return Ok((Vec::new(), field.to_string()));
    }
    if let Some(location) = registry.locate_field(root, field, preferred) {
        return Ok((location.path, field.to_string()));
    }

    // Declared somewhere, but not on any type reachable from the root
    let declaring = registry.type_names().into_iter().find(|name| {
        name != root && ensure_requestable(registry, name, field).is_ok()
    });
    Err(match declaring {
        Some(to) => PlanningError::UnreachableType {
            from: root.to_string(),
            to,
        },
        None => PlanningError::UnknownField {
            type_name: root.to_string(),
            field: field.to_string(),
        },
    })
}
