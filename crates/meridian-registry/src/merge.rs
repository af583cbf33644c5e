//! Schema Merger: the only writer of the registry
//!
//! A document is validated as a whole before any shared state is touched,
//! then applied type by type, each under its own slot lock.

use meridian_schema::{FieldKind, PlatformId, RelationshipEdge, SchemaDocument, TypeDecl};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, warn};

use crate::canonical::{Contribution, SchemaConflict};
use crate::error::SchemaError;
use crate::registry::{PlatformRecord, Registry};

/// Outcome of a successful (possibly degraded) merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub platform: PlatformId,
    pub version: String,
    /// Types declared by this load
    pub types: Vec<String>,
    /// Types the platform declared previously but no longer does
    pub retracted: Vec<String>,
    /// Fields of this platform excluded from the canonical merge
    pub conflicts: Vec<SchemaConflict>,
    /// Relationship edges contributed by this platform
    pub edges: usize,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

impl Registry {
    /// Merge one platform's type declarations.
    ///
    /// Re-merging a platform replaces everything it contributed before, so
    /// merging identical declarations twice leaves the registry unchanged.
    pub fn merge(
        &self,
        platform: &str,
        version: &str,
        decls: &[TypeDecl],
    ) -> Result<MergeReport, SchemaError> {
        let document = SchemaDocument {
            platform: platform.to_string(),
            version: version.to_string(),
            enums: Vec::new(),
            types: decls.to_vec(),
        };
        self.merge_document(&document)
    }

    pub fn merge_document(&self, document: &SchemaDocument) -> Result<MergeReport, SchemaError> {
        let platform = document.platform.as_str();
        let lock = self.registration_lock(platform);
        let _guard = lock.lock();

        let decls: Vec<TypeDecl> = document
            .types
            .iter()
            .map(|decl| self.canonicalize(decl))
            .collect();
        let declared: BTreeSet<String> = decls.iter().map(|d| d.type_name.clone()).collect();

        let previous = self.platform(platform);
        let dropped: Vec<String> = previous
            .as_ref()
            .map(|p| p.types.difference(&declared).cloned().collect())
            .unwrap_or_default();
        let drops_enums = previous
            .as_ref()
            .map_or(false, |p| p.enums.iter().any(|name| !document.enums.iter().any(|e| &e.name == name)));

        // Held until the merge is applied
        let _shared;
        let _exclusive;
        if dropped.is_empty() && !drops_enums {
            _shared = self.removal_gate.read();
        } else {
            _exclusive = self.removal_gate.write();
        }

        self.validate(document, &decls)?;
        self.check_still_referenced(platform, &dropped)?;

        // Enums first: fields of the new declarations may name them
        {
            let mut enums = self.enums.write();
            for decl in &document.enums {
                enums
                    .entry(decl.name.clone())
                    .or_default()
                    .upsert(platform, decl.values.clone());
            }
            if let Some(previous) = &previous {
                let declared: HashSet<&str> = document.enums.iter().map(|e| e.name.as_str()).collect();
                for name in previous.enums.iter().filter(|n| !declared.contains(n.as_str())) {
                    if let Some(slot) = enums.get_mut(name) {
                        slot.retract(platform);
                    }
                }
            }
        }

        let mut conflicts = Vec::new();
        let mut edges = 0;
        for decl in &decls {
            let slot = self.slot_or_create(&decl.type_name);
            let mut slot = slot.write();
            slot.upsert(Contribution {
                platform: platform.to_string(),
                version: document.version.clone(),
                decl: decl.clone(),
            });
            let state = slot.state();
            conflicts.extend(
                state
                    .canonical
                    .conflicts
                    .iter()
                    .filter(|c| c.platform == platform)
                    .cloned(),
            );
            edges += state
                .edges
                .iter()
                .filter(|e| e.source_platform == platform)
                .count();
        }

        let mut retracted = Vec::new();
        for name in dropped {
            if let Some(slot) = self.slot(&name) {
                if slot.write().retract(platform) {
                    retracted.push(name);
                }
            }
        }

        self.platforms.write().insert(
            platform.to_string(),
            PlatformRecord {
                platform: platform.to_string(),
                version: document.version.clone(),
                registered_at: chrono::Utc::now(),
                types: declared.clone(),
                enums: document.enums.iter().map(|e| e.name.clone()).collect(),
            },
        );

        for conflict in &conflicts {
            warn!(
                platform = %platform,
                type_name = %conflict.type_name,
                field = %conflict.field,
                offered = %conflict.offered,
                existing = %conflict.existing,
                "Schema conflict: field excluded from canonical merge"
            );
        }
        info!(
            platform = %platform,
            version = %document.version,
            types = declared.len(),
            edges,
            conflicts = conflicts.len(),
            refresh = previous.is_some(),
            "Platform schema merged"
        );

        Ok(MergeReport {
            platform: platform.to_string(),
            version: document.version.clone(),
            types: declared.into_iter().collect(),
            retracted,
            conflicts,
            edges,
        })
    }

    /// Retract every contribution of `platform`.
    ///
    /// Returns the types whose capability entries changed, so dependent
    /// caches can be invalidated.
    pub fn deregister(&self, platform: &str) -> Result<Vec<String>, SchemaError> {
        let lock = self.registration_lock(platform);
        let _guard = lock.lock();
        let _exclusive = self.removal_gate.write();

        let record = self
            .platforms
            .write()
            .remove(platform)
            .ok_or_else(|| SchemaError::UnknownPlatform(platform.to_string()))?;

        let mut changed = Vec::new();
        for name in &record.types {
            if let Some(slot) = self.slot(name) {
                if slot.write().retract(platform) {
                    changed.push(name.clone());
                }
            }
        }
        {
            let mut enums = self.enums.write();
            for name in &record.enums {
                if let Some(slot) = enums.get_mut(name) {
                    slot.retract(platform);
                }
            }
        }

        self.warn_dangling();
        info!(platform = %platform, types = changed.len(), "Platform deregistered");
        Ok(changed)
    }

    /// Edges whose target type is no longer declared by any platform
    pub fn dangling_edges(&self) -> Vec<RelationshipEdge> {
        self.type_names()
            .iter()
            .filter_map(|name| self.read_type(name))
            .flat_map(|view| view.edges.clone())
            .filter(|edge| !self.contains_type(&edge.to_type))
            .collect()
    }

    fn warn_dangling(&self) {
        for edge in self.dangling_edges() {
            warn!(
                platform = %edge.source_platform,
                type_name = %edge.from_type,
                field = %edge.via_field,
                target = %edge.to_type,
                "Relationship edge now points to an undeclared type"
            );
        }
    }

    /// Apply the alias table to the declared name and every reference target
    fn canonicalize(&self, decl: &TypeDecl) -> TypeDecl {
        let aliases = self.aliases();
        if aliases.is_empty() {
            return decl.clone();
        }
        let mut decl = decl.clone();
        decl.type_name = aliases.canonical(&decl.type_name).to_string();
        for field in &mut decl.fields {
            if let Some(target) = field.kind.target() {
                let canonical = aliases.canonical(target).to_string();
                if canonical != target {
                    debug!(field = %field.name, alias = %target, canonical = %canonical, "Alias applied");
                    field.kind = field.kind.with_target(canonical);
                }
            }
        }
        decl
    }

    fn validate(&self, document: &SchemaDocument, decls: &[TypeDecl]) -> Result<(), SchemaError> {
        let platform = document.platform.as_str();
        let mut seen_types = HashSet::new();
        for decl in decls {
            if decl.type_name.is_empty() {
                return Err(SchemaError::malformed(platform, "", "empty type name"));
            }
            if !seen_types.insert(decl.type_name.as_str()) {
                return Err(SchemaError::malformed(
                    platform,
                    &decl.type_name,
                    "type declared twice in one document",
                ));
            }
        }

        let mut enum_names: BTreeMap<&str, usize> = BTreeMap::new();
        for decl in &document.enums {
            *enum_names.entry(decl.name.as_str()).or_default() += 1;
        }
        if let Some((name, _)) = enum_names.iter().find(|(_, count)| **count > 1) {
            return Err(SchemaError::malformed(platform, name, "enum declared twice in one document"));
        }

        for decl in decls {
            let mut seen_fields = HashSet::new();
            for field in &decl.fields {
                if !seen_fields.insert(field.name.as_str()) {
                    return Err(SchemaError::malformed(
                        platform,
                        &decl.type_name,
                        format!("field '{}' declared twice", field.name),
                    ));
                }
            }

            for key_field in &decl.primary_key {
                if decl.find_field(key_field).is_none() {
                    return Err(SchemaError::malformed(
                        platform,
                        &decl.type_name,
                        format!("primary key field '{}' is not a declared field", key_field),
                    ));
                }
            }

            for field in &decl.fields {
                match &field.kind {
                    FieldKind::Scalar(ty) => {
                        if let Some(name) = ty.enum_name() {
                            let known = enum_names.contains_key(name)
                                || self
                                    .resolve_enum(name)
                                    .map_or(false, |e| e.sources.iter().any(|p| p != platform));
                            if !known {
                                return Err(SchemaError::malformed(
                                    platform,
                                    &decl.type_name,
                                    format!("field '{}' uses undeclared enum '{}'", field.name, name),
                                ));
                            }
                        }
                    }
                    FieldKind::Reference(target) | FieldKind::ReferenceList(target) => {
                        let known = seen_types.contains(target.as_str())
                            || self.declared_by_others(target, platform);
                        if !known {
                            return Err(SchemaError::DanglingReference {
                                platform: platform.to_string(),
                                type_name: decl.type_name.clone(),
                                field: field.name.clone(),
                                target: target.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// A type a refresh stops declaring must not be the last declaration of
    /// a type another platform's edges still point at
    fn check_still_referenced(&self, platform: &str, dropped: &[String]) -> Result<(), SchemaError> {
        for name in dropped {
            if self.declared_by_others(name, platform) {
                continue;
            }
            let referrer = self
                .type_names()
                .iter()
                .filter_map(|type_name| self.read_type(type_name))
                .flat_map(|view| view.edges.clone())
                .find(|edge| &edge.to_type == name && edge.source_platform != platform);
            if let Some(edge) = referrer {
                return Err(SchemaError::DanglingReference {
                    platform: edge.source_platform,
                    type_name: edge.from_type,
                    field: edge.via_field,
                    target: edge.to_type,
                });
            }
        }
        Ok(())
    }

    fn declared_by_others(&self, type_name: &str, platform: &str) -> bool {
        self.read_type(type_name)
            .map_or(false, |view| view.canonical.sources.iter().any(|p| p != platform))
    }
}
