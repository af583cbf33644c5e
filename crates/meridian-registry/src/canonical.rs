//! Canonical types and their reconstruction from per-platform contributions

use meridian_schema::{
    CapabilitySet, FieldDecl, FieldKind, Mutability, PlatformId, RelationshipEdge, TypeDecl,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A field merged across every platform declaring it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalField {
    pub name: String,
    pub kind: FieldKind,
    pub mutability: Mutability,
    pub is_local: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Platforms that supply this field
    pub sources: BTreeSet<PlatformId>,
}

impl CanonicalField {
    fn from_decl(decl: &FieldDecl, platform: &str) -> Self {
        Self {
            name: decl.name.clone(),
            kind: decl.kind.clone(),
            mutability: decl.mutability,
            is_local: decl.is_local,
            description: decl.description.clone(),
            sources: BTreeSet::from([platform.to_string()]),
        }
    }

    fn absorb(&mut self, decl: &FieldDecl, platform: &str) {
        if decl.mutability == Mutability::Mutable {
            self.mutability = Mutability::Mutable;
        }
        self.is_local &= decl.is_local;
        if self.description.is_none() {
            self.description = decl.description.clone();
        }
        self.sources.insert(platform.to_string());
    }

    pub fn is_supplied_by(&self, platform: &str) -> bool {
        self.sources.contains(platform)
    }
}

/// Two declarations of one field disagree on its kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConflict {
    pub type_name: String,
    pub field: String,
    /// Platform whose declaration was excluded
    pub platform: PlatformId,
    pub offered: FieldKind,
    pub existing: FieldKind,
    /// Platform whose declaration fixed the canonical kind
    pub established_by: PlatformId,
}

impl fmt::Display for SchemaConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}: platform {} declares {} but {} declares {}",
            self.type_name,
            self.field,
            self.platform,
            self.offered,
            self.established_by,
            self.existing
        )
    }
}

/// Registry entry for one entity kind, independent of platforms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalType {
    pub type_name: String,
    pub fields: BTreeMap<String, CanonicalField>,
    pub primary_key_candidates: BTreeSet<Vec<String>>,
    pub sources: BTreeSet<PlatformId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<SchemaConflict>,
}

impl CanonicalType {
    fn empty(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            fields: BTreeMap::new(),
            primary_key_candidates: BTreeSet::new(),
            sources: BTreeSet::new(),
            conflicts: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&CanonicalField> {
        self.fields.get(name)
    }

    /// Fields a query may ask for
    pub fn requestable_fields(&self) -> impl Iterator<Item = &CanonicalField> {
        self.fields.values().filter(|f| !f.is_local)
    }

    /// Key candidates whose fields `platform` supplies
    pub fn keys_supplied_by<'a>(&'a self, platform: &'a str) -> impl Iterator<Item = &'a Vec<String>> {
        self.primary_key_candidates.iter().filter(move |key| {
            key.iter()
                .all(|f| self.fields.get(f).map_or(false, |cf| cf.is_supplied_by(platform)))
        })
    }
}

/// Merged view of one type: canonical description, capability entries and outgoing edges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeState {
    pub canonical: CanonicalType,
    /// Capability Matrix rows for this type, keyed by platform
    pub capabilities: BTreeMap<PlatformId, CapabilitySet>,
    /// Key tuple each platform declared
    pub declared_keys: BTreeMap<PlatformId, Vec<String>>,
    pub edges: Vec<RelationshipEdge>,
}

impl TypeState {
    pub fn type_name(&self) -> &str {
        &self.canonical.type_name
    }

    /// Union across platforms
    pub fn reachable_capabilities(&self) -> CapabilitySet {
        self.capabilities
            .values()
            .fold(CapabilitySet::new(), |acc, caps| acc.union(caps))
    }

    /// Intersection across platforms
    pub fn guaranteed_capabilities(&self) -> CapabilitySet {
        let mut iter = self.capabilities.values();
        match iter.next() {
            Some(first) => iter.fold(first.clone(), |acc, caps| acc.intersection(caps)),
            None => CapabilitySet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Contribution {
    pub platform: PlatformId,
    pub version: String,
    pub decl: TypeDecl,
}

/// Per-type-name storage; every mutation of a type goes through its slot lock
#[derive(Debug)]
pub(crate) struct TypeSlot {
    contributions: Vec<Contribution>,
    state: TypeState,
}

impl TypeSlot {
    pub fn new(type_name: &str) -> Self {
        Self {
            contributions: Vec::new(),
            state: TypeState {
                canonical: CanonicalType::empty(type_name),
                capabilities: BTreeMap::new(),
                declared_keys: BTreeMap::new(),
                edges: Vec::new(),
            },
        }
    }

    pub fn state(&self) -> &TypeState {
        &self.state
    }

    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }

    /// Replace the platform's contribution in place, or append a new one
    pub fn upsert(&mut self, contribution: Contribution) {
        match self
            .contributions
            .iter_mut()
            .find(|c| c.platform == contribution.platform)
        {
            Some(existing) => *existing = contribution,
            None => self.contributions.push(contribution),
        }
        self.rebuild();
    }

    /// Returns false when the platform had nothing here
    pub fn retract(&mut self, platform: &str) -> bool {
        let before = self.contributions.len();
        self.contributions.retain(|c| c.platform != platform);
        let removed = self.contributions.len() != before;
        if removed {
            self.rebuild();
        }
        removed
    }

    pub fn versions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.contributions
            .iter()
            .map(|c| (c.platform.as_str(), c.version.as_str()))
    }

    fn rebuild(&mut self) {
        let type_name = self.state.canonical.type_name.clone();
        let mut canonical = CanonicalType::empty(&type_name);
        let mut capabilities = BTreeMap::new();
        let mut declared_keys = BTreeMap::new();
        let mut edges = Vec::new();
        // field name -> platform that fixed its kind
        let mut established: BTreeMap<String, PlatformId> = BTreeMap::new();

        for contribution in &self.contributions {
            let platform = &contribution.platform;
            canonical.sources.insert(platform.clone());
            capabilities.insert(platform.clone(), contribution.decl.capabilities.clone());
            if !contribution.decl.primary_key.is_empty() {
                canonical
                    .primary_key_candidates
                    .insert(contribution.decl.primary_key.clone());
                declared_keys.insert(platform.clone(), contribution.decl.primary_key.clone());
            }

            for decl in &contribution.decl.fields {
                match canonical.fields.get_mut(&decl.name) {
                    None => {
                        canonical
                            .fields
                            .insert(decl.name.clone(), CanonicalField::from_decl(decl, platform));
                        established.insert(decl.name.clone(), platform.clone());
                    }
                    Some(existing) if existing.kind == decl.kind => {
                        existing.absorb(decl, platform);
                    }
                    Some(existing) => {
                        canonical.conflicts.push(SchemaConflict {
                            type_name: type_name.clone(),
                            field: decl.name.clone(),
                            platform: platform.clone(),
                            offered: decl.kind.clone(),
                            existing: existing.kind.clone(),
                            established_by: established
                                .get(&decl.name)
                                .cloned()
                                .unwrap_or_default(),
                        });
                        continue;
                    }
                }

                if let (Some(target), Some(cardinality)) = (decl.kind.target(), decl.kind.cardinality()) {
                    edges.push(RelationshipEdge {
                        from_type: type_name.clone(),
                        to_type: target.to_string(),
                        via_field: decl.name.clone(),
                        cardinality,
                        source_platform: platform.clone(),
                    });
                }
            }
        }

        edges.sort();
        self.state = TypeState {
            canonical,
            capabilities,
            declared_keys,
            edges,
        };
    }
}
