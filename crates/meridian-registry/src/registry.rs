//! Type Registry and Capability Matrix storage
//!
//! State is partitioned by type name. Each type lives in its own slot behind
//! its own lock, so registrations touching different types never contend.
//! The slot index is write-locked only to create a slot; slots are never
//! removed, a slot without contributions reads as an absent type.

use chrono::{DateTime, Utc};
use meridian_schema::{Capability, CapabilitySet, PlatformId};
use parking_lot::{Mutex, RawRwLock, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Deref;
use std::sync::Arc;

use crate::alias::AliasTable;
use crate::canonical::{CanonicalType, TypeSlot, TypeState};

/// Enumeration merged across platforms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEnum {
    pub name: String,
    /// Union of values, in first-declared order
    pub values: Vec<String>,
    pub sources: BTreeSet<PlatformId>,
}

#[derive(Debug, Default)]
pub(crate) struct EnumSlot {
    contributions: Vec<(PlatformId, Vec<String>)>,
}

impl EnumSlot {
    pub fn upsert(&mut self, platform: &str, values: Vec<String>) {
        match self.contributions.iter_mut().find(|(p, _)| p == platform) {
            Some(existing) => existing.1 = values,
            None => self.contributions.push((platform.to_string(), values)),
        }
    }

    pub fn retract(&mut self, platform: &str) {
        self.contributions.retain(|(p, _)| p != platform);
    }

    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }

    fn canonical(&self, name: &str) -> CanonicalEnum {
        let mut values: Vec<String> = Vec::new();
        let mut sources = BTreeSet::new();
        for (platform, declared) in &self.contributions {
            sources.insert(platform.clone());
            for value in declared {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        CanonicalEnum {
            name: name.to_string(),
            values,
            sources,
        }
    }
}

/// Ledger entry for a registered platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformRecord {
    pub platform: PlatformId,
    pub version: String,
    pub registered_at: DateTime<Utc>,
    pub types: BTreeSet<String>,
    pub enums: BTreeSet<String>,
}

/// Comparable copy of every type, capability entry, edge and enum
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub types: BTreeMap<String, TypeState>,
    pub enums: BTreeMap<String, CanonicalEnum>,
}

/// Read access to one type, holding its lock until dropped
pub struct TypeView {
    guard: lock_api::ArcRwLockReadGuard<RawRwLock, TypeSlot>,
}

impl Deref for TypeView {
    type Target = TypeState;

    fn deref(&self) -> &TypeState {
        self.guard.state()
    }
}

impl std::fmt::Debug for TypeView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TypeView").field(self.guard.state()).finish()
    }
}

/// Shared store of canonical types, capability entries and relationship edges.
///
/// One instance per tenant/gateway; created on startup, mutated only through
/// [`Registry::merge`] and [`Registry::deregister`].
#[derive(Default)]
pub struct Registry {
    slots: RwLock<HashMap<String, Arc<RwLock<TypeSlot>>>>,
    pub(crate) enums: RwLock<BTreeMap<String, EnumSlot>>,
    pub(crate) platforms: RwLock<BTreeMap<PlatformId, PlatformRecord>>,
    registrations: Mutex<HashMap<PlatformId, Arc<Mutex<()>>>>,
    /// Shared by merges that only add; exclusive for anything that removes
    /// types or enums, so reference targets cannot vanish mid-merge
    pub(crate) removal_gate: RwLock<()>,
    aliases: AliasTable,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aliases(aliases: AliasTable) -> Self {
        Self {
            aliases,
            ..Self::default()
        }
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub(crate) fn slot(&self, type_name: &str) -> Option<Arc<RwLock<TypeSlot>>> {
        let name = self.aliases.canonical(type_name);
        self.slots.read().get(name).cloned()
    }

    pub(crate) fn slot_or_create(&self, type_name: &str) -> Arc<RwLock<TypeSlot>> {
        if let Some(slot) = self.slots.read().get(type_name) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(type_name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(TypeSlot::new(type_name))))
            .clone()
    }

    /// Serializes concurrent registrations of the same platform
    pub(crate) fn registration_lock(&self, platform: &str) -> Arc<Mutex<()>> {
        self.registrations
            .lock()
            .entry(platform.to_string())
            .or_default()
            .clone()
    }

    /// Lock a type for reading; the lock is held while the view lives.
    ///
    /// Uses recursive read locks so readers never queue behind a waiting
    /// merge of the same type.
    pub fn read_type(&self, type_name: &str) -> Option<TypeView> {
        let slot = self.slot(type_name)?;
        let guard = slot.read_arc_recursive();
        if guard.is_empty() {
            return None;
        }
        Some(TypeView { guard })
    }

    pub fn contains_type(&self, type_name: &str) -> bool {
        self.slot(type_name)
            .map_or(false, |slot| !slot.read_recursive().is_empty())
    }

    pub fn resolve(&self, type_name: &str) -> Option<CanonicalType> {
        self.read_type(type_name).map(|view| view.canonical.clone())
    }

    pub fn type_state(&self, type_name: &str) -> Option<TypeState> {
        self.read_type(type_name).map(|view| (*view).clone())
    }

    pub fn capabilities_of(&self, type_name: &str, platform: &str) -> Option<CapabilitySet> {
        self.read_type(type_name)
            .and_then(|view| view.capabilities.get(platform).cloned())
    }

    pub fn platforms_supporting(&self, type_name: &str, capability: Capability) -> BTreeSet<PlatformId> {
        self.read_type(type_name)
            .map(|view| {
                view.capabilities
                    .iter()
                    .filter(|(_, caps)| caps.contains(capability))
                    .map(|(platform, _)| platform.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of every type currently declared by at least one platform
    pub fn type_names(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<RwLock<TypeSlot>>)> = self
            .slots
            .read()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();
        let mut names: Vec<String> = slots
            .into_iter()
            .filter(|(_, slot)| !slot.read_recursive().is_empty())
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }

    pub fn resolve_enum(&self, name: &str) -> Option<CanonicalEnum> {
        self.enums
            .read()
            .get(name)
            .filter(|slot| !slot.is_empty())
            .map(|slot| slot.canonical(name))
    }

    pub fn platform(&self, platform: &str) -> Option<PlatformRecord> {
        self.platforms.read().get(platform).cloned()
    }

    pub fn platforms(&self) -> Vec<PlatformRecord> {
        self.platforms.read().values().cloned().collect()
    }

    /// Schema version each platform declared for `type_name`
    pub fn versions_of(&self, type_name: &str) -> BTreeMap<PlatformId, String> {
        self.slot(type_name)
            .map(|slot| {
                slot.read_recursive()
                    .versions()
                    .map(|(p, v)| (p.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let types = self
            .type_names()
            .into_iter()
            .filter_map(|name| self.type_state(&name).map(|state| (name, state)))
            .collect();
        let enums = self
            .enums
            .read()
            .iter()
            .filter(|(_, slot)| !slot.is_empty())
            .map(|(name, slot)| (name.clone(), slot.canonical(name)))
            .collect();
        RegistrySnapshot { types, enums }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("types", &self.type_names())
            .field("platforms", &self.platforms.read().keys().collect::<Vec<_>>())
            .field("aliases", &self.aliases)
            .finish()
    }
}
