//! Join-Path Planner
//!
//! Compiles a request into an [`ExecutionPlan`] in three passes:
//! 1. resolve requested fields and filters into a query tree
//! 2. choose platforms per tree node, top-down, emitting steps
//! 3. order the steps topologically
//!
//! Every type the tree touches stays read-locked until the plan is built.

use meridian_registry::{Registry, TypeState, TypeView};
use meridian_schema::{
    Capability, ExecutionPlan, Filter, KeyBinding, Operation, PlanStep, PlatformId, Pushdown,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::config::PlannerConfig;
use crate::error::PlanningError;
use crate::tree::QueryTree;

/// A query: target type, requested fields and selection predicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub root_type: String,
    /// Bare field names or dotted reference paths (`users.user_email`)
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
}

impl PlanRequest {
    pub fn new<I, S>(root_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            root_type: root_type.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// Read-only against the registry; any number of plans may run concurrently
#[derive(Debug, Clone)]
pub struct Planner {
    registry: Arc<Registry>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(registry: Arc<Registry>, config: PlannerConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn plan(&self, request: &PlanRequest) -> Result<ExecutionPlan, PlanningError> {
        if request.fields.is_empty() {
            return Err(PlanningError::EmptyRequest);
        }
        let root = self.registry.aliases().canonical(&request.root_type).to_string();
        if !self.registry.contains_type(&root) {
            return Err(PlanningError::UnknownType(root));
        }

        let (tree, locked) = self.resolve_locked(&root, request)?;
        let mut builder = PlanBuilder {
            config: &self.config,
            tree: &tree,
            locked: &locked,
            steps: Vec::new(),
            used: Vec::new(),
        };
        builder.place(0, KeyBinding::Root)?;
        let steps = order_steps(builder.steps)?;

        let plan = ExecutionPlan {
            root_type: root,
            requested_fields: request.fields.clone(),
            steps,
        };
        debug!(
            root_type = %plan.root_type,
            steps = plan.steps.len(),
            platforms = ?plan.platforms(),
            "Plan built"
        );
        Ok(plan)
    }
}

const RESOLVE_ATTEMPTS: usize = 3;

impl Planner {
    /// Resolve the query tree and read-lock its types.
    ///
    /// Resolution reads the registry before the locks are taken; a merge
    /// landing in between sends resolution round again against the new state.
    fn resolve_locked(&self, root: &str, request: &PlanRequest) -> Result<(QueryTree, LockedTypes), PlanningError> {
        let mut attempt = 1;
        loop {
            let tree = QueryTree::resolve(&self.registry, root, request)?;
            let locked = LockedTypes::lock(&self.registry, &tree)?;
            if locked.describes(&tree) || attempt == RESOLVE_ATTEMPTS {
                return Ok((tree, locked));
            }
            debug!(root_type = %root, attempt, "Types changed while locking, resolving again");
            attempt += 1;
        }
    }
}

/// Read guards on every type of one query tree
struct LockedTypes {
    views: BTreeMap<String, TypeView>,
}

impl LockedTypes {
    fn lock(registry: &Registry, tree: &QueryTree) -> Result<Self, PlanningError> {
        let mut views = BTreeMap::new();
        for node in &tree.nodes {
            if views.contains_key(&node.type_name) {
                continue;
            }
            let view = registry
                .read_type(&node.type_name)
                .ok_or_else(|| PlanningError::UnknownType(node.type_name.clone()))?;
            views.insert(node.type_name.clone(), view);
        }
        Ok(Self { views })
    }

    /// Whether every edge and requested field of `tree` still exists in
    /// the locked state
    fn describes(&self, tree: &QueryTree) -> bool {
        tree.nodes.iter().all(|node| {
            let Ok(state) = self.get(&node.type_name) else {
                return false;
            };
            let fields_present = node.requested.keys().all(|field| state.canonical.field(field).is_some());
            let edge_present = match (node.parent, &node.edge) {
                (Some(parent), Some(edge)) => self.get(&tree.node(parent).type_name).map_or(false, |parent| {
                    parent.edges.iter().any(|e| {
                        e.via_field == edge.via_field && e.to_type == edge.to_type && e.cardinality == edge.cardinality
                    })
                }),
                _ => true,
            };
            fields_present && edge_present
        })
    }

    fn get(&self, type_name: &str) -> Result<&TypeState, PlanningError> {
        self.views
            .get(type_name)
            .map(|view| &**view)
            .ok_or_else(|| PlanningError::UnknownType(type_name.to_string()))
    }
}

fn supplies(state: &TypeState, platform: &str, field: &str) -> bool {
    state
        .canonical
        .field(field)
        .map_or(false, |f| f.is_supplied_by(platform))
}

/// A step about to be added; merged into an existing one when platform,
/// type, operation and key all match
struct StepDraft {
    platform: PlatformId,
    type_name: String,
    operation: Operation,
    key: Vec<String>,
    binding: KeyBinding,
    fields: BTreeSet<String>,
    provides: Vec<String>,
    filters: Vec<Filter>,
}

struct PlanBuilder<'a> {
    config: &'a PlannerConfig,
    tree: &'a QueryTree,
    locked: &'a LockedTypes,
    steps: Vec<PlanStep>,
    /// Platforms chosen so far, in order of first choice
    used: Vec<PlatformId>,
}

impl<'a> PlanBuilder<'a> {
    /// Emit the steps for one node, then recurse into its children
    fn place(&mut self, id: usize, binding: KeyBinding) -> Result<(), PlanningError> {
        let (tree, locked) = (self.tree, self.locked);
        let node = tree.node(id);
        let state = locked.get(&node.type_name)?;
        let (required, operation) = if node.is_root() {
            (Capability::Retrieve, Operation::Retrieve)
        } else {
            (Capability::Join, Operation::Join)
        };

        if self.config.collapse_full_query && !node.children.is_empty() {
            if let Some((platform, key)) = self.full_query_platform(id, required)? {
                self.push_full_query(id, platform, key, binding)?;
                return Ok(());
            }
        }

        let needed = tree.needed_fields(id);
        let (primary, key) = self.choose_primary(id, state, required, &needed)?;
        let mut remaining: BTreeSet<String> = needed
            .iter()
            .filter(|f| !supplies(state, &primary, f))
            .cloned()
            .collect();
        let primary_fields: BTreeSet<String> = needed.difference(&remaining).cloned().collect();

        let primary_step = self.push_for_fields(id, &primary, operation, &key, binding, primary_fields.clone())?;
        let mut field_steps: BTreeMap<String, usize> =
            primary_fields.into_iter().map(|f| (f, primary_step)).collect();

        let mut serving = vec![primary.clone()];
        while !remaining.is_empty() {
            let partner = self
                .choose_partition(state, &key, &remaining, &serving)
                .ok_or_else(|| PlanningError::NoCapablePlatform {
                    type_name: node.type_name.clone(),
                    capability: Capability::Join,
                    fields: remaining.iter().cloned().collect(),
                })?;
            let covered: BTreeSet<String> = remaining
                .iter()
                .filter(|f| supplies(state, &partner, f))
                .cloned()
                .collect();
            debug!(
                type_name = %node.type_name,
                primary = %primary,
                partition = %partner,
                fields = ?covered,
                "Vertical partition added"
            );
            let step = self.push_for_fields(
                id,
                &partner,
                Operation::Join,
                &key,
                KeyBinding::Partition { step: primary_step },
                covered.clone(),
            )?;
            for field in covered {
                remaining.remove(&field);
                field_steps.insert(field, step);
            }
            serving.push(partner);
        }

        for &child in &node.children {
            let Some(edge) = tree.node(child).edge.as_ref() else {
                continue;
            };
            let carrier = field_steps.get(&edge.via_field).copied().unwrap_or(primary_step);
            self.place(
                child,
                KeyBinding::Reference {
                    step: carrier,
                    via_field: edge.via_field.clone(),
                    cardinality: edge.cardinality,
                },
            )?;
        }
        Ok(())
    }

    /// Richest capability set first, then a platform the plan already uses,
    /// then field coverage, then platform id
    fn choose_primary(
        &self,
        id: usize,
        state: &TypeState,
        required: Capability,
        needed: &BTreeSet<String>,
    ) -> Result<(PlatformId, Vec<String>), PlanningError> {
        let node = self.tree.node(id);
        let mut best: Option<((usize, bool, usize), &PlatformId, Vec<String>)> = None;

        for (platform, caps) in &state.capabilities {
            if !caps.contains(required) {
                continue;
            }
            let key = self.key_for(state, platform);
            if !node.is_root() && key.is_none() {
                continue;
            }
            let coverage = needed.iter().filter(|f| supplies(state, platform, f)).count();
            if coverage == 0 && !needed.is_empty() {
                continue;
            }
            let rank = (caps.len(), self.used.contains(platform), coverage);
            // Platforms iterate in id order, so ties keep the smallest id
            if best.as_ref().map_or(true, |(r, _, _)| rank > *r) {
                best = Some((rank, platform, key.unwrap_or_default()));
            }
        }

        let (_, platform, key) = best.ok_or_else(|| PlanningError::NoCapablePlatform {
            type_name: node.type_name.clone(),
            capability: required,
            fields: needed.iter().cloned().collect(),
        })?;
        debug!(
            type_name = %node.type_name,
            platform = %platform,
            key = ?key,
            capabilities = %state.capabilities[platform],
            "Platform selected"
        );
        Ok((platform.clone(), key))
    }

    /// Join-capable platform covering most of `remaining` on the same key
    fn choose_partition(
        &self,
        state: &TypeState,
        key: &[String],
        remaining: &BTreeSet<String>,
        serving: &[PlatformId],
    ) -> Option<PlatformId> {
        if key.is_empty() {
            return None;
        }
        let mut best: Option<((usize, usize, bool), &PlatformId)> = None;
        for (platform, caps) in &state.capabilities {
            if serving.contains(platform) || !caps.contains(Capability::Join) {
                continue;
            }
            if !key.iter().all(|f| supplies(state, platform, f)) {
                continue;
            }
            let coverage = remaining.iter().filter(|f| supplies(state, platform, f)).count();
            if coverage == 0 {
                continue;
            }
            let rank = (coverage, caps.len(), self.used.contains(platform));
            if best.as_ref().map_or(true, |(r, _)| rank > *r) {
                best = Some((rank, platform));
            }
        }
        best.map(|(_, platform)| platform.clone())
    }

    /// Configured preference, else the platform's own declared key, else
    /// any key candidate whose fields the platform supplies
    fn key_for(&self, state: &TypeState, platform: &str) -> Option<Vec<String>> {
        let usable = |key: &Vec<String>| !key.is_empty() && key.iter().all(|f| supplies(state, platform, f));

        if let Some(preferred) = self.config.key_preferences.get(state.type_name()) {
            if usable(preferred) {
                return Some(preferred.clone());
            }
        }
        if let Some(declared) = state.declared_keys.get(platform) {
            if usable(declared) {
                return Some(declared.clone());
            }
        }
        state.canonical.keys_supplied_by(platform).next().cloned()
    }

    /// Platform able to answer the whole sub-tree under `id` in one call
    fn full_query_platform(
        &self,
        id: usize,
        required: Capability,
    ) -> Result<Option<(PlatformId, Vec<String>)>, PlanningError> {
        let subtree = self.tree.subtree(id);
        let node = self.tree.node(id);
        let state = self.locked.get(&node.type_name)?;

        let mut best: Option<((usize, bool), &PlatformId, Vec<String>)> = None;
        for (platform, caps) in &state.capabilities {
            if !caps.contains(Capability::FullQuery) || !caps.contains(required) {
                continue;
            }
            let key = self.key_for(state, platform);
            if !node.is_root() && key.is_none() {
                continue;
            }
            let mut answers_all = true;
            for &member in &subtree {
                let member_state = self.locked.get(&self.tree.node(member).type_name)?;
                let capable = member_state
                    .capabilities
                    .get(platform)
                    .map_or(false, |c| c.contains(Capability::FullQuery));
                if !capable
                    || !self
                        .tree
                        .needed_fields(member)
                        .iter()
                        .all(|f| supplies(member_state, platform, f))
                {
                    answers_all = false;
                    break;
                }
            }
            if !answers_all {
                continue;
            }
            let rank = (caps.len(), self.used.contains(platform));
            if best.as_ref().map_or(true, |(r, _, _)| rank > *r) {
                best = Some((rank, platform, key.unwrap_or_default()));
            }
        }
        Ok(best.map(|(_, platform, key)| (platform.clone(), key)))
    }

    fn push_full_query(
        &mut self,
        id: usize,
        platform: PlatformId,
        key: Vec<String>,
        binding: KeyBinding,
    ) -> Result<(), PlanningError> {
        let tree = self.tree;
        let mut fields: BTreeSet<String> = key.iter().cloned().collect();
        let mut provides = Vec::new();
        let mut filters = Vec::new();
        for member in tree.subtree(id) {
            let prefix = tree.relative_path(id, member);
            let node = tree.node(member);
            let local_fields = node
                .requested
                .keys()
                .chain(node.filters.iter().map(|f| &f.field));
            for field in local_fields {
                let mut path = prefix.clone();
                path.push(field.clone());
                fields.insert(path.join("."));
            }
            provides.extend(node.requested.values().flatten().cloned());
            filters.extend(node.filters.iter().cloned());
        }
        debug!(
            type_name = %tree.node(id).type_name,
            platform = %platform,
            types = tree.subtree(id).len(),
            "Sub-tree collapsed into one full query"
        );
        self.push(StepDraft {
            platform,
            type_name: tree.node(id).type_name.clone(),
            operation: Operation::FullQuery,
            key,
            binding,
            fields,
            provides,
            filters,
        })?;
        Ok(())
    }

    /// Step fetching `fields` of node `id`, with the filters and request
    /// strings that belong to those fields
    fn push_for_fields(
        &mut self,
        id: usize,
        platform: &str,
        operation: Operation,
        key: &[String],
        binding: KeyBinding,
        fields: BTreeSet<String>,
    ) -> Result<usize, PlanningError> {
        let node = self.tree.node(id);
        let provides = node
            .requested
            .iter()
            .filter(|(field, _)| fields.contains(*field))
            .flat_map(|(_, requests)| requests.iter().cloned())
            .collect();
        let filters = node
            .filters
            .iter()
            .filter(|f| fields.contains(&f.field))
            .cloned()
            .collect();
        let mut all_fields = fields;
        all_fields.extend(key.iter().cloned());

        let draft = StepDraft {
            platform: platform.to_string(),
            type_name: node.type_name.clone(),
            operation,
            key: key.to_vec(),
            binding,
            fields: all_fields,
            provides,
            filters,
        };
        self.push(draft)
    }

    /// Add a step, or fold it into an existing one with the same platform,
    /// type, operation and key so each key set is fetched once
    fn push(&mut self, draft: StepDraft) -> Result<usize, PlanningError> {
        let caps = self
            .locked
            .get(&draft.type_name)?
            .capabilities
            .get(&draft.platform)
            .cloned()
            .unwrap_or_default();
        if !self.used.contains(&draft.platform) {
            self.used.push(draft.platform.clone());
        }

        let shareable = draft.binding != KeyBinding::Root;
        let existing = self.steps.iter().position(|s| {
            shareable
                && !s.bindings.contains(&KeyBinding::Root)
                && s.platform == draft.platform
                && s.type_name == draft.type_name
                && s.operation == draft.operation
                && s.key == draft.key
        });

        let index = match existing {
            Some(index) => {
                let step = &mut self.steps[index];
                debug!(
                    step = step.id,
                    platform = %step.platform,
                    type_name = %step.type_name,
                    "Fetch shared between branches"
                );
                if !step.bindings.contains(&draft.binding) {
                    step.bindings.push(draft.binding);
                }
                step.fields.extend(draft.fields);
                for request in draft.provides {
                    if !step.provides.contains(&request) {
                        step.provides.push(request);
                    }
                }
                for filter in draft.filters {
                    if !step.filters.contains(&filter) {
                        step.filters.push(filter);
                    }
                }
                index
            }
            None => {
                let id = self.steps.len();
                self.steps.push(PlanStep {
                    id,
                    platform: draft.platform,
                    type_name: draft.type_name,
                    operation: draft.operation,
                    key: draft.key,
                    bindings: vec![draft.binding],
                    fields: draft.fields,
                    provides: draft.provides,
                    depends_on: Vec::new(),
                    pushdown: Pushdown::default(),
                    filters: draft.filters,
                    critical: false,
                });
                id
            }
        };

        let step = &mut self.steps[index];
        step.pushdown = Pushdown {
            selection: !step.filters.is_empty() && caps.contains(Capability::Selection),
            projection: caps.contains(Capability::Projection),
        };
        Ok(index)
    }
}

/// Kahn's algorithm over key bindings; renumbers steps in execution order
fn order_steps(steps: Vec<PlanStep>) -> Result<Vec<PlanStep>, PlanningError> {
    let upstream: Vec<BTreeSet<usize>> = steps
        .iter()
        .map(|s| s.bindings.iter().filter_map(KeyBinding::upstream).collect())
        .collect();

    let mut pending = upstream.clone();
    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|i| pending[*i].is_empty()).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for (i, deps) in pending.iter_mut().enumerate() {
            if deps.remove(&next) && deps.is_empty() {
                ready.insert(i);
            }
        }
    }

    if order.len() < steps.len() {
        let types: BTreeSet<String> = (0..steps.len())
            .filter(|i| !order.contains(i))
            .map(|i| steps[i].type_name.clone())
            .collect();
        return Err(PlanningError::CyclicDependency {
            types: types.into_iter().collect(),
        });
    }

    let mut position = vec![0; steps.len()];
    for (new_id, old_id) in order.iter().enumerate() {
        position[*old_id] = new_id;
    }
    let consumed: BTreeSet<usize> = upstream.iter().flatten().map(|old| position[*old]).collect();

    let mut slots: Vec<Option<PlanStep>> = steps.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(slots.len());
    for old_id in order {
        let Some(mut step) = slots[old_id].take() else {
            continue;
        };
        step.id = position[old_id];
        for binding in &mut step.bindings {
            match binding {
                KeyBinding::Root => {}
                KeyBinding::Reference { step: upstream, .. } | KeyBinding::Partition { step: upstream } => {
                    *upstream = position[*upstream];
                }
            }
        }
        step.depends_on = upstream[old_id].iter().map(|old| position[*old]).collect();
        step.depends_on.sort_unstable();
        step.critical = step.bindings.contains(&KeyBinding::Root) || consumed.contains(&step.id);
        ordered.push(step);
    }
    Ok(ordered)
}
