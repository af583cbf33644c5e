//! Plan execution: a bounded fan-out of per-platform fetches
//!
//! A step is dispatched once every step it depends on has finished. At most
//! `max_in_flight` fetches run at a time across all platforms; results are
//! merged by key only after every fetch has returned.

use meridian_schema::{ExecutionPlan, KeyBinding, PlanStep, PlatformId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::client::{FetchError, FetchRequest, PlatformClient, Record};
use crate::error::{DegradedBranch, ExecError};
use crate::merge;

/// Execution settings, usually read from the `execution` section of meridian.yaml
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Platform calls allowed in flight at once
    pub max_in_flight: usize,
    pub fetch_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            fetch_timeout_ms: 30_000,
        }
    }
}

impl ExecutionConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    /// Root records with joined records embedded under their reference fields
    pub records: Vec<Record>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<DegradedBranch>,
}

impl ExecutionResult {
    pub fn is_complete(&self) -> bool {
        self.degraded.is_empty()
    }
}

pub struct Executor {
    clients: HashMap<PlatformId, Arc<dyn PlatformClient>>,
    semaphore: Arc<Semaphore>,
    config: ExecutionConfig,
}

impl Executor {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            clients: HashMap::new(),
            semaphore: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            config,
        }
    }

    pub fn with_client(mut self, platform: impl Into<PlatformId>, client: Arc<dyn PlatformClient>) -> Self {
        self.register_client(platform, client);
        self
    }

    pub fn register_client(&mut self, platform: impl Into<PlatformId>, client: Arc<dyn PlatformClient>) {
        self.clients.insert(platform.into(), client);
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub async fn execute(&self, plan: &ExecutionPlan, cancel: &CancelToken) -> Result<ExecutionResult, ExecError> {
        if let Some(platform) = plan.platforms().into_iter().find(|p| !self.clients.contains_key(*p)) {
            return Err(ExecError::MissingClient(platform.to_string()));
        }
        let execution_id = Uuid::new_v4();
        let span = info_span!("execute", execution_id = %execution_id, root_type = %plan.root_type);
        self.run(plan, cancel, execution_id).instrument(span).await
    }

    async fn run(
        &self,
        plan: &ExecutionPlan,
        cancel: &CancelToken,
        execution_id: Uuid,
    ) -> Result<ExecutionResult, ExecError> {
        info!(steps = plan.steps.len(), platforms = ?plan.platforms(), "Executing plan");

        let mut results: BTreeMap<usize, Vec<Record>> = BTreeMap::new();
        // Failed or skipped steps, with the reason
        let mut failed: BTreeMap<usize, String> = BTreeMap::new();
        let mut degraded = Vec::new();
        let mut critical_failure: Option<usize> = None;

        let mut pending: BTreeSet<usize> = plan.steps.iter().map(|s| s.id).collect();
        let mut in_flight: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut tasks: JoinSet<Result<Vec<Record>, FetchError>> = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                tasks.abort_all();
                warn!(in_flight = in_flight.len(), "Plan cancelled");
                return Err(ExecError::PlanCancelled);
            }

            let is_ready = |step: &PlanStep| {
                step.depends_on
                    .iter()
                    .all(|d| results.contains_key(d) || failed.contains_key(d))
            };
            let ready: Vec<&PlanStep> = pending
                .iter()
                .filter_map(|id| plan.step(*id))
                .filter(|step| is_ready(step))
                .collect();
            let progressed = !ready.is_empty();

            for step in ready {
                pending.remove(&step.id);
                if let Some(upstream) = step.depends_on.iter().find(|d| failed.contains_key(d)) {
                    debug!(step = step.id, upstream, "Step skipped, upstream failed");
                    failed.insert(step.id, format!("upstream step {} failed", upstream));
                    continue;
                }

                let request = fetch_request(step, &results);
                if request.keys.as_ref().map_or(false, Vec::is_empty) {
                    debug!(step = step.id, "No upstream keys, nothing to fetch");
                    results.insert(step.id, Vec::new());
                    continue;
                }
                let client = self
                    .clients
                    .get(&step.platform)
                    .cloned()
                    .ok_or_else(|| ExecError::MissingClient(step.platform.clone()))?;

                debug!(
                    step = step.id,
                    platform = %step.platform,
                    type_name = %step.type_name,
                    operation = %step.operation,
                    keys = request.keys.as_ref().map_or(0, Vec::len),
                    "Dispatching fetch"
                );
                let semaphore = Arc::clone(&self.semaphore);
                let timeout = self.config.fetch_timeout();
                let handle = tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| FetchError::Failed(format!("executor closed: {e}")))?;
                    match tokio::time::timeout(timeout, client.fetch(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(FetchError::Timeout(timeout)),
                    }
                });
                in_flight.insert(handle.id(), step.id);
            }

            if tasks.is_empty() {
                if pending.is_empty() || !progressed {
                    break;
                }
                // Skips and empty fetches may have released further steps
                continue;
            }

            let joined = tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    warn!(in_flight = in_flight.len(), "Plan cancelled");
                    return Err(ExecError::PlanCancelled);
                }
                joined = tasks.join_next_with_id() => joined,
            };
            let Some(joined) = joined else {
                continue;
            };
            let (task, outcome) = match joined {
                Ok((task, outcome)) => (task, outcome),
                Err(err) => (err.id(), Err(FetchError::Failed(err.to_string()))),
            };
            let Some(step) = in_flight.remove(&task).and_then(|id| plan.step(id)) else {
                continue;
            };

            match outcome {
                Ok(mut records) => {
                    if !step.pushdown.selection && !step.filters.is_empty() {
                        records.retain(|r| step.filters.iter().all(|f| f.matches(r.get(&f.field))));
                    }
                    debug!(step = step.id, records = records.len(), "Fetch completed");
                    results.insert(step.id, records);
                }
                Err(err) => {
                    let reason = err.to_string();
                    if step.critical {
                        let dependents: Vec<usize> = plan.dependents(step.id).map(|s| s.id).collect();
                        warn!(
                            step = step.id,
                            platform = %step.platform,
                            type_name = %step.type_name,
                            reason = %reason,
                            dependents = ?dependents,
                            "Key-supplying fetch failed, dependent joins aborted"
                        );
                        critical_failure = Some(critical_failure.map_or(step.id, |first| first.min(step.id)));
                    } else {
                        warn!(
                            step = step.id,
                            platform = %step.platform,
                            type_name = %step.type_name,
                            reason = %reason,
                            "Optional fetch failed, result degraded"
                        );
                        degraded.push(DegradedBranch {
                            step: step.id,
                            platform: step.platform.clone(),
                            type_name: step.type_name.clone(),
                            reason: reason.clone(),
                            missing_fields: step.provides.clone(),
                        });
                    }
                    failed.insert(step.id, reason);
                }
            }
        }

        let records = merge::assemble(plan, results);

        if let Some(id) = critical_failure {
            let missing: BTreeSet<String> = failed
                .keys()
                .filter_map(|id| plan.step(*id))
                .flat_map(|step| step.provides.iter().cloned())
                .collect();
            let (platform, type_name) = plan
                .step(id)
                .map(|s| (s.platform.clone(), s.type_name.clone()))
                .unwrap_or_default();
            return Err(ExecError::PartialFetchFailure {
                step: id,
                platform,
                type_name,
                reason: failed.get(&id).cloned().unwrap_or_default(),
                missing_fields: missing.into_iter().collect(),
                partial: records,
            });
        }

        degraded.sort_by_key(|d: &DegradedBranch| d.step);
        info!(records = records.len(), degraded = degraded.len(), "Plan executed");
        Ok(ExecutionResult {
            execution_id,
            records,
            degraded,
        })
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut platforms: Vec<&PlatformId> = self.clients.keys().collect();
        platforms.sort();
        f.debug_struct("Executor")
            .field("platforms", &platforms)
            .field("config", &self.config)
            .finish()
    }
}

/// Request for `step`, with key values collected from finished upstream steps
fn fetch_request(step: &PlanStep, results: &BTreeMap<usize, Vec<Record>>) -> FetchRequest {
    let keys = if step.bindings.contains(&KeyBinding::Root) {
        None
    } else {
        let mut values = Vec::new();
        for binding in &step.bindings {
            match binding {
                KeyBinding::Root => {}
                KeyBinding::Reference {
                    step: upstream,
                    via_field,
                    ..
                } => {
                    for record in results.get(upstream).into_iter().flatten() {
                        if let Some(reference) = record.get(via_field) {
                            values.extend(merge::reference_keys(reference, &step.key));
                        }
                    }
                }
                KeyBinding::Partition { step: upstream } => {
                    values.extend(
                        results
                            .get(upstream)
                            .into_iter()
                            .flatten()
                            .filter_map(|record| merge::key_of(record, &step.key)),
                    );
                }
            }
        }
        Some(merge::dedup(values))
    };

    FetchRequest {
        step: step.id,
        platform: step.platform.clone(),
        type_name: step.type_name.clone(),
        operation: step.operation,
        key: step.key.clone(),
        keys,
        fields: step.fields.clone(),
        filters: if step.pushdown.selection {
            step.filters.clone()
        } else {
            Vec::new()
        },
        projection: step.pushdown.projection,
    }
}
