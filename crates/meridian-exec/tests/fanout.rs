//! Executor behaviour against in-memory platforms

use async_trait::async_trait;
use meridian_exec::{
    CancelToken, ExecError, ExecutionConfig, Executor, FetchError, FetchRequest, PlatformClient,
    Record,
};
use meridian_planner::{PlanRequest, Planner, PlannerConfig};
use meridian_registry::Registry;
use meridian_schema::{
    Capability, ExecutionPlan, FieldDecl, Filter, FilterOp, KeyBinding, Operation, PlanStep,
    Pushdown, ScalarType, TypeDecl,
};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn records(value: Value) -> Vec<Record> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|r| r.as_object().cloned())
        .collect()
}

/// Serves fixed tables per type, filtered by the requested key values
#[derive(Default)]
struct MockPlatform {
    tables: HashMap<String, Vec<Record>>,
    failing: HashSet<String>,
    delay: Duration,
    calls: Mutex<Vec<FetchRequest>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockPlatform {
    fn new() -> Self {
        Self::default()
    }

    fn table(mut self, type_name: &str, rows: Value) -> Self {
        self.tables.insert(type_name.to_string(), records(rows));
        self
    }

    fn failing(mut self, type_name: &str) -> Self {
        self.failing.insert(type_name.to_string());
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> Vec<FetchRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn called_types(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.type_name).collect()
    }
}

#[async_trait]
impl PlatformClient for MockPlatform {
    async fn fetch(&self, request: FetchRequest) -> Result<Vec<Record>, FetchError> {
        self.calls.lock().unwrap().push(request.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&request.type_name) {
            return Err(FetchError::Failed("platform unavailable".to_string()));
        }
        let rows = self.tables.get(&request.type_name).cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter(|row| match (&request.keys, request.key.first()) {
                (Some(keys), Some(field)) => keys.contains(row.get(field).unwrap_or(&Value::Null)),
                _ => true,
            })
            .collect())
    }
}

fn sfa_registry() -> Arc<Registry> {
    let caps = [Capability::Retrieve, Capability::Join];
    let registry = Registry::new();
    registry
        .merge(
            "ple",
            "sfa-rm-2",
            &[
                TypeDecl::new("slice")
                    .field(FieldDecl::scalar("slice_hrn", ScalarType::String))
                    .field(FieldDecl::reference_list("user", "user"))
                    .key(["slice_hrn"])
                    .capabilities(caps),
                TypeDecl::new("user")
                    .field(FieldDecl::scalar("user_hrn", ScalarType::String))
                    .field(FieldDecl::scalar("user_email", ScalarType::String))
                    .field(FieldDecl::reference("parent_authority", "authority"))
                    .key(["user_hrn"])
                    .capabilities(caps),
                TypeDecl::new("authority")
                    .field(FieldDecl::scalar("authority_hrn", ScalarType::String))
                    .field(FieldDecl::scalar("name", ScalarType::String))
                    .key(["authority_hrn"])
                    .capabilities(caps),
            ],
        )
        .unwrap();
    Arc::new(registry)
}

fn sfa_platform() -> MockPlatform {
    MockPlatform::new()
        .table(
            "slice",
            json!([
                {"slice_hrn": "ple.inria.s1", "user": ["ple.inria.alice", "ple.inria.bob"]},
                {"slice_hrn": "ple.upmc.s2", "user": ["ple.inria.bob"]}
            ]),
        )
        .table(
            "user",
            json!([
                {"user_hrn": "ple.inria.alice", "user_email": "alice@inria.fr", "parent_authority": "ple.inria"},
                {"user_hrn": "ple.inria.bob", "user_email": "bob@inria.fr", "parent_authority": "ple.inria"},
                {"user_hrn": "ple.upmc.carol", "user_email": "carol@upmc.fr", "parent_authority": "ple.upmc"}
            ]),
        )
        .table(
            "authority",
            json!([{"authority_hrn": "ple.inria", "name": "INRIA"}]),
        )
}

fn plan(fields: &[&str]) -> ExecutionPlan {
    Planner::new(sfa_registry(), PlannerConfig::default())
        .plan(&PlanRequest::new("slice", fields.iter().copied()))
        .unwrap()
}

#[tokio::test]
async fn test_joined_records_embedded() {
    let platform = Arc::new(sfa_platform());
    let executor = Executor::new(ExecutionConfig::default()).with_client("ple", platform.clone());

    let result = executor
        .execute(&plan(&["slice_hrn", "user_email"]), &CancelToken::new())
        .await
        .unwrap();

    assert!(result.is_complete());
    assert_eq!(result.records.len(), 2);
    assert_eq!(
        result.records[0]["user"],
        json!([
            {"user_hrn": "ple.inria.alice", "user_email": "alice@inria.fr", "parent_authority": "ple.inria"},
            {"user_hrn": "ple.inria.bob", "user_email": "bob@inria.fr", "parent_authority": "ple.inria"}
        ])
    );

    let calls = platform.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].keys, None);
    assert_eq!(calls[1].operation, Operation::Join);
    assert_eq!(
        calls[1].keys,
        Some(vec![json!("ple.inria.alice"), json!("ple.inria.bob")])
    );
}

#[tokio::test]
async fn test_optional_branch_degrades() {
    let platform = Arc::new(sfa_platform().failing("user"));
    let executor = Executor::new(ExecutionConfig::default()).with_client("ple", platform);

    let result = executor
        .execute(&plan(&["slice_hrn", "user_email"]), &CancelToken::new())
        .await
        .unwrap();

    assert!(!result.is_complete());
    assert_eq!(result.degraded.len(), 1);
    assert_eq!(result.degraded[0].step, 1);
    assert_eq!(result.degraded[0].type_name, "user");
    assert_eq!(result.degraded[0].missing_fields, vec!["user_email".to_string()]);
    // References stay as fetched
    assert_eq!(result.records[1]["user"], json!(["ple.inria.bob"]));
}

#[tokio::test]
async fn test_key_supplier_failure_is_partial() {
    let platform = Arc::new(sfa_platform().failing("user"));
    let executor = Executor::new(ExecutionConfig::default()).with_client("ple", platform.clone());

    let err = executor
        .execute(&plan(&["slice_hrn", "user.parent_authority.name"]), &CancelToken::new())
        .await
        .unwrap_err();

    match err {
        ExecError::PartialFetchFailure {
            step,
            type_name,
            missing_fields,
            partial,
            ..
        } => {
            assert_eq!(step, 1);
            assert_eq!(type_name, "user");
            assert_eq!(missing_fields, vec!["user.parent_authority.name".to_string()]);
            assert_eq!(partial.len(), 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!platform.called_types().contains(&"authority".to_string()));
}

#[tokio::test]
async fn test_nested_join_through_two_hops() {
    let executor = Executor::new(ExecutionConfig::default()).with_client("ple", Arc::new(sfa_platform()));

    let result = executor
        .execute(&plan(&["slice_hrn", "user.parent_authority.name"]), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(
        result.records[1]["user"][0]["parent_authority"],
        json!({"authority_hrn": "ple.inria", "name": "INRIA"})
    );
}

#[tokio::test]
async fn test_root_timeout() {
    let config = ExecutionConfig {
        fetch_timeout_ms: 20,
        ..ExecutionConfig::default()
    };
    let platform = Arc::new(sfa_platform().delay(Duration::from_millis(500)));
    let executor = Executor::new(config).with_client("ple", platform);

    let err = executor
        .execute(&plan(&["slice_hrn"]), &CancelToken::new())
        .await
        .unwrap_err();

    match err {
        ExecError::PartialFetchFailure { step, reason, partial, .. } => {
            assert_eq!(step, 0);
            assert!(reason.contains("timed out"));
            assert!(partial.is_empty());
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_stops_in_flight_fetches() {
    let platform = Arc::new(sfa_platform().delay(Duration::from_secs(10)));
    let executor = Executor::new(ExecutionConfig::default()).with_client("ple", platform.clone());
    let cancel = CancelToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let plan = plan(&["slice_hrn", "user_email"]);
    let outcome = tokio::time::timeout(Duration::from_secs(2), executor.execute(&plan, &cancel))
        .await
        .expect("cancellation should end execution promptly");
    assert_eq!(outcome, Err(ExecError::PlanCancelled));
    // The user join never started
    assert_eq!(platform.called_types(), vec!["slice".to_string()]);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let platform = Arc::new(sfa_platform());
    let executor = Executor::new(ExecutionConfig::default()).with_client("ple", platform.clone());
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = executor.execute(&plan(&["slice_hrn"]), &cancel).await;
    assert_eq!(outcome, Err(ExecError::PlanCancelled));
    assert!(platform.calls().is_empty());
}

#[tokio::test]
async fn test_missing_client() {
    let executor = Executor::new(ExecutionConfig::default());
    let outcome = executor.execute(&plan(&["slice_hrn"]), &CancelToken::new()).await;
    assert_eq!(outcome, Err(ExecError::MissingClient("ple".to_string())));
}

fn partition_step(id: usize, platform: &str) -> PlanStep {
    PlanStep {
        id,
        platform: platform.to_string(),
        type_name: "node".to_string(),
        operation: Operation::Join,
        key: vec!["hostname".to_string()],
        bindings: vec![KeyBinding::Partition { step: 0 }],
        fields: BTreeSet::from(["hostname".to_string()]),
        provides: Vec::new(),
        depends_on: vec![0],
        pushdown: Pushdown::default(),
        filters: Vec::new(),
        critical: false,
    }
}

#[tokio::test]
async fn test_in_flight_bound() {
    let platform = Arc::new(
        MockPlatform::new()
            .table("node", json!([{"hostname": "planetlab1.inria.fr"}]))
            .delay(Duration::from_millis(30)),
    );
    let mut root = partition_step(0, "p0");
    root.operation = Operation::Retrieve;
    root.bindings = vec![KeyBinding::Root];
    root.depends_on = Vec::new();
    root.critical = true;

    let mut steps = vec![root];
    let mut executor = Executor::new(ExecutionConfig {
        max_in_flight: 2,
        ..ExecutionConfig::default()
    });
    executor.register_client("p0", platform.clone());
    for id in 1..=6 {
        let name = format!("p{id}");
        steps.push(partition_step(id, &name));
        executor.register_client(name, platform.clone());
    }
    let plan = ExecutionPlan {
        root_type: "node".to_string(),
        requested_fields: vec!["hostname".to_string()],
        steps,
    };

    let result = executor.execute(&plan, &CancelToken::new()).await.unwrap();
    assert_eq!(result.records.len(), 1);
    assert_eq!(platform.calls().len(), 7);
    assert!(platform.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_partition_merge_with_local_filter() {
    let registry = Registry::new();
    registry
        .merge(
            "ple",
            "1",
            &[TypeDecl::new("node")
                .field(FieldDecl::scalar("hostname", ScalarType::String))
                .field(FieldDecl::scalar("site", ScalarType::String))
                .key(["hostname"])
                .capabilities([Capability::Retrieve, Capability::Join])],
        )
        .unwrap();
    registry
        .merge(
            "comon",
            "1",
            &[TypeDecl::new("node")
                .field(FieldDecl::scalar("hostname", ScalarType::String))
                .field(FieldDecl::scalar("load", ScalarType::Float))
                .key(["hostname"])
                .capabilities([Capability::Join])],
        )
        .unwrap();
    let plan = Planner::new(Arc::new(registry), PlannerConfig::default())
        .plan(
            &PlanRequest::new("node", ["hostname", "load"])
                .with_filter(Filter::new("node", "site", FilterOp::Eq, json!("inria"))),
        )
        .unwrap();

    let ple = Arc::new(MockPlatform::new().table(
        "node",
        json!([
            {"hostname": "a.inria.fr", "site": "inria"},
            {"hostname": "b.upmc.fr", "site": "upmc"}
        ]),
    ));
    let comon = Arc::new(MockPlatform::new().table(
        "node",
        json!([
            {"hostname": "a.inria.fr", "load": 0.5},
            {"hostname": "b.upmc.fr", "load": 0.9}
        ]),
    ));
    let executor = Executor::new(ExecutionConfig::default())
        .with_client("ple", ple.clone())
        .with_client("comon", comon.clone());

    let result = executor.execute(&plan, &CancelToken::new()).await.unwrap();

    assert_eq!(
        result.records,
        records(json!([{"hostname": "a.inria.fr", "site": "inria", "load": 0.5}]))
    );
    // Filter applied locally, so only the surviving key was joined
    assert!(ple.calls()[0].filters.is_empty());
    assert_eq!(comon.calls()[0].keys, Some(vec![json!("a.inria.fr")]));
}
