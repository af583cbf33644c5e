//! End-to-end planning against registries built from metadata-like fixtures

use meridian_planner::{PlanRequest, Planner, PlannerConfig, PlanningError};
use meridian_registry::{AliasTable, Registry};
use meridian_schema::{
    Capability, CapabilitySet, Cardinality, FieldDecl, Filter, FilterOp, KeyBinding, Operation,
    ScalarType, TypeDecl,
};
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

const RETRIEVE_JOIN: [Capability; 2] = [Capability::Retrieve, Capability::Join];

fn sfa_types(caps: &[Capability]) -> Vec<TypeDecl> {
    let caps: CapabilitySet = caps.iter().copied().collect();
    vec![
        TypeDecl::new("slice")
            .field(FieldDecl::scalar("slice_hrn", ScalarType::String).immutable())
            .field(FieldDecl::scalar("slice_description", ScalarType::Text))
            .field(FieldDecl::reference_list("user", "user"))
            .field(FieldDecl::reference("authority", "authority"))
            .key(["slice_hrn"])
            .capabilities(caps.clone()),
        TypeDecl::new("user")
            .field(FieldDecl::scalar("user_hrn", ScalarType::String).immutable())
            .field(FieldDecl::scalar("user_email", ScalarType::String))
            .field(FieldDecl::reference("parent_authority", "authority"))
            .key(["user_hrn"])
            .capabilities(caps.clone()),
        TypeDecl::new("authority")
            .field(FieldDecl::scalar("authority_hrn", ScalarType::String).immutable())
            .field(FieldDecl::scalar("name", ScalarType::String))
            .field(FieldDecl::reference_list("users", "user"))
            .key(["authority_hrn"])
            .capabilities(caps),
    ]
}

fn sfa(caps: &[Capability]) -> Arc<Registry> {
    let registry = Registry::new();
    registry.merge("ple", "sfa-rm-2", &sfa_types(caps)).unwrap();
    Arc::new(registry)
}

fn planner(registry: Arc<Registry>) -> Planner {
    Planner::new(registry, PlannerConfig::default())
}

#[test]
fn test_richer_platform_wins_single_fetch() {
    let registry = Registry::new();
    registry
        .merge(
            "x",
            "1",
            &[TypeDecl::new("node")
                .field(FieldDecl::scalar("hostname", ScalarType::String))
                .field(FieldDecl::scalar("site", ScalarType::String))
                .field(FieldDecl::scalar("boot_state", ScalarType::String))
                .key(["hostname"])
                .capabilities([Capability::Retrieve])],
        )
        .unwrap();
    registry
        .merge(
            "y",
            "1",
            &[TypeDecl::new("node")
                .field(FieldDecl::scalar("ip", ScalarType::Inet))
                .field(FieldDecl::scalar("site", ScalarType::String))
                .field(FieldDecl::scalar("boot_state", ScalarType::String))
                .key(["ip"])
                .capabilities(RETRIEVE_JOIN)],
        )
        .unwrap();

    let plan = planner(Arc::new(registry))
        .plan(&PlanRequest::new("node", ["site", "boot_state"]))
        .unwrap();

    assert_eq!(plan.steps.len(), 1);
    let step = &plan.steps[0];
    assert_eq!(step.platform, "y");
    assert_eq!(step.operation, Operation::Retrieve);
    assert_eq!(step.key, vec!["ip".to_string()]);
    assert_eq!(step.bindings, vec![KeyBinding::Root]);
}

#[test]
fn test_slice_fetched_before_user() {
    let plan = planner(sfa(&RETRIEVE_JOIN))
        .plan(&PlanRequest::new("slice", ["slice_hrn", "user_email"]))
        .unwrap();

    assert_eq!(plan.steps.len(), 2);
    let (slice, user) = (&plan.steps[0], &plan.steps[1]);
    assert_eq!(slice.type_name, "slice");
    assert_eq!(slice.operation, Operation::Retrieve);
    assert!(slice.fields.contains("user"));
    assert!(slice.critical);

    assert_eq!(user.type_name, "user");
    assert_eq!(user.operation, Operation::Join);
    assert_eq!(user.depends_on, vec![0]);
    assert_eq!(
        user.bindings,
        vec![KeyBinding::Reference {
            step: 0,
            via_field: "user".to_string(),
            cardinality: Cardinality::Many,
        }]
    );
    assert_eq!(user.key, vec!["user_hrn".to_string()]);
    assert_eq!(user.provides, vec!["user_email".to_string()]);
    assert!(!user.critical);
}

#[test]
fn test_full_query_collapses_subtree() {
    let caps = [Capability::Retrieve, Capability::Join, Capability::FullQuery];
    let request = PlanRequest::new("slice", ["slice_hrn", "user_email"]);

    let plan = planner(sfa(&caps)).plan(&request).unwrap();
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].operation, Operation::FullQuery);
    assert_eq!(
        plan.steps[0].fields,
        BTreeSet::from([
            "slice_hrn".to_string(),
            "user.user_email".to_string(),
        ])
    );

    let planner = Planner::new(sfa(&caps), PlannerConfig::default().without_full_query());
    assert_eq!(planner.plan(&request).unwrap().steps.len(), 2);
}

#[test]
fn test_projection_only_platform_cannot_retrieve() {
    let registry = Registry::new();
    registry
        .merge(
            "tophat",
            "1",
            &[TypeDecl::new("node")
                .field(FieldDecl::scalar("hostname", ScalarType::String))
                .key(["hostname"])
                .capabilities([Capability::Projection])],
        )
        .unwrap();

    let err = planner(Arc::new(registry))
        .plan(&PlanRequest::new("node", ["hostname"]))
        .unwrap_err();
    assert!(matches!(
        err,
        PlanningError::NoCapablePlatform { ref type_name, capability: Capability::Retrieve, .. }
            if type_name == "node"
    ));
}

#[test]
fn test_path_around_cycle_is_rejected() {
    let registry = Registry::new();
    registry
        .merge(
            "p",
            "1",
            &[
                TypeDecl::new("a")
                    .field(FieldDecl::scalar("name", ScalarType::String))
                    .field(FieldDecl::reference("to_b", "b"))
                    .key(["name"])
                    .capabilities(RETRIEVE_JOIN),
                TypeDecl::new("b")
                    .field(FieldDecl::scalar("name", ScalarType::String))
                    .field(FieldDecl::reference("to_c", "c"))
                    .key(["name"])
                    .capabilities(RETRIEVE_JOIN),
                TypeDecl::new("c")
                    .field(FieldDecl::scalar("name", ScalarType::String))
                    .field(FieldDecl::reference("to_a", "a"))
                    .key(["name"])
                    .capabilities(RETRIEVE_JOIN),
            ],
        )
        .unwrap();

    let err = planner(Arc::new(registry))
        .plan(&PlanRequest::new("a", ["to_b.to_c.to_a.name"]))
        .unwrap_err();
    assert_eq!(
        err,
        PlanningError::CyclicDependency {
            types: vec!["a", "b", "c", "a"].into_iter().map(String::from).collect()
        }
    );
}

#[test]
fn test_crossing_branches_are_cyclic() {
    let err = planner(sfa(&RETRIEVE_JOIN))
        .plan(&PlanRequest::new(
            "slice",
            ["user.parent_authority.name", "authority.users.user_email"],
        ))
        .unwrap_err();
    assert_eq!(
        err,
        PlanningError::CyclicDependency {
            types: vec!["authority".to_string(), "user".to_string()]
        }
    );
}

#[test]
fn test_shared_key_fetched_once() {
    let mut types = sfa_types(&RETRIEVE_JOIN);
    types[0] = types[0].clone().field(FieldDecl::reference_list("pi", "user"));
    let registry = Registry::new();
    registry.merge("ple", "sfa-rm-2", &types).unwrap();

    let plan = planner(Arc::new(registry))
        .plan(&PlanRequest::new("slice", ["user.user_email", "pi.user_email", "user.user_hrn"]))
        .unwrap();

    assert_eq!(plan.steps.len(), 2);
    assert_eq!(plan.steps_for_type("user").count(), 1);
    let user = &plan.steps[1];
    assert_eq!(user.bindings.len(), 2);
    assert_eq!(plan.dependents(0).map(|s| s.id).collect::<Vec<_>>(), vec![1]);
    assert_eq!(user.provides.len(), 3);

    let mut seen = HashSet::new();
    for step in &plan.steps {
        assert!(seen.insert((step.platform.clone(), step.type_name.clone(), step.key.clone())));
    }
}

#[test]
fn test_vertical_partition_on_shared_key() {
    let registry = Registry::new();
    registry
        .merge(
            "ple",
            "1",
            &[TypeDecl::new("node")
                .field(FieldDecl::scalar("hostname", ScalarType::String))
                .field(FieldDecl::scalar("site", ScalarType::String))
                .key(["hostname"])
                .capabilities(RETRIEVE_JOIN)],
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

    let plan = planner(Arc::new(registry))
        .plan(&PlanRequest::new("node", ["site", "load"]))
        .unwrap();

    assert_eq!(plan.steps.len(), 2);
    assert_eq!(plan.steps[0].platform, "ple");
    assert!(plan.steps[0].critical);
    let partition = &plan.steps[1];
    assert_eq!(partition.platform, "comon");
    assert_eq!(partition.bindings, vec![KeyBinding::Partition { step: 0 }]);
    assert_eq!(
        partition.fields,
        BTreeSet::from(["hostname".to_string(), "load".to_string()])
    );
    assert!(!partition.critical);
}

#[test]
fn test_field_no_platform_can_join() {
    let registry = Registry::new();
    registry
        .merge(
            "ple",
            "1",
            &[TypeDecl::new("node")
                .field(FieldDecl::scalar("hostname", ScalarType::String))
                .key(["hostname"])
                .capabilities(RETRIEVE_JOIN)],
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
                .capabilities([Capability::Retrieve])],
        )
        .unwrap();

    let err = planner(Arc::new(registry))
        .plan(&PlanRequest::new("node", ["hostname", "load"]))
        .unwrap_err();
    assert_eq!(
        err,
        PlanningError::NoCapablePlatform {
            type_name: "node".to_string(),
            capability: Capability::Join,
            fields: vec!["load".to_string()],
        }
    );
}

#[test]
fn test_filter_pushdown_follows_selection() {
    let filter = Filter::new("slice", "slice_hrn", FilterOp::Eq, json!("ple.inria.heartbeat"));
    let request = PlanRequest::new("slice", ["slice_description"]).with_filter(filter.clone());

    let plan = planner(sfa(&RETRIEVE_JOIN)).plan(&request).unwrap();
    assert_eq!(plan.steps[0].filters, vec![filter.clone()]);
    assert!(!plan.steps[0].pushdown.selection);
    assert!(plan.steps[0].fields.contains("slice_hrn"));

    let caps = [Capability::Retrieve, Capability::Join, Capability::Selection, Capability::Projection];
    let plan = planner(sfa(&caps)).plan(&request).unwrap();
    assert!(plan.steps[0].pushdown.selection);
    assert!(plan.steps[0].pushdown.projection);
}

#[test]
fn test_request_errors() {
    let planner = planner(sfa(&RETRIEVE_JOIN));

    assert_eq!(
        planner.plan(&PlanRequest::new("slice", Vec::<String>::new())),
        Err(PlanningError::EmptyRequest)
    );
    assert_eq!(
        planner.plan(&PlanRequest::new("hop", ["ttl"])),
        Err(PlanningError::UnknownType("hop".to_string()))
    );
    assert_eq!(
        planner.plan(&PlanRequest::new("slice", ["ttl"])),
        Err(PlanningError::UnknownField {
            type_name: "slice".to_string(),
            field: "ttl".to_string()
        })
    );
}

#[test]
fn test_alias_resolves_root() {
    let registry = Registry::with_aliases(AliasTable::new().with("resource", "node"));
    registry
        .merge(
            "ple",
            "1",
            &[TypeDecl::new("node")
                .field(FieldDecl::scalar("hostname", ScalarType::String))
                .key(["hostname"])
                .capabilities(RETRIEVE_JOIN)],
        )
        .unwrap();

    let plan = planner(Arc::new(registry))
        .plan(&PlanRequest::new("resource", ["hostname"]))
        .unwrap();
    assert_eq!(plan.root_type, "node");
    assert_eq!(plan.steps[0].type_name, "node");
}

#[test]
fn test_plan_is_deterministic() {
    let planner = planner(sfa(&RETRIEVE_JOIN));
    let request = PlanRequest::new("slice", ["slice_hrn", "user_email", "name"]);

    let first = planner.plan(&request).unwrap();
    let second = planner.plan(&request).unwrap();
    assert_eq!(first.fingerprint(), second.fingerprint());
    // `name` resolves on authority, one hop from slice
    assert_eq!(first.steps.len(), 3);
}

#[test]
fn test_planning_concurrent_with_unrelated_merges() {
    let registry = sfa(&RETRIEVE_JOIN);
    let planner = planner(registry.clone());
    let request = PlanRequest::new("slice", ["slice_hrn", "user_email"]);
    let expected = planner.plan(&request).unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..50 {
                registry
                    .merge(
                        "tdmi",
                        &i.to_string(),
                        &[TypeDecl::new("hop")
                            .field(FieldDecl::scalar("ttl", ScalarType::Unsigned))
                            .key(["ttl"])
                            .capabilities(RETRIEVE_JOIN)],
                    )
                    .unwrap();
            }
        });
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..50 {
                    assert_eq!(planner.plan(&request).unwrap(), expected);
                }
            });
        }
    });
}
