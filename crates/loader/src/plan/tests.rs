use super::*;
use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::metadata::{AssociationDescriptor, EntityDescriptor, MetadataRegistry};
use crate::tests::fixtures::shop_metadata;

fn build(root: &str, joins: &[&str]) -> Result<FetchPlan, LoadError> {
    let metadata = shop_metadata();
    let config = LoaderConfig::default();
    let joins: Vec<String> = joins.iter().map(|j| j.to_string()).collect();
    FetchPlanBuilder::new(metadata.as_ref(), &config).build(root, LockMode::None, &[], &joins)
}

#[test]
fn test_root_projection_order() {
    let plan = build("Order", &[]).unwrap();
    let root = plan.root();

    assert_eq!(root.kind, NodeKind::Root);
    assert_eq!(plan.root_alias(), "ord0");
    let labels: Vec<&str> = plan.columns.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(
        &labels[..4],
        &["ord0_id", "ord0_total", "ord0_version", "ord0_customer_id"]
    );
    assert_eq!(root.id_positions, vec![0]);
    assert_eq!(root.version_position, Some(2));
    assert_eq!(
        root.attribute_positions,
        vec![("total".to_string(), 1), ("customer_id".to_string(), 3)]
    );
}

#[test]
fn test_strategies_per_association() {
    let plan = build("Order", &[]).unwrap();

    let customer = plan.node_by_path("customer").unwrap();
    assert_eq!(customer.strategy, FetchStrategy::Batch);
    assert!(!customer.is_read_by_statement());

    let lines = plan.node_by_path("lines").unwrap();
    assert_eq!(lines.kind, NodeKind::ToManyElement);
    assert_eq!(lines.strategy, FetchStrategy::Join);

    // Collections joined at different depths are both allowed
    let parts = plan.node_by_path("lines.parts").unwrap();
    assert_eq!(parts.strategy, FetchStrategy::Join);
    assert_eq!(parts.depth, 2);

    // A second collection at depth one falls back to a subselect
    let notes = plan.node_by_path("notes").unwrap();
    assert_eq!(notes.strategy, FetchStrategy::Subselect);

    // Shared primary key targets are never joined
    let detail = plan.node_by_path("detail").unwrap();
    assert_eq!(detail.strategy, FetchStrategy::Select);
    assert!(detail.alias.is_none());

    assert!(plan.has_collection_join());
    assert_eq!(plan.joins.len(), 2);
    assert_eq!(
        plan.joins[0].on,
        vec![("ord1.order_id".to_string(), "ord0.id".to_string())]
    );
}

#[test]
fn test_to_one_join_condition() {
    let plan = build("Customer", &[]).unwrap();
    let address = plan.node_by_path("address").unwrap();

    assert_eq!(address.kind, NodeKind::ToOne);
    assert_eq!(address.alias.as_deref(), Some("add1"));
    assert_eq!(
        plan.joins[0].on,
        vec![("cus0.address_id".to_string(), "add1.id".to_string())]
    );
    assert!(!plan.has_collection_join());
    assert_eq!(plan.node_by_path("orders").unwrap().strategy, FetchStrategy::Lazy);
}

#[test]
fn test_self_reference_stops_at_repeated_foreign_key() {
    let plan = build("Employee", &[]).unwrap();

    assert_eq!(plan.node_by_path("manager").unwrap().strategy, FetchStrategy::Join);
    assert_eq!(
        plan.node_by_path("manager.manager").unwrap().strategy,
        FetchStrategy::Select
    );
    assert_eq!(plan.joins.len(), 1);
}

#[test]
fn test_requested_join_bypasses_mapping() {
    let plan = build("Customer", &["orders"]).unwrap();
    let orders = plan.node_by_path("orders").unwrap();
    assert_eq!(orders.strategy, FetchStrategy::Join);
    assert!(orders.requested);

    // Joined orders bring their own mapped joins below them
    assert_eq!(
        plan.node_by_path("orders.lines").unwrap().strategy,
        FetchStrategy::Join
    );
}

#[test]
fn test_requested_second_collection_is_rejected() {
    let err = build("Order", &["notes"]).unwrap_err();
    assert!(matches!(err, LoadError::MappingInconsistency { .. }));
    assert!(err.is_build_time());
}

#[test]
fn test_unknown_requested_path_is_rejected() {
    let err = build("Order", &["invoices"]).unwrap_err();
    assert!(matches!(err, LoadError::MappingInconsistency { .. }));
}

#[test]
fn test_depth_limit_downgrades_joins() {
    let metadata = shop_metadata();
    let config = LoaderConfig::default().with_max_fetch_depth(1);
    let plan = FetchPlanBuilder::new(metadata.as_ref(), &config)
        .build("Order", LockMode::None, &[], &[])
        .unwrap();

    assert_eq!(plan.node_by_path("lines").unwrap().strategy, FetchStrategy::Join);
    assert_eq!(
        plan.node_by_path("lines.parts").unwrap().strategy,
        FetchStrategy::Select
    );
}

#[test]
fn test_plan_node_limit() {
    let metadata = shop_metadata();
    let config = LoaderConfig {
        max_plan_nodes: 3,
        ..Default::default()
    };
    let err = FetchPlanBuilder::new(metadata.as_ref(), &config)
        .build("Order", LockMode::None, &[], &[])
        .unwrap_err();
    assert!(matches!(err, LoadError::OverflowGuard(_)));
}

#[test]
fn test_alias_collision_and_unknown_target() {
    let registry = MetadataRegistry::new();
    registry
        .register(
            EntityDescriptor::new("Order", "orders")
                .with_association(
                    AssociationDescriptor::to_one("buyer", "Customer", "buyer_id")
                        .with_fetch(FetchStrategy::Join)
                        .with_alias("c"),
                )
                .with_association(
                    AssociationDescriptor::to_one("seller", "Customer", "seller_id")
                        .with_fetch(FetchStrategy::Join)
                        .with_alias("c"),
                ),
        )
        .unwrap();
    let config = LoaderConfig::default();
    let builder = FetchPlanBuilder::new(&registry, &config);

    let err = builder.build("Order", LockMode::None, &[], &[]).unwrap_err();
    assert!(err.to_string().contains("Customer"), "{}", err);

    registry
        .register(EntityDescriptor::new("Customer", "customers"))
        .unwrap();
    let err = builder.build("Order", LockMode::None, &[], &[]).unwrap_err();
    assert!(err.to_string().contains("alias 'c'"), "{}", err);
}

#[test]
fn test_filters_are_applied_per_alias() {
    let metadata = shop_metadata();
    let config = LoaderConfig::default();
    let builder = FetchPlanBuilder::new(metadata.as_ref(), &config);
    let filters = vec!["active".to_string()];

    let plan = builder
        .build("Customer", LockMode::None, &filters, &[])
        .unwrap();
    assert_eq!(plan.filters.len(), 1);
    assert_eq!(plan.filters[0].condition, "cus0.deleted_at IS NULL");

    // Joined customers carry the filter in their join clause
    let plan = builder
        .build("Order", LockMode::None, &filters, &["customer".to_string()])
        .unwrap();
    assert!(plan.filters.is_empty());
    let join = plan
        .joins
        .iter()
        .find(|j| j.table == "customers")
        .unwrap();
    assert_eq!(join.filters[0].condition, format!("{}.deleted_at IS NULL", join.alias));
}

#[test]
fn test_write_lock_cannot_be_requested() {
    let metadata = shop_metadata();
    let config = LoaderConfig::default();
    let err = FetchPlanBuilder::new(metadata.as_ref(), &config)
        .build("Order", LockMode::Write, &[], &[])
        .unwrap_err();
    assert!(matches!(err, LoadError::Configuration(_)));
}

#[test]
fn test_plan_cache_reuses_plans() {
    let metadata = shop_metadata();
    let config = LoaderConfig::default();
    let builder = FetchPlanBuilder::new(metadata.as_ref(), &config);
    let cache = PlanCache::new();

    let key = PlanKey::new("Order", LockMode::None).with_filters(["b", "a", "a"]);
    assert_eq!(key.filters, vec!["a".to_string(), "b".to_string()]);

    let first = cache.get_or_build(&key, &builder).unwrap();
    let second = cache.get_or_build(&key, &builder).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let locked = PlanKey::new("Order", LockMode::Upgrade);
    let third = cache.get_or_build(&locked, &builder).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(third.lock_mode, LockMode::Upgrade);

    let stats = cache.stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);

    cache.invalidate("Order");
    assert_eq!(cache.stats().entries, 0);
}
