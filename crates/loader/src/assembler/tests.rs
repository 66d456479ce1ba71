use super::*;
use crate::config::LoaderConfig;
use crate::executor::SimpleRow;
use crate::identity::SlotState;
use crate::metadata::{AssociationDescriptor, EntityDescriptor, MetadataRegistry};
use crate::plan::FetchPlanBuilder;
use crate::tests::fixtures::{shop_metadata, RowBuilder};

fn plan_for(metadata: &MetadataRegistry, root: &str, lock: LockMode) -> FetchPlan {
    let config = LoaderConfig::default();
    FetchPlanBuilder::new(metadata, &config)
        .build(root, lock, &[], &[])
        .unwrap()
}

fn plan(root: &str) -> FetchPlan {
    plan_for(&shop_metadata(), root, LockMode::None)
}

fn boxed(rows: Vec<SimpleRow>) -> Vec<Box<dyn DatabaseRow>> {
    rows.into_iter()
        .map(|row| Box::new(row) as Box<dyn DatabaseRow>)
        .collect()
}

fn assemble(
    plan: &FetchPlan,
    registry: &mut IdentityRegistry,
    policy: RowPolicy,
    rows: Vec<SimpleRow>,
) -> LoadResult<Assembly> {
    RowAssembler::new(plan, registry, policy, None).assemble(&boxed(rows))
}

fn customer_row(plan: &FetchPlan, id: i64, address: Option<i64>) -> SimpleRow {
    let row = RowBuilder::new(plan)
        .set("", "id", id)
        .set("", "name", format!("customer {}", id));
    match address {
        Some(address) => row
            .set("", "address_id", address)
            .set("address", "id", address)
            .set("address", "street", "Main St")
            .build(),
        None => row.build(),
    }
}

#[test]
fn test_outer_join_without_match_is_absent() {
    let plan = plan("Customer");
    let mut registry = IdentityRegistry::new();

    let assembly = assemble(
        &plan,
        &mut registry,
        RowPolicy::MultiRow,
        vec![customer_row(&plan, 1, Some(10)), customer_row(&plan, 2, None)],
    )
    .unwrap();

    assert_eq!(assembly.roots.len(), 2);
    let with_address = registry.get(assembly.roots[0]).unwrap();
    let address = registry
        .resolve(&EntityKey::new("Address", 10i64))
        .unwrap();
    assert_eq!(
        with_address.association("address"),
        Some(&AssociationValue::ToOne(Some(address)))
    );
    assert_eq!(
        registry.get(assembly.roots[1]).unwrap().association("address"),
        Some(&AssociationValue::ToOne(None))
    );
    assert_eq!(registry.placeholder_count(), 0);
    assert_eq!(assembly.hydrated.len(), 3);
}

#[test]
fn test_dangling_reference_follows_not_found_action() {
    let plan = plan("Customer");
    let mut registry = IdentityRegistry::new();
    let row = RowBuilder::new(&plan)
        .set("", "id", 3i64)
        .set("", "address_id", 99i64)
        .build();

    let assembly = assemble(&plan, &mut registry, RowPolicy::SingleRow, vec![row]).unwrap();
    assert_eq!(
        registry.get(assembly.roots[0]).unwrap().association("address"),
        Some(&AssociationValue::ToOne(None))
    );

    let strict = MetadataRegistry::new();
    strict
        .register(EntityDescriptor::new("Invoice", "invoices").with_association(
            AssociationDescriptor::to_one("customer", "Customer", "customer_id")
                .with_fetch(FetchStrategy::Join),
        ))
        .unwrap();
    strict
        .register(EntityDescriptor::new("Customer", "customers"))
        .unwrap();
    let plan = plan_for(&strict, "Invoice", LockMode::None);
    let row = RowBuilder::new(&plan)
        .set("", "id", 1i64)
        .set("", "customer_id", 42i64)
        .build();

    let mut registry = IdentityRegistry::new();
    let err = assemble(&plan, &mut registry, RowPolicy::SingleRow, vec![row]).unwrap_err();
    assert!(matches!(err, LoadError::EntityNotFound { .. }));
    // The failed row leaves nothing behind
    assert!(registry.is_empty());
}

#[test]
fn test_join_fan_out_yields_one_root() {
    let plan = plan("Order");
    let mut registry = IdentityRegistry::new();
    let row = |line: Option<i64>, part: Option<i64>| {
        let mut row = RowBuilder::new(&plan)
            .set("", "id", 1i64)
            .set("", "total", 30.0f64)
            .set("", "version", 1i64)
            .set("", "customer_id", 7i64);
        if let Some(line) = line {
            row = row.set("lines", "id", line).set("lines", "sku", "A");
        }
        if let Some(part) = part {
            row = row.set("lines.parts", "id", part);
        }
        row.build()
    };

    let assembly = assemble(
        &plan,
        &mut registry,
        RowPolicy::SingleRow,
        vec![
            row(Some(1), Some(100)),
            row(Some(1), Some(101)),
            row(Some(2), None),
        ],
    )
    .unwrap();

    assert_eq!(assembly.roots.len(), 1);
    assert_eq!(assembly.rows.len(), 1);
    let order = registry.get(assembly.roots[0]).unwrap();
    let Some(AssociationValue::Collection(lines)) = order.association("lines") else {
        panic!("lines not initialized");
    };
    assert_eq!(lines.len(), 2);

    let first_line = registry.get(lines[0]).unwrap();
    assert_eq!(
        first_line.association("parts").map(AssociationValue::loaded_ids),
        Some(vec![
            registry.resolve(&EntityKey::new("Part", 100i64)).unwrap(),
            registry.resolve(&EntityKey::new("Part", 101i64)).unwrap(),
        ])
    );
    assert_eq!(
        registry.get(lines[1]).unwrap().association("parts"),
        Some(&AssociationValue::Collection(Vec::new()))
    );
}

#[test]
fn test_single_row_policy_rejects_second_row() {
    let plan = plan("Address");
    let address = |id: i64| RowBuilder::new(&plan).set("", "id", id).build();

    let mut registry = IdentityRegistry::new();
    let err = assemble(
        &plan,
        &mut registry,
        RowPolicy::SingleRow,
        vec![address(1), address(2)],
    )
    .unwrap_err();
    assert!(matches!(err, LoadError::NonUniqueResult { .. }));

    let mut registry = IdentityRegistry::new();
    let err = assemble(
        &plan,
        &mut registry,
        RowPolicy::SingleRow,
        vec![address(1), address(1)],
    )
    .unwrap_err();
    assert!(matches!(err, LoadError::NonUniqueResult { .. }));

    let mut registry = IdentityRegistry::new();
    let assembly = assemble(
        &plan,
        &mut registry,
        RowPolicy::MultiRow,
        vec![address(1), address(2), address(1)],
    )
    .unwrap();
    assert_eq!(assembly.roots.len(), 2);
    assert!(RowPolicy::SingleRow.is_single_row_loader());
    assert!(!RowPolicy::MultiRow.is_single_row_loader());
}

#[test]
fn test_self_reference_resolves_to_same_instance() {
    let plan = plan("Employee");
    let mut registry = IdentityRegistry::new();
    let row = RowBuilder::new(&plan)
        .set("", "id", 1i64)
        .set("", "manager_id", 1i64)
        .set("manager", "id", 1i64)
        .set("manager", "manager_id", 1i64)
        .build();

    let assembly = assemble(&plan, &mut registry, RowPolicy::SingleRow, vec![row]).unwrap();
    let boss = assembly.roots[0];

    assert_eq!(registry.len(), 1);
    let slot = registry.get(boss).unwrap();
    assert_eq!(slot.association("manager"), Some(&AssociationValue::ToOne(Some(boss))));
    assert!(slot.is_complete());
}

#[test]
fn test_deferred_associations_produce_pending_work() {
    let plan = plan("Order");
    let mut registry = IdentityRegistry::new();
    let row = RowBuilder::new(&plan)
        .set("", "id", 5i64)
        .set("", "version", 1i64)
        .set("", "customer_id", 7i64)
        .build();

    let assembly = assemble(&plan, &mut registry, RowPolicy::SingleRow, vec![row]).unwrap();
    let order = assembly.roots[0];
    let slot = registry.get(order).unwrap();

    assert_eq!(
        slot.association("customer"),
        Some(&AssociationValue::Reference(EntityKey::new("Customer", 7i64)))
    );
    assert_eq!(slot.association("notes"), Some(&AssociationValue::Uninitialized));
    assert_eq!(
        slot.association("detail"),
        Some(&AssociationValue::Reference(EntityKey::new("OrderDetail", 5i64)))
    );

    assert!(assembly.pending.contains(&PendingLoad::ByKey {
        owner: order,
        association: "customer".into(),
        key: EntityKey::new("Customer", 7i64),
        strategy: FetchStrategy::Batch,
    }));
    assert!(assembly.pending.contains(&PendingLoad::ByOwner {
        owner: order,
        owner_entity: "Order".into(),
        association: "notes".into(),
        strategy: FetchStrategy::Subselect,
    }));
    assert!(assembly.pending.contains(&PendingLoad::ByKey {
        owner: order,
        association: "detail".into(),
        key: EntityKey::new("OrderDetail", 5i64),
        strategy: FetchStrategy::Select,
    }));
}

#[test]
fn test_known_reference_is_linked_without_pending_load() {
    let plan = plan("Order");
    let mut registry = IdentityRegistry::new();
    let customer = registry
        .register(EntityKey::new("Customer", 7i64), LoadedState::default())
        .unwrap();
    let row = RowBuilder::new(&plan)
        .set("", "id", 5i64)
        .set("", "customer_id", 7i64)
        .build();

    let assembly = assemble(&plan, &mut registry, RowPolicy::SingleRow, vec![row]).unwrap();
    let slot = registry.get(assembly.roots[0]).unwrap();
    assert_eq!(
        slot.association("customer"),
        Some(&AssociationValue::ToOne(Some(customer)))
    );
    assert!(!assembly
        .pending
        .iter()
        .any(|p| matches!(p, PendingLoad::ByKey { association, .. } if association == "customer")));
}

#[test]
fn test_failed_row_discards_only_its_placeholders() {
    let plan = plan("Order");
    let mut registry = IdentityRegistry::new();
    let good = RowBuilder::new(&plan)
        .set("", "id", 1i64)
        .set("lines", "id", 1i64)
        .build();
    let bad = RowBuilder::new(&plan)
        .set("", "id", 1i64)
        .set("lines", "id", 2i64)
        .set("lines.parts", "id", true)
        .build();

    let err = assemble(&plan, &mut registry, RowPolicy::SingleRow, vec![good, bad]).unwrap_err();
    assert!(matches!(err, LoadError::InvalidIdentifier(_)));

    let order = registry.resolve(&EntityKey::new("Order", 1i64)).unwrap();
    assert!(registry.get(order).unwrap().is_complete());
    assert!(registry.resolve(&EntityKey::new("OrderLine", 1i64)).is_some());
    assert!(registry.resolve(&EntityKey::new("OrderLine", 2i64)).is_none());
    assert_eq!(
        registry
            .get(order)
            .unwrap()
            .association("lines")
            .map(AssociationValue::loaded_ids)
            .map(|ids| ids.len()),
        Some(1)
    );
}

#[test]
fn test_existing_placeholder_is_populated_in_place() {
    let plan = plan("Address");
    let mut registry = IdentityRegistry::new();
    let reserved = registry
        .placeholder(EntityKey::new("Address", 4i64))
        .unwrap();
    let row = RowBuilder::new(&plan)
        .set("", "id", 4i64)
        .set("", "city", "Oslo")
        .build();

    let assembly = assemble(&plan, &mut registry, RowPolicy::SingleRow, vec![row]).unwrap();
    assert_eq!(assembly.roots, vec![reserved]);
    let slot = registry.get(reserved).unwrap();
    assert_eq!(slot.state(), SlotState::Complete);
    assert_eq!(slot.attribute("city"), Some(&DatabaseValue::from("Oslo")));
}

#[test]
fn test_lock_upgrade_checks_version() {
    let metadata = shop_metadata();
    let plan = plan_for(&metadata, "Order", LockMode::Upgrade);
    let row = |version: i64| {
        RowBuilder::new(&plan)
            .set("", "id", 1i64)
            .set("", "version", version)
            .build()
    };

    let mut registry = IdentityRegistry::new();
    let order = registry
        .register(
            EntityKey::new("Order", 1i64),
            LoadedState::default().with_version(Some(DatabaseValue::Int64(1))),
        )
        .unwrap();
    assert_eq!(registry.get(order).unwrap().entry().lock_mode, LockMode::Read);

    let err = assemble(&plan, &mut registry, RowPolicy::SingleRow, vec![row(2)]).unwrap_err();
    assert!(matches!(err, LoadError::ConcurrencyFailure { .. }));
    assert!(err.is_retryable());
    assert_eq!(registry.get(order).unwrap().entry().lock_mode, LockMode::Read);

    assemble(&plan, &mut registry, RowPolicy::SingleRow, vec![row(1)]).unwrap();
    assert_eq!(registry.get(order).unwrap().entry().lock_mode, LockMode::Upgrade);
}

#[test]
fn test_new_instances_record_lock_mode() {
    let metadata = shop_metadata();
    let plan = plan_for(&metadata, "Customer", LockMode::PessimisticRead);
    let mut registry = IdentityRegistry::new();

    let assembly = assemble(
        &plan,
        &mut registry,
        RowPolicy::SingleRow,
        vec![customer_row(&plan, 1, Some(2))],
    )
    .unwrap();

    let customer = registry.get(assembly.roots[0]).unwrap();
    assert_eq!(customer.entry().lock_mode, LockMode::PessimisticRead);
    let address = registry
        .get(registry.resolve(&EntityKey::new("Address", 2i64)).unwrap())
        .unwrap();
    assert_eq!(address.entry().lock_mode, LockMode::Read);
}
