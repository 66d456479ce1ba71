use super::*;
use crate::identity::LoadedState;
use crate::tests::fixtures::shop_metadata;

fn employee(registry: &mut IdentityRegistry, id: i64) -> EntityId {
    registry
        .register(EntityKey::new("Employee", id), LoadedState::default())
        .unwrap()
}

fn walk_all(
    registry: &IdentityRegistry,
    descriptor: &EntityDescriptor,
    mut walk: CascadeWalk,
) -> LoadResult<Vec<EntityId>> {
    while let Some(step) = walk.next_step()? {
        walk.push_children(registry, descriptor, &step)?;
    }
    Ok(walk.visited().to_vec())
}

#[test]
fn test_policy_membership() {
    let policy = CascadePolicy::none().with(CascadeKind::Delete);

    assert!(policy.includes(CascadeAction::Delete));
    assert!(!policy.includes(CascadeAction::Load));
    assert!(CascadePolicy::all().includes(CascadeAction::Lock(LockMode::Upgrade)));
    assert!(CascadePolicy::none().is_empty());
    assert_eq!(
        CascadePolicy::of(&[CascadeKind::Evict, CascadeKind::Lock]),
        CascadePolicy::none().with(CascadeKind::Lock).with(CascadeKind::Evict)
    );
}

#[test]
fn test_policy_serializes_as_list() {
    let policy = CascadePolicy::of(&[CascadeKind::Refresh, CascadeKind::Load]);
    let json = serde_json::to_string(&policy).unwrap();
    assert_eq!(json, r#"["load","refresh"]"#);
    let parsed: CascadePolicy = serde_json::from_str(r#"["delete"]"#).unwrap();
    assert!(parsed.includes(CascadeAction::Delete));
}

#[test]
fn test_action_materialization_and_display() {
    assert!(CascadeAction::Delete.requires_materialization());
    assert!(CascadeAction::Load.requires_materialization());
    assert!(!CascadeAction::Lock(LockMode::Upgrade).requires_materialization());
    assert!(!CascadeAction::Evict.requires_materialization());
    assert_eq!(CascadeAction::Lock(LockMode::Upgrade).to_string(), "lock(UPGRADE)");
    assert_eq!(CascadeAction::Refresh.to_string(), "refresh");
}

#[test]
fn test_cycle_is_visited_once() {
    let metadata = shop_metadata();
    let descriptor = metadata.get("Employee").unwrap();
    let mut registry = IdentityRegistry::new();
    let boss = employee(&mut registry, 1);
    let alice = employee(&mut registry, 2);
    let bob = employee(&mut registry, 3);
    registry
        .set_association(boss, "reports", AssociationValue::Collection(vec![alice, bob]))
        .unwrap();
    registry
        .set_association(alice, "reports", AssociationValue::Collection(vec![boss]))
        .unwrap();
    registry
        .set_association(bob, "reports", AssociationValue::Collection(vec![alice, bob]))
        .unwrap();

    let walk = CascadeWalk::new(
        CascadeAction::Evict,
        boss,
        EntityKey::new("Employee", 1i64),
        100,
    );
    let visited = walk_all(&registry, &descriptor, walk).unwrap();

    assert_eq!(visited, vec![boss, alice, bob]);
}

#[test]
fn test_only_cascading_associations_are_followed() {
    let metadata = shop_metadata();
    let descriptor = metadata.get("Employee").unwrap();
    let mut registry = IdentityRegistry::new();
    let worker = employee(&mut registry, 1);
    let manager = employee(&mut registry, 2);
    let report = employee(&mut registry, 3);
    registry
        .set_association(worker, "manager", AssociationValue::ToOne(Some(manager)))
        .unwrap();
    registry
        .set_association(worker, "reports", AssociationValue::Collection(vec![report]))
        .unwrap();

    let slot = registry.get(worker).unwrap();
    let children: Vec<_> = cascadable_children(slot, &descriptor, CascadeAction::Refresh).collect();
    assert_eq!(children, vec![("reports", report)]);
}

#[test]
fn test_unloaded_associations_are_reported() {
    let metadata = shop_metadata();
    let descriptor = metadata.get("Order").unwrap();
    let mut registry = IdentityRegistry::new();
    let order = registry
        .register(EntityKey::new("Order", 1i64), LoadedState::default())
        .unwrap();
    registry
        .set_association(order, "lines", AssociationValue::Uninitialized)
        .unwrap();

    let slot = registry.get(order).unwrap();
    let unloaded: Vec<_> = unloaded_associations(slot, &descriptor, CascadeAction::Delete).collect();
    assert_eq!(unloaded, vec!["lines"]);
    assert_eq!(
        cascadable_children(slot, &descriptor, CascadeAction::Delete).count(),
        0
    );
}

#[test]
fn test_runaway_graph_trips_guard() {
    let metadata = shop_metadata();
    let descriptor = metadata.get("Employee").unwrap();
    let mut registry = IdentityRegistry::new();
    let ids: Vec<_> = (1..=5).map(|i| employee(&mut registry, i)).collect();
    for pair in ids.windows(2) {
        registry
            .set_association(pair[0], "reports", AssociationValue::Collection(vec![pair[1]]))
            .unwrap();
    }

    let walk = CascadeWalk::new(
        CascadeAction::Evict,
        ids[0],
        EntityKey::new("Employee", 1i64),
        3,
    );
    let err = walk_all(&registry, &descriptor, walk).unwrap_err();
    assert!(matches!(err, LoadError::OverflowGuard(_)));
}

#[test]
fn test_failure_carries_path() {
    let metadata = shop_metadata();
    let descriptor = metadata.get("Employee").unwrap();
    let mut registry = IdentityRegistry::new();
    let boss = employee(&mut registry, 1);
    let middle = employee(&mut registry, 2);
    let leaf = employee(&mut registry, 3);
    registry
        .set_association(boss, "reports", AssociationValue::Collection(vec![middle]))
        .unwrap();
    registry
        .set_association(middle, "reports", AssociationValue::Collection(vec![leaf]))
        .unwrap();

    let action = CascadeAction::Lock(LockMode::Upgrade);
    let mut walk = CascadeWalk::new(action, boss, EntityKey::new("Employee", 1i64), 10);
    let mut last = None;
    while let Some(step) = walk.next_step().unwrap() {
        walk.push_children(&registry, &descriptor, &step).unwrap();
        last = Some(step);
    }
    let step = last.unwrap();
    assert_eq!(step.id, leaf);

    let err = step.wrap(action, LoadError::concurrency("Employee", 3, "row locked"));
    match &err {
        LoadError::Cascade {
            owner,
            association,
            element,
            path,
            ..
        } => {
            assert_eq!(owner, "Employee#2");
            assert_eq!(association, "reports");
            assert_eq!(element, "Employee#3");
            assert_eq!(path, "Employee#1.reports -> Employee#2.reports");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.is_retryable());

    let root = CascadeStep {
        id: boss,
        key: EntityKey::new("Employee", 1i64),
        via: None,
    };
    assert!(matches!(
        root.wrap(action, LoadError::Database("down".into())),
        LoadError::Database(_)
    ));
}
