use std::collections::BTreeMap;
use std::sync::Arc;

use super::*;
use crate::config::LoaderConfig;
use crate::key::{EntityKey, Identifier};
use crate::metadata::EntityDescriptor;
use crate::plan::{FetchPlan, FetchPlanBuilder};
use crate::tests::fixtures::shop_metadata;
use crate::value::DatabaseValue;

fn plan(root: &str, lock: LockMode, filters: &[&str]) -> FetchPlan {
    let metadata = shop_metadata();
    let config = LoaderConfig::default();
    let filters: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
    FetchPlanBuilder::new(metadata.as_ref(), &config)
        .build(root, lock, &filters, &[])
        .unwrap()
}

fn context(filters: &BTreeMap<String, FilterParams>) -> RenderContext<'_> {
    RenderContext {
        dialect: SqlDialect::PostgreSQL,
        filters,
        tenant: None,
    }
}

#[test]
fn test_render_joined_select_with_filter() {
    let plan = plan("Customer", LockMode::None, &["active"]);
    let filters = BTreeMap::new();
    let statement = SelectRenderer::new(&plan, context(&filters))
        .render(
            &Restriction::Identifiers(vec![Identifier::Integer(1), Identifier::Integer(2)]),
            &[],
        )
        .unwrap();

    assert_eq!(
        statement.sql,
        "SELECT cus0.id AS cus0_id, cus0.name AS cus0_name, cus0.email AS cus0_email, \
         cus0.address_id AS cus0_address_id, add1.id AS add1_id, add1.street AS add1_street, \
         add1.city AS add1_city FROM customers cus0 \
         LEFT OUTER JOIN addresses add1 ON cus0.address_id = add1.id \
         WHERE cus0.id IN ($1, $2) AND (cus0.deleted_at IS NULL)"
    );
    assert_eq!(
        statement.params,
        vec![DatabaseValue::Int64(1), DatabaseValue::Int64(2)]
    );
    assert_eq!(statement.lock_mode, LockMode::None);
}

#[test]
fn test_render_lock_clause_per_dialect() {
    let plan = plan("Address", LockMode::Upgrade, &[]);
    let filters = BTreeMap::new();
    let restriction = Restriction::Identifiers(vec![Identifier::Integer(5)]);

    let statement = SelectRenderer::new(&plan, context(&filters))
        .render(&restriction, &[])
        .unwrap();
    assert!(statement.sql.ends_with("WHERE add0.id = $1 FOR UPDATE OF add0"));
    assert_eq!(statement.lock_mode, LockMode::Upgrade);

    let mysql = RenderContext {
        dialect: SqlDialect::MySQL,
        ..context(&filters)
    };
    let statement = SelectRenderer::new(&plan, mysql)
        .render(&restriction, &[])
        .unwrap();
    assert!(statement.sql.ends_with("WHERE add0.id = ? FOR UPDATE"));

    let sqlite = RenderContext {
        dialect: SqlDialect::SQLite,
        ..context(&filters)
    };
    assert!(matches!(
        SelectRenderer::new(&plan, sqlite).render(&restriction, &[]),
        Err(LoadError::Configuration(_))
    ));
}

#[test]
fn test_lock_clauses() {
    let pg = SqlDialect::PostgreSQL;
    assert_eq!(pg.lock_clause(LockMode::None, "a").unwrap(), None);
    assert_eq!(pg.lock_clause(LockMode::Read, "a").unwrap(), None);
    assert_eq!(
        pg.lock_clause(LockMode::PessimisticRead, "a").unwrap().as_deref(),
        Some("FOR SHARE OF a")
    );
    assert_eq!(
        pg.lock_clause(LockMode::UpgradeNoWait, "a").unwrap().as_deref(),
        Some("FOR UPDATE OF a NOWAIT")
    );
    assert_eq!(
        SqlDialect::MySQL
            .lock_clause(LockMode::PessimisticRead, "a")
            .unwrap()
            .as_deref(),
        Some("LOCK IN SHARE MODE")
    );
}

#[test]
fn test_filter_parameters_are_bound() {
    let mut params = FilterParams::new();
    params.insert("tenant".to_string(), DatabaseValue::from("acme"));

    let mut w = SqlWriter::new(SqlDialect::PostgreSQL);
    w.push_str("a.x = ");
    w.push_param(DatabaseValue::Int64(1));
    w.push_str(" AND ");
    w.push_condition(
        "scoped",
        "a.owner = :tenant AND a.kind::text <> ':skip'",
        Some(&params),
    )
    .unwrap();
    let (sql, bound) = w.finish();

    assert_eq!(sql, "a.x = $1 AND a.owner = $2 AND a.kind::text <> ':skip'");
    assert_eq!(bound, vec![DatabaseValue::Int64(1), DatabaseValue::from("acme")]);

    let mut w = SqlWriter::new(SqlDialect::PostgreSQL);
    assert!(matches!(
        w.push_condition("scoped", "a.owner = :tenant", None),
        Err(LoadError::Configuration(_))
    ));
}

#[test]
fn test_composite_identifiers_and_tenant() {
    let registry = crate::metadata::MetadataRegistry::new();
    registry
        .register(
            EntityDescriptor::new("Shipment", "shipments")
                .with_id_columns(&["region", "number"])
                .with_tenant_column("tenant_id"),
        )
        .unwrap();
    let config = LoaderConfig::default();
    let plan = FetchPlanBuilder::new(&registry, &config)
        .build("Shipment", LockMode::None, &[], &[])
        .unwrap();
    let filters = BTreeMap::new();
    let ctx = RenderContext {
        tenant: Some("acme"),
        ..context(&filters)
    };

    let ids = vec![
        Identifier::Composite(vec!["eu".into(), 1i64.into()]),
        Identifier::Composite(vec!["us".into(), 2i64.into()]),
    ];
    let statement = SelectRenderer::new(&plan, ctx)
        .render(&Restriction::Identifiers(ids), &[])
        .unwrap();
    assert!(statement.sql.ends_with(
        "WHERE ((shi0.region = $1 AND shi0.number = $2) OR (shi0.region = $3 AND shi0.number = $4)) \
         AND shi0.tenant_id = $5"
    ));
    assert_eq!(statement.params.len(), 5);
    assert_eq!(statement.params[4], DatabaseValue::from("acme"));
}

#[test]
fn test_subselect_restriction_reuses_origin_query() {
    let orders = Arc::new(plan("Order", LockMode::None, &[]));
    let notes = plan("Note", LockMode::None, &[]);
    let filters = BTreeMap::new();

    let restriction = Restriction::Subselect {
        columns: vec!["order_id".to_string()],
        origin: Box::new(OriginQuery {
            plan: orders,
            restriction: Restriction::Identifiers(vec![
                Identifier::Integer(1),
                Identifier::Integer(2),
            ]),
        }),
    };
    let statement = SelectRenderer::new(&notes, context(&filters))
        .render(&restriction, &["order_id".to_string()])
        .unwrap();

    assert_eq!(
        statement.sql,
        "SELECT not0.id AS not0_id, not0.body AS not0_body, not0.order_id AS not0_extra0 \
         FROM notes not0 WHERE not0.order_id IN \
         (SELECT ord0.id FROM orders ord0 WHERE ord0.id IN ($1, $2))"
    );
    assert_eq!(statement.params.len(), 2);
}

#[test]
fn test_render_lock_statement() {
    let metadata = shop_metadata();
    let order = metadata.get("Order").unwrap();
    let filters = BTreeMap::new();

    let statement = render_lock(
        context(&filters),
        &order,
        &EntityKey::new("Order", 7i64),
        LockMode::UpgradeNoWait,
    )
    .unwrap();
    assert_eq!(
        statement.sql,
        "SELECT lck.id AS lck_id, lck.version AS lck_version FROM orders lck \
         WHERE lck.id = $1 FOR UPDATE OF lck NOWAIT"
    );
    assert_eq!(statement.params, vec![DatabaseValue::Int64(7)]);

    let statement = render_lock(
        context(&filters),
        &order,
        &EntityKey::new("Order", 7i64),
        LockMode::Read,
    )
    .unwrap();
    assert!(statement.sql.ends_with("WHERE lck.id = $1"));
}

#[test]
fn test_dialect_from_str() {
    assert_eq!("postgres".parse::<SqlDialect>().unwrap(), SqlDialect::PostgreSQL);
    assert_eq!("MySQL".parse::<SqlDialect>().unwrap(), SqlDialect::MySQL);
    assert!("oracle".parse::<SqlDialect>().is_err());
}
