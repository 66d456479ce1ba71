use std::collections::BTreeMap;
use std::sync::Arc;

use super::SqlDialect;
use crate::error::{LoadError, LoadResult};
use crate::executor::Statement;
use crate::key::{EntityKey, Identifier};
use crate::lock::LockMode;
use crate::metadata::EntityDescriptor;
use crate::plan::{AppliedFilter, FetchPlan};
use crate::value::DatabaseValue;

/// Parameter values of an enabled filter
pub type FilterParams = BTreeMap<String, DatabaseValue>;

/// Which rows of the plan's root a statement reads
#[derive(Debug, Clone, PartialEq)]
pub enum Restriction {
    /// Rows with one of these identifiers
    Identifiers(Vec<Identifier>),
    /// The row whose unique property has this value
    UniqueKey {
        property: String,
        value: DatabaseValue,
    },
    /// Rows whose foreign key columns reference one of these owners
    ForeignKey {
        columns: Vec<String>,
        owners: Vec<Identifier>,
    },
    /// Rows whose foreign key columns reference an owner selected by an
    /// earlier query
    Subselect {
        columns: Vec<String>,
        origin: Box<OriginQuery>,
    },
}

/// The statement that loaded a set of owners, re-used as a subselect
#[derive(Debug, Clone)]
pub struct OriginQuery {
    pub plan: Arc<FetchPlan>,
    pub restriction: Restriction,
}

impl PartialEq for OriginQuery {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.plan, &other.plan) && self.restriction == other.restriction
    }
}

/// Session state a statement depends on
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub dialect: SqlDialect,
    /// Enabled filters and their parameter values
    pub filters: &'a BTreeMap<String, FilterParams>,
    pub tenant: Option<&'a str>,
}

/// SQL text plus bound parameters, in text order
#[derive(Debug)]
pub struct SqlWriter {
    sql: String,
    params: Vec<DatabaseValue>,
    dialect: SqlDialect,
}

impl SqlWriter {
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            sql: String::new(),
            params: Vec::new(),
            dialect,
        }
    }

    pub fn push_str(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    pub fn push_param(&mut self, value: DatabaseValue) {
        let placeholder = self.dialect.parameter_placeholder(self.params.len());
        self.sql.push_str(&placeholder);
        self.params.push(value);
    }

    /// Write a filter condition, binding `:name` tokens from `params`.
    ///
    /// `::` casts and quoted literals are copied as is.
    pub fn push_condition(
        &mut self,
        filter: &str,
        condition: &str,
        params: Option<&FilterParams>,
    ) -> LoadResult<()> {
        let chars: Vec<char> = condition.chars().collect();
        let mut in_quote = false;
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c == '\'' {
                in_quote = !in_quote;
            }
            if in_quote || c != ':' {
                self.sql.push(c);
                i += 1;
                continue;
            }
            if chars.get(i + 1) == Some(&':') {
                self.sql.push_str("::");
                i += 2;
                continue;
            }
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                end += 1;
            }
            if end == start {
                self.sql.push(c);
                i += 1;
                continue;
            }
            let name: String = chars[start..end].iter().collect();
            let value = params.and_then(|p| p.get(&name)).cloned().ok_or_else(|| {
                LoadError::Configuration(format!(
                    "filter '{}' has no value for parameter '{}'",
                    filter, name
                ))
            })?;
            self.push_param(value);
            i = end;
        }
        Ok(())
    }

    pub fn finish(self) -> (String, Vec<DatabaseValue>) {
        (self.sql, self.params)
    }
}

/// Renders the statements of one fetch plan
pub struct SelectRenderer<'a> {
    plan: &'a FetchPlan,
    context: RenderContext<'a>,
}

impl<'a> SelectRenderer<'a> {
    pub fn new(plan: &'a FetchPlan, context: RenderContext<'a>) -> Self {
        Self { plan, context }
    }

    /// Render the plan's SELECT for `restriction`.
    ///
    /// `extra_columns` are root-table columns appended after the plan's
    /// projection, at positions `plan.columns.len()..`.
    pub fn render(&self, restriction: &Restriction, extra_columns: &[String]) -> LoadResult<Statement> {
        let plan = self.plan;
        let root = plan.root_entity();
        let alias = plan.root_alias();
        let mut w = SqlWriter::new(self.context.dialect);

        w.push_str("SELECT ");
        let mut select_list: Vec<String> = plan
            .columns
            .iter()
            .map(|c| format!("{}.{} AS {}", c.alias, c.column, c.label))
            .collect();
        select_list.extend(
            extra_columns
                .iter()
                .enumerate()
                .map(|(i, column)| format!("{}.{} AS {}_extra{}", alias, column, alias, i)),
        );
        w.push_str(&select_list.join(", "));
        w.push_str(&format!(" FROM {} {}", root.table, alias));

        for join in &plan.joins {
            w.push_str(&format!(" LEFT OUTER JOIN {} {} ON ", join.table, join.alias));
            let on: Vec<String> = join
                .on
                .iter()
                .map(|(left, right)| format!("{} = {}", left, right))
                .collect();
            w.push_str(&on.join(" AND "));
            for filter in &join.filters {
                w.push_str(" AND ");
                self.write_filter(&mut w, filter)?;
            }
            if let (Some(column), Some(tenant)) = (&join.tenant_column, self.context.tenant) {
                w.push_str(&format!(" AND {}.{} = ", join.alias, column));
                w.push_param(DatabaseValue::from(tenant));
            }
        }

        w.push_str(" WHERE ");
        self.write_restriction(&mut w, plan, restriction)?;
        self.write_root_conditions(&mut w, plan)?;

        if let Some(clause) = self.context.dialect.lock_clause(plan.lock_mode, alias)? {
            w.push_str(" ");
            w.push_str(&clause);
        }

        let (sql, params) = w.finish();
        Ok(Statement::new(sql, params).with_lock_mode(plan.lock_mode))
    }

    fn write_filter(&self, w: &mut SqlWriter, filter: &AppliedFilter) -> LoadResult<()> {
        w.push_str("(");
        w.push_condition(
            &filter.name,
            &filter.condition,
            self.context.filters.get(&filter.name),
        )?;
        w.push_str(")");
        Ok(())
    }

    /// Root filters and tenant discriminator, each prefixed with AND
    fn write_root_conditions(&self, w: &mut SqlWriter, plan: &FetchPlan) -> LoadResult<()> {
        for filter in &plan.filters {
            w.push_str(" AND ");
            self.write_filter(w, filter)?;
        }
        if let (Some(column), Some(tenant)) =
            (&plan.root_entity().tenant_column, self.context.tenant)
        {
            w.push_str(&format!(" AND {}.{} = ", plan.root_alias(), column));
            w.push_param(DatabaseValue::from(tenant));
        }
        Ok(())
    }

    fn write_restriction(
        &self,
        w: &mut SqlWriter,
        plan: &FetchPlan,
        restriction: &Restriction,
    ) -> LoadResult<()> {
        let alias = plan.root_alias();
        match restriction {
            Restriction::Identifiers(ids) => {
                write_in_list(w, alias, &plan.root_entity().id_columns, ids)
            }
            Restriction::UniqueKey { property, value } => {
                w.push_str(&format!("{}.{} = ", alias, property));
                w.push_param(value.clone());
                Ok(())
            }
            Restriction::ForeignKey { columns, owners } => write_in_list(w, alias, columns, owners),
            Restriction::Subselect { columns, origin } => {
                w.push_str(&column_tuple(alias, columns));
                w.push_str(" IN (SELECT ");
                let origin_alias = origin.plan.root_alias();
                w.push_str(&tuple_items(origin_alias, &origin.plan.root_entity().id_columns));
                w.push_str(&format!(
                    " FROM {} {} WHERE ",
                    origin.plan.root_entity().table,
                    origin_alias
                ));
                self.write_restriction(w, &origin.plan, &origin.restriction)?;
                self.write_root_conditions(w, &origin.plan)?;
                w.push_str(")");
                Ok(())
            }
        }
    }
}

/// `a.c IN (...)`, `a.c = ?`, or an OR of ANDs for composite keys
fn write_in_list(
    w: &mut SqlWriter,
    alias: &str,
    columns: &[String],
    ids: &[Identifier],
) -> LoadResult<()> {
    if ids.is_empty() {
        return Err(LoadError::Configuration(
            "cannot restrict a statement to an empty identifier list".to_string(),
        ));
    }
    if columns.len() == 1 {
        let column = format!("{}.{}", alias, columns[0]);
        if ids.len() == 1 {
            w.push_str(&format!("{} = ", column));
            push_identifier(w, &ids[0], 1)?;
            return Ok(());
        }
        w.push_str(&format!("{} IN (", column));
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                w.push_str(", ");
            }
            push_identifier(w, id, 1)?;
        }
        w.push_str(")");
        return Ok(());
    }

    w.push_str("(");
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            w.push_str(" OR ");
        }
        w.push_str("(");
        for (j, (column, value)) in columns
            .iter()
            .zip(id.to_values(columns.len())?)
            .enumerate()
        {
            if j > 0 {
                w.push_str(" AND ");
            }
            w.push_str(&format!("{}.{} = ", alias, column));
            w.push_param(value);
        }
        w.push_str(")");
    }
    w.push_str(")");
    Ok(())
}

fn push_identifier(w: &mut SqlWriter, id: &Identifier, width: usize) -> LoadResult<()> {
    for value in id.to_values(width)? {
        w.push_param(value);
    }
    Ok(())
}

fn tuple_items(alias: &str, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{}.{}", alias, c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_tuple(alias: &str, columns: &[String]) -> String {
    if columns.len() == 1 {
        tuple_items(alias, columns)
    } else {
        format!("({})", tuple_items(alias, columns))
    }
}

/// Statement that locks (or only re-reads the version of) one row
pub fn render_lock(
    context: RenderContext<'_>,
    entity: &EntityDescriptor,
    key: &EntityKey,
    mode: LockMode,
) -> LoadResult<Statement> {
    let alias = "lck";
    let mut w = SqlWriter::new(context.dialect);
    let mut select_list: Vec<String> = entity
        .id_columns
        .iter()
        .map(|c| format!("{}.{} AS {}_{}", alias, c, alias, c))
        .collect();
    if let Some(version) = &entity.version_column {
        select_list.push(format!("{}.{} AS {}_{}", alias, version, alias, version));
    }
    w.push_str(&format!(
        "SELECT {} FROM {} {} WHERE ",
        select_list.join(", "),
        entity.table,
        alias
    ));
    write_in_list(&mut w, alias, &entity.id_columns, std::slice::from_ref(key.id()))?;
    if let (Some(column), Some(tenant)) = (&entity.tenant_column, key.tenant()) {
        w.push_str(&format!(" AND {}.{} = ", alias, column));
        w.push_param(DatabaseValue::from(tenant));
    }
    if let Some(clause) = context.dialect.lock_clause(mode, alias)? {
        w.push_str(" ");
        w.push_str(&clause);
    }
    let (sql, params) = w.finish();
    Ok(Statement::new(sql, params).with_lock_mode(mode))
}
