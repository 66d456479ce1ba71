//! Shared fixtures for the integration tests: a library mapping and an
//! executor that answers statements from a script

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use elif_loader::{
    AssociationDescriptor, CascadeKind, CascadePolicy, DatabaseRow, DatabaseValue,
    EntityDescriptor, FetchStrategy, LoadError, LoadResult, MetadataRegistry, SimpleRow,
    Statement, StatementExecutor,
};

/// Author -> books (batched, two owners per statement, cascades lock and evict)
/// Book -> author (select), chapters (indexed by position, subselect)
/// Edition keyed by (isbn_group, isbn_number)
pub fn library_metadata() -> Arc<MetadataRegistry> {
    let registry = MetadataRegistry::new()
        .with(
            EntityDescriptor::new("Author", "authors")
                .with_columns(&["name"])
                .with_tenant_column("tenant_id")
                .with_association(
                    AssociationDescriptor::to_many("books", "Book", "author_id")
                        .with_fetch(FetchStrategy::Batch)
                        .with_batch_size(2)
                        .with_cascade(CascadePolicy::of(&[CascadeKind::Lock, CascadeKind::Evict])),
                ),
        )
        .and_then(|r| {
            r.with(
                EntityDescriptor::new("Book", "books")
                    .with_columns(&["title"])
                    .with_association(AssociationDescriptor::to_one("author", "Author", "author_id"))
                    .with_association(
                        AssociationDescriptor::indexed("chapters", "Chapter", "book_id", "position")
                            .with_fetch(FetchStrategy::Subselect),
                    ),
            )
        })
        .and_then(|r| r.with(EntityDescriptor::new("Chapter", "chapters").with_columns(&["title"])))
        .and_then(|r| {
            r.with(
                EntityDescriptor::new("Edition", "editions")
                    .with_id_columns(&["isbn_group", "isbn_number"])
                    .with_columns(&["format"]),
            )
        })
        .expect("library mapping is valid");
    registry
        .validate_targets()
        .expect("library targets are mapped");
    Arc::new(registry)
}

pub type ScriptedRow = Vec<(&'static str, DatabaseValue)>;

/// Answers statements in order; unscripted statements return no rows
#[derive(Default)]
pub struct ScriptedExecutor {
    responses: Mutex<VecDeque<LoadResult<Vec<ScriptedRow>>>>,
    statements: Mutex<Vec<Statement>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, rows: Vec<ScriptedRow>) {
        self.responses.lock().unwrap().push_back(Ok(rows));
    }

    pub fn fail(&self, err: LoadError) {
        self.responses.lock().unwrap().push_back(Err(err));
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.statements.lock().unwrap().clone()
    }
}

fn labels(sql: &str) -> Vec<String> {
    let list = sql
        .strip_prefix("SELECT ")
        .and_then(|rest| rest.split(" FROM ").next())
        .unwrap_or_else(|| panic!("not a select: {}", sql));
    list.split(", ")
        .map(|item| item.rsplit(" AS ").next().unwrap_or(item).to_string())
        .collect()
}

#[async_trait]
impl StatementExecutor for ScriptedExecutor {
    async fn fetch_all(&self, statement: &Statement) -> LoadResult<Vec<Box<dyn DatabaseRow>>> {
        self.statements.lock().unwrap().push(statement.clone());
        let rows = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))?;
        let labels = labels(&statement.sql);
        rows.into_iter()
            .map(|pairs| {
                let values = labels
                    .iter()
                    .map(|label| {
                        pairs
                            .iter()
                            .find(|(l, _)| l == label)
                            .map(|(_, v)| v.clone())
                            .unwrap_or(DatabaseValue::Null)
                    })
                    .collect();
                Ok(Box::new(SimpleRow::new(labels.clone(), values)?) as Box<dyn DatabaseRow>)
            })
            .collect()
    }
}
