use std::collections::HashMap;

use crate::error::{LoadError, LoadResult};
use crate::executor::DatabaseRow;
use crate::identity::EntityId;
use crate::key::Identifier;
use crate::value::DatabaseValue;

/// One result row being assembled: the raw values plus what each plan node
/// resolved to so far
#[derive(Debug)]
pub struct ResultRow {
    values: Vec<DatabaseValue>,
    resolved: HashMap<usize, Option<EntityId>>,
}

impl ResultRow {
    /// Read every column of `row`, checking it covers the plan's projection
    pub fn read(row: &dyn DatabaseRow, expected: usize) -> LoadResult<Self> {
        let width = row.column_count();
        if width < expected {
            return Err(LoadError::Column(format!(
                "row has {} column(s), the fetch plan projects {}",
                width, expected
            )));
        }
        let values = (0..width)
            .map(|index| row.get_by_index(index))
            .collect::<LoadResult<Vec<_>>>()?;
        Ok(Self {
            values,
            resolved: HashMap::new(),
        })
    }

    pub fn value(&self, position: usize) -> LoadResult<&DatabaseValue> {
        self.values
            .get(position)
            .ok_or_else(|| LoadError::Column(format!("no value at position {}", position)))
    }

    /// Identifier read from the given positions; `None` when all are null
    pub fn identifier(&self, positions: &[usize]) -> LoadResult<Option<Identifier>> {
        let values = positions
            .iter()
            .map(|p| self.value(*p).cloned())
            .collect::<LoadResult<Vec<_>>>()?;
        Identifier::from_values(&values)
    }

    /// Values after the plan's projection
    pub fn extras(&self, from: usize) -> Vec<DatabaseValue> {
        self.values.get(from..).map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn resolve(&mut self, node: usize, entity: Option<EntityId>) {
        self.resolved.insert(node, entity);
    }

    /// What a node resolved to; `None` if the node was not reached
    pub fn resolved(&self, node: usize) -> Option<Option<EntityId>> {
        self.resolved.get(&node).copied()
    }
}
