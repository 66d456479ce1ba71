use std::collections::HashSet;

use crate::error::{LoadError, LoadResult};
use crate::key::EntityKey;

/// How repeated root keys across rows are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowPolicy {
    /// The load names one logical row; any second root is an error
    SingleRow,
    /// Each distinct root is a member of the result
    MultiRow,
}

impl RowPolicy {
    pub fn is_single_row_loader(self) -> bool {
        matches!(self, RowPolicy::SingleRow)
    }
}

/// What a row's root key means for the result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowDisposition {
    /// First row for this root
    New,
    /// Same root again, produced by a joined collection
    Repeat,
}

/// Tracks root keys across the rows of one statement
#[derive(Debug)]
pub(crate) struct PolicyState {
    policy: RowPolicy,
    fan_out: bool,
    seen: HashSet<EntityKey>,
    first: Option<EntityKey>,
}

impl PolicyState {
    /// `fan_out` is whether the plan joins a collection
    pub(crate) fn new(policy: RowPolicy, fan_out: bool) -> Self {
        Self {
            policy,
            fan_out,
            seen: HashSet::new(),
            first: None,
        }
    }

    pub(crate) fn observe(&mut self, key: &EntityKey) -> LoadResult<RowDisposition> {
        match self.policy {
            RowPolicy::MultiRow => {
                if self.seen.insert(key.clone()) {
                    Ok(RowDisposition::New)
                } else {
                    Ok(RowDisposition::Repeat)
                }
            }
            RowPolicy::SingleRow => match &self.first {
                None => {
                    self.first = Some(key.clone());
                    Ok(RowDisposition::New)
                }
                Some(first) if first != key => Err(LoadError::NonUniqueResult {
                    entity: key.entity().to_string(),
                    detail: format!("rows for both {} and {}", first, key),
                }),
                Some(_) if self.fan_out => Ok(RowDisposition::Repeat),
                Some(first) => Err(LoadError::NonUniqueResult {
                    entity: key.entity().to_string(),
                    detail: format!("{} returned more than one row without a joined collection", first),
                }),
            },
        }
    }
}
