//! Cascade Executor - propagates an action along cascading associations
//!
//! The walk is iterative: an explicit stack of steps and a visited set keyed
//! by [`EntityId`], so cyclic graphs visit each instance once and deep graphs
//! cannot overflow the call stack. The session drives the walk because most
//! actions need I/O.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, LoadResult};
use crate::identity::{AssociationValue, EntityId, EntitySlot, IdentityRegistry};
use crate::key::EntityKey;
use crate::lock::LockMode;
use crate::metadata::EntityDescriptor;

/// Action propagated across associations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeAction {
    Load,
    Refresh,
    Delete,
    Lock(LockMode),
    Evict,
}

impl CascadeAction {
    pub fn kind(self) -> CascadeKind {
        match self {
            CascadeAction::Load => CascadeKind::Load,
            CascadeAction::Refresh => CascadeKind::Refresh,
            CascadeAction::Delete => CascadeKind::Delete,
            CascadeAction::Lock(_) => CascadeKind::Lock,
            CascadeAction::Evict => CascadeKind::Evict,
        }
    }

    /// Whether unloaded associations must be loaded before cascading.
    ///
    /// A delete has to reach every element; lock, refresh and evict only
    /// touch what is already in memory.
    pub fn requires_materialization(self) -> bool {
        matches!(self, CascadeAction::Load | CascadeAction::Delete)
    }
}

impl std::fmt::Display for CascadeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CascadeAction::Lock(mode) => write!(f, "lock({})", mode),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Action type named in a cascade policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeKind {
    Load,
    Refresh,
    Delete,
    Lock,
    Evict,
}

impl CascadeKind {
    pub const ALL: [CascadeKind; 5] = [
        CascadeKind::Load,
        CascadeKind::Refresh,
        CascadeKind::Delete,
        CascadeKind::Lock,
        CascadeKind::Evict,
    ];
}

impl std::fmt::Display for CascadeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CascadeKind::Load => "load",
            CascadeKind::Refresh => "refresh",
            CascadeKind::Delete => "delete",
            CascadeKind::Lock => "lock",
            CascadeKind::Evict => "evict",
        };
        write!(f, "{}", name)
    }
}

/// Set of actions an association cascades
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CascadePolicy(BTreeSet<CascadeKind>);

impl CascadePolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self(CascadeKind::ALL.into_iter().collect())
    }

    pub fn of(kinds: &[CascadeKind]) -> Self {
        Self(kinds.iter().copied().collect())
    }

    pub fn with(mut self, kind: CascadeKind) -> Self {
        self.0.insert(kind);
        self
    }

    pub fn includes(&self, action: CascadeAction) -> bool {
        self.0.contains(&action.kind())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Loaded elements of associations that cascade `action`, in mapping order.
///
/// Single pass and lazy; unloaded values yield nothing.
pub fn cascadable_children<'a>(
    slot: &'a EntitySlot,
    descriptor: &'a EntityDescriptor,
    action: CascadeAction,
) -> impl Iterator<Item = (&'a str, EntityId)> + 'a {
    descriptor
        .associations
        .iter()
        .filter(move |association| association.cascade.includes(action))
        .flat_map(move |association| {
            let elements: Box<dyn Iterator<Item = EntityId> + 'a> =
                match slot.association(&association.name) {
                    Some(AssociationValue::ToOne(Some(id))) => Box::new(std::iter::once(*id)),
                    Some(AssociationValue::Collection(ids)) => Box::new(ids.iter().copied()),
                    Some(AssociationValue::Indexed(map)) => Box::new(map.values().copied()),
                    _ => Box::new(std::iter::empty()),
                };
            elements.map(move |id| (association.name.as_str(), id))
        })
}

/// Cascading associations of `slot` that are not initialized yet
pub fn unloaded_associations<'a>(
    slot: &'a EntitySlot,
    descriptor: &'a EntityDescriptor,
    action: CascadeAction,
) -> impl Iterator<Item = &'a str> + 'a {
    descriptor
        .associations
        .iter()
        .filter(move |association| association.cascade.includes(action))
        .filter(move |association| {
            slot.association(&association.name)
                .map_or(true, |value| !value.is_initialized())
        })
        .map(|association| association.name.as_str())
}

/// How a step was reached from its owner
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeEdge {
    pub owner: EntityKey,
    pub association: String,
    /// Path from the root to the association, e.g. `Order#1.lines`
    pub path: String,
}

/// One instance the action is applied to
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeStep {
    pub id: EntityId,
    pub key: EntityKey,
    /// `None` for the root
    pub via: Option<CascadeEdge>,
}

impl CascadeStep {
    fn trail(&self) -> String {
        match &self.via {
            Some(edge) => format!("{} -> {}", edge.path, self.key),
            None => self.key.to_string(),
        }
    }

    /// Attach owner, association, element and path to a failure.
    ///
    /// Failures on the root are returned unchanged.
    pub fn wrap(&self, action: CascadeAction, err: LoadError) -> LoadError {
        match &self.via {
            Some(edge) => LoadError::Cascade {
                action,
                owner: edge.owner.to_string(),
                association: edge.association.clone(),
                element: self.key.to_string(),
                path: edge.path.clone(),
                source: Box::new(err),
            },
            None => err,
        }
    }
}

/// Iterative traversal state of one cascade
#[derive(Debug)]
pub struct CascadeWalk {
    action: CascadeAction,
    stack: Vec<CascadeStep>,
    visited: HashSet<EntityId>,
    order: Vec<EntityId>,
    max_visits: usize,
}

impl CascadeWalk {
    pub fn new(action: CascadeAction, root: EntityId, root_key: EntityKey, max_visits: usize) -> Self {
        Self {
            action,
            stack: vec![CascadeStep {
                id: root,
                key: root_key,
                via: None,
            }],
            visited: HashSet::new(),
            order: Vec::new(),
            max_visits: max_visits.max(1),
        }
    }

    pub fn action(&self) -> CascadeAction {
        self.action
    }

    /// Next unvisited instance, marking it visited
    pub fn next_step(&mut self) -> LoadResult<Option<CascadeStep>> {
        while let Some(step) = self.stack.pop() {
            if !self.visited.insert(step.id) {
                continue;
            }
            if self.visited.len() > self.max_visits {
                return Err(LoadError::OverflowGuard(format!(
                    "cascade of {} visited more than {} instances (at {})",
                    self.action,
                    self.max_visits,
                    step.trail()
                )));
            }
            self.order.push(step.id);
            return Ok(Some(step));
        }
        Ok(None)
    }

    /// Queue the cascadable elements of `step`; returns how many were queued
    pub fn push_children(
        &mut self,
        registry: &IdentityRegistry,
        descriptor: &EntityDescriptor,
        step: &CascadeStep,
    ) -> LoadResult<usize> {
        let slot = registry.get(step.id)?;
        let trail = step.trail();
        let mut queued = Vec::new();
        for (association, child) in cascadable_children(slot, descriptor, self.action) {
            if self.visited.contains(&child) {
                continue;
            }
            queued.push(CascadeStep {
                id: child,
                key: registry.key_of(child)?.clone(),
                via: Some(CascadeEdge {
                    owner: step.key.clone(),
                    association: association.to_string(),
                    path: format!("{}.{}", trail, association),
                }),
            });
        }
        if self.stack.len() + queued.len() > self.max_visits {
            return Err(LoadError::OverflowGuard(format!(
                "cascade of {} queued more than {} instances (at {})",
                self.action, self.max_visits, trail
            )));
        }
        let count = queued.len();
        // Reversed so elements are visited in mapping order
        self.stack.extend(queued.into_iter().rev());
        Ok(count)
    }

    /// Instances visited so far, in visit order
    pub fn visited(&self) -> &[EntityId] {
        &self.order
    }
}

#[cfg(test)]
mod tests;
