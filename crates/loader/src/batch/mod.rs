//! Batching Loader - groups deferred loads into IN-list statements
//!
//! Keys are queued per role (an entity, or a collection of an owner entity)
//! and drained into [`KeyBatch`]es sized by [`BatchSizes`]. A short result
//! is never an error here; callers decide what an absent key means.

use std::collections::{BTreeMap, HashSet};

use crate::key::EntityKey;

mod sizes;

pub use sizes::{BatchSizes, KeyBatch};

/// What a queue batches: instances of an entity or collections of owners
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BatchRole {
    Entity(String),
    Collection { owner: String, association: String },
}

impl BatchRole {
    pub fn entity(name: &str) -> Self {
        BatchRole::Entity(name.to_string())
    }

    pub fn collection(owner: &str, association: &str) -> Self {
        BatchRole::Collection {
            owner: owner.to_string(),
            association: association.to_string(),
        }
    }
}

impl std::fmt::Display for BatchRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchRole::Entity(name) => write!(f, "{}", name),
            BatchRole::Collection { owner, association } => write!(f, "{}.{}", owner, association),
        }
    }
}

/// Queue of keys awaiting a batched load, in request order
#[derive(Debug, Default)]
pub struct PendingBatch {
    keys: Vec<EntityKey>,
    queued: HashSet<EntityKey>,
    threshold: usize,
}

impl PendingBatch {
    fn new(threshold: usize) -> Self {
        Self {
            keys: Vec::new(),
            queued: HashSet::new(),
            threshold: threshold.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Per-role queues of pending keys
#[derive(Debug, Default)]
pub struct BatchingLoader {
    queues: BTreeMap<BatchRole, PendingBatch>,
}

impl BatchingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a key; returns false when it is already pending.
    ///
    /// The queue for a role is created on first use with `threshold` as the
    /// size at which it should be flushed.
    pub fn request_load(&mut self, role: BatchRole, key: EntityKey, threshold: usize) -> bool {
        let queue = self
            .queues
            .entry(role)
            .or_insert_with(|| PendingBatch::new(threshold));
        if !queue.queued.insert(key.clone()) {
            return false;
        }
        queue.keys.push(key);
        true
    }

    pub fn pending_count(&self, role: &BatchRole) -> usize {
        self.queues.get(role).map(PendingBatch::len).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.queues.values().map(PendingBatch::len).sum()
    }

    /// Whether the queue reached its flush threshold
    pub fn should_flush(&self, role: &BatchRole) -> bool {
        self.queues
            .get(role)
            .map(|queue| queue.len() >= queue.threshold)
            .unwrap_or(false)
    }

    /// Roles with pending keys, in stable order
    pub fn pending_roles(&self) -> Vec<BatchRole> {
        self.queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(role, _)| role.clone())
            .collect()
    }

    /// Drain a role's queue into statement-sized batches
    pub fn take_batches(&mut self, role: &BatchRole, sizes: &BatchSizes) -> Vec<KeyBatch> {
        let Some(queue) = self.queues.get_mut(role) else {
            return Vec::new();
        };
        queue.queued.clear();
        let keys = std::mem::take(&mut queue.keys);
        if keys.len() == 1 {
            return vec![KeyBatch {
                keys,
                distinct: 1,
            }];
        }
        let batches = sizes.split(keys);
        tracing::debug!(
            "Draining {} batch(es) for {} (sizes {:?})",
            batches.len(),
            role,
            batches.iter().map(|b| b.keys.len()).collect::<Vec<_>>()
        );
        batches
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}
