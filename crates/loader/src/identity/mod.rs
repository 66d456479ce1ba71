//! Identity Registry - one managed instance per row within a unit of work
//!
//! Instances live in an arena and are addressed by [`EntityId`] handles, so
//! associations between them (including cycles) are plain ids. A slot starts
//! as a placeholder, is populated from a row, and becomes complete at the end
//! of the row that hydrated it.

use std::collections::{BTreeMap, HashMap};

use crate::error::{LoadError, LoadResult};
use crate::key::{EntityKey, Identifier, UniqueKey};
use crate::lock::LockMode;
use crate::value::DatabaseValue;

/// Attribute values of an instance, by column name
pub type Attributes = BTreeMap<String, DatabaseValue>;

/// Handle of a managed instance in the registry arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(usize);

impl EntityId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Two-phase initialization state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Identity reserved, state not (fully) read yet
    Placeholder,
    /// Attributes and join-fetched associations are set
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Managed,
    Loading,
    Deleted,
    Gone,
}

/// Bookkeeping for a managed instance
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEntry {
    pub status: EntityStatus,
    pub lock_mode: LockMode,
    /// Snapshot of the attributes as read from the database
    pub loaded_state: Option<Attributes>,
    pub version: Option<DatabaseValue>,
}

impl EntityEntry {
    fn loading() -> Self {
        Self {
            status: EntityStatus::Loading,
            lock_mode: LockMode::None,
            loaded_state: None,
            version: None,
        }
    }
}

/// State read for one instance
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoadedState {
    pub attributes: Attributes,
    pub version: Option<DatabaseValue>,
    /// Lock mode the row was read under
    pub lock: LockMode,
}

impl LoadedState {
    pub fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            version: None,
            lock: LockMode::None,
        }
    }

    pub fn with_version(mut self, version: Option<DatabaseValue>) -> Self {
        self.version = version;
        self
    }

    pub fn with_lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }
}

/// Value of an association on a managed instance
#[derive(Debug, Clone, PartialEq)]
pub enum AssociationValue {
    /// Collection not loaded yet
    Uninitialized,
    /// To-one whose target is known by key but not loaded yet
    Reference(EntityKey),
    ToOne(Option<EntityId>),
    Collection(Vec<EntityId>),
    Indexed(BTreeMap<Identifier, EntityId>),
}

impl AssociationValue {
    pub fn is_initialized(&self) -> bool {
        !matches!(
            self,
            AssociationValue::Uninitialized | AssociationValue::Reference(_)
        )
    }

    /// Elements that are loaded and present
    pub fn loaded_ids(&self) -> Vec<EntityId> {
        match self {
            AssociationValue::ToOne(Some(id)) => vec![*id],
            AssociationValue::Collection(ids) => ids.clone(),
            AssociationValue::Indexed(map) => map.values().copied().collect(),
            _ => Vec::new(),
        }
    }
}

/// One managed instance
#[derive(Debug, Clone)]
pub struct EntitySlot {
    key: EntityKey,
    state: SlotState,
    entry: EntityEntry,
    attributes: Attributes,
    associations: BTreeMap<String, AssociationValue>,
}

impl EntitySlot {
    fn placeholder(key: EntityKey) -> Self {
        Self {
            key,
            state: SlotState::Placeholder,
            entry: EntityEntry::loading(),
            attributes: Attributes::new(),
            associations: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == SlotState::Complete
    }

    pub fn entry(&self) -> &EntityEntry {
        &self.entry
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&DatabaseValue> {
        self.attributes.get(name)
    }

    pub fn association(&self, name: &str) -> Option<&AssociationValue> {
        self.associations.get(name)
    }

    pub fn associations(&self) -> impl Iterator<Item = (&String, &AssociationValue)> {
        self.associations.iter()
    }

    fn fill(&mut self, state: LoadedState) {
        self.entry.loaded_state = Some(state.attributes.clone());
        self.entry.version = state.version;
        self.entry.lock_mode = state.lock.acquired();
        self.attributes = state.attributes;
    }
}

/// Arena of managed instances keyed by [`EntityKey`]
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    slots: Vec<Option<EntitySlot>>,
    index: HashMap<EntityKey, EntityId>,
    unique: HashMap<UniqueKey, EntityId>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, key: &EntityKey) -> Option<EntityId> {
        self.index.get(key).copied()
    }

    pub fn get(&self, id: EntityId) -> LoadResult<&EntitySlot> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| LoadError::UnknownInstance(id.to_string()))
    }

    fn get_mut(&mut self, id: EntityId) -> LoadResult<&mut EntitySlot> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| LoadError::UnknownInstance(id.to_string()))
    }

    pub fn key_of(&self, id: EntityId) -> LoadResult<&EntityKey> {
        Ok(self.get(id)?.key())
    }

    fn insert(&mut self, slot: EntitySlot) -> EntityId {
        let id = EntityId(self.slots.len());
        self.index.insert(slot.key.clone(), id);
        self.slots.push(Some(slot));
        id
    }

    /// Reserve an identity for a row being read
    pub fn placeholder(&mut self, key: EntityKey) -> LoadResult<EntityId> {
        if self.index.contains_key(&key) {
            return Err(LoadError::IdentityConflict {
                key: key.to_string(),
            });
        }
        tracing::trace!("Reserving placeholder for {}", key);
        Ok(self.insert(EntitySlot::placeholder(key)))
    }

    /// Register a fully read instance.
    ///
    /// A placeholder for the key is filled and completed. An already complete
    /// instance with identical attributes is returned as is; with different
    /// attributes the registration is an identity conflict.
    pub fn register(&mut self, key: EntityKey, state: LoadedState) -> LoadResult<EntityId> {
        match self.resolve(&key) {
            None => {
                let mut slot = EntitySlot::placeholder(key);
                slot.fill(state);
                slot.state = SlotState::Complete;
                slot.entry.status = EntityStatus::Managed;
                Ok(self.insert(slot))
            }
            Some(id) => {
                let slot = self.get_mut(id)?;
                match slot.state {
                    SlotState::Placeholder => {
                        slot.fill(state);
                        slot.state = SlotState::Complete;
                        slot.entry.status = EntityStatus::Managed;
                        Ok(id)
                    }
                    SlotState::Complete if slot.attributes == state.attributes => Ok(id),
                    SlotState::Complete => Err(LoadError::IdentityConflict {
                        key: slot.key.to_string(),
                    }),
                }
            }
        }
    }

    /// Set the state of a placeholder read from a row
    pub fn populate(&mut self, id: EntityId, state: LoadedState) -> LoadResult<()> {
        let slot = self.get_mut(id)?;
        if slot.state != SlotState::Placeholder {
            return Err(LoadError::IdentityConflict {
                key: slot.key.to_string(),
            });
        }
        slot.fill(state);
        Ok(())
    }

    /// Promote a placeholder to a complete instance
    pub fn complete(&mut self, id: EntityId) -> LoadResult<()> {
        let slot = self.get_mut(id)?;
        if slot.state != SlotState::Placeholder {
            return Err(LoadError::IdentityConflict {
                key: slot.key.to_string(),
            });
        }
        slot.state = SlotState::Complete;
        slot.entry.status = EntityStatus::Managed;
        Ok(())
    }

    /// Turn a complete instance back into a placeholder so it can be re-read
    pub fn reset_to_placeholder(&mut self, id: EntityId) -> LoadResult<()> {
        let slot = self.get_mut(id)?;
        slot.state = SlotState::Placeholder;
        slot.entry = EntityEntry::loading();
        slot.attributes.clear();
        slot.associations.clear();
        self.unique.retain(|_, owner| *owner != id);
        Ok(())
    }

    /// Drop a placeholder created by a row that failed
    pub fn discard(&mut self, id: EntityId) -> LoadResult<()> {
        if self.get(id)?.is_complete() {
            return Err(LoadError::IdentityConflict {
                key: self.get(id)?.key.to_string(),
            });
        }
        self.remove(id);
        Ok(())
    }

    /// Detach an instance from the unit of work
    pub fn evict(&mut self, id: EntityId) -> LoadResult<EntitySlot> {
        self.get(id)?;
        self.remove(id)
            .ok_or_else(|| LoadError::UnknownInstance(id.to_string()))
    }

    fn remove(&mut self, id: EntityId) -> Option<EntitySlot> {
        let slot = self.slots.get_mut(id.0)?.take()?;
        self.index.remove(&slot.key);
        self.unique.retain(|_, owner| *owner != id);
        self.detach_references(id, &slot.key);
        Some(slot)
    }

    /// Drop `id` from every association; to-ones fall back to its key
    fn detach_references(&mut self, id: EntityId, key: &EntityKey) {
        for slot in self.slots.iter_mut().flatten() {
            for value in slot.associations.values_mut() {
                if matches!(value, AssociationValue::ToOne(Some(target)) if *target == id) {
                    *value = AssociationValue::Reference(key.clone());
                    continue;
                }
                match value {
                    AssociationValue::Collection(elements) => elements.retain(|e| *e != id),
                    AssociationValue::Indexed(map) => map.retain(|_, e| *e != id),
                    _ => {}
                }
            }
        }
    }

    pub fn mark_deleted(&mut self, id: EntityId) -> LoadResult<()> {
        self.get_mut(id)?.entry.status = EntityStatus::Deleted;
        Ok(())
    }

    pub fn set_lock_mode(&mut self, id: EntityId, lock: LockMode) -> LoadResult<()> {
        self.get_mut(id)?.entry.lock_mode = lock;
        Ok(())
    }

    pub fn set_version(&mut self, id: EntityId, version: Option<DatabaseValue>) -> LoadResult<()> {
        self.get_mut(id)?.entry.version = version;
        Ok(())
    }

    pub fn set_association(
        &mut self,
        id: EntityId,
        name: &str,
        value: AssociationValue,
    ) -> LoadResult<()> {
        self.get_mut(id)?
            .associations
            .insert(name.to_string(), value);
        Ok(())
    }

    /// Initialize an association only if nothing is set yet
    pub fn init_association(
        &mut self,
        id: EntityId,
        name: &str,
        value: AssociationValue,
    ) -> LoadResult<()> {
        self.get_mut(id)?
            .associations
            .entry(name.to_string())
            .or_insert(value);
        Ok(())
    }

    /// Append an element to a collection; the first appearance wins.
    ///
    /// Returns false when the element was already present.
    pub fn add_element(&mut self, id: EntityId, name: &str, element: EntityId) -> LoadResult<bool> {
        let slot = self.get_mut(id)?;
        let value = slot
            .associations
            .entry(name.to_string())
            .or_insert_with(|| AssociationValue::Collection(Vec::new()));
        if !matches!(value, AssociationValue::Collection(_)) {
            *value = AssociationValue::Collection(Vec::new());
        }
        match value {
            AssociationValue::Collection(elements) if !elements.contains(&element) => {
                elements.push(element);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Put an element at an index of an indexed collection; the first wins
    pub fn add_indexed_element(
        &mut self,
        id: EntityId,
        name: &str,
        index: Identifier,
        element: EntityId,
    ) -> LoadResult<bool> {
        let slot = self.get_mut(id)?;
        let value = slot
            .associations
            .entry(name.to_string())
            .or_insert_with(|| AssociationValue::Indexed(BTreeMap::new()));
        if !matches!(value, AssociationValue::Indexed(_)) {
            *value = AssociationValue::Indexed(BTreeMap::new());
        }
        match value {
            AssociationValue::Indexed(map) if !map.contains_key(&index) => {
                map.insert(index, element);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove an element from whatever value an association holds
    pub fn remove_element(&mut self, id: EntityId, name: &str, element: EntityId) -> LoadResult<()> {
        let slot = self.get_mut(id)?;
        if let Some(value) = slot.associations.get_mut(name) {
            match value {
                AssociationValue::ToOne(target) if *target == Some(element) => *target = None,
                AssociationValue::Collection(elements) => elements.retain(|e| *e != element),
                AssociationValue::Indexed(map) => map.retain(|_, e| *e != element),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn resolve_unique(&self, key: &UniqueKey) -> Option<EntityId> {
        self.unique.get(key).copied()
    }

    /// Point a unique value at `id`.
    ///
    /// The most recently read row owns the value; an earlier owner holds state
    /// the database no longer has and is returned so callers can note it.
    pub fn register_unique(&mut self, key: UniqueKey, id: EntityId) -> LoadResult<Option<EntityId>> {
        self.get(id)?;
        let previous = self.unique.insert(key, id).filter(|previous| *previous != id);
        Ok(previous)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &EntitySlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|slot| (EntityId(i), slot)))
    }

    pub fn placeholder_count(&self) -> usize {
        self.iter().filter(|(_, slot)| !slot.is_complete()).count()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.unique.clear();
    }
}
