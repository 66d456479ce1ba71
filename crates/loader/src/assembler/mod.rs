//! Result Assembler - turns the rows of one statement into managed instances
//!
//! Each row is walked along the plan's statement nodes, parents before
//! children. Keys move UNSEEN -> PLACEHOLDER -> COMPLETE; only the row that
//! creates (or first finds) a placeholder populates it, and everything that
//! row hydrated is completed when the row ends. A failing row discards the
//! placeholders it created and leaves earlier rows intact.
//!
//! Associations not read by the statement become [`PendingLoad`]s.

use std::collections::HashSet;

use crate::error::{LoadError, LoadResult};
use crate::executor::DatabaseRow;
use crate::identity::{AssociationValue, EntityId, IdentityRegistry, LoadedState};
use crate::key::{EntityKey, Identifier};
use crate::lock::LockMode;
use crate::metadata::{AssociationKind, FetchStrategy, ForeignKeySide};
use crate::plan::{FetchNode, FetchPlan, NodeKind};
use crate::value::DatabaseValue;

mod policy;
mod row;

pub use policy::{RowDisposition, RowPolicy};
pub use row::ResultRow;

use policy::PolicyState;

/// Association left for a follow-up statement
#[derive(Debug, Clone, PartialEq)]
pub enum PendingLoad {
    /// To-one whose target key is known
    ByKey {
        owner: EntityId,
        association: String,
        key: EntityKey,
        strategy: FetchStrategy,
    },
    /// Collection (or inverse to-one) found through the owner's identifier
    ByOwner {
        owner: EntityId,
        owner_entity: String,
        association: String,
        strategy: FetchStrategy,
    },
}

impl PendingLoad {
    pub fn owner(&self) -> EntityId {
        match self {
            PendingLoad::ByKey { owner, .. } | PendingLoad::ByOwner { owner, .. } => *owner,
        }
    }

    pub fn strategy(&self) -> FetchStrategy {
        match self {
            PendingLoad::ByKey { strategy, .. } | PendingLoad::ByOwner { strategy, .. } => *strategy,
        }
    }
}

/// Root of one non-repeated row plus the values after the plan's projection
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledRow {
    pub root: EntityId,
    pub extras: Vec<DatabaseValue>,
}

/// Everything one statement produced
#[derive(Debug, Default)]
pub struct Assembly {
    /// Distinct roots in first-appearance order
    pub roots: Vec<EntityId>,
    pub rows: Vec<AssembledRow>,
    pub pending: Vec<PendingLoad>,
    /// Instances populated from this statement's rows
    pub hydrated: Vec<EntityId>,
}

/// Assembles rows of statements rendered from one plan
pub struct RowAssembler<'a> {
    plan: &'a FetchPlan,
    registry: &'a mut IdentityRegistry,
    tenant: Option<&'a str>,
    policy: PolicyState,
    /// Instances populated by this assembler, completed or not
    statement_hydrated: HashSet<EntityId>,
    out: Assembly,
}

/// Row-local bookkeeping, undone if the row fails
#[derive(Default)]
struct RowScope {
    created: Vec<EntityId>,
    /// Placeholders that existed before this row and were populated by it
    adopted: Vec<EntityId>,
    /// (node, instance) populated by this row, in walk order
    hydrating: Vec<(usize, EntityId)>,
    /// (owner, association, element) links added by this row
    links: Vec<(EntityId, String, EntityId)>,
}

impl RowScope {
    fn is_hydrating(&self, id: EntityId) -> bool {
        self.hydrating.iter().any(|(_, h)| *h == id)
    }
}

impl<'a> RowAssembler<'a> {
    pub fn new(
        plan: &'a FetchPlan,
        registry: &'a mut IdentityRegistry,
        policy: RowPolicy,
        tenant: Option<&'a str>,
    ) -> Self {
        Self {
            plan,
            registry,
            tenant,
            policy: PolicyState::new(policy, plan.has_collection_join()),
            statement_hydrated: HashSet::new(),
            out: Assembly::default(),
        }
    }

    /// Assemble every row, stopping at the first failing one
    pub fn assemble(mut self, rows: &[Box<dyn DatabaseRow>]) -> LoadResult<Assembly> {
        for row in rows {
            self.assemble_row(row.as_ref())?;
        }
        tracing::trace!(
            "Assembled {} row(s) into {} root(s), {} hydrated, {} pending",
            rows.len(),
            self.out.roots.len(),
            self.out.hydrated.len(),
            self.out.pending.len()
        );
        Ok(self.out)
    }

    pub fn assemble_row(&mut self, row: &dyn DatabaseRow) -> LoadResult<()> {
        let mut result_row = ResultRow::read(row, self.plan.columns.len())?;
        let mut scope = RowScope::default();

        match self.walk_row(&mut result_row, &mut scope) {
            Ok(()) => self.finish_row(scope),
            Err(err) => {
                self.rollback_row(scope);
                Err(err)
            }
        }
    }

    fn walk_row(&mut self, row: &mut ResultRow, scope: &mut RowScope) -> LoadResult<()> {
        let plan = self.plan;
        for (index, node) in plan.statement_nodes() {
            match node.kind {
                NodeKind::Root => {
                    let Some(id) = row.identifier(&node.id_positions)? else {
                        // A root without identifier contributes nothing
                        return Ok(());
                    };
                    let key = node.entity.key(id, self.tenant);
                    let disposition = self.policy.observe(&key)?;
                    let entity = self.resolve_or_hydrate(index, node, key, row, scope)?;
                    row.resolve(index, Some(entity));
                    if disposition == RowDisposition::New {
                        if !self.out.roots.contains(&entity) {
                            self.out.roots.push(entity);
                        }
                        self.out.rows.push(AssembledRow {
                            root: entity,
                            extras: row.extras(plan.columns.len()),
                        });
                    }
                }
                _ => self.walk_joined(index, node, row, scope)?,
            }
        }
        Ok(())
    }

    fn walk_joined(
        &mut self,
        index: usize,
        node: &FetchNode,
        row: &mut ResultRow,
        scope: &mut RowScope,
    ) -> LoadResult<()> {
        let parent = node.parent.and_then(|p| row.resolved(p)).flatten();
        let Some(parent) = parent else {
            row.resolve(index, None);
            return Ok(());
        };
        let name = node.association_name().to_string();
        let attach = self.statement_hydrated.contains(&parent);

        let target = match row.identifier(&node.id_positions)? {
            Some(id) => {
                let key = node.entity.key(id, self.tenant);
                Some(self.resolve_or_hydrate(index, node, key, row, scope)?)
            }
            None => None,
        };
        row.resolve(index, target);

        match node.kind {
            NodeKind::ToOne if attach => {
                let value = match target {
                    Some(id) => Some(id),
                    None => self.missing_to_one(node, parent)?,
                };
                self.registry
                    .set_association(parent, &name, AssociationValue::ToOne(value))?;
            }
            NodeKind::ToOne => {}
            NodeKind::ToManyElement => {
                if let (true, Some(element)) = (attach, target) {
                    if self.registry.add_element(parent, &name, element)? {
                        scope.links.push((parent, name, element));
                    }
                }
            }
            NodeKind::CollectionIndex => {
                if let (true, Some(element)) = (attach, target) {
                    let index_value = match node.index_position {
                        Some(position) => Identifier::from_value(row.value(position)?)?,
                        None => None,
                    };
                    let Some(index_value) = index_value else {
                        return Err(LoadError::mapping(
                            &node.entity.name,
                            format!("indexed collection '{}' row has no index value", node.path),
                        ));
                    };
                    if self
                        .registry
                        .add_indexed_element(parent, &name, index_value, element)?
                    {
                        scope.links.push((parent, name, element));
                    }
                }
            }
            NodeKind::Root => {}
        }
        Ok(())
    }

    /// Outer join found no target row: absent, or a dangling foreign key
    fn missing_to_one(&self, node: &FetchNode, parent: EntityId) -> LoadResult<Option<EntityId>> {
        let Some(association) = &node.association else {
            return Ok(None);
        };
        if association.foreign_key.side != ForeignKeySide::Owner {
            return Ok(None);
        }
        let slot = self.registry.get(parent)?;
        let Some(fk) = foreign_key_of(slot.attributes(), &association.foreign_key.columns)? else {
            return Ok(None);
        };
        let key = node.entity.key(fk, self.tenant);
        association.not_found.resolve(None, &key).into_result()
    }

    fn resolve_or_hydrate(
        &mut self,
        index: usize,
        node: &FetchNode,
        key: EntityKey,
        row: &ResultRow,
        scope: &mut RowScope,
    ) -> LoadResult<EntityId> {
        match self.registry.resolve(&key) {
            Some(id) => {
                if self.statement_hydrated.contains(&id) || scope.is_hydrating(id) {
                    return Ok(id);
                }
                if self.registry.get(id)?.is_complete() {
                    if node.kind == NodeKind::Root {
                        self.instance_already_loaded(node, id, row)?;
                    }
                    return Ok(id);
                }
                let state = self.state_from_row(node, row)?;
                self.registry.populate(id, state)?;
                scope.adopted.push(id);
                self.begin_hydration(index, id, scope)?;
                Ok(id)
            }
            None => {
                let state = self.state_from_row(node, row)?;
                let id = self.registry.placeholder(key)?;
                scope.created.push(id);
                self.registry.populate(id, state)?;
                self.begin_hydration(index, id, scope)?;
                Ok(id)
            }
        }
    }

    fn begin_hydration(&mut self, index: usize, id: EntityId, scope: &mut RowScope) -> LoadResult<()> {
        let plan = self.plan;
        scope.hydrating.push((index, id));
        self.statement_hydrated.insert(id);
        for (_, child) in plan.children(index) {
            if !child.is_read_by_statement() {
                continue;
            }
            let empty = match child.kind {
                NodeKind::ToManyElement => AssociationValue::Collection(Vec::new()),
                NodeKind::CollectionIndex => AssociationValue::Indexed(Default::default()),
                NodeKind::ToOne | NodeKind::Root => AssociationValue::ToOne(None),
            };
            self.registry
                .set_association(id, child.association_name(), empty)?;
        }
        Ok(())
    }

    /// Lock upgrade of an instance loaded before this statement.
    ///
    /// The statement itself acquired the lock; the version read with it must
    /// match the version the instance was loaded with.
    fn instance_already_loaded(&mut self, node: &FetchNode, id: EntityId, row: &ResultRow) -> LoadResult<()> {
        let requested = self.plan.lock_mode;
        let slot = self.registry.get(id)?;
        if !requested.greater_than(slot.entry().lock_mode) {
            return Ok(());
        }
        if let (Some(position), Some(known)) = (node.version_position, &slot.entry().version) {
            let current = row.value(position)?;
            if !current.same_value(known) {
                return Err(LoadError::concurrency(
                    &node.entity.name,
                    slot.key().id(),
                    format!("version changed from {} to {}", known, current),
                ));
            }
        }
        tracing::debug!(
            "Upgrading lock on {} from {} to {}",
            slot.key(),
            slot.entry().lock_mode,
            requested
        );
        self.registry.set_lock_mode(id, requested)
    }

    fn state_from_row(&self, node: &FetchNode, row: &ResultRow) -> LoadResult<LoadedState> {
        let mut attributes = crate::identity::Attributes::new();
        for (column, position) in &node.attribute_positions {
            attributes.insert(column.clone(), row.value(*position)?.clone());
        }
        let version = match node.version_position {
            Some(position) => Some(row.value(position)?.clone()),
            None => None,
        };
        let lock = if node.kind == NodeKind::Root {
            self.plan.lock_mode
        } else {
            LockMode::None
        };
        Ok(LoadedState::new(attributes).with_version(version).with_lock(lock))
    }

    fn finish_row(&mut self, scope: RowScope) -> LoadResult<()> {
        for (index, id) in scope.hydrating {
            self.defer_associations(index, id)?;
            self.registry.complete(id)?;
            self.out.hydrated.push(id);
        }
        Ok(())
    }

    fn rollback_row(&mut self, scope: RowScope) {
        for (owner, association, element) in scope.links.iter().rev() {
            // owner may itself be discarded below
            let _ = self.registry.remove_element(*owner, association, *element);
        }
        for id in scope.created {
            self.statement_hydrated.remove(&id);
            let _ = self.registry.discard(id);
        }
        for id in scope.adopted {
            self.statement_hydrated.remove(&id);
            let _ = self.registry.reset_to_placeholder(id);
        }
    }

    /// Set up associations the statement did not read and queue their loads
    fn defer_associations(&mut self, index: usize, id: EntityId) -> LoadResult<()> {
        let plan = self.plan;
        for (_, child) in plan.children(index) {
            if child.is_read_by_statement() {
                continue;
            }
            let Some(association) = &child.association else {
                continue;
            };
            let owner_key = self.registry.key_of(id)?.clone();

            let by_owner = association.kind != AssociationKind::ToOne
                || (!association.shares_primary_key
                    && association.foreign_key.side == ForeignKeySide::Target);
            if by_owner {
                self.registry
                    .set_association(id, &association.name, AssociationValue::Uninitialized)?;
                if child.strategy != FetchStrategy::Lazy {
                    self.out.pending.push(PendingLoad::ByOwner {
                        owner: id,
                        owner_entity: owner_key.entity().to_string(),
                        association: association.name.clone(),
                        strategy: child.strategy,
                    });
                }
                continue;
            }

            let target_key = if association.shares_primary_key {
                child.entity.key(owner_key.id().clone(), owner_key.tenant())
            } else {
                let attributes = self.registry.get(id)?.attributes();
                match foreign_key_of(attributes, &association.foreign_key.columns)? {
                    Some(fk) => child.entity.key(fk, self.tenant),
                    None => {
                        self.registry
                            .set_association(id, &association.name, AssociationValue::ToOne(None))?;
                        continue;
                    }
                }
            };

            let known = match self.registry.resolve(&target_key) {
                Some(target) if self.statement_hydrated.contains(&target) => Some(target),
                Some(target) if self.registry.get(target)?.is_complete() => Some(target),
                _ => None,
            };
            if let Some(target) = known {
                self.registry
                    .set_association(id, &association.name, AssociationValue::ToOne(Some(target)))?;
                continue;
            }
            self.registry.set_association(
                id,
                &association.name,
                AssociationValue::Reference(target_key.clone()),
            )?;
            if child.strategy != FetchStrategy::Lazy {
                self.out.pending.push(PendingLoad::ByKey {
                    owner: id,
                    association: association.name.clone(),
                    key: target_key,
                    strategy: child.strategy,
                });
            }
        }
        Ok(())
    }
}

/// Foreign key value held in an instance's attributes
pub(crate) fn foreign_key_of(
    attributes: &crate::identity::Attributes,
    columns: &[String],
) -> LoadResult<Option<Identifier>> {
    let values = columns
        .iter()
        .map(|column| {
            attributes.get(column).cloned().ok_or_else(|| {
                LoadError::Column(format!("foreign key column '{}' was not read", column))
            })
        })
        .collect::<LoadResult<Vec<_>>>()?;
    Identifier::from_values(&values)
}

#[cfg(test)]
mod tests;
