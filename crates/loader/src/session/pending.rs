//! Resolution of associations deferred by the assembler

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::LoadSession;
use crate::assembler::{PendingLoad, RowPolicy};
use crate::batch::BatchRole;
use crate::error::{LoadError, LoadResult};
use crate::identity::{AssociationValue, EntityId};
use crate::key::{EntityKey, Identifier};
use crate::lock::LockMode;
use crate::metadata::{require_entity, AssociationKind, FetchStrategy, ForeignKeySide};
use crate::sql::{OriginQuery, Restriction};

/// To-one association waiting for its target to be read
#[derive(Debug)]
struct PendingLink {
    owner: EntityId,
    association: String,
    key: EntityKey,
}

/// Subselect load of one association for every root of an origin statement
#[derive(Debug)]
struct SubselectLoad {
    owner_entity: String,
    association: String,
    origin: Arc<OriginQuery>,
}

/// Statements needed by one resolution round
#[derive(Debug, Default)]
struct RoundWork {
    /// Target keys read one statement each
    selects: Vec<EntityKey>,
    /// Queues to drain, entity and collection roles alike
    roles: BTreeSet<BatchRole>,
    /// (owner entity, association, owner) read one statement each
    collections: Vec<(String, String, EntityId)>,
    subselects: Vec<SubselectLoad>,
    links: Vec<PendingLink>,
}

impl LoadSession {
    /// Load deferred associations round by round until none are left
    pub(super) async fn resolve_pending(&mut self, mut pending: Vec<PendingLoad>) -> LoadResult<()> {
        let mut rounds = 0;
        while !pending.is_empty() {
            rounds += 1;
            if rounds > self.config.max_resolution_rounds {
                return Err(LoadError::OverflowGuard(format!(
                    "deferred loads still pending after {} rounds",
                    self.config.max_resolution_rounds
                )));
            }
            self.stats.resolution_rounds += 1;
            tracing::trace!("Resolution round {} with {} deferred load(s)", rounds, pending.len());

            let work = self.classify(pending)?;
            pending = self.run_round(work).await?;
        }
        Ok(())
    }

    fn classify(&mut self, pending: Vec<PendingLoad>) -> LoadResult<RoundWork> {
        let mut work = RoundWork::default();
        for load in pending {
            match load {
                PendingLoad::ByKey {
                    owner,
                    association,
                    key,
                    strategy,
                } => {
                    if self.find(&key).is_none() {
                        if strategy == FetchStrategy::Batch {
                            let entity = key.entity().to_string();
                            self.request_load(&key)?;
                            work.roles.insert(BatchRole::entity(&entity));
                        } else if !work.selects.contains(&key) {
                            work.selects.push(key.clone());
                        }
                    }
                    work.links.push(PendingLink {
                        owner,
                        association,
                        key,
                    });
                }
                PendingLoad::ByOwner {
                    owner,
                    owner_entity,
                    association,
                    strategy,
                } => {
                    let Ok(slot) = self.registry.get(owner) else {
                        continue;
                    };
                    if slot
                        .association(&association)
                        .is_some_and(AssociationValue::is_initialized)
                    {
                        continue;
                    }
                    let origin = self.origins.get(&owner).cloned();
                    match (strategy, origin) {
                        (FetchStrategy::Subselect, Some(origin)) => {
                            let grouped = work.subselects.iter().any(|load| {
                                load.owner_entity == owner_entity
                                    && load.association == association
                                    && Arc::ptr_eq(&load.origin, &origin)
                            });
                            if !grouped {
                                work.subselects.push(SubselectLoad {
                                    owner_entity,
                                    association,
                                    origin,
                                });
                            }
                        }
                        (FetchStrategy::Batch | FetchStrategy::Subselect, _) => {
                            let key = slot.key().clone();
                            let role = BatchRole::collection(&owner_entity, &association);
                            let threshold = self.collection_batch_size(&owner_entity, &association)?;
                            self.batching.request_load(role.clone(), key, threshold);
                            work.roles.insert(role);
                        }
                        _ => work.collections.push((owner_entity, association, owner)),
                    }
                }
            }
        }
        Ok(work)
    }

    async fn run_round(&mut self, work: RoundWork) -> LoadResult<Vec<PendingLoad>> {
        let mut next = Vec::new();
        for key in work.selects {
            if self.find(&key).is_some() {
                continue;
            }
            let entity = key.entity().to_string();
            next.extend(self.load_keys(&entity, vec![key], LockMode::None).await?);
        }
        for role in &work.roles {
            let (_, pending) = self.flush_role(role).await?;
            next.extend(pending);
        }
        for load in work.subselects {
            let owners = self.subselect_owners(&load);
            next.extend(
                self.load_collection(&load.owner_entity, &load.association, owners, Some(load.origin))
                    .await?,
            );
        }
        for (owner_entity, association, owner) in work.collections {
            next.extend(
                self.load_collection(&owner_entity, &association, vec![owner], None)
                    .await?,
            );
        }
        for link in work.links {
            self.link_to_one(link)?;
        }
        Ok(next)
    }

    /// Drain a batching queue; returns the keys it held and the loads it deferred
    pub(super) async fn flush_role(
        &mut self,
        role: &BatchRole,
    ) -> LoadResult<(Vec<EntityKey>, Vec<PendingLoad>)> {
        let mut requested = Vec::new();
        let mut pending = Vec::new();
        match role {
            BatchRole::Entity(entity) => {
                let descriptor = require_entity(self.metadata.as_ref(), entity, entity)?;
                let sizes = self.config.batch_sizes_for(descriptor.batch_size)?;
                for batch in self.batching.take_batches(role, &sizes) {
                    requested.extend_from_slice(batch.distinct_keys());
                    pending.extend(self.load_keys(entity, batch.keys, LockMode::None).await?);
                }
            }
            BatchRole::Collection { owner, association } => {
                let max = self.collection_batch_size(owner, association)?;
                let sizes = self.config.batch_sizes_for(Some(max))?;
                for batch in self.batching.take_batches(role, &sizes) {
                    requested.extend_from_slice(batch.distinct_keys());
                    let owners = batch
                        .distinct_keys()
                        .iter()
                        .filter_map(|key| self.registry.resolve(key))
                        .collect();
                    pending.extend(self.load_collection(owner, association, owners, None).await?);
                }
            }
        }
        tracing::debug!("Flushed {} key(s) for {}", requested.len(), role);
        Ok((requested, pending))
    }

    fn collection_batch_size(&self, owner_entity: &str, association: &str) -> LoadResult<usize> {
        let descriptor = require_entity(self.metadata.as_ref(), owner_entity, owner_entity)?;
        let declared = descriptor
            .association(association)
            .and_then(|a| a.batch_size)
            .or(descriptor.batch_size);
        Ok(declared.unwrap_or(self.config.default_batch_size))
    }

    /// Roots read by the origin statement that still miss the association
    fn subselect_owners(&self, load: &SubselectLoad) -> Vec<EntityId> {
        let mut owners: Vec<EntityId> = self
            .origins
            .iter()
            .filter(|(_, origin)| Arc::ptr_eq(origin, &load.origin))
            .map(|(id, _)| *id)
            .filter(|id| {
                self.registry.get(*id).is_ok_and(|slot| {
                    slot.key().entity() == load.owner_entity
                        && !slot
                            .association(&load.association)
                            .is_some_and(AssociationValue::is_initialized)
                })
            })
            .collect();
        owners.sort();
        owners
    }

    /// Read the elements of `association` for `owners` and attach them
    pub(super) async fn load_collection(
        &mut self,
        owner_entity: &str,
        association: &str,
        owners: Vec<EntityId>,
        origin: Option<Arc<OriginQuery>>,
    ) -> LoadResult<Vec<PendingLoad>> {
        if owners.is_empty() {
            return Ok(Vec::new());
        }
        let descriptor = require_entity(self.metadata.as_ref(), owner_entity, owner_entity)?;
        let mapping = descriptor.association(association).cloned().ok_or_else(|| {
            LoadError::mapping(owner_entity, format!("no association named '{}'", association))
        })?;
        if mapping.foreign_key.side != ForeignKeySide::Target {
            return Err(LoadError::mapping(
                owner_entity,
                format!(
                    "'{}' is loaded through its owner but its foreign key is on the owner",
                    association
                ),
            ));
        }

        let mut identifiers = Vec::with_capacity(owners.len());
        let mut by_identifier = HashMap::with_capacity(owners.len());
        for owner in &owners {
            let id = self.registry.key_of(*owner)?.id().clone();
            identifiers.push(id.clone());
            by_identifier.insert(id, *owner);
        }
        let columns = mapping.foreign_key.columns.clone();
        let restriction = match origin {
            Some(origin) => Restriction::Subselect {
                columns: columns.clone(),
                origin: Box::new(origin.as_ref().clone()),
            },
            None => Restriction::ForeignKey {
                columns: columns.clone(),
                owners: identifiers,
            },
        };
        let mut extras = columns.clone();
        extras.extend(mapping.index_column.iter().cloned());

        let empty = match mapping.kind {
            AssociationKind::ToOne => AssociationValue::ToOne(None),
            _ if mapping.index_column.is_some() => AssociationValue::Indexed(Default::default()),
            _ => AssociationValue::Collection(Vec::new()),
        };
        let plan = self.plan_for(&mapping.target, LockMode::None, &[])?;
        let assembly = self.run(&plan, restriction, &extras, RowPolicy::MultiRow).await?;

        for owner in &owners {
            self.registry.set_association(*owner, association, empty.clone())?;
        }
        let width = columns.len();
        for row in &assembly.rows {
            let Some(fk) = Identifier::from_values(&row.extras[..width.min(row.extras.len())])? else {
                continue;
            };
            let Some(owner) = by_identifier.get(&fk).copied() else {
                continue;
            };
            match (&mapping.kind, &mapping.index_column) {
                (AssociationKind::ToOne, _) => {
                    self.registry.set_association(
                        owner,
                        association,
                        AssociationValue::ToOne(Some(row.root)),
                    )?;
                }
                (_, Some(_)) => {
                    let index = row
                        .extras
                        .get(width)
                        .map(Identifier::from_value)
                        .transpose()?
                        .flatten()
                        .ok_or_else(|| {
                            LoadError::InvalidIdentifier(format!(
                                "null index for an element of {}.{}",
                                owner_entity, association
                            ))
                        })?;
                    self.registry
                        .add_indexed_element(owner, association, index, row.root)?;
                }
                _ => {
                    self.registry.add_element(owner, association, row.root)?;
                }
            }
        }
        tracing::debug!(
            "Loaded {}.{} for {} owner(s): {} row(s)",
            owner_entity,
            association,
            owners.len(),
            assembly.rows.len()
        );
        Ok(assembly.pending)
    }

    fn link_to_one(&mut self, link: PendingLink) -> LoadResult<()> {
        let Ok(owner_key) = self.registry.key_of(link.owner) else {
            return Ok(());
        };
        let descriptor = require_entity(self.metadata.as_ref(), owner_key.entity(), owner_key.entity())?;
        let Some(mapping) = descriptor.association(&link.association) else {
            return Ok(());
        };
        let found = self.find(&link.key);
        let target = mapping.not_found.resolve(found, &link.key).into_result()?;
        self.registry
            .set_association(link.owner, &link.association, AssociationValue::ToOne(target))
    }
}
