//! Load session - one unit of work over the loading pipeline
//!
//! A session owns the identity registry, the batching queues and the enabled
//! filters. It renders plans into statements, runs them through the
//! [`StatementExecutor`], assembles the rows and resolves deferred
//! associations in rounds until nothing is left pending.
//!
//! Sessions are single-threaded (`&mut self`); they share only metadata, the
//! plan cache and the second-level cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::assembler::{foreign_key_of, Assembly, PendingLoad, RowAssembler, RowPolicy};
use crate::batch::{BatchRole, BatchingLoader};
use crate::cache::{CachedEntity, SecondLevelCache};
use crate::cascade::{unloaded_associations, CascadeAction, CascadeStep, CascadeWalk};
use crate::config::LoaderConfig;
use crate::error::{LoadError, LoadResult};
use crate::executor::{DatabaseRow, SimpleRow, Statement, StatementExecutor};
use crate::identity::{AssociationValue, EntityId, EntitySlot, EntityStatus, IdentityRegistry};
use crate::key::{EntityKey, Identifier, UniqueKey};
use crate::lock::LockMode;
use crate::metadata::{
    require_entity, AssociationKind, EntityDescriptor, FetchStrategy, ForeignKeySide,
    MappingMetadata,
};
use crate::plan::{FetchPlan, FetchPlanBuilder, PlanCache, PlanKey};
use crate::sql::{render_lock, FilterParams, OriginQuery, RenderContext, Restriction, SelectRenderer};
use crate::value::DatabaseValue;

mod pending;

/// Options of a by-key load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOptions {
    pub lock: LockMode,
    /// Association paths to join in addition to the mapping's joins
    pub joins: Vec<String>,
    /// Instance to re-read in place instead of resolving from the registry
    pub existing: Option<EntityId>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_join(mut self, path: &str) -> Self {
        self.joins.push(path.to_string());
        self
    }

    pub fn with_existing(mut self, existing: Option<EntityId>) -> Self {
        self.existing = existing;
        self
    }
}

/// Outcome of a cascade
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeReport {
    pub action: CascadeAction,
    /// Instances the action was applied to, in visit order
    pub visited: Vec<EntityId>,
    /// Associations loaded so the action could reach their elements
    pub materialized: usize,
}

/// Counters of one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub statements: u64,
    pub rows: u64,
    pub cache_hits: u64,
    pub resolution_rounds: u64,
}

/// One unit of work
pub struct LoadSession {
    metadata: Arc<dyn MappingMetadata>,
    executor: Arc<dyn StatementExecutor>,
    config: LoaderConfig,
    plans: Arc<PlanCache>,
    cache: Option<Arc<dyn SecondLevelCache>>,
    registry: IdentityRegistry,
    batching: BatchingLoader,
    filters: BTreeMap<String, FilterParams>,
    tenant: Option<String>,
    /// Statement that loaded each root, re-used for subselect loading
    origins: HashMap<EntityId, Arc<OriginQuery>>,
    stats: SessionStats,
}

impl std::fmt::Debug for LoadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadSession")
            .field("instances", &self.registry.len())
            .field("pending", &self.batching.total_pending())
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("tenant", &self.tenant)
            .field("stats", &self.stats)
            .finish()
    }
}

impl LoadSession {
    pub fn new(
        metadata: Arc<dyn MappingMetadata>,
        executor: Arc<dyn StatementExecutor>,
        config: LoaderConfig,
    ) -> LoadResult<Self> {
        config.validate()?;
        Ok(Self {
            metadata,
            executor,
            config,
            plans: Arc::new(PlanCache::new()),
            cache: None,
            registry: IdentityRegistry::new(),
            batching: BatchingLoader::new(),
            filters: BTreeMap::new(),
            tenant: None,
            origins: HashMap::new(),
            stats: SessionStats::default(),
        })
    }

    /// Share a plan cache with other sessions over the same metadata and config
    pub fn with_plan_cache(mut self, plans: Arc<PlanCache>) -> Self {
        self.plans = plans;
        self
    }

    pub fn with_second_level_cache(mut self, cache: Arc<dyn SecondLevelCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn plan_cache(&self) -> &Arc<PlanCache> {
        &self.plans
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn get(&self, id: EntityId) -> LoadResult<&EntitySlot> {
        self.registry.get(id)
    }

    /// Managed, fully loaded instance for `key`
    pub fn find(&self, key: &EntityKey) -> Option<EntityId> {
        self.registry
            .resolve(key)
            .filter(|id| self.is_complete(*id))
    }

    /// Key for `id` of `entity` under this session's tenant
    pub fn key(&self, entity: &str, id: impl Into<Identifier>) -> LoadResult<EntityKey> {
        let descriptor = require_entity(self.metadata.as_ref(), entity, entity)?;
        Ok(descriptor.key(id.into(), self.tenant.as_deref()))
    }

    pub fn enable_filter(&mut self, name: &str, params: FilterParams) {
        tracing::debug!("Enabling filter '{}'", name);
        self.filters.insert(name.to_string(), params);
    }

    /// Returns false when the filter was not enabled
    pub fn disable_filter(&mut self, name: &str) -> bool {
        self.filters.remove(name).is_some()
    }

    pub fn enabled_filters(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    /// Load one instance by key.
    ///
    /// `existing` names an instance to re-read in place. Returns `None` when
    /// no row matches.
    pub async fn load(
        &mut self,
        key: &EntityKey,
        existing: Option<EntityId>,
        lock: LockMode,
    ) -> LoadResult<Option<EntityId>> {
        self.load_with(key, LoadOptions::new().with_lock(lock).with_existing(existing))
            .await
    }

    pub async fn load_with(
        &mut self,
        key: &EntityKey,
        options: LoadOptions,
    ) -> LoadResult<Option<EntityId>> {
        if !options.lock.is_requestable() {
            return Err(LoadError::Configuration(format!(
                "lock mode {} cannot be requested by a load",
                options.lock
            )));
        }
        let descriptor = require_entity(self.metadata.as_ref(), key.entity(), key.entity())?;

        if let Some(existing) = options.existing {
            if self.registry.key_of(existing)? != key {
                return Err(LoadError::IdentityConflict {
                    key: key.to_string(),
                });
            }
            return self.reload(existing, &options).await;
        }

        if let Some(id) = self.registry.resolve(key) {
            let slot = self.registry.get(id)?;
            if self.is_deleted(id) {
                return Ok(None);
            }
            if slot.is_complete() {
                if options.lock.greater_than(slot.entry().lock_mode) {
                    self.lock(id, options.lock).await?;
                }
                tracing::trace!("{} resolved from the identity registry", key);
                return Ok(Some(id));
            }
        }

        if options.lock == LockMode::None && options.joins.is_empty() {
            if let Some(id) = self.load_from_cache(&descriptor, key).await? {
                return Ok(Some(id));
            }
        }
        self.load_from_database(key, &options).await
    }

    /// Load many instances of possibly different entities.
    ///
    /// Keys without a row are missing from the result.
    pub async fn load_batch(
        &mut self,
        keys: &[EntityKey],
        lock: LockMode,
    ) -> LoadResult<HashMap<EntityKey, EntityId>> {
        let mut by_entity: BTreeMap<&str, Vec<EntityKey>> = BTreeMap::new();
        for key in keys {
            let group = by_entity.entry(key.entity()).or_default();
            if !group.contains(key) {
                group.push(key.clone());
            }
        }

        let mut pending = Vec::new();
        for (entity, keys) in by_entity {
            let descriptor = require_entity(self.metadata.as_ref(), entity, entity)?;
            let mut missing = Vec::new();
            for key in keys {
                match self.find(&key) {
                    Some(id) if self.is_deleted(id) => {}
                    Some(id) => self.lock(id, lock).await?,
                    None => missing.push(key),
                }
            }
            if missing.is_empty() {
                continue;
            }
            let sizes = self.config.batch_sizes_for(descriptor.batch_size)?;
            for batch in sizes.split(missing) {
                pending.extend(self.load_keys(entity, batch.keys, lock).await?);
            }
        }
        self.resolve_pending(pending).await?;

        Ok(keys
            .iter()
            .filter_map(|key| {
                self.find(key)
                    .filter(|id| !self.is_deleted(*id))
                    .map(|id| (key.clone(), id))
            })
            .collect())
    }

    /// Load the instance whose unique `property` equals `value`
    pub async fn load_by_unique_key(
        &mut self,
        entity: &str,
        property: &str,
        value: impl Into<DatabaseValue>,
    ) -> LoadResult<Option<EntityId>> {
        let descriptor = require_entity(self.metadata.as_ref(), entity, entity)?;
        if !descriptor.is_unique_property(property) {
            return Err(LoadError::Configuration(format!(
                "'{}' is not a unique property of '{}'",
                property, entity
            )));
        }
        let value = value.into();
        let Some(identifier) = Identifier::from_value(&value)? else {
            return Ok(None);
        };
        let unique = UniqueKey {
            entity: entity.to_string(),
            property: property.to_string(),
            value: identifier,
            tenant: self.tenant_for(&descriptor),
        };
        if let Some(id) = self.registry.resolve_unique(&unique) {
            if self.is_complete(id) {
                tracing::trace!("{}.{} resolved from the unique key index", entity, property);
                return Ok(Some(id));
            }
        }

        let plan = self.plan_for(entity, LockMode::None, &[])?;
        let restriction = Restriction::UniqueKey {
            property: property.to_string(),
            value,
        };
        let assembly = self.run(&plan, restriction, &[], RowPolicy::SingleRow).await?;
        let root = assembly.roots.first().copied();
        self.resolve_pending(assembly.pending).await?;
        if let Some(root) = root {
            self.registry.register_unique(unique, root)?;
        }
        Ok(root)
    }

    /// Queue a key for the next batched load of its entity.
    ///
    /// Returns false when the key is loaded or already queued.
    pub fn request_load(&mut self, key: &EntityKey) -> LoadResult<bool> {
        if self.find(key).is_some() {
            return Ok(false);
        }
        let descriptor = require_entity(self.metadata.as_ref(), key.entity(), key.entity())?;
        let threshold = descriptor
            .batch_size
            .unwrap_or(self.config.default_batch_size);
        Ok(self
            .batching
            .request_load(BatchRole::entity(key.entity()), key.clone(), threshold))
    }

    pub fn pending_count(&self, entity: &str) -> usize {
        self.batching.pending_count(&BatchRole::entity(entity))
    }

    /// Whether the entity's queue reached its batch size
    pub fn should_flush(&self, entity: &str) -> bool {
        self.batching.should_flush(&BatchRole::entity(entity))
    }

    /// Load every queued key of `entity`; returns the instances found
    pub async fn flush(&mut self, entity: &str) -> LoadResult<Vec<EntityId>> {
        let (keys, pending) = self.flush_role(&BatchRole::entity(entity)).await?;
        self.resolve_pending(pending).await?;
        Ok(keys.iter().filter_map(|key| self.find(key)).collect())
    }

    /// Flush every queue; returns how many keys were requested
    pub async fn flush_all(&mut self) -> LoadResult<usize> {
        let mut requested = 0;
        let mut pending = Vec::new();
        for role in self.batching.pending_roles() {
            let (keys, more) = self.flush_role(&role).await?;
            requested += keys.len();
            pending.extend(more);
        }
        self.resolve_pending(pending).await?;
        Ok(requested)
    }

    /// Load an association left uninitialized (or as a reference)
    pub async fn initialize_association(&mut self, owner: EntityId, name: &str) -> LoadResult<()> {
        let owner_key = self.registry.key_of(owner)?.clone();
        let descriptor = require_entity(self.metadata.as_ref(), owner_key.entity(), owner_key.entity())?;
        let association = descriptor.association(name).cloned().ok_or_else(|| {
            LoadError::mapping(&descriptor.name, format!("no association named '{}'", name))
        })?;
        let value = self.registry.get(owner)?.association(name).cloned();
        if value.as_ref().is_some_and(AssociationValue::is_initialized) {
            return Ok(());
        }

        let strategy = match association.fetch {
            FetchStrategy::Lazy | FetchStrategy::Join => FetchStrategy::Select,
            other => other,
        };
        let by_key = association.kind == AssociationKind::ToOne
            && (association.shares_primary_key
                || association.foreign_key.side == ForeignKeySide::Owner);

        let load = match value {
            Some(AssociationValue::Reference(key)) => PendingLoad::ByKey {
                owner,
                association: name.to_string(),
                key,
                strategy,
            },
            _ if by_key => {
                let target = require_entity(self.metadata.as_ref(), &association.target, &descriptor.name)?;
                let key = if association.shares_primary_key {
                    target.key(owner_key.id().clone(), owner_key.tenant())
                } else {
                    let attributes = self.registry.get(owner)?.attributes();
                    match foreign_key_of(attributes, &association.foreign_key.columns)? {
                        Some(fk) => target.key(fk, self.tenant.as_deref()),
                        None => {
                            return self.registry.set_association(
                                owner,
                                name,
                                AssociationValue::ToOne(None),
                            );
                        }
                    }
                };
                PendingLoad::ByKey {
                    owner,
                    association: name.to_string(),
                    key,
                    strategy,
                }
            }
            _ => PendingLoad::ByOwner {
                owner,
                owner_entity: owner_key.entity().to_string(),
                association: name.to_string(),
                strategy,
            },
        };
        tracing::debug!("Initializing {}.{}", owner_key, name);
        self.resolve_pending(vec![load]).await
    }

    /// Acquire `mode` on a loaded instance, checking its version
    pub async fn lock(&mut self, id: EntityId, mode: LockMode) -> LoadResult<()> {
        if !mode.is_requestable() {
            return Err(LoadError::Configuration(format!(
                "lock mode {} cannot be requested by a load",
                mode
            )));
        }
        let slot = self.registry.get(id)?;
        if !mode.greater_than(slot.entry().lock_mode) {
            return Ok(());
        }
        let key = slot.key().clone();
        let known_version = slot.entry().version.clone();
        let current_mode = slot.entry().lock_mode;
        let descriptor = require_entity(self.metadata.as_ref(), key.entity(), key.entity())?;

        let statement = render_lock(self.render_context(), &descriptor, &key, mode)?;
        let rows = self
            .execute(statement, key.entity(), &key.id().to_string())
            .await?;
        let Some(row) = rows.first() else {
            return Err(LoadError::concurrency(
                key.entity(),
                key.id(),
                "row no longer exists",
            ));
        };
        if let (Some(_), Some(known)) = (&descriptor.version_column, &known_version) {
            let current = row.get_by_index(descriptor.id_columns.len())?;
            if !current.same_value(known) {
                return Err(LoadError::concurrency(
                    key.entity(),
                    key.id(),
                    format!("version changed from {} to {}", known, current),
                ));
            }
        }
        tracing::debug!("Upgrading lock on {} from {} to {}", key, current_mode, mode);
        self.registry.set_lock_mode(id, mode)
    }

    /// Re-read an instance in place; `None` when its row is gone
    pub async fn refresh(&mut self, id: EntityId) -> LoadResult<Option<EntityId>> {
        let key = self.registry.key_of(id)?.clone();
        self.load_with(&key, LoadOptions::new().with_existing(Some(id)))
            .await
    }

    /// Detach an instance from the unit of work
    pub fn evict(&mut self, id: EntityId) -> LoadResult<()> {
        let slot = self.registry.evict(id)?;
        self.origins.remove(&id);
        tracing::trace!("Evicted {}", slot.key());
        Ok(())
    }

    /// Apply `action` to `root` and everything reachable through associations
    /// that cascade it
    pub async fn cascade(&mut self, action: CascadeAction, root: EntityId) -> LoadResult<CascadeReport> {
        let root_key = self.registry.key_of(root)?.clone();
        let mut walk = CascadeWalk::new(action, root, root_key, self.config.max_cascade_visits);
        let mut materialized = 0;
        while let Some(step) = walk.next_step()? {
            match self.cascade_step(&mut walk, &step).await {
                Ok(loaded) => materialized += loaded,
                Err(err) => {
                    tracing::warn!("Cascade of {} failed at {}: {}", action, step.key, err);
                    return Err(step.wrap(action, err));
                }
            }
        }
        tracing::debug!(
            "Cascaded {} to {} instance(s)",
            action,
            walk.visited().len()
        );
        Ok(CascadeReport {
            action,
            visited: walk.visited().to_vec(),
            materialized,
        })
    }

    async fn cascade_step(&mut self, walk: &mut CascadeWalk, step: &CascadeStep) -> LoadResult<usize> {
        let action = walk.action();
        let descriptor = require_entity(self.metadata.as_ref(), step.key.entity(), step.key.entity())?;

        let mut materialized = 0;
        if action.requires_materialization() {
            let unloaded: Vec<String> = unloaded_associations(self.registry.get(step.id)?, &descriptor, action)
                .map(str::to_string)
                .collect();
            for name in unloaded {
                self.initialize_association(step.id, &name).await?;
                materialized += 1;
            }
        }
        walk.push_children(&self.registry, &descriptor, step)?;

        match action {
            CascadeAction::Load => {}
            CascadeAction::Refresh => {
                self.refresh(step.id).await?;
            }
            CascadeAction::Delete => self.registry.mark_deleted(step.id)?,
            CascadeAction::Lock(mode) => self.lock(step.id, mode).await?,
            CascadeAction::Evict => self.evict(step.id)?,
        }
        Ok(materialized)
    }

    /// Forget every managed instance and pending request
    pub fn clear(&mut self) {
        tracing::debug!("Clearing session with {} instance(s)", self.registry.len());
        self.registry.clear();
        self.batching.clear();
        self.origins.clear();
    }

    fn is_complete(&self, id: EntityId) -> bool {
        self.registry
            .get(id)
            .map(EntitySlot::is_complete)
            .unwrap_or(false)
    }

    fn is_deleted(&self, id: EntityId) -> bool {
        self.registry
            .get(id)
            .is_ok_and(|slot| slot.entry().status == EntityStatus::Deleted)
    }

    fn tenant_for(&self, descriptor: &EntityDescriptor) -> Option<String> {
        descriptor
            .tenant_column
            .as_ref()
            .and(self.tenant.clone())
    }

    fn render_context(&self) -> RenderContext<'_> {
        RenderContext {
            dialect: self.config.dialect,
            filters: &self.filters,
            tenant: self.tenant.as_deref(),
        }
    }

    fn plan_for(&self, root: &str, lock: LockMode, joins: &[String]) -> LoadResult<Arc<FetchPlan>> {
        let key = PlanKey::new(root, lock)
            .with_filters(self.filters.keys().cloned())
            .with_joins(joins.iter().cloned());
        let builder = FetchPlanBuilder::new(self.metadata.as_ref(), &self.config);
        self.plans.get_or_build(&key, &builder)
    }

    /// Run a statement reading `entity` rows identified by `ids`
    async fn execute(
        &mut self,
        statement: Statement,
        entity: &str,
        ids: &str,
    ) -> LoadResult<Vec<Box<dyn DatabaseRow>>> {
        let statement = statement.with_timeout(self.config.statement_timeout());
        tracing::debug!("Executing: {}", statement.sql);
        let rows = self
            .executor
            .fetch_all(&statement)
            .await
            .map_err(|err| err.attributed(entity, ids))?;
        self.stats.statements += 1;
        self.stats.rows += rows.len() as u64;
        Ok(rows)
    }

    /// Render, execute and assemble one statement of `plan`
    async fn run(
        &mut self,
        plan: &Arc<FetchPlan>,
        restriction: Restriction,
        extra_columns: &[String],
        policy: RowPolicy,
    ) -> LoadResult<Assembly> {
        let statement = SelectRenderer::new(plan, self.render_context()).render(&restriction, extra_columns)?;
        let ids = match &restriction {
            Restriction::Identifiers(ids) => ids
                .iter()
                .map(Identifier::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            _ => "*".to_string(),
        };
        let rows = self
            .execute(statement, &plan.root_entity().name, &ids)
            .await?;
        let assembly =
            RowAssembler::new(plan, &mut self.registry, policy, self.tenant.as_deref()).assemble(&rows)?;

        let origin = Arc::new(OriginQuery {
            plan: plan.clone(),
            restriction,
        });
        for root in &assembly.roots {
            self.origins.insert(*root, origin.clone());
        }
        self.after_hydration(&assembly.hydrated, true).await?;
        Ok(assembly)
    }

    async fn load_keys(
        &mut self,
        entity: &str,
        keys: Vec<EntityKey>,
        lock: LockMode,
    ) -> LoadResult<Vec<PendingLoad>> {
        let plan = self.plan_for(entity, lock, &[])?;
        let ids = keys.iter().map(|key| key.id().clone()).collect();
        let assembly = self
            .run(&plan, Restriction::Identifiers(ids), &[], RowPolicy::MultiRow)
            .await?;
        Ok(assembly.pending)
    }

    async fn load_from_database(
        &mut self,
        key: &EntityKey,
        options: &LoadOptions,
    ) -> LoadResult<Option<EntityId>> {
        let plan = self.plan_for(key.entity(), options.lock, &options.joins)?;
        let restriction = Restriction::Identifiers(vec![key.id().clone()]);
        let assembly = self.run(&plan, restriction, &[], RowPolicy::SingleRow).await?;
        let root = assembly.roots.first().copied();
        self.resolve_pending(assembly.pending).await?;
        if root.is_none() {
            tracing::debug!("No row for {}", key);
        }
        Ok(root)
    }

    async fn reload(&mut self, existing: EntityId, options: &LoadOptions) -> LoadResult<Option<EntityId>> {
        let slot = self.registry.get(existing)?;
        let key = slot.key().clone();
        let held = slot.entry().lock_mode;
        tracing::debug!("Re-reading {}", key);

        self.registry.reset_to_placeholder(existing)?;
        self.origins.remove(&existing);
        if let Some(cache) = &self.cache {
            cache.remove(&key).await;
        }
        match self.load_from_database(&key, options).await? {
            Some(id) => {
                if held.greater_than(self.registry.get(id)?.entry().lock_mode) {
                    self.registry.set_lock_mode(id, held)?;
                }
                Ok(Some(id))
            }
            None => {
                self.registry.evict(existing)?;
                Ok(None)
            }
        }
    }

    async fn load_from_cache(
        &mut self,
        descriptor: &EntityDescriptor,
        key: &EntityKey,
    ) -> LoadResult<Option<EntityId>> {
        if !self.config.use_second_level_cache || !descriptor.cacheable {
            return Ok(None);
        }
        let Some(cache) = self.cache.clone() else {
            return Ok(None);
        };
        let Some(cached) = cache.get(key).await else {
            return Ok(None);
        };
        self.stats.cache_hits += 1;
        tracing::trace!("{} read from the second-level cache", key);

        // Cached state carries no joined associations; all of them are deferred
        let shallow = self.config.clone().with_max_fetch_depth(0);
        let plan = FetchPlanBuilder::new(self.metadata.as_ref(), &shallow).build(
            &descriptor.name,
            LockMode::None,
            &[],
            &[],
        )?;
        let row: Box<dyn DatabaseRow> = Box::new(cached_row(&plan, key, &cached)?);
        let assembly = RowAssembler::new(&plan, &mut self.registry, RowPolicy::SingleRow, self.tenant.as_deref())
            .assemble(std::slice::from_ref(&row))?;
        self.after_hydration(&assembly.hydrated, false).await?;
        let root = assembly.roots.first().copied();
        self.resolve_pending(assembly.pending).await?;
        Ok(root)
    }

    /// Index unique properties of freshly read instances and feed the cache
    async fn after_hydration(&mut self, hydrated: &[EntityId], store: bool) -> LoadResult<()> {
        let caching = store && self.config.use_second_level_cache && self.cache.is_some();
        let mut unique_keys = Vec::new();
        let mut puts = Vec::new();
        for id in hydrated {
            let slot = self.registry.get(*id)?;
            let descriptor = require_entity(self.metadata.as_ref(), slot.key().entity(), slot.key().entity())?;
            for property in &descriptor.unique_properties {
                let Some(value) = slot.attribute(property) else {
                    continue;
                };
                if let Some(value) = Identifier::from_value(value)? {
                    unique_keys.push((
                        UniqueKey {
                            entity: descriptor.name.clone(),
                            property: property.clone(),
                            value,
                            tenant: slot.key().tenant().map(str::to_string),
                        },
                        *id,
                    ));
                }
            }
            if caching && descriptor.cacheable {
                puts.push((
                    slot.key().clone(),
                    CachedEntity {
                        attributes: slot.attributes().clone(),
                        version: slot.entry().version.clone(),
                    },
                ));
            }
        }
        for (key, id) in unique_keys {
            if let Some(previous) = self.registry.register_unique(key.clone(), id)? {
                tracing::debug!(
                    "{}.{}={} moved from {} to {}",
                    key.entity,
                    key.property,
                    key.value,
                    previous,
                    id
                );
            }
        }
        if let Some(cache) = &self.cache {
            for (key, entity) in puts {
                cache.put(&key, entity).await;
            }
        }
        Ok(())
    }
}

/// Row in `plan`'s projection rebuilt from cached state
fn cached_row(plan: &FetchPlan, key: &EntityKey, cached: &CachedEntity) -> LoadResult<SimpleRow> {
    let entity = plan.root_entity();
    let ids = key.id().to_values(entity.id_columns.len())?;
    let mut labels = Vec::with_capacity(plan.columns.len());
    let mut values = Vec::with_capacity(plan.columns.len());
    for column in &plan.columns {
        let value = match entity.id_columns.iter().position(|c| *c == column.column) {
            Some(index) => ids.get(index).cloned().unwrap_or(DatabaseValue::Null),
            None if entity.version_column.as_deref() == Some(column.column.as_str()) => {
                cached.version.clone().unwrap_or(DatabaseValue::Null)
            }
            None => cached
                .attributes
                .get(&column.column)
                .cloned()
                .unwrap_or(DatabaseValue::Null),
        };
        labels.push(column.label.clone());
        values.push(value);
    }
    SimpleRow::new(labels, values)
}
