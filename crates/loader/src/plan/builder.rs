use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use super::{AppliedFilter, FetchNode, FetchPlan, JoinClause, NodeKind, ProjectedColumn};
use crate::config::LoaderConfig;
use crate::error::{LoadError, LoadResult};
use crate::lock::LockMode;
use crate::metadata::{
    require_entity, AssociationDescriptor, AssociationKind, EntityDescriptor, FetchStrategy,
    ForeignKeySide, MappingMetadata,
};

/// Builds fetch plans from mapping metadata
pub struct FetchPlanBuilder<'a> {
    metadata: &'a dyn MappingMetadata,
    config: &'a LoaderConfig,
}

/// Mutable state of one build
struct BuildState<'f> {
    nodes: Vec<FetchNode>,
    columns: Vec<ProjectedColumn>,
    joins: Vec<JoinClause>,
    aliases: HashSet<String>,
    alias_counter: usize,
    /// Physical foreign keys already joined: (table, columns)
    joined_keys: HashSet<(String, Vec<String>)>,
    /// Depths at which a collection is already joined
    collection_depths: HashSet<usize>,
    requested: BTreeSet<String>,
    filters: &'f [String],
}

impl<'f> BuildState<'f> {
    fn claim_alias(&mut self, alias: &str, owner: &str) -> LoadResult<String> {
        if !self.aliases.insert(alias.to_string()) {
            return Err(LoadError::mapping(
                owner,
                format!("table alias '{}' is claimed by more than one association", alias),
            ));
        }
        Ok(alias.to_string())
    }

    fn generate_alias(&mut self, table: &str) -> String {
        let unqualified = table.rsplit('.').next().unwrap_or(table);
        let mut base: String = unqualified
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .take(3)
            .collect::<String>()
            .to_ascii_lowercase();
        if base.is_empty() {
            base.push('t');
        }
        loop {
            let candidate = format!("{}{}", base, self.alias_counter);
            self.alias_counter += 1;
            if self.aliases.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    fn push_column(&mut self, alias: &str, column: &str) -> usize {
        self.columns.push(ProjectedColumn {
            alias: alias.to_string(),
            column: column.to_string(),
            label: format!("{}_{}", alias, column),
        });
        self.columns.len() - 1
    }

    fn push_node(&mut self, node: FetchNode, limit: usize) -> LoadResult<usize> {
        if self.nodes.len() >= limit {
            return Err(LoadError::OverflowGuard(format!(
                "fetch plan for '{}' exceeds {} nodes at '{}'",
                self.nodes
                    .first()
                    .map(|n| n.entity.name.as_str())
                    .unwrap_or(""),
                limit,
                node.path
            )));
        }
        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }
}

impl<'a> FetchPlanBuilder<'a> {
    pub fn new(metadata: &'a dyn MappingMetadata, config: &'a LoaderConfig) -> Self {
        Self { metadata, config }
    }

    /// Build the plan for loading `root` under `lock` with the given enabled
    /// filters and explicitly requested join paths (dotted association names)
    pub fn build(
        &self,
        root: &str,
        lock: LockMode,
        filters: &[String],
        requested_joins: &[String],
    ) -> LoadResult<FetchPlan> {
        if !lock.is_requestable() {
            return Err(LoadError::Configuration(format!(
                "lock mode {} cannot be requested by a load",
                lock
            )));
        }
        let root_entity = require_entity(self.metadata, root, root)?;

        let mut state = BuildState {
            nodes: Vec::new(),
            columns: Vec::new(),
            joins: Vec::new(),
            aliases: HashSet::new(),
            alias_counter: 0,
            joined_keys: HashSet::new(),
            collection_depths: HashSet::new(),
            requested: expand_paths(requested_joins),
            filters,
        };

        let alias = state.generate_alias(&root_entity.table);
        let root_filters = self.filters_for(&root_entity, &alias, filters);
        state.push_node(
            FetchNode {
                kind: NodeKind::Root,
                parent: None,
                association: None,
                entity: root_entity.clone(),
                strategy: FetchStrategy::Join,
                alias: Some(alias),
                depth: 0,
                path: String::new(),
                requested: false,
                id_positions: Vec::new(),
                attribute_positions: Vec::new(),
                version_position: None,
                index_position: None,
            },
            self.config.max_plan_nodes,
        )?;
        project(&mut state, 0);
        self.walk(&mut state, 0)?;

        for path in requested_joins {
            if !state.nodes.iter().any(|node| &node.path == path) {
                return Err(LoadError::mapping(
                    &root_entity.name,
                    format!("requested join path '{}' does not name an association", path),
                ));
            }
        }

        tracing::debug!(
            "Built fetch plan for {}: {} node(s), {} join(s), {} column(s)",
            root_entity.name,
            state.nodes.len(),
            state.joins.len(),
            state.columns.len()
        );

        Ok(FetchPlan {
            nodes: state.nodes,
            columns: state.columns,
            joins: state.joins,
            filters: root_filters,
            lock_mode: lock,
        })
    }

    fn walk(&self, state: &mut BuildState<'_>, parent: usize) -> LoadResult<()> {
        let owner = state.nodes[parent].entity.clone();
        let parent_path = state.nodes[parent].path.clone();
        let depth = state.nodes[parent].depth + 1;

        for association in &owner.associations {
            let path = if parent_path.is_empty() {
                association.name.clone()
            } else {
                format!("{}.{}", parent_path, association.name)
            };
            let requested = state.requested.contains(&path);
            let target = require_entity(self.metadata, &association.target, &owner.name)?;
            let strategy =
                self.choose_strategy(state, &owner, &target, association, depth, requested, &path)?;

            let kind = match association.kind {
                AssociationKind::ToOne => NodeKind::ToOne,
                AssociationKind::ToMany => NodeKind::ToManyElement,
                AssociationKind::Indexed => NodeKind::CollectionIndex,
            };
            let index = state.push_node(
                FetchNode {
                    kind,
                    parent: Some(parent),
                    association: Some(association.clone()),
                    entity: target.clone(),
                    strategy,
                    alias: None,
                    depth,
                    path,
                    requested,
                    id_positions: Vec::new(),
                    attribute_positions: Vec::new(),
                    version_position: None,
                    index_position: None,
                },
                self.config.max_plan_nodes,
            )?;

            if strategy == FetchStrategy::Join {
                self.join(state, index, parent, &owner, &target, association)?;
                self.walk(state, index)?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn choose_strategy(
        &self,
        state: &mut BuildState<'_>,
        owner: &EntityDescriptor,
        target: &EntityDescriptor,
        association: &AssociationDescriptor,
        depth: usize,
        requested: bool,
        path: &str,
    ) -> LoadResult<FetchStrategy> {
        if association.fetch != FetchStrategy::Join && !requested {
            return Ok(deferred_strategy(association));
        }
        if association.shares_primary_key {
            tracing::trace!("Not joining {}: target shares the owner's primary key", path);
            return Ok(FetchStrategy::Select);
        }

        let key_table = match association.foreign_key.side {
            ForeignKeySide::Owner => owner.table.clone(),
            ForeignKeySide::Target => target.table.clone(),
        };
        let foreign_key = (key_table, association.foreign_key.columns.clone());

        if !requested {
            if depth > self.config.max_fetch_depth {
                tracing::debug!(
                    "Not joining {}: depth {} exceeds max fetch depth {}",
                    path,
                    depth,
                    self.config.max_fetch_depth
                );
                return Ok(FetchStrategy::Select);
            }
            if state.joined_keys.contains(&foreign_key) {
                tracing::debug!("Not joining {}: foreign key already joined on this plan", path);
                return Ok(FetchStrategy::Select);
            }
        }

        if association.is_collection() && !state.collection_depths.insert(depth) {
            if requested {
                return Err(LoadError::mapping(
                    &owner.name,
                    format!(
                        "cannot join collection '{}': another collection is already joined at depth {}",
                        path, depth
                    ),
                ));
            }
            tracing::debug!(
                "Not joining {}: a collection is already joined at depth {}, using subselect",
                path,
                depth
            );
            return Ok(FetchStrategy::Subselect);
        }

        state.joined_keys.insert(foreign_key);
        Ok(FetchStrategy::Join)
    }

    fn join(
        &self,
        state: &mut BuildState<'_>,
        index: usize,
        parent: usize,
        owner: &EntityDescriptor,
        target: &Arc<EntityDescriptor>,
        association: &AssociationDescriptor,
    ) -> LoadResult<()> {
        let alias = match &association.alias {
            Some(explicit) => state.claim_alias(explicit, &owner.name)?,
            None => state.generate_alias(&target.table),
        };
        let owner_alias = state.nodes[parent].alias.clone().unwrap_or_default();

        let (fk_alias, referenced_alias, referenced_ids) = match association.foreign_key.side {
            ForeignKeySide::Owner => (&owner_alias, &alias, &target.id_columns),
            ForeignKeySide::Target => (&alias, &owner_alias, &owner.id_columns),
        };
        if association.foreign_key.columns.len() != referenced_ids.len() {
            return Err(LoadError::mapping(
                &owner.name,
                format!(
                    "association '{}' has {} foreign key column(s) for {} identifier column(s)",
                    association.name,
                    association.foreign_key.columns.len(),
                    referenced_ids.len()
                ),
            ));
        }
        let on = association
            .foreign_key
            .columns
            .iter()
            .zip(referenced_ids.iter())
            .map(|(fk, id)| {
                (
                    format!("{}.{}", fk_alias, fk),
                    format!("{}.{}", referenced_alias, id),
                )
            })
            .collect();

        let filters = self.filters_for(target, &alias, state.filters);
        state.joins.push(JoinClause {
            node: index,
            table: target.table.clone(),
            alias: alias.clone(),
            on,
            filters,
            tenant_column: target.tenant_column.clone(),
        });

        state.nodes[index].alias = Some(alias.clone());
        project(state, index);
        if let Some(index_column) = &association.index_column {
            let position = state.push_column(&alias, index_column);
            state.nodes[index].index_position = Some(position);
        }
        Ok(())
    }

    fn filters_for(
        &self,
        entity: &EntityDescriptor,
        alias: &str,
        enabled: &[String],
    ) -> Vec<AppliedFilter> {
        entity
            .filters
            .iter()
            .filter(|filter| enabled.contains(&filter.name))
            .map(|filter| AppliedFilter {
                name: filter.name.clone(),
                condition: filter.condition.replace("{alias}", alias),
            })
            .collect()
    }
}

/// Identifier, attribute, version and owner-side foreign key columns of a node
fn project(state: &mut BuildState<'_>, index: usize) {
    let entity = state.nodes[index].entity.clone();
    let alias = state.nodes[index].alias.clone().unwrap_or_default();
    let mut seen: HashSet<&str> = HashSet::new();

    let id_positions = entity
        .id_columns
        .iter()
        .map(|column| {
            seen.insert(column);
            state.push_column(&alias, column)
        })
        .collect();

    let mut attribute_positions = Vec::new();
    for column in &entity.columns {
        if seen.insert(column) {
            attribute_positions.push((column.clone(), state.push_column(&alias, column)));
        }
    }

    let version_position = entity.version_column.as_ref().map(|column| {
        match attribute_positions.iter().find(|(name, _)| name == column) {
            Some((_, position)) => *position,
            None => {
                seen.insert(column);
                state.push_column(&alias, column)
            }
        }
    });

    for association in &entity.associations {
        for column in association.owner_columns() {
            if seen.insert(column) {
                attribute_positions.push((column.clone(), state.push_column(&alias, column)));
            }
        }
    }

    let node = &mut state.nodes[index];
    node.id_positions = id_positions;
    node.attribute_positions = attribute_positions;
    node.version_position = version_position;
}

/// Strategy for an association that is not joined by the mapping
fn deferred_strategy(association: &AssociationDescriptor) -> FetchStrategy {
    match association.fetch {
        FetchStrategy::Join => FetchStrategy::Select,
        FetchStrategy::Subselect if !association.is_collection() => FetchStrategy::Batch,
        other => other,
    }
}

/// Requested paths plus every prefix of them
fn expand_paths(paths: &[String]) -> BTreeSet<String> {
    let mut expanded = BTreeSet::new();
    for path in paths {
        let mut prefix = String::new();
        for segment in path.split('.') {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(segment);
            expanded.insert(prefix.clone());
        }
    }
    expanded
}
