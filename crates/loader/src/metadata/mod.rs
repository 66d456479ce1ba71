//! Mapping Metadata - what the loader needs to know about mapped entities
//!
//! Descriptors are produced by the mapping bootstrap (outside this crate) and
//! consumed through the [`MappingMetadata`] trait. [`MetadataRegistry`] is the
//! in-process implementation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cascade::CascadePolicy;
use crate::error::{LoadError, LoadResult};
use crate::identity::EntityId;
use crate::key::{EntityKey, Identifier};

pub mod registry;

pub use registry::{MetadataRegistry, RegistryStats};

/// How an association is fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchStrategy {
    /// Outer join in the owner's statement
    Join,
    /// Immediate follow-up select per owner
    Select,
    /// Follow-up selects grouped into IN-list batches
    Batch,
    /// One follow-up select restricted by the owner query
    Subselect,
    /// Left unloaded until explicitly initialized
    Lazy,
}

impl std::fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FetchStrategy::Join => "JOIN",
            FetchStrategy::Select => "SELECT",
            FetchStrategy::Batch => "BATCH",
            FetchStrategy::Subselect => "SUBSELECT",
            FetchStrategy::Lazy => "LAZY",
        };
        write!(f, "{}", name)
    }
}

/// Semantic type of an association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssociationKind {
    /// Single-valued reference
    ToOne,
    /// Unordered collection of elements
    ToMany,
    /// Collection keyed by an index column (list position or map key)
    Indexed,
}

impl AssociationKind {
    pub fn is_collection(self) -> bool {
        matches!(self, Self::ToMany | Self::Indexed)
    }
}

/// Which table holds the foreign key columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForeignKeySide {
    /// Columns live on the owner and reference the target's identifier
    Owner,
    /// Columns live on the target and reference the owner's identifier
    Target,
}

/// Foreign key configuration for associations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyConfig {
    /// The foreign key column name(s)
    pub columns: Vec<String>,
    /// The table holding the columns
    pub side: ForeignKeySide,
}

impl ForeignKeyConfig {
    pub fn owner(columns: Vec<String>) -> Self {
        Self {
            columns,
            side: ForeignKeySide::Owner,
        }
    }

    pub fn target(columns: Vec<String>) -> Self {
        Self {
            columns,
            side: ForeignKeySide::Target,
        }
    }

    pub fn is_composite(&self) -> bool {
        self.columns.len() > 1
    }
}

/// What to do when a referenced row does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NotFoundAction {
    /// A dangling reference is an error
    #[default]
    Required,
    /// A dangling reference resolves to an absent association
    IgnoreIfMissing,
}

/// Outcome of resolving a reference against the not-found policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(EntityId),
    Absent,
    NotFound(EntityKey),
}

impl NotFoundAction {
    pub fn resolve(self, found: Option<EntityId>, key: &EntityKey) -> Resolution {
        match (found, self) {
            (Some(id), _) => Resolution::Found(id),
            (None, NotFoundAction::IgnoreIfMissing) => Resolution::Absent,
            (None, NotFoundAction::Required) => Resolution::NotFound(key.clone()),
        }
    }
}

impl Resolution {
    /// Collapse into the association value, surfacing `NotFound` as an error
    pub fn into_result(self) -> LoadResult<Option<EntityId>> {
        match self {
            Resolution::Found(id) => Ok(Some(id)),
            Resolution::Absent => Ok(None),
            Resolution::NotFound(key) => Err(LoadError::EntityNotFound {
                entity: key.entity().to_string(),
                id: key.id().to_string(),
            }),
        }
    }
}

/// A named predicate applied globally when enabled (soft delete, visibility...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDefinition {
    pub name: String,
    /// SQL fragment; `{alias}` is replaced by the table alias and `:param`
    /// tokens by bound parameters
    pub condition: String,
}

impl FilterDefinition {
    pub fn new(name: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: condition.into(),
        }
    }
}

/// Association metadata as seen by the loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationDescriptor {
    /// Name of the association (field name on the owner)
    pub name: String,
    pub kind: AssociationKind,
    /// Target entity name
    pub target: String,
    pub foreign_key: ForeignKeyConfig,
    pub fetch: FetchStrategy,
    pub cascade: CascadePolicy,
    pub not_found: NotFoundAction,
    /// Target uses the owner's primary key (degenerate one-to-one)
    pub shares_primary_key: bool,
    /// Explicit table alias to use when joined
    pub alias: Option<String>,
    /// Index column on the target table for indexed collections
    pub index_column: Option<String>,
    /// Batch size for batched collection loads
    pub batch_size: Option<usize>,
}

impl AssociationDescriptor {
    fn new(name: &str, kind: AssociationKind, target: &str, foreign_key: ForeignKeyConfig) -> Self {
        Self {
            name: name.to_string(),
            kind,
            target: target.to_string(),
            foreign_key,
            fetch: if kind.is_collection() {
                FetchStrategy::Lazy
            } else {
                FetchStrategy::Select
            },
            cascade: CascadePolicy::none(),
            not_found: NotFoundAction::Required,
            shares_primary_key: false,
            alias: None,
            index_column: None,
            batch_size: None,
        }
    }

    /// Many-to-one: the owner's `column` references the target's identifier
    pub fn to_one(name: &str, target: &str, column: &str) -> Self {
        Self::new(
            name,
            AssociationKind::ToOne,
            target,
            ForeignKeyConfig::owner(vec![column.to_string()]),
        )
    }

    /// Inverse one-to-one: the target's `column` references the owner's identifier
    pub fn inverse_one(name: &str, target: &str, column: &str) -> Self {
        Self::new(
            name,
            AssociationKind::ToOne,
            target,
            ForeignKeyConfig::target(vec![column.to_string()]),
        )
    }

    /// One-to-one whose target row uses the owner's primary key.
    ///
    /// The target row is optional.
    pub fn shared_key(name: &str, target: &str) -> Self {
        let mut descriptor = Self::new(
            name,
            AssociationKind::ToOne,
            target,
            ForeignKeyConfig::owner(Vec::new()),
        );
        descriptor.shares_primary_key = true;
        descriptor.not_found = NotFoundAction::IgnoreIfMissing;
        descriptor
    }

    /// One-to-many: the target's `column` references the owner's identifier
    pub fn to_many(name: &str, target: &str, column: &str) -> Self {
        Self::new(
            name,
            AssociationKind::ToMany,
            target,
            ForeignKeyConfig::target(vec![column.to_string()]),
        )
    }

    /// Indexed one-to-many keyed by `index_column` on the target table
    pub fn indexed(name: &str, target: &str, column: &str, index_column: &str) -> Self {
        let mut descriptor = Self::new(
            name,
            AssociationKind::Indexed,
            target,
            ForeignKeyConfig::target(vec![column.to_string()]),
        );
        descriptor.index_column = Some(index_column.to_string());
        descriptor
    }

    pub fn with_foreign_key(mut self, foreign_key: ForeignKeyConfig) -> Self {
        self.foreign_key = foreign_key;
        self
    }

    pub fn with_fetch(mut self, fetch: FetchStrategy) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_cascade(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn ignore_missing(mut self) -> Self {
        self.not_found = NotFoundAction::IgnoreIfMissing;
        self
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn is_collection(&self) -> bool {
        self.kind.is_collection()
    }

    /// Foreign key columns that live on the owner's table
    pub fn owner_columns(&self) -> &[String] {
        match self.foreign_key.side {
            ForeignKeySide::Owner => &self.foreign_key.columns,
            ForeignKeySide::Target => &[],
        }
    }

    /// Validate the association for consistency
    pub fn validate(&self, owner: &str) -> LoadResult<()> {
        if self.name.is_empty() {
            return Err(LoadError::mapping(owner, "association name cannot be empty"));
        }
        if self.shares_primary_key {
            if self.kind != AssociationKind::ToOne {
                return Err(LoadError::mapping(
                    owner,
                    format!("'{}' shares the primary key but is a collection", self.name),
                ));
            }
        } else if self.foreign_key.columns.is_empty() {
            return Err(LoadError::mapping(
                owner,
                format!("'{}' must have at least one foreign key column", self.name),
            ));
        }
        if self.is_collection() && self.foreign_key.side != ForeignKeySide::Target {
            return Err(LoadError::mapping(
                owner,
                format!("collection '{}' must keep its foreign key on the target", self.name),
            ));
        }
        match (self.kind, &self.index_column) {
            (AssociationKind::Indexed, None) => Err(LoadError::mapping(
                owner,
                format!("indexed collection '{}' requires an index column", self.name),
            )),
            (AssociationKind::ToOne | AssociationKind::ToMany, Some(_)) => Err(LoadError::mapping(
                owner,
                format!("'{}' declares an index column but is not indexed", self.name),
            )),
            _ => Ok(()),
        }?;
        if self.batch_size == Some(0) {
            return Err(LoadError::mapping(
                owner,
                format!("'{}' has a batch size of zero", self.name),
            ));
        }
        Ok(())
    }
}

/// Entity metadata as seen by the loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: String,
    pub id_columns: Vec<String>,
    /// Attribute columns (attribute name == column name)
    pub columns: Vec<String>,
    pub version_column: Option<String>,
    /// Discriminator column for multi-tenant tables
    pub tenant_column: Option<String>,
    /// Properties (columns) declared unique, usable by unique-key loads
    pub unique_properties: Vec<String>,
    pub filters: Vec<FilterDefinition>,
    pub associations: Vec<AssociationDescriptor>,
    /// Batch size for batched loads of this entity
    pub batch_size: Option<usize>,
    /// Whether instances may be stored in the second-level cache
    pub cacheable: bool,
}

impl EntityDescriptor {
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            id_columns: vec!["id".to_string()],
            columns: Vec::new(),
            version_column: None,
            tenant_column: None,
            unique_properties: Vec::new(),
            filters: Vec::new(),
            associations: Vec::new(),
            batch_size: None,
            cacheable: false,
        }
    }

    pub fn with_id_columns(mut self, columns: &[&str]) -> Self {
        self.id_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_version(mut self, column: &str) -> Self {
        self.version_column = Some(column.to_string());
        self
    }

    pub fn with_tenant_column(mut self, column: &str) -> Self {
        self.tenant_column = Some(column.to_string());
        self
    }

    pub fn with_unique(mut self, property: &str) -> Self {
        self.unique_properties.push(property.to_string());
        self
    }

    pub fn with_filter(mut self, filter: FilterDefinition) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_association(mut self, association: AssociationDescriptor) -> Self {
        self.associations.push(association);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn association(&self, name: &str) -> Option<&AssociationDescriptor> {
        self.associations.iter().find(|a| a.name == name)
    }

    pub fn filter(&self, name: &str) -> Option<&FilterDefinition> {
        self.filters.iter().find(|f| f.name == name)
    }

    pub fn is_versioned(&self) -> bool {
        self.version_column.is_some()
    }

    pub fn is_unique_property(&self, property: &str) -> bool {
        self.unique_properties.iter().any(|p| p == property)
    }

    /// Registry key of a row; the tenant only applies to tenant-scoped tables
    pub fn key(&self, id: Identifier, tenant: Option<&str>) -> EntityKey {
        let tenant = self
            .tenant_column
            .as_ref()
            .and(tenant)
            .map(str::to_string);
        EntityKey::new(self.name.clone(), id).with_tenant(tenant)
    }

    /// Validate the descriptor for consistency
    pub fn validate(&self) -> LoadResult<()> {
        if self.name.is_empty() || self.table.is_empty() {
            return Err(LoadError::mapping(
                &self.name,
                "entity name and table cannot be empty",
            ));
        }
        if self.id_columns.is_empty() {
            return Err(LoadError::mapping(&self.name, "at least one identifier column is required"));
        }
        if self.batch_size == Some(0) {
            return Err(LoadError::mapping(&self.name, "batch size cannot be zero"));
        }
        for property in &self.unique_properties {
            if !self.columns.contains(property) {
                return Err(LoadError::mapping(
                    &self.name,
                    format!("unique property '{}' is not a mapped column", property),
                ));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for association in &self.associations {
            if !seen.insert(association.name.as_str()) {
                return Err(LoadError::mapping(
                    &self.name,
                    format!("association '{}' is declared twice", association.name),
                ));
            }
            association.validate(&self.name)?;
        }
        Ok(())
    }
}

/// Mapping metadata interface consumed by the loader
pub trait MappingMetadata: Send + Sync {
    /// Descriptor for an entity name, if mapped
    fn entity(&self, name: &str) -> Option<Arc<EntityDescriptor>>;
}

/// Look up an entity, treating a missing one as a mapping inconsistency
pub fn require_entity(
    metadata: &dyn MappingMetadata,
    name: &str,
    referenced_from: &str,
) -> LoadResult<Arc<EntityDescriptor>> {
    metadata.entity(name).ok_or_else(|| {
        LoadError::mapping(
            referenced_from,
            format!("references unmapped entity '{}'", name),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_association_defaults() {
        let customer = AssociationDescriptor::to_one("customer", "Customer", "customer_id");
        assert_eq!(customer.fetch, FetchStrategy::Select);
        assert_eq!(customer.owner_columns(), &["customer_id".to_string()]);

        let lines = AssociationDescriptor::to_many("lines", "OrderLine", "order_id");
        assert_eq!(lines.fetch, FetchStrategy::Lazy);
        assert!(lines.owner_columns().is_empty());
        assert!(lines.is_collection());
    }

    #[test]
    fn test_association_validation() {
        assert!(AssociationDescriptor::to_one("customer", "Customer", "customer_id")
            .validate("Order")
            .is_ok());

        let mut broken = AssociationDescriptor::to_many("lines", "OrderLine", "order_id");
        broken.foreign_key.side = ForeignKeySide::Owner;
        assert!(broken.validate("Order").is_err());

        let mut no_index = AssociationDescriptor::indexed("steps", "Step", "plan_id", "position");
        no_index.index_column = None;
        assert!(no_index.validate("Plan").is_err());

        assert!(AssociationDescriptor::shared_key("detail", "OrderDetail")
            .validate("Order")
            .is_ok());
    }

    #[test]
    fn test_entity_validation() {
        let order = EntityDescriptor::new("Order", "orders")
            .with_columns(&["total", "email"])
            .with_unique("email")
            .with_association(AssociationDescriptor::to_one("customer", "Customer", "customer_id"));
        assert!(order.validate().is_ok());

        let bad_unique = EntityDescriptor::new("Order", "orders").with_unique("email");
        assert!(bad_unique.validate().is_err());

        let duplicate = EntityDescriptor::new("Order", "orders")
            .with_association(AssociationDescriptor::to_one("customer", "Customer", "customer_id"))
            .with_association(AssociationDescriptor::to_one("customer", "Customer", "buyer_id"));
        assert!(matches!(
            duplicate.validate(),
            Err(LoadError::MappingInconsistency { .. })
        ));
    }

    #[test]
    fn test_not_found_resolution() {
        let key = EntityKey::new("Address", 4i64);
        assert_eq!(
            NotFoundAction::IgnoreIfMissing.resolve(None, &key),
            Resolution::Absent
        );
        assert_eq!(
            NotFoundAction::Required.resolve(None, &key),
            Resolution::NotFound(key.clone())
        );
        assert!(matches!(
            NotFoundAction::Required.resolve(None, &key).into_result(),
            Err(LoadError::EntityNotFound { .. })
        ));
    }
}
