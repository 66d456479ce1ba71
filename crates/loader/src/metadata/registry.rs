//! Metadata Registry - runtime storage of entity descriptors

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use super::{AssociationKind, EntityDescriptor, FetchStrategy, MappingMetadata};
use crate::error::{LoadError, LoadResult};

/// Thread-safe registry of entity descriptors, shared between sessions
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    /// Map of entity name -> descriptor
    entities: Arc<DashMap<String, Arc<EntityDescriptor>>>,
}

impl MetadataRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity descriptor, replacing any previous one of the same name
    pub fn register(&self, descriptor: EntityDescriptor) -> LoadResult<()> {
        descriptor.validate()?;
        tracing::debug!(
            "Registering entity '{}' (table {}, {} association(s))",
            descriptor.name,
            descriptor.table,
            descriptor.associations.len()
        );
        self.entities
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Builder-style registration
    pub fn with(self, descriptor: EntityDescriptor) -> LoadResult<Self> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<EntityDescriptor>> {
        self.entities.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Check that every association targets a registered entity and that
    /// shared-primary-key targets have the same identifier width
    pub fn validate_targets(&self) -> LoadResult<()> {
        for entry in self.entities.iter() {
            let owner = entry.value();
            for association in &owner.associations {
                let Some(target) = self.get(&association.target) else {
                    return Err(LoadError::mapping(
                        &owner.name,
                        format!(
                            "association '{}' targets unmapped entity '{}'",
                            association.name, association.target
                        ),
                    ));
                };
                let expected = if association.shares_primary_key {
                    owner.id_columns.len()
                } else {
                    association.foreign_key.columns.len()
                };
                if expected != target.id_columns.len() && association.kind == AssociationKind::ToOne {
                    return Err(LoadError::mapping(
                        &owner.name,
                        format!(
                            "association '{}' has {} key column(s) but '{}' has {} identifier column(s)",
                            association.name,
                            expected,
                            target.name,
                            target.id_columns.len()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Get statistics about the registry
    pub fn stats(&self) -> RegistryStats {
        let mut fetch_strategy_counts = HashMap::new();
        let mut total_associations = 0;
        for entry in self.entities.iter() {
            for association in &entry.value().associations {
                total_associations += 1;
                *fetch_strategy_counts.entry(association.fetch).or_insert(0) += 1;
            }
        }
        RegistryStats {
            total_entities: self.entities.len(),
            total_associations,
            fetch_strategy_counts,
        }
    }

    /// Clear all registered entities
    pub fn clear(&self) {
        self.entities.clear();
    }
}

impl MappingMetadata for MetadataRegistry {
    fn entity(&self, name: &str) -> Option<Arc<EntityDescriptor>> {
        self.get(name)
    }
}

/// Statistics about the metadata registry
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total_entities: usize,
    pub total_associations: usize,
    pub fetch_strategy_counts: HashMap<FetchStrategy, usize>,
}
