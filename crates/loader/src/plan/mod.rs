//! Fetch plans - which associations are read by one statement, and where
//! their columns sit in each result row

use std::sync::Arc;

use crate::lock::LockMode;
use crate::metadata::{AssociationDescriptor, EntityDescriptor, FetchStrategy};

mod builder;
mod cache;

pub use builder::FetchPlanBuilder;
pub use cache::{PlanCache, PlanCacheStats, PlanKey};

/// Role of a node in the row walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// The entity being loaded
    Root,
    /// Single-valued association of the parent node
    ToOne,
    /// Element of an unindexed collection of the parent node
    ToManyElement,
    /// Element of an indexed collection, keyed by its index column
    CollectionIndex,
}

impl NodeKind {
    pub fn is_collection(self) -> bool {
        matches!(self, NodeKind::ToManyElement | NodeKind::CollectionIndex)
    }
}

/// One association (or the root) in a fetch plan
#[derive(Debug, Clone)]
pub struct FetchNode {
    pub kind: NodeKind,
    pub parent: Option<usize>,
    /// Association of the parent this node fills; `None` for the root
    pub association: Option<AssociationDescriptor>,
    pub entity: Arc<EntityDescriptor>,
    /// `Join` for the root and every node read by this statement
    pub strategy: FetchStrategy,
    /// Table alias; set only for nodes read by this statement
    pub alias: Option<String>,
    pub depth: usize,
    /// Dotted association path from the root (empty for the root)
    pub path: String,
    /// Join was asked for by the caller rather than the mapping
    pub requested: bool,
    pub id_positions: Vec<usize>,
    /// Attribute and owner-side foreign key columns, by column name
    pub attribute_positions: Vec<(String, usize)>,
    pub version_position: Option<usize>,
    pub index_position: Option<usize>,
}

impl FetchNode {
    /// Whether the node's columns are part of this statement's rows
    pub fn is_read_by_statement(&self) -> bool {
        self.alias.is_some()
    }

    pub fn association_name(&self) -> &str {
        self.association
            .as_ref()
            .map(|a| a.name.as_str())
            .unwrap_or("")
    }
}

/// A column in the statement's select list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedColumn {
    pub alias: String,
    pub column: String,
    /// Column label in the result set
    pub label: String,
}

/// A filter predicate with the table alias already substituted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFilter {
    pub name: String,
    pub condition: String,
}

/// Outer join that brings a node's table into the statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinClause {
    pub node: usize,
    pub table: String,
    pub alias: String,
    /// `left = right` column pairs
    pub on: Vec<(String, String)>,
    /// Filters of the joined entity; rendered into the ON clause
    pub filters: Vec<AppliedFilter>,
    pub tenant_column: Option<String>,
}

/// Fetch plan for one query shape
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub nodes: Vec<FetchNode>,
    pub columns: Vec<ProjectedColumn>,
    pub joins: Vec<JoinClause>,
    /// Filters of the root entity; rendered into the WHERE clause
    pub filters: Vec<AppliedFilter>,
    pub lock_mode: LockMode,
}

impl FetchPlan {
    pub fn root(&self) -> &FetchNode {
        &self.nodes[0]
    }

    pub fn root_entity(&self) -> &Arc<EntityDescriptor> {
        &self.nodes[0].entity
    }

    pub fn root_alias(&self) -> &str {
        self.nodes[0].alias.as_deref().unwrap_or("")
    }

    pub fn node(&self, index: usize) -> &FetchNode {
        &self.nodes[index]
    }

    pub fn children(&self, parent: usize) -> impl Iterator<Item = (usize, &FetchNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, node)| node.parent == Some(parent))
    }

    /// Nodes whose columns are in the row, in walk order
    pub fn statement_nodes(&self) -> impl Iterator<Item = (usize, &FetchNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_read_by_statement())
    }

    /// Whether a joined collection can repeat the root across rows
    pub fn has_collection_join(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| node.kind.is_collection() && node.is_read_by_statement())
    }

    pub fn node_by_path(&self, path: &str) -> Option<&FetchNode> {
        self.nodes.iter().find(|node| node.path == path)
    }
}

#[cfg(test)]
mod tests;
