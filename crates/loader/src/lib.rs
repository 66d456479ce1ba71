//! # elif-loader: entity loading for elif.rs
//!
//! Turns mapping metadata into fetch plans, renders them into SQL, and
//! materializes result rows into a per-session identity registry. Deferred
//! associations are loaded by key, in batches or through subselects; actions
//! such as refresh, lock, delete and evict cascade along mapped associations.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use elif_loader::*;
//! # async fn example(metadata: Arc<MetadataRegistry>, executor: Arc<PgStatementExecutor>) -> LoadResult<()> {
//! let mut session = LoadSession::new(metadata, executor, LoaderConfig::default())?;
//! let key = session.key("Order", 5i64)?;
//! if let Some(order) = session.load(&key, None, LockMode::None).await? {
//!     session.cascade(CascadeAction::Lock(LockMode::Upgrade), order).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod backends;
pub mod batch;
pub mod cache;
pub mod cascade;
pub mod config;
pub mod error;
pub mod executor;
pub mod identity;
pub mod key;
pub mod lock;
pub mod metadata;
pub mod plan;
pub mod session;
pub mod sql;
pub mod value;

#[cfg(test)]
mod tests;

pub use assembler::{AssembledRow, Assembly, PendingLoad, RowAssembler, RowPolicy};
pub use backends::PgStatementExecutor;
pub use batch::{BatchRole, BatchSizes, BatchingLoader, KeyBatch};
pub use cache::{CachedEntity, EntityCacheConfig, MemoryEntityCache, SecondLevelCache};
pub use cascade::{CascadeAction, CascadeKind, CascadePolicy};
pub use config::{BatchSizing, LoaderConfig};
pub use error::{LoadError, LoadResult};
pub use executor::{DatabaseRow, SimpleRow, Statement, StatementExecutor};
pub use identity::{AssociationValue, EntityId, EntitySlot, EntityStatus, IdentityRegistry};
pub use key::{EntityKey, Identifier, UniqueKey};
pub use lock::LockMode;
pub use metadata::{
    AssociationDescriptor, AssociationKind, EntityDescriptor, FetchStrategy, FilterDefinition,
    ForeignKeyConfig, MappingMetadata, MetadataRegistry, NotFoundAction,
};
pub use plan::{FetchPlan, FetchPlanBuilder, PlanCache, PlanKey};
pub use session::{CascadeReport, LoadOptions, LoadSession, SessionStats};
pub use sql::{FilterParams, SqlDialect};
pub use value::DatabaseValue;
