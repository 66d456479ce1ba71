//! Second-level cache - entity state shared across sessions
//!
//! Consulted before issuing a statement for a by-key load without a lock.
//! Entries may be stale; nothing here is authoritative.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::identity::Attributes;
use crate::key::EntityKey;
use crate::value::DatabaseValue;

/// Cached state of one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub attributes: Attributes,
    pub version: Option<DatabaseValue>,
}

/// Cache tier the session reads through
#[async_trait]
pub trait SecondLevelCache: Send + Sync {
    async fn get(&self, key: &EntityKey) -> Option<CachedEntity>;

    async fn put(&self, key: &EntityKey, entity: CachedEntity);

    async fn remove(&self, key: &EntityKey);
}

/// Configuration for [`MemoryEntityCache`]
#[derive(Debug, Clone)]
pub struct EntityCacheConfig {
    /// Maximum number of cached rows (0 = unlimited)
    pub max_entries: usize,
    /// Time to live of an entry
    pub ttl: Option<Duration>,
    pub enable_metrics: bool,
}

impl Default for EntityCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Some(Duration::from_secs(300)),
            enable_metrics: true,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    entity: CachedEntity,
    created_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Counters of a [`MemoryEntityCache`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityCacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub expired: u64,
    pub evictions: u64,
}

impl EntityCacheMetrics {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// In-memory second-level cache with TTL expiry
#[derive(Clone)]
pub struct MemoryEntityCache {
    entries: Arc<RwLock<HashMap<EntityKey, CacheEntry>>>,
    config: EntityCacheConfig,
    metrics: Arc<RwLock<EntityCacheMetrics>>,
}

impl MemoryEntityCache {
    pub fn new(config: EntityCacheConfig) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            config,
            metrics: Arc::new(RwLock::new(EntityCacheMetrics::default())),
        }
    }

    pub async fn metrics(&self) -> EntityCacheMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Drop expired entries, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let Some(ttl) = self.config.ttl else {
            return 0;
        };
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(ttl));
        let removed = before - entries.len();
        if removed > 0 && self.config.enable_metrics {
            self.metrics.write().await.expired += removed as u64;
        }
        removed
    }

    async fn record(&self, update: impl FnOnce(&mut EntityCacheMetrics)) {
        if self.config.enable_metrics {
            update(&mut *self.metrics.write().await);
        }
    }
}

impl Default for MemoryEntityCache {
    fn default() -> Self {
        Self::new(EntityCacheConfig::default())
    }
}

#[async_trait]
impl SecondLevelCache for MemoryEntityCache {
    async fn get(&self, key: &EntityKey) -> Option<CachedEntity> {
        let mut entries = self.entries.write().await;
        let lookup = entries.get(key).map(|entry| match self.config.ttl {
            Some(ttl) if entry.is_expired(ttl) => None,
            _ => Some(entry.entity.clone()),
        });
        match lookup {
            None => {
                drop(entries);
                self.record(|m| m.misses += 1).await;
                None
            }
            Some(None) => {
                entries.remove(key);
                drop(entries);
                tracing::trace!("Second-level cache entry for {} expired", key);
                self.record(|m| {
                    m.misses += 1;
                    m.expired += 1;
                })
                .await;
                None
            }
            Some(Some(entity)) => {
                drop(entries);
                self.record(|m| m.hits += 1).await;
                Some(entity)
            }
        }
    }

    async fn put(&self, key: &EntityKey, entity: CachedEntity) {
        let mut entries = self.entries.write().await;
        let mut evicted = 0;
        if self.config.max_entries > 0
            && entries.len() >= self.config.max_entries
            && !entries.contains_key(key)
        {
            // Oldest entry makes room
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&oldest);
                evicted = 1;
            }
        }
        entries.insert(
            key.clone(),
            CacheEntry {
                entity,
                created_at: Instant::now(),
            },
        );
        drop(entries);
        self.record(|m| {
            m.stores += 1;
            m.evictions += evicted;
        })
        .await;
    }

    async fn remove(&self, key: &EntityKey) {
        self.entries.write().await.remove(key);
    }
}
