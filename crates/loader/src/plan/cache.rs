use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::{FetchPlan, FetchPlanBuilder};
use crate::error::LoadResult;
use crate::lock::LockMode;

/// Query shape a plan is built for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanKey {
    pub root: String,
    /// Enabled filter names, sorted
    pub filters: Vec<String>,
    pub lock: LockMode,
    /// Requested join paths, sorted
    pub joins: Vec<String>,
}

impl PlanKey {
    pub fn new(root: &str, lock: LockMode) -> Self {
        Self {
            root: root.to_string(),
            filters: Vec::new(),
            lock,
            joins: Vec::new(),
        }
    }

    pub fn with_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters = normalize(filters);
        self
    }

    pub fn with_joins<I, S>(mut self, joins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.joins = normalize(joins);
        self
    }
}

fn normalize<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut items: Vec<String> = items.into_iter().map(Into::into).collect();
    items.sort();
    items.dedup();
    items
}

/// Plans shared by every session over the same metadata
#[derive(Debug, Default)]
pub struct PlanCache {
    plans: DashMap<PlanKey, Arc<FetchPlan>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Plan cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached plan for `key`, building and caching it on a miss.
    ///
    /// Build failures are not cached.
    pub fn get_or_build(
        &self,
        key: &PlanKey,
        builder: &FetchPlanBuilder<'_>,
    ) -> LoadResult<Arc<FetchPlan>> {
        if let Some(plan) = self.plans.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(plan.value().clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let plan = Arc::new(builder.build(&key.root, key.lock, &key.filters, &key.joins)?);
        let plan = self
            .plans
            .entry(key.clone())
            .or_insert(plan)
            .value()
            .clone();
        Ok(plan)
    }

    /// Drop cached plans rooted at an entity (after its mapping changed)
    pub fn invalidate(&self, root: &str) {
        self.plans.retain(|key, _| key.root != root);
    }

    pub fn clear(&self) {
        self.plans.clear();
    }

    pub fn stats(&self) -> PlanCacheStats {
        PlanCacheStats {
            entries: self.plans.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
