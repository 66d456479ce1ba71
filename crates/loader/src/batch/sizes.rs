use crate::error::{LoadError, LoadResult};
use crate::key::EntityKey;

/// Descending sequence of statement sizes available to a batched load.
///
/// Always ends in 1. The first element is the maximum batch size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSizes(Vec<usize>);

/// One statement's worth of keys, padded up to the chosen slot size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBatch {
    pub keys: Vec<EntityKey>,
    /// Number of distinct keys before padding
    pub distinct: usize,
}

impl KeyBatch {
    pub fn is_single(&self) -> bool {
        self.keys.len() == 1
    }

    pub fn distinct_keys(&self) -> &[EntityKey] {
        &self.keys[..self.distinct]
    }
}

impl BatchSizes {
    /// `max`, then every power of two below it
    pub fn powers_of_two(max: usize) -> LoadResult<Self> {
        ensure_positive(max)?;
        let mut sizes = vec![max];
        let mut power = max.next_power_of_two();
        while power > 1 {
            power /= 2;
            if power < max {
                sizes.push(power);
            }
        }
        Ok(Self(sizes))
    }

    /// `max`, halving while above ten, then ten down to one
    pub fn legacy(max: usize) -> LoadResult<Self> {
        ensure_positive(max)?;
        let mut sizes = Vec::new();
        let mut size = max;
        while size > 0 {
            sizes.push(size);
            size = if size <= 10 {
                size - 1
            } else if size / 2 < 10 {
                10
            } else {
                size / 2
            };
        }
        Ok(Self(sizes))
    }

    /// Explicit sizes; sorted descending, deduplicated, and completed with 1
    pub fn fixed(mut sizes: Vec<usize>) -> LoadResult<Self> {
        if sizes.is_empty() {
            return Err(LoadError::Configuration(
                "batch size list cannot be empty".to_string(),
            ));
        }
        if sizes.contains(&0) {
            return Err(LoadError::Configuration(
                "batch sizes must be positive".to_string(),
            ));
        }
        sizes.sort_unstable_by(|a, b| b.cmp(a));
        sizes.dedup();
        if sizes.last() != Some(&1) {
            sizes.push(1);
        }
        Ok(Self(sizes))
    }

    pub fn max(&self) -> usize {
        self.0[0]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Smallest available size that holds `count` keys
    fn slot_for(&self, count: usize) -> usize {
        self.0
            .iter()
            .rev()
            .copied()
            .find(|size| *size >= count)
            .unwrap_or_else(|| self.max())
    }

    /// Split keys into the fewest statements: full batches of the maximum,
    /// then one batch in the smallest slot that fits the remainder, padded
    /// by repeating its last key.
    pub fn split(&self, keys: Vec<EntityKey>) -> Vec<KeyBatch> {
        let max = self.max();
        let mut batches = Vec::with_capacity(keys.len().div_ceil(max));
        let mut remaining = keys.as_slice();
        while !remaining.is_empty() {
            let slot = if remaining.len() >= max {
                max
            } else {
                self.slot_for(remaining.len())
            };
            let take = slot.min(remaining.len());
            let (head, tail) = remaining.split_at(take);
            let mut batch = head.to_vec();
            if let Some(last) = head.last() {
                batch.resize(slot, last.clone());
            }
            batches.push(KeyBatch {
                keys: batch,
                distinct: take,
            });
            remaining = tail;
        }
        batches
    }
}

fn ensure_positive(max: usize) -> LoadResult<()> {
    if max == 0 {
        return Err(LoadError::Configuration(
            "maximum batch size must be at least 1".to_string(),
        ));
    }
    Ok(())
}
