//! Loader configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchSizes;
use crate::error::{LoadError, LoadResult};
use crate::sql::SqlDialect;

/// How batch sizes below the configured maximum are chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BatchSizing {
    /// The maximum, then every power of two below it
    #[default]
    PowersOfTwo,
    /// The maximum, halving while above ten, then ten down to one
    Legacy,
    /// An explicit list of sizes; the largest acts as the maximum
    Fixed(Vec<usize>),
}

/// Configuration for a load session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Maximum depth of joined associations in one statement
    pub max_fetch_depth: usize,
    /// Maximum number of nodes in a fetch plan
    pub max_plan_nodes: usize,
    /// Batch size used when neither entity nor association declares one
    pub default_batch_size: usize,
    pub batch_sizing: BatchSizing,
    /// Maximum number of instances a single cascade may visit
    pub max_cascade_visits: usize,
    /// Maximum number of deferred-load rounds after a statement
    pub max_resolution_rounds: usize,
    /// Statement timeout in milliseconds, passed through to the executor
    pub statement_timeout_ms: Option<u64>,
    pub dialect: SqlDialect,
    /// Consult and fill the second-level cache for unlocked loads
    pub use_second_level_cache: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_fetch_depth: 2,
            max_plan_nodes: 64,
            default_batch_size: 16,
            batch_sizing: BatchSizing::PowersOfTwo,
            max_cascade_visits: 100_000,
            max_resolution_rounds: 1024,
            statement_timeout_ms: None,
            dialect: SqlDialect::PostgreSQL,
            use_second_level_cache: true,
        }
    }
}

impl LoaderConfig {
    /// Validate the configuration
    pub fn validate(&self) -> LoadResult<()> {
        if self.max_plan_nodes == 0 {
            return Err(LoadError::Configuration(
                "max_plan_nodes must be at least 1".to_string(),
            ));
        }
        if self.default_batch_size == 0 {
            return Err(LoadError::Configuration(
                "default_batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_cascade_visits == 0 || self.max_resolution_rounds == 0 {
            return Err(LoadError::Configuration(
                "cascade and resolution limits must be at least 1".to_string(),
            ));
        }
        if self.statement_timeout_ms == Some(0) {
            return Err(LoadError::Configuration(
                "statement_timeout_ms must be positive when set".to_string(),
            ));
        }
        if let BatchSizing::Fixed(sizes) = &self.batch_sizing {
            BatchSizes::fixed(sizes.clone())?;
        }
        Ok(())
    }

    pub fn with_dialect(mut self, dialect: SqlDialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_max_fetch_depth(mut self, depth: usize) -> Self {
        self.max_fetch_depth = depth;
        self
    }

    pub fn with_batch_sizing(mut self, sizing: BatchSizing) -> Self {
        self.batch_sizing = sizing;
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn without_second_level_cache(mut self) -> Self {
        self.use_second_level_cache = false;
        self
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }

    /// Batch size sequence for a declared maximum (falls back to the default)
    pub fn batch_sizes_for(&self, declared: Option<usize>) -> LoadResult<BatchSizes> {
        let max = declared.unwrap_or(self.default_batch_size);
        match &self.batch_sizing {
            BatchSizing::PowersOfTwo => BatchSizes::powers_of_two(max),
            BatchSizing::Legacy => BatchSizes::legacy(max),
            BatchSizing::Fixed(sizes) => BatchSizes::fixed(sizes.clone()),
        }
    }

    /// Defaults overridden by `ELIF_LOADER_*` environment variables
    pub fn from_env() -> LoadResult<Self> {
        let mut config = Self::default();
        if let Some(value) = env_parse::<usize>("ELIF_LOADER_MAX_FETCH_DEPTH")? {
            config.max_fetch_depth = value;
        }
        if let Some(value) = env_parse::<usize>("ELIF_LOADER_MAX_PLAN_NODES")? {
            config.max_plan_nodes = value;
        }
        if let Some(value) = env_parse::<usize>("ELIF_LOADER_BATCH_SIZE")? {
            config.default_batch_size = value;
        }
        if let Some(value) = env_parse::<usize>("ELIF_LOADER_MAX_CASCADE_VISITS")? {
            config.max_cascade_visits = value;
        }
        if let Some(value) = env_parse::<u64>("ELIF_LOADER_STATEMENT_TIMEOUT_MS")? {
            config.statement_timeout_ms = Some(value);
        }
        if let Ok(sizing) = std::env::var("ELIF_LOADER_BATCH_SIZING") {
            config.batch_sizing = match sizing.to_ascii_lowercase().as_str() {
                "legacy" => BatchSizing::Legacy,
                "powers_of_two" | "pow2" => BatchSizing::PowersOfTwo,
                other => {
                    return Err(LoadError::Configuration(format!(
                        "unknown batch sizing '{}'",
                        other
                    )))
                }
            };
        }
        if let Ok(dialect) = std::env::var("ELIF_LOADER_DIALECT") {
            config.dialect = dialect.parse()?;
        }
        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> LoadResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| LoadError::Configuration(format!("{} has an invalid value '{}'", name, raw))),
        Err(_) => Ok(None),
    }
}
