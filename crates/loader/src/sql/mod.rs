//! SQL rendering for loader statements

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, LoadResult};
use crate::lock::LockMode;

mod select;

pub use select::{
    render_lock, FilterParams, OriginQuery, RenderContext, Restriction, SelectRenderer, SqlWriter,
};

/// SQL dialect types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SqlDialect {
    #[default]
    PostgreSQL,
    MySQL,
    SQLite,
}

impl SqlDialect {
    /// Get the parameter placeholder style for this dialect
    pub fn parameter_placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index + 1),
            SqlDialect::MySQL | SqlDialect::SQLite => "?".to_string(),
        }
    }

    /// Row lock clause appended to a select whose root table has `alias`.
    ///
    /// Modes that need no row lock yield `None`. A dialect that cannot lock
    /// rows fails instead of silently reading unlocked.
    pub fn lock_clause(&self, mode: LockMode, alias: &str) -> LoadResult<Option<String>> {
        if !mode.requires_row_lock() {
            return Ok(None);
        }
        let clause = match (self, mode) {
            (SqlDialect::PostgreSQL, LockMode::PessimisticRead) => format!("FOR SHARE OF {}", alias),
            (SqlDialect::PostgreSQL, LockMode::UpgradeNoWait) => {
                format!("FOR UPDATE OF {} NOWAIT", alias)
            }
            (SqlDialect::PostgreSQL, _) => format!("FOR UPDATE OF {}", alias),
            (SqlDialect::MySQL, LockMode::PessimisticRead) => "LOCK IN SHARE MODE".to_string(),
            (SqlDialect::MySQL, LockMode::UpgradeNoWait) => "FOR UPDATE NOWAIT".to_string(),
            (SqlDialect::MySQL, _) => "FOR UPDATE".to_string(),
            (SqlDialect::SQLite, _) => {
                return Err(LoadError::Configuration(format!(
                    "SQLite cannot acquire {} row locks",
                    mode
                )))
            }
        };
        Ok(Some(clause))
    }
}

impl std::str::FromStr for SqlDialect {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(SqlDialect::PostgreSQL),
            "mysql" | "mariadb" => Ok(SqlDialect::MySQL),
            "sqlite" => Ok(SqlDialect::SQLite),
            other => Err(LoadError::Configuration(format!(
                "unknown SQL dialect '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests;
