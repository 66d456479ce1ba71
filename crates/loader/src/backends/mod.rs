//! Statement executors over real database drivers

pub mod postgres;

pub use postgres::{PgResultRow, PgStatementExecutor};
