//! Connection abstraction shared by every database backend.
//!
//! The pool and the resource adapters only talk to [`SqlConnection`] trait objects, so the
//! sqlx driver, the websocket JSON session and the scripted connections used in tests are
//! interchangeable.

use crate::error::ProviderResult;
use async_trait::async_trait;

/// One result row. Catalog queries cast every column to text, `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// A single live database session.
#[async_trait]
pub trait SqlConnection: Send {
    /// Execute a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str, args: &[String]) -> ProviderResult<u64>;

    /// Execute a query and return all rows.
    async fn fetch(&mut self, sql: &str, args: &[String]) -> ProviderResult<Vec<Row>>;

    async fn commit(&mut self) -> ProviderResult<()>;

    async fn rollback(&mut self) -> ProviderResult<()>;

    /// Close the session. The connection must not be used afterwards.
    async fn close(&mut self) -> ProviderResult<()>;
}

/// Opens new sessions for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> ProviderResult<Box<dyn SqlConnection>>;

    /// Name of the backend for logging.
    fn name(&self) -> &'static str;
}

/// Read a text cell, treating NULL as an empty string.
pub fn cell(row: &Row, index: usize) -> String {
    row.get(index).cloned().flatten().unwrap_or_default()
}

/// Read an optional text cell; NULL and empty strings both map to `None`.
pub fn opt_cell(row: &Row, index: usize) -> Option<String> {
    row.get(index).cloned().flatten().filter(|s| !s.is_empty())
}

/// Read a boolean cell rendered as text (`TRUE`, `true`, `1`).
pub fn bool_cell(row: &Row, index: usize) -> bool {
    matches!(
        cell(row, index).to_ascii_lowercase().as_str(),
        "true" | "1"
    )
}

/// Read an integer cell rendered as text; unparsable values map to `None`.
pub fn int_cell(row: &Row, index: usize) -> Option<i64> {
    let text = opt_cell(row, index)?;
    // DECIMAL casts may carry a fractional part such as "3.0"
    let integral = text.split('.').next().unwrap_or_default();
    integral.trim().parse().ok()
}
