//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - The `SqlConnection`/`Connector` seam shared by all backends
//! - The sqlx-exasol driver backend and the websocket JSON backend
//! - The connection pool and its leases
//! - Retry of global transaction collisions
//! - SQL quoting helpers

pub mod connection;
pub mod pool;
pub mod retry;
pub mod sql;
pub mod sqlx_backend;
pub mod ws_session;

pub use connection::{Connector, Row, SqlConnection};
pub use pool::{ConnectionPool, Lease, PoolMode};
pub use retry::{RetryPolicy, is_rollback_error, is_rollback_message, run_and_retry_rollbacks};
pub use sqlx_backend::{SqlxConnection, SqlxConnector};
pub use ws_session::{CacheSettings, WsConnector, WsSession};
