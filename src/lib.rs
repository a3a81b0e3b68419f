//! Exasol provider library.
//!
//! Manages Exasol connections, physical schemas, tables, views, roles and users through
//! a pool of database sessions, with retry of global transaction collisions and an
//! optional recorded-response cache for the websocket driver.

pub mod cache;
pub mod config;
pub mod credentials;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod provider;
pub mod resources;
pub mod transport;

pub use config::Config;
pub use error::{ProviderError, ProviderResult};
pub use provider::{Outcome, Provider};
