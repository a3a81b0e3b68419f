//! Resource adapters.
//!
//! Each managed object kind has a typed spec (deserialized and validated once at the
//! boundary) and implements [`Resource`]. Adapters only build SQL, run it through a
//! [`SqlContext`] and map catalog rows back into the spec.
//!
//! - `connection`: `exasol_connection`
//! - `schema`: `exasol_physical_schema`
//! - `table`: `exasol_table`
//! - `view`: `exasol_view`
//! - `role`: `exasol_role`
//! - `user`: `exasol_user`

pub mod connection;
pub mod role;
pub mod schema;
pub mod table;
pub mod user;
pub mod view;

pub use connection::ConnectionSpec;
pub use role::RoleSpec;
pub use schema::SchemaSpec;
pub use table::{ColumnSpec, ForeignKeySpec, TableSpec};
pub use user::UserSpec;
pub use view::{ViewColumn, ViewSpec};

use crate::db::pool::ConnectionPool;
use crate::db::retry::{RetryPolicy, run_and_retry_rollbacks};
use crate::db::{Row, sql};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The closed set of managed object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceKind {
    Connection,
    PhysicalSchema,
    Table,
    View,
    Role,
    User,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Connection,
        ResourceKind::PhysicalSchema,
        ResourceKind::Role,
        ResourceKind::Table,
        ResourceKind::User,
        ResourceKind::View,
    ];

    /// Resource type name used by the plugin host.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Connection => "exasol_connection",
            Self::PhysicalSchema => "exasol_physical_schema",
            Self::Table => "exasol_table",
            Self::View => "exasol_view",
            Self::Role => "exasol_role",
            Self::User => "exasol_user",
        }
    }

    /// Human-readable object kind for messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connection => "Connection",
            Self::PhysicalSchema => "Schema",
            Self::Table => "Table",
            Self::View => "View",
            Self::Role => "Role",
            Self::User => "User",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

impl FromStr for ResourceKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.type_name() == s)
            .ok_or_else(|| {
                ProviderError::invalid_argument(format!("Unknown resource type '{}'", s))
            })
    }
}

/// Everything an adapter needs to talk to the database.
#[derive(Clone, Copy)]
pub struct SqlContext<'a> {
    pub pool: &'a ConnectionPool,
    pub retry: &'a RetryPolicy,
    pub cancel: &'a CancellationToken,
}

impl<'a> SqlContext<'a> {
    pub fn new(
        pool: &'a ConnectionPool,
        retry: &'a RetryPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            pool,
            retry,
            cancel,
        }
    }

    pub async fn fetch(&self, sql: &str, args: &[String]) -> ProviderResult<Vec<Row>> {
        self.pool.fetch(sql, args).await
    }

    /// Run DDL statements in order, stopping at the first failure.
    ///
    /// With `retry_collisions`, each statement is retried on its own when the database
    /// rolls it back because of a global transaction collision.
    pub async fn apply(&self, statements: &[String], retry_collisions: bool) -> ProviderResult<()> {
        let pool = self.pool;
        for statement in statements {
            debug!(sql = %statement, retry_collisions, "Applying statement");
            if retry_collisions {
                run_and_retry_rollbacks(self.retry, self.cancel, || {
                    pool.execute(statement, &[])
                })
                .await?;
            } else {
                pool.execute(statement, &[]).await?;
            }
        }
        Ok(())
    }
}

/// Lifecycle of one managed object kind.
#[async_trait]
pub trait Resource: Sized + Clone + Serialize + DeserializeOwned + JsonSchema + Send + Sync {
    const KIND: ResourceKind;

    /// Whether DDL on this kind touches global objects and needs collision retries.
    const GLOBAL: bool = false;

    /// Check required attributes before any SQL runs.
    fn validate(&self) -> ProviderResult<()>;

    /// Identifier stored by the plugin host.
    fn id(&self) -> String;

    /// Create the object and return its state as read back from the catalog.
    async fn create(&self, ctx: &SqlContext<'_>) -> ProviderResult<Self>;

    /// Read the object identified by `id`. `prior` supplies values the catalog never
    /// returns, such as passwords.
    async fn read(id: &str, prior: Option<&Self>, ctx: &SqlContext<'_>) -> ProviderResult<Self>;

    /// Move the object from `prior` to `planned`.
    async fn update(prior: &Self, planned: &Self, ctx: &SqlContext<'_>) -> ProviderResult<Self>;

    async fn delete(&self, ctx: &SqlContext<'_>) -> ProviderResult<()>;

    /// Whether the object still exists; not-found is `false`, other errors propagate.
    async fn exists(id: &str, ctx: &SqlContext<'_>) -> ProviderResult<bool> {
        match Self::read(id, None, ctx).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Adopt an existing object by id.
    async fn import(id: &str, ctx: &SqlContext<'_>) -> ProviderResult<Self> {
        Self::read(id, None, ctx).await
    }
}

/// Require a non-empty attribute.
pub fn require(field: &str, value: &str) -> ProviderResult<()> {
    if value.trim().is_empty() {
        return Err(ProviderError::invalid_argument(format!(
            "'{}' must not be empty",
            field
        )));
    }
    Ok(())
}

/// Id of a schema-level object: `SCHEMA.NAME`, both upper-cased.
pub fn qualified_id(schema: &str, name: &str) -> String {
    format!("{}.{}", sql::normalize_name(schema), sql::normalize_name(name))
}

/// Split a `SCHEMA.NAME` id.
pub fn parse_qualified_id(id: &str) -> ProviderResult<(String, String)> {
    match id.split_once('.') {
        Some((schema, name)) if !schema.trim().is_empty() && !name.trim().is_empty() => {
            Ok((sql::normalize_name(schema), sql::normalize_name(name)))
        }
        _ => Err(ProviderError::invalid_argument(format!(
            "Id '{}' must have the form SCHEMA.NAME",
            id
        ))),
    }
}

/// Validate a plain-name id.
pub fn parse_name_id(id: &str) -> ProviderResult<String> {
    require("id", id)?;
    Ok(sql::normalize_name(id))
}

/// Names equal under the database's case folding.
pub fn same_name(a: &str, b: &str) -> bool {
    sql::normalize_name(a) == sql::normalize_name(b)
}
