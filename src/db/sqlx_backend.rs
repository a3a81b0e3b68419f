//! Database backend built on the `sqlx-exasol` driver.

use crate::db::connection::{Connector, Row, SqlConnection};
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use sqlx::{ConnectOptions, Connection, Row as _};
use sqlx_exasol::{ExaConnectOptions, ExaConnection, Exasol};
use tracing::debug;
use url::Url;

/// Builds `exa://` URLs for the driver and opens sessions from them.
#[derive(Debug, Clone)]
pub struct SqlxConnector {
    options: ExaConnectOptions,
}

impl SqlxConnector {
    /// Create a connector from the provider's host/port/credential settings.
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> ProviderResult<Self> {
        let url = connection_url(host, port, username, password)?;
        Self::from_url(url.as_str())
    }

    /// Create a connector from a full `exa://` connection string.
    pub fn from_url(url: &str) -> ProviderResult<Self> {
        let options = url.parse::<ExaConnectOptions>()?;
        Ok(Self { options })
    }
}

/// Assemble the driver URL, percent-encoding the credentials.
pub fn connection_url(host: &str, port: u16, username: &str, password: &str) -> ProviderResult<Url> {
    let mut url = Url::parse(&format!("exa://{}:{}", host, port))
        .map_err(|e| ProviderError::invalid_argument(format!("Invalid host '{}': {}", host, e)))?;
    url.set_username(username)
        .map_err(|_| ProviderError::invalid_argument("Username cannot be set on this URL"))?;
    if !password.is_empty() {
        url.set_password(Some(password))
            .map_err(|_| ProviderError::invalid_argument("Password cannot be set on this URL"))?;
    }
    Ok(url)
}

#[async_trait]
impl Connector for SqlxConnector {
    async fn connect(&self) -> ProviderResult<Box<dyn SqlConnection>> {
        let conn = self.options.connect().await?;
        debug!("Opened sqlx-exasol session");
        Ok(Box::new(SqlxConnection { inner: Some(conn) }))
    }

    fn name(&self) -> &'static str {
        "sqlx"
    }
}

/// A single `ExaConnection`. Runs in autocommit mode; explicit COMMIT/ROLLBACK
/// statements end whatever the adapter started.
pub struct SqlxConnection {
    inner: Option<ExaConnection>,
}

impl SqlxConnection {
    fn conn(&mut self) -> ProviderResult<&mut ExaConnection> {
        self.inner.as_mut().ok_or_else(|| {
            ProviderError::connection("Session already closed", "Reconnect the provider")
        })
    }
}

#[async_trait]
impl SqlConnection for SqlxConnection {
    async fn execute(&mut self, sql: &str, args: &[String]) -> ProviderResult<u64> {
        let conn = self.conn()?;
        let mut query = sqlx::query::<Exasol>(sql);
        for arg in args {
            query = query.bind(arg.as_str());
        }
        let result = query.execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    async fn fetch(&mut self, sql: &str, args: &[String]) -> ProviderResult<Vec<Row>> {
        let conn = self.conn()?;
        let mut query = sqlx::query::<Exasol>(sql);
        for arg in args {
            query = query.bind(arg.as_str());
        }
        let rows = query.fetch_all(&mut *conn).await?;
        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<Option<String>, _>(i).map_err(ProviderError::from))
                    .collect::<ProviderResult<Row>>()
            })
            .collect()
    }

    async fn commit(&mut self) -> ProviderResult<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&mut self) -> ProviderResult<()> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }

    async fn close(&mut self) -> ProviderResult<()> {
        if let Some(conn) = self.inner.take() {
            conn.close().await?;
        }
        Ok(())
    }
}
