//! Database backend speaking Exasol's websocket JSON API directly.
//!
//! Every request goes through a [`JsonTransport`], which lets a [`JsonCache`] record and
//! replay the session. Only the commands the provider needs are implemented: login,
//! execute, fetch, closeResultSet and disconnect.

use crate::cache::{BlobStore, JsonCache};
use crate::db::connection::{Connector, Row, SqlConnection};
use crate::db::sql::bind_literals;
use crate::diagnostics::Diagnostics;
use crate::error::{ProviderError, ProviderResult, classify_database_error};
use crate::transport::{JsonTransport, WebSocketTransport};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as STD_BASE64_ENGINE};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

/// Protocol version requested at login.
pub const PROTOCOL_VERSION: u32 = 1;
/// Bytes requested per `fetch` round trip for large result sets.
pub const FETCH_NUM_BYTES: u64 = 5 * 1024 * 1024;
pub const CLIENT_NAME: &str = "exasol-provider";

/// Where recorded responses go when the session is cached.
#[derive(Clone)]
pub struct CacheSettings {
    pub store: Arc<dyn BlobStore>,
    pub id: String,
    pub diagnostics: Diagnostics,
}

/// Opens websocket sessions, optionally wrapped in a response cache.
#[derive(Clone)]
pub struct WsConnector {
    url: String,
    username: String,
    password: String,
    compression: bool,
    cache: Option<CacheSettings>,
}

impl WsConnector {
    pub fn new(
        host: &str,
        port: u16,
        tls: bool,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let scheme = if tls { "wss" } else { "ws" };
        Self {
            url: format!("{}://{}:{}", scheme, host, port),
            username: username.into(),
            password: password.into(),
            compression: false,
            cache: None,
        }
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn with_cache(mut self, cache: CacheSettings) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> ProviderResult<Box<dyn SqlConnection>> {
        let transport = WebSocketTransport::connect(&self.url).await?;
        match &self.cache {
            Some(cache) => {
                let cached = JsonCache::new(
                    transport,
                    cache.store.clone(),
                    cache.id.clone(),
                    cache.diagnostics.clone(),
                );
                let session =
                    WsSession::login(cached, &self.username, &self.password, self.compression)
                        .await?;
                Ok(Box::new(session))
            }
            None => {
                let session =
                    WsSession::login(transport, &self.username, &self.password, self.compression)
                        .await?;
                Ok(Box::new(session))
            }
        }
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyData {
    public_key_pem: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionData {
    #[serde(default)]
    session_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResultsData {
    results: Vec<StatementResult>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", rename_all = "camelCase")]
enum StatementResult {
    #[serde(rename_all = "camelCase")]
    RowCount { row_count: u64 },
    #[serde(rename_all = "camelCase")]
    ResultSet { result_set: ResultSet },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSet {
    #[serde(default)]
    result_set_handle: Option<i64>,
    num_columns: usize,
    num_rows: u64,
    #[serde(default)]
    num_rows_in_message: u64,
    /// Column-major: one array per column.
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchData {
    num_rows: u64,
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

/// One logged-in session on top of a JSON transport.
pub struct WsSession<T> {
    transport: T,
    session_id: Option<String>,
    closed: bool,
}

impl<T: JsonTransport> WsSession<T> {
    /// Run the two-step credentials login: fetch the server's public key, then send the
    /// RSA-encrypted password.
    pub async fn login(
        mut transport: T,
        username: &str,
        password: &str,
        compression: bool,
    ) -> ProviderResult<Self> {
        let key_data: PublicKeyData = roundtrip(
            &mut transport,
            &json!({"command": "login", "protocolVersion": PROTOCOL_VERSION}),
        )
        .await?;
        let encrypted = encrypt_password(&key_data.public_key_pem, password)?;

        let session: SessionData = roundtrip(
            &mut transport,
            &json!({
                "username": username,
                "password": encrypted,
                "useCompression": compression,
                "clientName": CLIENT_NAME,
                "clientVersion": env!("CARGO_PKG_VERSION"),
            }),
        )
        .await
        .map_err(|e| match e {
            ProviderError::Database { message, .. } => ProviderError::connection(
                message,
                "Check the username and password of the provider configuration",
            ),
            other => other,
        })?;
        transport.set_compression(compression);

        let session_id = session.session_id.map(|id| match id {
            Value::String(s) => s,
            other => other.to_string(),
        });
        info!(session_id = ?session_id, "Websocket session logged in");

        Ok(Self {
            transport,
            session_id,
            closed: false,
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn ensure_open(&self) -> ProviderResult<()> {
        if self.closed {
            return Err(ProviderError::connection(
                "Session already closed",
                "Reconnect the provider",
            ));
        }
        Ok(())
    }

    async fn run(&mut self, sql: &str, args: &[String]) -> ProviderResult<StatementResult> {
        self.ensure_open()?;
        let sql_text = bind_literals(sql, args);
        debug!(sql = %sql_text, "Executing over websocket");
        let mut data: ResultsData = roundtrip(
            &mut self.transport,
            &json!({"command": "execute", "sqlText": sql_text}),
        )
        .await?;
        if data.results.is_empty() {
            return Err(ProviderError::internal("Execute returned no results"));
        }
        Ok(data.results.swap_remove(0))
    }

    /// Pull the remaining rows of a result set and close its handle.
    async fn drain(&mut self, mut result_set: ResultSet) -> ProviderResult<Vec<Row>> {
        let mut columns = std::mem::take(&mut result_set.data);
        columns.resize_with(result_set.num_columns, Vec::new);
        let mut fetched = result_set.num_rows_in_message;

        if let Some(handle) = result_set.result_set_handle {
            while fetched < result_set.num_rows {
                let chunk: FetchData = roundtrip(
                    &mut self.transport,
                    &json!({
                        "command": "fetch",
                        "resultSetHandle": handle,
                        "startPosition": fetched,
                        "numBytes": FETCH_NUM_BYTES,
                    }),
                )
                .await?;
                if chunk.num_rows == 0 {
                    break;
                }
                for (column, values) in columns.iter_mut().zip(chunk.data) {
                    column.extend(values);
                }
                fetched += chunk.num_rows;
            }
            let _: Value = roundtrip(
                &mut self.transport,
                &json!({"command": "closeResultSet", "resultSetHandles": [handle]}),
            )
            .await?;
        }

        Ok(transpose(columns))
    }
}

/// Send one request and decode the `responseData` of an `ok` response.
async fn roundtrip<T, R>(transport: &mut T, request: &Value) -> ProviderResult<R>
where
    T: JsonTransport,
    R: for<'de> Deserialize<'de>,
{
    transport.write_json(request).await?;
    let response = transport.read_json().await?;
    let data = response_data(response)?;
    serde_json::from_value(data).map_err(|e| {
        ProviderError::transport(format!("Unexpected response shape: {}", e))
    })
}

/// Unwrap `{"status": "ok", "responseData": ...}` or turn `{"status": "error", ...}` into
/// the matching error.
fn response_data(mut response: Value) -> ProviderResult<Value> {
    match response.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(response
            .get_mut("responseData")
            .map(Value::take)
            .unwrap_or(Value::Null)),
        Some("error") => {
            let exception = response.get("exception");
            let text = exception
                .and_then(|e| e.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            let code = exception
                .and_then(|e| e.get("sqlCode"))
                .and_then(Value::as_str)
                .map(String::from);
            Err(classify_database_error(text, code))
        }
        other => Err(ProviderError::transport(format!(
            "Unexpected response status {:?}",
            other
        ))),
    }
}

fn encrypt_password(pem: &str, password: &str) -> ProviderResult<String> {
    let key = RsaPublicKey::from_pkcs1_pem(pem)
        .map_err(|e| ProviderError::transport(format!("Invalid server public key: {}", e)))?;
    let encrypted = key
        .encrypt(&mut rand::rngs::OsRng, Pkcs1v15Encrypt, password.as_bytes())
        .map_err(|e| ProviderError::internal(format!("Password encryption failed: {}", e)))?;
    Ok(STD_BASE64_ENGINE.encode(encrypted))
}

fn value_to_cell(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Turn column-major data into rows.
fn transpose(columns: Vec<Vec<Value>>) -> Vec<Row> {
    let num_rows = columns.iter().map(Vec::len).max().unwrap_or(0);
    let mut rows: Vec<Row> = (0..num_rows)
        .map(|_| Vec::with_capacity(columns.len()))
        .collect();
    for column in columns {
        let mut values = column.into_iter();
        for row in rows.iter_mut() {
            row.push(values.next().and_then(value_to_cell));
        }
    }
    rows
}

#[async_trait]
impl<T: JsonTransport> SqlConnection for WsSession<T> {
    async fn execute(&mut self, sql: &str, args: &[String]) -> ProviderResult<u64> {
        match self.run(sql, args).await? {
            StatementResult::RowCount { row_count } => Ok(row_count),
            StatementResult::ResultSet { result_set } => {
                let rows = self.drain(result_set).await?;
                Ok(rows.len() as u64)
            }
        }
    }

    async fn fetch(&mut self, sql: &str, args: &[String]) -> ProviderResult<Vec<Row>> {
        match self.run(sql, args).await? {
            StatementResult::ResultSet { result_set } => self.drain(result_set).await,
            StatementResult::RowCount { .. } => Ok(Vec::new()),
        }
    }

    async fn commit(&mut self) -> ProviderResult<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&mut self) -> ProviderResult<()> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }

    async fn close(&mut self) -> ProviderResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _: Value = roundtrip(&mut self.transport, &json!({"command": "disconnect"})).await?;
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_data_ok() {
        let data = response_data(json!({"status": "ok", "responseData": {"a": 1}})).unwrap();
        assert_eq!(data, json!({"a": 1}));
        let empty = response_data(json!({"status": "ok"})).unwrap();
        assert_eq!(empty, Value::Null);
    }

    #[test]
    fn test_response_data_error_classifies_collision() {
        let err = response_data(json!({
            "status": "error",
            "exception": {
                "text": format!("{}. (Session: 42)", crate::error::ROLLBACK_MARKER),
                "sqlCode": "40001"
            }
        }))
        .unwrap_err();
        assert!(err.is_transaction_collision());

        let err = response_data(json!({
            "status": "error",
            "exception": {"text": "object FOO not found", "sqlCode": "42000"}
        }))
        .unwrap_err();
        match err {
            ProviderError::Database { message, sql_state } => {
                assert_eq!(message, "object FOO not found");
                assert_eq!(sql_state.as_deref(), Some("42000"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_transpose() {
        let rows = transpose(vec![
            vec![json!("A"), json!("B")],
            vec![json!(1), Value::Null],
        ]);
        assert_eq!(
            rows,
            vec![
                vec![Some("A".to_string()), Some("1".to_string())],
                vec![Some("B".to_string()), None],
            ]
        );
    }

    #[test]
    fn test_statement_result_decoding() {
        let data: ResultsData = serde_json::from_value(json!({
            "numResults": 1,
            "results": [{
                "resultType": "resultSet",
                "resultSet": {
                    "numColumns": 1,
                    "numRows": 1,
                    "numRowsInMessage": 1,
                    "columns": [{"name": "X", "dataType": {"type": "VARCHAR"}}],
                    "data": [["v"]]
                }
            }]
        }))
        .unwrap();
        assert!(matches!(
            &data.results[0],
            StatementResult::ResultSet { result_set } if result_set.num_rows == 1
        ));
    }
}
