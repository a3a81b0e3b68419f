//! Diagnostics stay with the operation that produced them.
//!
//! Sessions speak the websocket JSON protocol to a scripted server through a response
//! cache whose store refuses to record anything mentioning `POISON`.

use async_trait::async_trait;
use exasol_provider::Provider;
use exasol_provider::cache::{BlobStore, JsonCache, MemoryBlobStore};
use exasol_provider::db::{ConnectionPool, PoolMode, RetryPolicy, SqlConnection, WsSession};
use exasol_provider::diagnostics::Diagnostics;
use exasol_provider::error::{ProviderError, ProviderResult};
use exasol_provider::resources::ResourceKind;
use exasol_provider::transport::stdio::handle_line;
use exasol_provider::transport::{JsonTransport, StdioHost};
use rsa::pkcs1::{EncodeRsaPublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const WRITE_FAILED: &str = "Response cache write failed";

fn public_key_pem() -> String {
    static PEM: OnceLock<String> = OnceLock::new();
    PEM.get_or_init(|| {
        let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
        RsaPublicKey::from(&key).to_pkcs1_pem(LineEnding::LF).unwrap()
    })
    .clone()
}

/// Server side of a session. Statements naming `BROKEN` get a row containing `POISON`.
#[derive(Default)]
struct ScriptedServer {
    last: Option<Value>,
}

fn result_set(columns: Value) -> Value {
    json!({"status": "ok", "responseData": {"results": [{
        "resultType": "resultSet",
        "resultSet": {"numColumns": 2, "numRows": 1, "numRowsInMessage": 1, "data": columns},
    }]}})
}

#[async_trait]
impl JsonTransport for ScriptedServer {
    async fn write_json(&mut self, request: &Value) -> ProviderResult<()> {
        self.last = Some(request.clone());
        Ok(())
    }

    async fn read_json(&mut self) -> ProviderResult<Value> {
        let request = self
            .last
            .take()
            .ok_or_else(|| ProviderError::transport("nothing was asked"))?;
        if request.get("username").is_some() {
            return Ok(json!({"status": "ok", "responseData": {"sessionId": 7}}));
        }
        match request["command"].as_str() {
            Some("login") => Ok(json!({
                "status": "ok",
                "responseData": {"publicKeyPem": public_key_pem()},
            })),
            Some("execute") => {
                // Keep both requests in flight at the same time
                tokio::time::sleep(Duration::from_millis(20)).await;
                let sql = request["sqlText"].as_str().unwrap_or_default();
                if sql.contains("BROKEN") {
                    Ok(result_set(json!([["BROKEN"], ["POISON"]])))
                } else if sql.starts_with("SELECT ROLE_NAME") {
                    Ok(result_set(json!([["FINE"], [null]])))
                } else {
                    Ok(json!({"status": "ok", "responseData": {"results": [
                        {"resultType": "rowCount", "rowCount": 0}
                    ]}}))
                }
            }
            _ => Ok(json!({"status": "ok"})),
        }
    }

    fn set_compression(&mut self, _enabled: bool) {}

    async fn close(&mut self) -> ProviderResult<()> {
        Ok(())
    }
}

/// Store refusing to record responses that mention `POISON`.
#[derive(Default)]
struct PickyStore {
    inner: MemoryBlobStore,
}

#[async_trait]
impl BlobStore for PickyStore {
    async fn read(&self, path: &str) -> ProviderResult<Option<Vec<u8>>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> ProviderResult<()> {
        if bytes.windows(6).any(|w| w == b"POISON") {
            return Err(ProviderError::cache("quota exceeded"));
        }
        self.inner.write(path, bytes).await
    }

    async fn delete_prefix(&self, prefix: &str) -> ProviderResult<usize> {
        self.inner.delete_prefix(prefix).await
    }
}

async fn provider() -> (Arc<Provider>, Diagnostics) {
    let store: Arc<dyn BlobStore> = Arc::new(PickyStore::default());
    let fallback = Diagnostics::new();
    let mut sessions: Vec<Box<dyn SqlConnection>> = Vec::new();
    for _ in 0..2 {
        let cached = JsonCache::new(
            ScriptedServer::default(),
            store.clone(),
            "run-1",
            fallback.clone(),
        );
        let session = WsSession::login(cached, "sys", "exasol", false).await.unwrap();
        sessions.push(Box::new(session));
    }
    let pool = ConnectionPool::from_connections(sessions, PoolMode::Independent).unwrap();
    let provider = Provider::new(
        Arc::new(pool),
        RetryPolicy::bounded(3, Duration::ZERO, Duration::ZERO),
        Diagnostics::new(),
    );
    (Arc::new(provider), fallback)
}

#[tokio::test]
async fn test_concurrent_operations_keep_their_own_warnings() {
    let (provider, fallback) = provider().await;

    let broken_config = json!({"name": "broken"});
    let fine_config = json!({"name": "fine"});
    let (broken, fine) = tokio::join!(
        provider.read(ResourceKind::Role, &broken_config),
        provider.read(ResourceKind::Role, &fine_config),
    );
    let broken = broken.unwrap();
    let fine = fine.unwrap();

    assert_eq!(broken.state.unwrap()["comment"], "POISON");
    assert_eq!(broken.diagnostics.len(), 1);
    assert_eq!(broken.diagnostics[0].summary, WRITE_FAILED);
    assert!(broken.diagnostics[0].detail.contains("quota exceeded"));

    assert_eq!(fine.state.unwrap()["id"], "FINE");
    assert!(fine.diagnostics.is_empty());
    assert!(fallback.is_empty());
}

#[tokio::test]
async fn test_concurrent_requests_on_the_host() {
    let (provider, _) = provider().await;
    let host = StdioHost::new(provider);
    let input = [
        r#"{"id": 1, "op": "read", "resource_type": "exasol_role", "state": {"name": "broken"}}"#,
        r#"{"id": 2, "op": "read", "resource_type": "exasol_role", "state": {"name": "fine"}}"#,
    ]
    .join("\n");

    let mut output = Vec::new();
    host.serve(input.as_bytes(), &mut output, std::future::pending::<()>())
        .await
        .unwrap();

    let responses: HashMap<String, Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| {
            let value: Value = serde_json::from_str(line).unwrap();
            (value["id"].to_string(), value)
        })
        .collect();
    assert_eq!(responses["1"]["diagnostics"][0]["summary"], WRITE_FAILED);
    assert_eq!(responses["1"]["diagnostics"].as_array().unwrap().len(), 1);
    assert_eq!(responses["2"]["diagnostics"], json!([]));
}

#[tokio::test]
async fn test_failed_request_reports_its_own_warnings() {
    let (provider, fallback) = provider().await;

    // The catalog row is recorded nowhere and its view text does not parse
    let failed = handle_line(
        &provider,
        r#"{"id": 1, "op": "import", "resource_type": "exasol_view", "import_id": "s.broken"}"#,
    )
    .await;
    assert!(!failed.ok);
    assert_eq!(failed.error.unwrap().code, "internal");
    assert_eq!(failed.diagnostics.len(), 1);
    assert_eq!(failed.diagnostics[0].summary, WRITE_FAILED);

    let next = handle_line(
        &provider,
        r#"{"id": 2, "op": "read", "resource_type": "exasol_role", "state": {"name": "fine"}}"#,
    )
    .await;
    assert!(next.ok);
    assert!(next.diagnostics.is_empty());
    assert!(fallback.is_empty());
}
