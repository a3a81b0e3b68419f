//! Integration tests for the recorded-response cache.

use async_trait::async_trait;
use exasol_provider::cache::{
    BlobStore, FsBlobStore, JsonCache, MemoryBlobStore, load_response, path_from_request,
    store_response,
};
use exasol_provider::diagnostics::Diagnostics;
use exasol_provider::error::{ProviderError, ProviderResult};
use exasol_provider::transport::JsonTransport;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Transport answering from a queue and recording what was written.
#[derive(Clone, Default)]
struct ScriptedTransport {
    responses: Arc<Mutex<VecDeque<Value>>>,
    written: Arc<Mutex<Vec<Value>>>,
}

impl ScriptedTransport {
    fn answering(responses: Vec<Value>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            written: Arc::default(),
        }
    }

    fn written(&self) -> Vec<Value> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl JsonTransport for ScriptedTransport {
    async fn write_json(&mut self, request: &Value) -> ProviderResult<()> {
        self.written.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn read_json(&mut self) -> ProviderResult<Value> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::transport("no scripted response left"))
    }

    fn set_compression(&mut self, _enabled: bool) {}

    async fn close(&mut self) -> ProviderResult<()> {
        Ok(())
    }
}

/// Store whose every operation fails.
struct BrokenStore;

#[async_trait]
impl BlobStore for BrokenStore {
    async fn read(&self, _path: &str) -> ProviderResult<Option<Vec<u8>>> {
        Err(ProviderError::cache("bucket unreachable"))
    }

    async fn write(&self, _path: &str, _bytes: &[u8]) -> ProviderResult<()> {
        Err(ProviderError::cache("bucket unreachable"))
    }

    async fn delete_prefix(&self, _prefix: &str) -> ProviderResult<usize> {
        Err(ProviderError::cache("bucket unreachable"))
    }
}

fn request() -> Value {
    json!({"command": "execute", "sqlText": "SELECT 1"})
}

fn ok_response() -> Value {
    json!({"status": "ok", "responseData": {"numResults": 1}})
}

#[tokio::test]
async fn test_fs_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new(dir.path());
    let request = json!({"foo": 42});

    store_response(&store, "64", &request, br#"{"bar":128}"#)
        .await
        .unwrap();
    let loaded = load_response(&store, "64", &request).await.unwrap();
    assert_eq!(loaded.as_deref(), Some(br#"{"bar":128}"#.as_slice()));

    let path = path_from_request("64", &request).unwrap();
    assert!(dir.path().join(&path).is_file());
}

#[tokio::test]
async fn test_miss_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new(dir.path());
    assert_eq!(
        load_response(&store, "64", &json!({"foo": 1})).await.unwrap(),
        None
    );
}

#[test]
fn test_path_is_fixed_and_uppercase() {
    let path = path_from_request("2", &json!({"foo": 4})).unwrap();
    assert_eq!(
        path,
        "v1/request_by_id/2/1F7267F4FC9FF9D36857D71FDB0B6A14783AF188E7679BA702D7846B97C5350A"
    );
    // Key order does not change the path
    assert_eq!(
        path_from_request("2", &json!({"a": 1, "b": 2})).unwrap(),
        path_from_request("2", &json!({"b": 2, "a": 1})).unwrap()
    );
}

#[tokio::test]
async fn test_second_session_replays_from_cache() {
    let store: Arc<MemoryBlobStore> = Arc::new(MemoryBlobStore::new());
    let diagnostics = Diagnostics::new();

    let network = ScriptedTransport::answering(vec![ok_response()]);
    let mut first = JsonCache::new(network.clone(), store.clone(), "run-1", diagnostics.clone());
    first.write_json(&request()).await.unwrap();
    assert_eq!(first.read_json().await.unwrap(), ok_response());
    assert_eq!(network.written().len(), 1);
    assert_eq!(store.paths().len(), 1);

    let offline = ScriptedTransport::answering(Vec::new());
    let mut second = JsonCache::new(offline.clone(), store.clone(), "run-1", diagnostics.clone());
    second.write_json(&request()).await.unwrap();
    assert_eq!(second.read_json().await.unwrap(), ok_response());
    assert!(offline.written().is_empty());
    assert!(diagnostics.is_empty());
}

#[tokio::test]
async fn test_other_id_misses() {
    let store: Arc<MemoryBlobStore> = Arc::new(MemoryBlobStore::new());
    let network = ScriptedTransport::answering(vec![ok_response(), ok_response()]);

    let mut first = JsonCache::new(network.clone(), store.clone(), "run-1", Diagnostics::new());
    first.write_json(&request()).await.unwrap();
    first.read_json().await.unwrap();

    let mut other = JsonCache::new(network.clone(), store.clone(), "run-2", Diagnostics::new());
    other.write_json(&request()).await.unwrap();
    other.read_json().await.unwrap();

    assert_eq!(network.written().len(), 2);
    assert_eq!(store.paths().len(), 2);
}

#[tokio::test]
async fn test_error_responses_are_not_recorded() {
    let store: Arc<MemoryBlobStore> = Arc::new(MemoryBlobStore::new());
    let failure = json!({"status": "error", "exception": {"text": "boom", "sqlCode": "42000"}});
    let network = ScriptedTransport::answering(vec![failure.clone()]);

    let mut cache = JsonCache::new(network, store.clone(), "run-1", Diagnostics::new());
    cache.write_json(&request()).await.unwrap();
    assert_eq!(cache.read_json().await.unwrap(), failure);
    assert!(store.paths().is_empty());
}

#[tokio::test]
async fn test_store_failures_become_warnings() {
    let diagnostics = Diagnostics::new();
    let network = ScriptedTransport::answering(vec![ok_response()]);

    let mut cache = JsonCache::new(
        network.clone(),
        Arc::new(BrokenStore),
        "run-1",
        diagnostics.clone(),
    );
    cache.write_json(&request()).await.unwrap();
    assert_eq!(cache.read_json().await.unwrap(), ok_response());

    assert_eq!(network.written().len(), 1);
    // One warning for the failed lookup, one for the failed write
    assert_eq!(diagnostics.len(), 2);
    assert_eq!(cache.invalidate("run-1").await, 0);
    assert_eq!(diagnostics.len(), 3);
}

#[tokio::test]
async fn test_corrupt_entry_falls_back_to_network() {
    let store: Arc<MemoryBlobStore> = Arc::new(MemoryBlobStore::new());
    store_response(store.as_ref(), "run-1", &request(), b"not json")
        .await
        .unwrap();
    let diagnostics = Diagnostics::new();
    let network = ScriptedTransport::answering(vec![ok_response()]);

    let mut cache = JsonCache::new(network.clone(), store.clone(), "run-1", diagnostics.clone());
    cache.write_json(&request()).await.unwrap();
    assert_eq!(cache.read_json().await.unwrap(), ok_response());

    assert_eq!(network.written(), vec![request()]);
    assert_eq!(diagnostics.len(), 1);
    // The good response replaced the corrupt entry
    let stored = load_response(store.as_ref(), "run-1", &request())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(serde_json::from_slice::<Value>(&stored).unwrap(), ok_response());
}

#[tokio::test]
async fn test_invalidate_removes_only_that_id() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<FsBlobStore> = Arc::new(FsBlobStore::new(dir.path()));
    let network = ScriptedTransport::answering(vec![ok_response(), ok_response()]);

    for id in ["run-1", "run-2"] {
        let mut cache = JsonCache::new(network.clone(), store.clone(), id, Diagnostics::new());
        cache.write_json(&request()).await.unwrap();
        cache.read_json().await.unwrap();
    }

    let cache = JsonCache::new(network.clone(), store.clone(), "run-1", Diagnostics::new());
    assert_eq!(cache.invalidate("run-1").await, 1);
    assert_eq!(load_response(store.as_ref(), "run-1", &request()).await.unwrap(), None);
    assert!(
        load_response(store.as_ref(), "run-2", &request())
            .await
            .unwrap()
            .is_some()
    );
}
