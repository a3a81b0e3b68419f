//! Read-through/write-through cache wrapping a [`JsonTransport`].

use crate::cache::{BlobStore, id_prefix, path_from_request};
use crate::diagnostics::Diagnostics;
use crate::error::ProviderResult;
use crate::transport::JsonTransport;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Memoizes request/response pairs of one transport in a blob store.
///
/// Only responses whose `status` is `"ok"` are recorded. Store failures are reported to
/// the running operation's diagnostics, falling back to the sink given at construction. Hash collisions and concurrent
/// writers of different responses for the same key are not guarded: last writer wins.
pub struct JsonCache<T> {
    inner: T,
    store: Arc<dyn BlobStore>,
    id: String,
    diagnostics: Diagnostics,
    /// Cached response waiting for the next `read_json`, with the request it answers.
    staged: Option<(Value, Vec<u8>)>,
    /// Request sent over the network whose response should be recorded.
    in_flight: Option<Value>,
}

impl<T: JsonTransport> JsonCache<T> {
    pub fn new(
        inner: T,
        store: Arc<dyn BlobStore>,
        id: impl Into<String>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            inner,
            store,
            id: id.into(),
            diagnostics,
            staged: None,
            in_flight: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn slot(&self) -> Slot<'_> {
        Slot {
            store: self.store.as_ref(),
            id: &self.id,
            diagnostics: &self.diagnostics,
        }
    }

    /// Remove every entry recorded for `id`. Returns the number of removed entries;
    /// failures are reported as warnings and count as zero.
    pub async fn invalidate(&self, id: &str) -> usize {
        match self.store.delete_prefix(&id_prefix(id)).await {
            Ok(removed) => {
                debug!(id = %id, removed, "Cache entries invalidated");
                removed
            }
            Err(e) => {
                self.diagnostics
                    .report("Response cache invalidation failed", e.to_string());
                0
            }
        }
    }
}

/// Borrowed view of the cache's store side, so lookups never hold `&JsonCache` across awaits.
struct Slot<'a> {
    store: &'a dyn BlobStore,
    id: &'a str,
    diagnostics: &'a Diagnostics,
}

impl Slot<'_> {
    async fn lookup(&self, request: &Value) -> Option<Vec<u8>> {
        let path = match path_from_request(self.id, request) {
            Ok(path) => path,
            Err(e) => {
                self.diagnostics
                    .report("Response cache key derivation failed", e.to_string());
                return None;
            }
        };
        match self.store.read(&path).await {
            Ok(hit) => {
                debug!(path = %path, hit = hit.is_some(), "Response cache lookup");
                hit
            }
            Err(e) => {
                self.diagnostics
                    .report("Response cache read failed", e.to_string());
                None
            }
        }
    }

    async fn record(&self, request: &Value, response: &Value) {
        let result = async {
            let path = path_from_request(self.id, request)?;
            let body = serde_json::to_vec(response)?;
            self.store.write(&path, &body).await?;
            debug!(path = %path, "Response cached");
            ProviderResult::Ok(())
        }
        .await;
        if let Err(e) = result {
            self.diagnostics
                .report("Response cache write failed", e.to_string());
        }
    }
}

#[async_trait]
impl<T: JsonTransport> JsonTransport for JsonCache<T> {
    async fn write_json(&mut self, request: &Value) -> ProviderResult<()> {
        self.staged = None;
        self.in_flight = None;

        if let Some(blob) = self.slot().lookup(request).await {
            self.staged = Some((request.clone(), blob));
            return Ok(());
        }

        self.inner.write_json(request).await?;
        self.in_flight = Some(request.clone());
        Ok(())
    }

    async fn read_json(&mut self) -> ProviderResult<Value> {
        if let Some((request, blob)) = self.staged.take() {
            match serde_json::from_slice(&blob) {
                Ok(response) => return Ok(response),
                Err(e) => {
                    // Unreadable entry: fall back to the network for this request
                    self.diagnostics
                        .report("Cached response could not be decoded", e.to_string());
                    self.inner.write_json(&request).await?;
                    self.in_flight = Some(request);
                }
            }
        }

        let response = self.inner.read_json().await?;
        if let Some(request) = self.in_flight.take() {
            if response.get("status").and_then(Value::as_str) == Some("ok") {
                self.slot().record(&request, &response).await;
            } else {
                debug!("Response not cached: status is not ok");
            }
        }
        Ok(response)
    }

    fn set_compression(&mut self, enabled: bool) {
        self.inner.set_compression(enabled);
    }

    async fn close(&mut self) -> ProviderResult<()> {
        self.staged = None;
        self.in_flight = None;
        self.inner.close().await
    }
}
