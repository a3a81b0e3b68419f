//! Best-effort response cache for the JSON transport.
//!
//! Responses are memoized in a [`BlobStore`] under a content-addressed key:
//!
//! ```text
//! v1/request_by_id/<id>/<UPPERCASE-HEX SHA-256 of the canonical request JSON>
//! ```
//!
//! The key depends only on the request and the caller-chosen id, so identical requests
//! against the same id always hit the same slot. Every cache failure is downgraded to a
//! warning diagnostic and treated as a miss; only the wrapped transport's errors fail a call.

pub mod json_cache;
pub mod store;

pub use json_cache::JsonCache;
pub use store::{BlobStore, FsBlobStore, MemoryBlobStore};

use crate::error::ProviderResult;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Version prefix of the cache layout.
pub const CACHE_PREFIX: &str = "v1/request_by_id";

/// Serialize a JSON value with object keys sorted at every level.
///
/// Hashing this form keeps cache keys stable regardless of how the map type orders keys.
pub fn canonical_json(value: &Value) -> ProviderResult<Vec<u8>> {
    let mut out = Vec::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> ProviderResult<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

/// Directory prefix holding every entry recorded for `id`.
pub fn id_prefix(id: &str) -> String {
    format!("{}/{}/", CACHE_PREFIX, id)
}

/// Derive the blob path of a request.
pub fn path_from_request(id: &str, request: &Value) -> ProviderResult<String> {
    let digest = Sha256::digest(canonical_json(request)?);
    Ok(format!("{}{}", id_prefix(id), hex::encode_upper(digest)))
}

/// Store a raw response body for `(id, request)`.
pub async fn store_response(
    store: &dyn BlobStore,
    id: &str,
    request: &Value,
    response: &[u8],
) -> ProviderResult<()> {
    let path = path_from_request(id, request)?;
    store.write(&path, response).await
}

/// Load the raw response body stored for `(id, request)`, if any.
pub async fn load_response(
    store: &dyn BlobStore,
    id: &str,
    request: &Value,
) -> ProviderResult<Option<Vec<u8>>> {
    let path = path_from_request(id, request)?;
    store.read(&path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_from_request_is_fixed() {
        let path = path_from_request("2", &json!({"foo": 4})).unwrap();
        assert_eq!(
            path,
            "v1/request_by_id/2/1F7267F4FC9FF9D36857D71FDB0B6A14783AF188E7679BA702D7846B97C5350A"
        );
    }

    #[test]
    fn test_path_depends_on_id() {
        let request = json!({"foo": 4});
        assert_ne!(
            path_from_request("2", &request).unwrap(),
            path_from_request("3", &request).unwrap()
        );
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": [ {"z": 1, "a": null} ], "a": "x\"y"});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":"x\"y","b":[{"a":null,"z":1}]}"#
        );
    }

    #[tokio::test]
    async fn test_store_then_load_round_trip() {
        let store = MemoryBlobStore::new();
        let request = json!({"foo": 42});
        store_response(&store, "64", &request, br#"{"bar":128}"#)
            .await
            .unwrap();

        let loaded = load_response(&store, "64", &request).await.unwrap();
        assert_eq!(loaded.as_deref(), Some(br#"{"bar":128}"#.as_slice()));
        assert_eq!(load_response(&store, "65", &request).await.unwrap(), None);
    }
}
