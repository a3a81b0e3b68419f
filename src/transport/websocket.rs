//! JSON request/response transport over a websocket.
//!
//! Exasol's JSON API sends one JSON document per frame. With compression enabled both
//! directions switch to zlib-compressed binary frames.

use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use async_tungstenite::WebSocketStream;
use async_tungstenite::tokio::{ConnectStream, connect_async};
use async_tungstenite::tungstenite::Message;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::io::{Read, Write};
use tracing::debug;

/// A bidirectional channel exchanging JSON documents.
#[async_trait]
pub trait JsonTransport: Send {
    /// Send one request document.
    async fn write_json(&mut self, request: &Value) -> ProviderResult<()>;

    /// Receive one response document.
    async fn read_json(&mut self) -> ProviderResult<Value>;

    /// Switch frame compression on or off for subsequent messages.
    fn set_compression(&mut self, enabled: bool);

    async fn close(&mut self) -> ProviderResult<()>;
}

pub struct WebSocketTransport {
    stream: WebSocketStream<ConnectStream>,
    compression: bool,
}

impl WebSocketTransport {
    /// Open a websocket to `url` (`ws://` or `wss://`).
    pub async fn connect(url: &str) -> ProviderResult<Self> {
        let (stream, _response) = connect_async(url).await.map_err(|e| {
            ProviderError::connection(
                format!("Websocket handshake with {} failed: {}", url, e),
                "Check the host, port and TLS settings",
            )
        })?;
        debug!(url = %url, "Websocket connected");
        Ok(Self {
            stream,
            compression: false,
        })
    }
}

/// Compress a payload with zlib.
pub fn deflate(payload: &[u8]) -> ProviderResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

/// Decompress a zlib payload.
pub fn inflate(payload: &[u8]) -> ProviderResult<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(payload).read_to_end(&mut out)?;
    Ok(out)
}

#[async_trait]
impl JsonTransport for WebSocketTransport {
    async fn write_json(&mut self, request: &Value) -> ProviderResult<()> {
        let payload = serde_json::to_vec(request)?;
        let message = if self.compression {
            Message::Binary(deflate(&payload)?.into())
        } else {
            let text = String::from_utf8(payload)
                .map_err(|e| ProviderError::internal(format!("Request is not UTF-8: {}", e)))?;
            Message::Text(text.into())
        };
        self.stream.send(message).await?;
        Ok(())
    }

    async fn read_json(&mut self) -> ProviderResult<Value> {
        loop {
            let message = self
                .stream
                .next()
                .await
                .ok_or_else(|| ProviderError::transport("Websocket closed by the server"))??;

            match message {
                Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
                Message::Binary(bytes) if self.compression => {
                    return Ok(serde_json::from_slice(&inflate(&bytes)?)?);
                }
                Message::Binary(bytes) => return Ok(serde_json::from_slice(&bytes)?),
                Message::Close(frame) => {
                    return Err(ProviderError::transport(format!(
                        "Websocket closed by the server: {:?}",
                        frame
                    )));
                }
                // Ping/pong are answered by tungstenite itself
                _ => continue,
            }
        }
    }

    fn set_compression(&mut self, enabled: bool) {
        self.compression = enabled;
    }

    async fn close(&mut self) -> ProviderResult<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_inflate() {
        let payload = br#"{"command":"execute","sqlText":"SELECT 1"}"#;
        let compressed = deflate(payload).unwrap();
        assert_ne!(compressed.as_slice(), payload.as_slice());
        assert_eq!(inflate(&compressed).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_inflate_rejects_garbage() {
        assert!(inflate(b"not zlib").is_err());
    }
}
