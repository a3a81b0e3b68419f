//! Transport layer.
//!
//! - `websocket`: the JSON message channel to the database, used by the websocket driver
//! - `stdio`: the line-delimited JSON host the plugin runtime talks to

pub mod stdio;
pub mod websocket;

pub use stdio::{Request, Response, StdioHost};
pub use websocket::{JsonTransport, WebSocketTransport};
