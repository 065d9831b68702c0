//! # MCP Streamable HTTP Client Transport
//!
//! Client-side transport for the Model Context Protocol over a single HTTP
//! endpoint that multiplexes JSON-RPC request/response, server-initiated
//! notifications, and resumable Server-Sent Event streams.
//!
//! ## Protocol Behavior
//!
//! - **POST** sends one JSON-RPC message or a batch; the response is
//!   classified as 202 (accepted, nothing to deliver), inline JSON, or a
//!   `text/event-stream` body read asynchronously
//! - **GET** opens an optional standalone stream for server-initiated
//!   messages; a 405 means the server offers none and is not an error
//! - **DELETE** terminates the session; 2xx and 405 are both success
//! - Session ids captured from `initialize` responses are echoed as
//!   `mcp-session-id` on every subsequent request
//! - Interrupted streams resume with `Last-Event-ID` under a deterministic
//!   exponential backoff schedule
//! - 401 responses drive a pluggable OAuth provider: silent token refresh
//!   when possible, a PKCE authorization redirect otherwise
//!
//! ## Module Organization
//!
//! ```text
//! src/
//! ├── transport.rs   # Transport controller, dispatch, stream reader
//! ├── config.rs      # Configuration and builder
//! ├── headers.rs     # Per-request header composition
//! ├── sse.rs         # Incremental SSE parsing
//! ├── retry.rs       # Reconnection schedule
//! ├── auth.rs        # OAuth provider interface and 401 recovery
//! ├── fetch.rs       # Pluggable HTTP performer
//! └── error.rs       # Error types
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mcp_streamable_http::{StreamableHttpConfig, StreamableHttpTransport};
//! use serde_json::json;
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StreamableHttpConfig::new(Url::parse("http://localhost:8080/mcp")?);
//!     let transport = StreamableHttpTransport::new(config);
//!
//!     transport.set_on_message(|message| println!("<- {message}"));
//!     transport.set_on_error(|error| eprintln!("transport error: {error}"));
//!
//!     transport.start().await?;
//!     transport
//!         .send(json!({
//!             "jsonrpc": "2.0",
//!             "method": "initialize",
//!             "params": {},
//!             "id": "init-1",
//!         }))
//!         .await?;
//!
//!     transport.terminate_session().await?;
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use
)]

pub mod auth;
pub mod config;
pub mod error;
pub mod fetch;
pub mod headers;
pub mod retry;
pub mod sse;
pub mod transport;

pub use auth::{
    AuthResult, OAuthClientInformation, OAuthClientMetadata, OAuthClientProvider, OAuthTokens,
};
pub use config::{StreamableHttpConfig, StreamableHttpConfigBuilder};
pub use error::{TransportError, TransportResult};
pub use fetch::{Fetch, HttpRequest, HttpResponse, ReqwestFetch};
pub use headers::{LAST_EVENT_ID, MCP_SESSION_ID, RequestInit};
pub use retry::ReconnectionOptions;
pub use sse::{SseEvent, SseParser};
pub use transport::StreamableHttpTransport;
