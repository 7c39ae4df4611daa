//! Capability-server protocol stack.
//!
//! This crate speaks a JSON-RPC 2.0 message protocol with capability servers
//! over three transport bindings, and layers request correlation, discovery,
//! reconnect and pooling on top:
//!
//! - [`protocol`] — the wire envelope and the `initialize` / `tools/list` /
//!   `tools/call` payload types.
//! - [`transport`] — pipe (subprocess stdio with newline framing), request
//!   (HTTP request/response), and stream (SSE push channel + HTTP request
//!   channel) bindings behind one [`transport::Transport`] trait.
//! - [`ProtocolClient`] — one connection: state machine, pending-request
//!   correlation, deadline expiry, reconnect with backoff, capability
//!   discovery and diffing.
//! - [`ConnectionPool`] — bounded per-server client reuse with FIFO
//!   queueing.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{ConnectionPool, ServerConfig};
//!
//! # async fn example() -> mcp::Result<()> {
//! let pool = ConnectionPool::new();
//! let mut events = pool.add_server(ServerConfig::pipe("files", "mcp-filesystem"))?;
//!
//! let client = pool.acquire("files").await?;
//! let result = client.call_tool("read_file", Some(serde_json::json!({
//!     "path": "./README.md"
//! }))).await?;
//! drop(client); // back to the pool
//! # let _ = (events.recv().await, result);
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod framing;
mod pool;
mod protocol;
mod retry;
pub mod transport;

pub use client::{ClientEvent, ConnectionState, Notification, ProtocolClient};
pub use config::{AuthConfig, ServerConfig, TransportKind, DEFAULT_TIMEOUT_MS};
pub use error::{Error, Result};
pub use framing::{FrameBuffer, FrameError, MAX_FRAME_SIZE};
pub use pool::{ConnectionPool, PooledClient};
pub use protocol::{
    codes, methods, CallToolParams, CallToolResult, FilesystemAccess, Incoming, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, RequestId, ServerInfo, ToolContent, ToolDef, ToolPermissions,
};
pub use retry::RetryPolicy;
