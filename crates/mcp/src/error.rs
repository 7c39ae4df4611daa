//! Protocol and transport error types.

use crate::protocol::JsonRpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn server process: {0}")]
    Spawn(std::io::Error),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout waiting for response to {method}")]
    Timeout { method: String },

    #[error("failed to encode message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("invalid server config for {name}: {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("connection pool closed for server {0}")]
    PoolClosed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
