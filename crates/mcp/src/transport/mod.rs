//! Transport bindings.
//!
//! All three bindings move the same JSON envelope; they differ in how
//! replies come back. Request/response transports return the correlated
//! reply directly from [`Transport::send`]; pipe and stream transports
//! deliver frames asynchronously on the incoming channel, which the
//! protocol client correlates by request id.

mod http;
mod pipe;
mod stream;

pub use http::HttpTransport;
pub use pipe::PipeTransport;
pub use stream::StreamTransport;

use crate::config::{ServerConfig, TransportKind};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Capacity of the incoming-frame channel.
pub(crate) const INCOMING_BUFFER: usize = 64;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message.
    ///
    /// Returns `Some(reply)` when the transport correlates the reply itself
    /// (request/response style), `None` when replies arrive via the
    /// incoming channel or no reply is expected (notifications).
    async fn send(&self, msg: Value) -> Result<Option<Value>>;

    /// Take ownership of the incoming-frame channel, if this transport has
    /// one. Yields `None` for pure request/response transports and on
    /// second call.
    fn take_incoming(&mut self) -> Option<mpsc::Receiver<Value>>;

    /// Whether loss of the incoming channel means the whole connection is
    /// gone (pipe) or only the push side (stream).
    fn incoming_is_connection(&self) -> bool;

    async fn close(&self);
}

/// Open the transport a server config calls for.
pub async fn connect(config: &ServerConfig) -> Result<Box<dyn Transport>> {
    config.validate()?;
    let transport: Box<dyn Transport> = match config.transport {
        TransportKind::Pipe => Box::new(PipeTransport::spawn(config).await?),
        TransportKind::Request => Box::new(HttpTransport::new(config)?),
        TransportKind::Stream => Box::new(StreamTransport::open(config).await?),
    };
    Ok(transport)
}
