//! Capability server configuration.

use crate::retry::RetryPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default reconnect attempt cap.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default per-server connection cap.
pub const DEFAULT_MAX_CONNECTIONS: usize = 2;

/// Which transport binding a server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Subprocess with newline-framed messages over stdin/stdout.
    Pipe,
    /// Stateless HTTP request/response; each send returns its reply.
    Request,
    /// Long-lived SSE push channel plus an HTTP request channel.
    Stream,
}

/// Authentication handle for HTTP-based transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuthConfig {
    ApiKey {
        key: String,
        #[serde(default = "default_api_key_header")]
        header: String,
    },
    Oauth {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

/// Configuration for one capability server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub transport: TransportKind,

    // Pipe transport.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,

    // Request/stream transports.
    #[serde(default)]
    pub url: Option<String>,
    /// Where the push channel attaches; defaults to `url` + `/events`.
    #[serde(default)]
    pub events_url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl ServerConfig {
    /// Minimal pipe-transport config, for embedding and tests.
    pub fn pipe(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Pipe,
            command: Some(command.into()),
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            events_url: None,
            headers: HashMap::new(),
            auth: None,
            timeout_ms: None,
            retry_attempts: None,
            max_connections: None,
        }
    }

    /// Per-request deadline for this server.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1)
    }

    /// Reconnect policy derived from `retry_attempts`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
            ..RetryPolicy::default()
        }
    }

    /// The push-channel endpoint for the stream transport.
    pub fn events_endpoint(&self) -> Option<String> {
        self.events_url
            .clone()
            .or_else(|| self.url.as_ref().map(|u| format!("{}/events", u.trim_end_matches('/'))))
    }

    /// Reject configs missing the fields their transport needs.
    pub fn validate(&self) -> Result<()> {
        let missing = match self.transport {
            TransportKind::Pipe => self.command.is_none().then_some("command"),
            TransportKind::Request | TransportKind::Stream => self.url.is_none().then_some("url"),
        };
        match missing {
            Some(field) => Err(Error::InvalidConfig {
                name: self.name.clone(),
                reason: format!("{field} is required for {:?} transport", self.transport),
            }),
            None => Ok(()),
        }
    }
}
