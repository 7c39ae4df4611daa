//! Push-stream transport: a long-lived SSE channel for server-initiated
//! messages plus an HTTP request channel for client calls.
//!
//! The two channels share connection lifecycle but fail independently: a
//! dropped SSE stream is reopened in the background under the server's
//! retry policy without touching requests in flight on the HTTP side.
//! The incoming channel only ends once those reopen attempts are
//! exhausted.

use super::{HttpTransport, Transport, INCOMING_BUFFER};
use crate::config::{AuthConfig, ServerConfig};
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type PushStream = BoxStream<'static, std::result::Result<Event, EventStreamError<reqwest::Error>>>;

pub struct StreamTransport {
    url: String,
    client: reqwest::Client,
    auth: Option<AuthConfig>,
    incoming: Option<mpsc::Receiver<Value>>,
    push_task: JoinHandle<()>,
}

impl StreamTransport {
    /// Open the push channel and prepare the request channel.
    pub async fn open(config: &ServerConfig) -> Result<Self> {
        let url = config.url.clone().ok_or_else(|| Error::InvalidConfig {
            name: config.name.clone(),
            reason: "url is required for stream transport".to_string(),
        })?;
        let events_url = config.events_endpoint().ok_or_else(|| Error::InvalidConfig {
            name: config.name.clone(),
            reason: "no events endpoint".to_string(),
        })?;

        let client = reqwest::Client::new();
        let auth = config.auth.clone();

        // The first subscription failure surfaces to the caller; later
        // drops are reopened in the background.
        let events = subscribe(&client, &events_url, &auth, config.timeout()).await?;

        let reader = PushReader {
            server: config.name.clone(),
            client: client.clone(),
            events_url,
            auth: auth.clone(),
            retry: config.retry_policy(),
            deadline: config.timeout(),
        };
        let (incoming_tx, incoming_rx) = mpsc::channel::<Value>(INCOMING_BUFFER);
        let push_task = tokio::spawn(reader.run(events, incoming_tx));

        Ok(Self {
            url,
            client,
            auth,
            incoming: Some(incoming_rx),
            push_task,
        })
    }
}

/// Connect the SSE stream; the response headers are bounded by the
/// server's request deadline so a silent server cannot hang the open.
async fn subscribe(
    client: &reqwest::Client,
    events_url: &str,
    auth: &Option<AuthConfig>,
    deadline: Duration,
) -> Result<PushStream> {
    let mut request = client
        .get(events_url)
        .header("accept", "text/event-stream");
    request = match auth {
        Some(AuthConfig::ApiKey { key, header }) => request.header(header.as_str(), key.as_str()),
        Some(AuthConfig::Oauth { token }) => request.bearer_auth(token),
        Some(AuthConfig::Basic { username, password }) => {
            request.basic_auth(username, Some(password))
        }
        None => request,
    };

    let response = tokio::time::timeout(deadline, request.send())
        .await
        .map_err(|_| Error::Timeout {
            method: "events".to_string(),
        })??;
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(Error::AuthFailed(format!("event stream returned {status}")));
    }
    if !status.is_success() {
        return Err(Error::InvalidResponse(format!(
            "event stream returned HTTP {status}"
        )));
    }

    Ok(response.bytes_stream().eventsource().boxed())
}

/// Background half of the push side: forwards events as decoded frames
/// and reopens the stream with backoff whenever it drops. In-flight HTTP
/// requests are unaffected.
struct PushReader {
    server: String,
    client: reqwest::Client,
    events_url: String,
    auth: Option<AuthConfig>,
    retry: RetryPolicy,
    deadline: Duration,
}

impl PushReader {
    async fn run(self, mut events: PushStream, incoming_tx: mpsc::Sender<Value>) {
        loop {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if event.data.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&event.data) {
                            Ok(value) => {
                                if incoming_tx.send(value).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(server = %self.server, error = %e, "dropping unparseable push event");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server = %self.server, error = %e, "push channel failed");
                        break;
                    }
                }
            }

            match self.reopen().await {
                Some(stream) => events = stream,
                None => {
                    tracing::warn!(server = %self.server, "push channel closed");
                    // incoming_tx drops here; the client sees the push side
                    // end without in-flight requests being affected.
                    return;
                }
            }
        }
    }

    async fn reopen(&self) -> Option<PushStream> {
        for attempt in 1..=self.retry.max_attempts {
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
            match subscribe(&self.client, &self.events_url, &self.auth, self.deadline).await {
                Ok(stream) => {
                    tracing::info!(server = %self.server, attempt, "push channel reopened");
                    return Some(stream);
                }
                Err(e) => {
                    tracing::warn!(server = %self.server, attempt, error = %e, "push channel reopen failed");
                }
            }
        }
        None
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&self, msg: Value) -> Result<Option<Value>> {
        HttpTransport::post(&self.client, &self.url, &self.auth, &msg).await
    }

    fn take_incoming(&mut self) -> Option<mpsc::Receiver<Value>> {
        self.incoming.take()
    }

    fn incoming_is_connection(&self) -> bool {
        false
    }

    async fn close(&self) {
        self.push_task.abort();
    }
}
