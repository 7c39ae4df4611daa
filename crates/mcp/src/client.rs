//! Protocol client: one connection to one capability server.
//!
//! Owns the connection state machine, the pending-request correlation map,
//! discovery, and reconnect with backoff. Lifecycle changes are published on
//! an event channel the owner consumes; server-initiated notifications go to
//! a separate channel rather than registered callbacks, so shutdown is an
//! explicit channel close.

use crate::config::ServerConfig;
use crate::protocol::{
    methods, CallToolParams, CallToolResult, Incoming, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult, RequestId, ToolDef,
};
use crate::transport::{self, Transport};
use crate::{Error, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Initializing,
    Connected,
    Reconnecting,
    Disconnecting,
}

/// Lifecycle events published to the client's owner.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Initial discovery finished.
    Connected { tools: Vec<ToolDef> },
    /// Recovered from a transport loss; capability set diffed against the
    /// pre-loss snapshot.
    Reconnected {
        added: Vec<ToolDef>,
        removed: Vec<String>,
    },
    /// Reconnect attempts exhausted (or none configured).
    Disconnected,
}

/// A server-initiated notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

struct PendingRequest {
    method: String,
    submitted_at: Instant,
    tx: oneshot::Sender<std::result::Result<JsonRpcResponse, Error>>,
}

pub struct ProtocolClient {
    config: ServerConfig,
    weak: Weak<Self>,
    state: Mutex<ConnectionState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    next_id: AtomicI64,
    tools: Mutex<Vec<ToolDef>>,
    server_info: Mutex<Option<InitializeResult>>,
    events: mpsc::Sender<ClientEvent>,
    notifications_tx: mpsc::Sender<Notification>,
    notifications_rx: Mutex<Option<mpsc::Receiver<Notification>>>,
}

impl ProtocolClient {
    /// Create a disconnected client. Call [`initialize`](Self::initialize)
    /// to connect and discover capabilities.
    pub fn new(config: ServerConfig, events: mpsc::Sender<ClientEvent>) -> Arc<Self> {
        let (notifications_tx, notifications_rx) = mpsc::channel(64);
        Arc::new_cyclic(|weak| Self {
            config,
            weak: weak.clone(),
            state: Mutex::new(ConnectionState::Disconnected),
            transport: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            tools: Mutex::new(Vec::new()),
            server_info: Mutex::new(None),
            events,
            notifications_tx,
            notifications_rx: Mutex::new(Some(notifications_rx)),
        })
    }

    /// Create a client over an already-open transport, skipping the
    /// connect step. Used for embedding and tests.
    pub fn with_transport(
        config: ServerConfig,
        mut transport: Box<dyn Transport>,
        events: mpsc::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let incoming = transport.take_incoming();
        let conn_bound = transport.incoming_is_connection();
        let client = Self::new(config, events);
        client.set_state(ConnectionState::Initializing);
        *client.transport_lock_mut() = Some(Arc::from(transport));
        if let Some(rx) = incoming {
            tokio::spawn(client.clone().read_loop(rx, conn_bound));
        }
        client
    }

    pub fn server_name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Snapshot of the capabilities discovered on this connection.
    pub fn tools(&self) -> Vec<ToolDef> {
        lock(&self.tools).clone()
    }

    /// Remote server identity, once initialized.
    pub fn server_info(&self) -> Option<InitializeResult> {
        lock(&self.server_info).clone()
    }

    /// Take the server-notification channel. Yields `None` after the first
    /// call; there is exactly one consumer.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<Notification>> {
        lock(&self.notifications_rx).take()
    }

    /// Connect, handshake, and discover capabilities.
    pub async fn initialize(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        match self.establish().await {
            Ok(tools) => {
                self.set_state(ConnectionState::Connected);
                let _ = self.events.send(ClientEvent::Connected { tools }).await;
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Open the transport and run the handshake. Leaves the state where the
    /// caller put it except for the Initializing hop.
    async fn establish(&self) -> Result<Vec<ToolDef>> {
        let mut new_transport = transport::connect(&self.config).await?;
        let incoming = new_transport.take_incoming();
        let conn_bound = new_transport.incoming_is_connection();
        *self.transport_lock_mut() = Some(Arc::from(new_transport));

        if let Some(rx) = incoming {
            if let Some(me) = self.weak.upgrade() {
                tokio::spawn(me.read_loop(rx, conn_bound));
            }
        }

        self.set_state(ConnectionState::Initializing);

        let init: InitializeResult = serde_json::from_value(
            self.request(
                methods::INITIALIZE,
                Some(serde_json::to_value(InitializeParams::default())?),
            )
            .await?,
        )?;
        tracing::debug!(
            server = %self.config.name,
            remote = %init.server_info.name,
            "initialized"
        );
        *lock(&self.server_info) = Some(init);

        self.notify(methods::INITIALIZED, None).await?;

        let listed: ListToolsResult =
            serde_json::from_value(self.request(methods::TOOLS_LIST, None).await?)?;
        *lock(&self.tools) = listed.tools.clone();
        Ok(listed.tools)
    }

    /// Issue a request and await its correlated response or deadline.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        match self.state() {
            ConnectionState::Initializing | ConnectionState::Connected => {}
            _ => return Err(Error::NotConnected),
        }
        self.request(method, params).await
    }

    /// Invoke a remote capability.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let raw = self
            .call(methods::TOOLS_CALL, Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let transport = self.current_transport().ok_or(Error::NotConnected)?;
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));

        let mut msg = JsonRpcRequest::new(id.clone(), method);
        if let Some(params) = params {
            msg.params = Some(params);
        }
        let msg = serde_json::to_value(&msg)?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                submitted_at: Instant::now(),
                tx,
            },
        );
        // Removes the entry on every exit path, including caller
        // cancellation; a matching response arriving later is then dropped
        // as unknown.
        let _guard = PendingGuard { client: self, id: id.clone() };

        // The deadline covers the send as well as the wait: a transport that
        // returns the reply in-band can stall in the send itself.
        let exchange = async {
            match self.send_with_reauth(&*transport, msg).await? {
                Some(direct) => Ok(serde_json::from_value::<JsonRpcResponse>(direct)?),
                None => match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::ConnectionClosed),
                },
            }
        };
        let response = match tokio::time::timeout(self.config.timeout(), exchange).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::debug!(
                    server = %self.config.name,
                    %id,
                    method,
                    "request deadline expired"
                );
                return Err(Error::Timeout {
                    method: method.to_string(),
                });
            }
        };

        if response.id != id {
            return Err(Error::InvalidResponse(format!(
                "response id mismatch: expected {id}, got {}",
                response.id
            )));
        }
        Ok(response.into_result()?)
    }

    /// Send a notification; no reply is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let transport = self.current_transport().ok_or(Error::NotConnected)?;
        let msg = serde_json::to_value(JsonRpcNotification::new(method, params))?;
        self.send_with_reauth(&*transport, msg).await?;
        Ok(())
    }

    /// One-shot re-authentication: an auth failure retries the send exactly
    /// once before surfacing.
    async fn send_with_reauth(&self, transport: &dyn Transport, msg: Value) -> Result<Option<Value>> {
        match transport.send(msg.clone()).await {
            Err(Error::AuthFailed(reason)) => {
                tracing::warn!(server = %self.config.name, %reason, "auth failed, retrying once");
                transport.send(msg).await
            }
            other => other,
        }
    }

    /// Consume incoming frames until the channel ends. Boxed because the
    /// reconnect path spawns this loop again from inside it.
    fn read_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Value>,
        conn_bound: bool,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            while let Some(value) = rx.recv().await {
                self.dispatch(value);
            }

            if !conn_bound {
                // The transport reopens a lost push channel on its own; the
                // channel only ends here once those attempts are exhausted
                // (or on deliberate close).
                match self.state() {
                    ConnectionState::Connected | ConnectionState::Initializing => {
                        tracing::warn!(server = %self.config.name, "push channel gone");
                        self.set_state(ConnectionState::Disconnected);
                        lock(&self.tools).clear();
                        let _ = self.events.send(ClientEvent::Disconnected).await;
                    }
                    _ => {
                        tracing::debug!(server = %self.config.name, "push channel ended");
                    }
                }
                return;
            }
            match self.state() {
                ConnectionState::Connected | ConnectionState::Initializing => {
                    self.clone().reconnect().await;
                }
                _ => {}
            }
        })
    }

    fn dispatch(&self, value: Value) {
        match Incoming::classify(value) {
            Ok(Incoming::Response(response)) => {
                let entry = lock(&self.pending).remove(&response.id);
                match entry {
                    Some(pending) => {
                        tracing::trace!(
                            server = %self.config.name,
                            method = %pending.method,
                            elapsed_ms = pending.submitted_at.elapsed().as_millis() as u64,
                            "response"
                        );
                        let _ = pending.tx.send(Ok(response));
                    }
                    None => {
                        tracing::debug!(
                            server = %self.config.name,
                            id = %response.id,
                            "dropping response for unknown or expired request"
                        );
                    }
                }
            }
            Ok(Incoming::Notification { method, params }) => {
                let _ = self.notifications_tx.try_send(Notification { method, params });
            }
            Ok(Incoming::Request { id, method, .. }) => {
                // This side does not serve requests; answer politely.
                tracing::debug!(server = %self.config.name, %method, "rejecting server-initiated request");
                if let (Some(me), Some(transport)) = (self.weak.upgrade(), self.current_transport())
                {
                    tokio::spawn(async move {
                        let reply = serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {
                                "code": crate::protocol::codes::METHOD_NOT_FOUND,
                                "message": format!("client does not serve {method}"),
                            }
                        });
                        let _ = transport.send(reply).await;
                        drop(me);
                    });
                }
            }
            Err(e) => {
                tracing::warn!(server = %self.config.name, error = %e, "dropping malformed frame");
            }
        }
    }

    /// Recover from a transport loss while connected.
    async fn reconnect(self: Arc<Self>) {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::Connected | ConnectionState::Initializing => {
                    *state = ConnectionState::Reconnecting;
                }
                // Deliberate close or a reconnect already in flight.
                _ => return,
            }
        }
        tracing::info!(server = %self.config.name, "transport lost, reconnecting");

        // In-flight requests on the lost transport cannot complete.
        self.fail_pending();
        let old_tools = self.tools();

        let policy = self.config.retry_policy();
        for attempt in 1..=policy.max_attempts {
            tokio::time::sleep(policy.delay_for(attempt)).await;
            match self.establish().await {
                Ok(new_tools) => {
                    let added: Vec<ToolDef> = new_tools
                        .iter()
                        .filter(|t| !old_tools.iter().any(|o| o.name == t.name))
                        .cloned()
                        .collect();
                    let removed: Vec<String> = old_tools
                        .iter()
                        .filter(|o| !new_tools.iter().any(|t| t.name == o.name))
                        .map(|o| o.name.clone())
                        .collect();
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(
                        server = %self.config.name,
                        attempt,
                        added = added.len(),
                        removed = removed.len(),
                        "reconnected"
                    );
                    let _ = self
                        .events
                        .send(ClientEvent::Reconnected { added, removed })
                        .await;
                    return;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Reconnecting);
                    tracing::warn!(server = %self.config.name, attempt, error = %e, "reconnect attempt failed");
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        // Take the transport out of the lock before awaiting on it.
        let taken = self.transport_lock_mut().take();
        if let Some(transport) = taken {
            transport.close().await;
        }
        lock(&self.tools).clear();
        let _ = self.events.send(ClientEvent::Disconnected).await;
    }

    /// Tear the connection down deliberately. Pending requests fail with
    /// `ConnectionClosed`; no `Disconnected` event is emitted.
    pub async fn close(&self) {
        self.set_state(ConnectionState::Disconnecting);
        self.fail_pending();
        let taken = self.transport_lock_mut().take();
        if let Some(transport) = taken {
            transport.close().await;
        }
        lock(&self.tools).clear();
        self.set_state(ConnectionState::Disconnected);
    }

    fn fail_pending(&self) {
        let drained: Vec<PendingRequest> = {
            let mut pending = lock(&self.pending);
            pending.drain().map(|(_, p)| p).collect()
        };
        for entry in drained {
            let _ = entry.tx.send(Err(Error::ConnectionClosed));
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        if *state != next {
            tracing::debug!(server = %self.config.name, from = ?*state, to = ?next, "state");
            *state = next;
        }
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transport_lock_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn Transport>>> {
        self.transport.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PendingGuard<'a> {
    client: &'a ProtocolClient,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.client.pending).remove(&self.id);
    }
}
