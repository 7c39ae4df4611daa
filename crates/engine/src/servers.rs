//! Server lifecycle: registration, discovery and keeping the registry in
//! step with each server's connection events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use mcp::{ClientEvent, ConnectionPool, ServerConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::registry::CapabilityRegistry;

/// Owns the pool entries and the per-server sync tasks.
pub struct ServerManager {
    registry: Arc<CapabilityRegistry>,
    pool: ConnectionPool,
    sync_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ServerManager {
    pub fn new(registry: Arc<CapabilityRegistry>, pool: ConnectionPool) -> Self {
        Self {
            registry,
            pool,
            sync_tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a server: add it to the pool, connect, and publish its
    /// discovered tools into the registry. Returns once discovery has
    /// landed, so a capability advertised by the server is resolvable
    /// immediately after.
    pub async fn register_server(&self, config: ServerConfig) -> Result<()> {
        let name = config.name.clone();
        let events = self.pool.add_server(config)?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(sync_loop(
            self.registry.clone(),
            name.clone(),
            events,
            ready_tx,
        ));
        if let Some(stale) = lock(&self.sync_tasks).insert(name.clone(), task) {
            stale.abort();
        }

        // First acquire opens the connection and runs the handshake; the
        // Connected event it emits drives the initial registry sync.
        match self.pool.acquire(&name).await {
            Ok(client) => drop(client),
            Err(error) => {
                self.remove_sync_task(&name);
                self.pool.remove_server(&name);
                return Err(error.into());
            }
        }

        // The Connected event is already queued at this point.
        if ready_rx.await.is_err() {
            warn!(server = %name, "discovery sync task exited before first sync");
        }
        info!(server = %name, "server registered");
        Ok(())
    }

    /// Drop a server and everything discovered from it. Returns how many
    /// capabilities were removed.
    pub async fn unregister_server(&self, name: &str) -> Result<usize> {
        if !self.pool.has_server(name) {
            return Err(Error::UnknownServer(name.to_string()));
        }
        self.pool.remove_server(name);
        self.remove_sync_task(name);
        let removed = self.registry.unregister_server(name).await;
        info!(server = name, removed, "server unregistered");
        Ok(removed)
    }

    pub fn shutdown(&self) {
        let mut tasks = lock(&self.sync_tasks);
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }

    fn remove_sync_task(&self, name: &str) {
        if let Some(task) = lock(&self.sync_tasks).remove(name) {
            task.abort();
        }
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Applies one server's lifecycle events to the registry. Runs until the
/// event channel closes.
async fn sync_loop(
    registry: Arc<CapabilityRegistry>,
    server: String,
    mut events: mpsc::Receiver<ClientEvent>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Connected { tools } => {
                registry.sync_server(&server, &tools).await;
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                }
            }
            ClientEvent::Reconnected { added, removed } => {
                registry.apply_diff(&server, &added, &removed).await;
            }
            ClientEvent::Disconnected => {
                let removed = registry.unregister_server(&server).await;
                warn!(server = %server, removed, "server gave up reconnecting");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
