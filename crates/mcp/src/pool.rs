//! Connection pool: a bounded, reusable set of protocol clients per server.
//!
//! `acquire` hands out an idle client, creates one while under the
//! per-server cap, or queues the caller FIFO until a client is released.
//! A client is never held by two callers at once; the checkout guard
//! returns it on drop, preferring the longest-waiting queued caller.

use crate::client::{ClientEvent, ProtocolClient};
use crate::config::ServerConfig;
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};

const EVENT_BUFFER: usize = 32;

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<Mutex<PoolState>>,
}

#[derive(Default)]
struct PoolState {
    servers: HashMap<String, ServerEntry>,
}

struct ServerEntry {
    config: ServerConfig,
    events_tx: mpsc::Sender<ClientEvent>,
    idle: Vec<Arc<ProtocolClient>>,
    /// Clients in existence (idle + checked out + being created).
    live: usize,
    waiters: VecDeque<oneshot::Sender<Wake>>,
}

/// What a queued caller is woken with: a released client, or a signal to
/// retry because the creation slot it was waiting behind is free again.
enum Wake {
    Ready(Arc<ProtocolClient>),
    Retry,
}

enum Plan {
    Ready(Arc<ProtocolClient>),
    Create(ServerConfig, mpsc::Sender<ClientEvent>),
    Wait(oneshot::Receiver<Wake>),
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    /// Add a server to the pool. Connections are opened lazily on first
    /// acquire. The returned channel carries every lifecycle event from
    /// every client of this server.
    pub fn add_server(&self, config: ServerConfig) -> Result<mpsc::Receiver<ClientEvent>> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let mut state = self.lock();
        state.servers.insert(
            config.name.clone(),
            ServerEntry {
                config,
                events_tx,
                idle: Vec::new(),
                live: 0,
                waiters: VecDeque::new(),
            },
        );
        Ok(events_rx)
    }

    /// Remove a server: idle clients are closed, queued callers fail with
    /// `PoolClosed`, checked-out clients are closed when released.
    pub fn remove_server(&self, server: &str) {
        let entry = self.lock().servers.remove(server);
        let Some(entry) = entry else { return };
        for waiter in entry.waiters {
            drop(waiter); // receiver sees the pool close
        }
        for client in entry.idle {
            tokio::spawn(async move { client.close().await });
        }
    }

    pub fn has_server(&self, server: &str) -> bool {
        self.lock().servers.contains_key(server)
    }

    /// Check out a client for the given server.
    pub async fn acquire(&self, server: &str) -> Result<PooledClient> {
        loop {
            let plan = {
                let mut state = self.lock();
                let entry = state
                    .servers
                    .get_mut(server)
                    .ok_or_else(|| Error::PoolClosed(server.to_string()))?;

                if let Some(client) = entry.idle.pop() {
                    Plan::Ready(client)
                } else if entry.live < entry.config.max_connections() {
                    entry.live += 1;
                    Plan::Create(entry.config.clone(), entry.events_tx.clone())
                } else {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push_back(tx);
                    Plan::Wait(rx)
                }
            };

            match plan {
                Plan::Ready(client) => return Ok(self.guard(server, client)),
                Plan::Create(config, events_tx) => {
                    let client = ProtocolClient::new(config, events_tx);
                    return match client.initialize().await {
                        Ok(()) => Ok(self.guard(server, client)),
                        Err(e) => {
                            // The creation slot is free again; hand it to the
                            // longest-waiting queued caller instead of leaving
                            // them stranded behind a client that never existed.
                            self.surrender_slot(server);
                            Err(e)
                        }
                    };
                }
                Plan::Wait(rx) => match rx.await {
                    Ok(Wake::Ready(client)) => return Ok(self.guard(server, client)),
                    Ok(Wake::Retry) => continue,
                    Err(_) => return Err(Error::PoolClosed(server.to_string())),
                },
            }
        }
    }

    /// A creation slot was lost without producing a client: release it and
    /// wake the oldest waiter so it can retry.
    fn surrender_slot(&self, server: &str) {
        let mut state = self.lock();
        let Some(entry) = state.servers.get_mut(server) else {
            return;
        };
        entry.live -= 1;
        while let Some(waiter) = entry.waiters.pop_front() {
            if waiter.send(Wake::Retry).is_ok() {
                return;
            }
        }
    }

    fn guard(&self, server: &str, client: Arc<ProtocolClient>) -> PooledClient {
        PooledClient {
            pool: self.clone(),
            server: server.to_string(),
            client,
        }
    }

    fn release(&self, server: &str, mut client: Arc<ProtocolClient>) {
        let mut state = self.lock();
        let Some(entry) = state.servers.get_mut(server) else {
            // Server was removed while this client was checked out.
            drop(state);
            tokio::spawn(async move { client.close().await });
            return;
        };

        // Longest-waiting caller first; skip waiters that gave up.
        while let Some(waiter) = entry.waiters.pop_front() {
            match waiter.send(Wake::Ready(client)) {
                Ok(()) => return,
                Err(handed_back) => {
                    // A failed send returns exactly what went in.
                    let Wake::Ready(rejected) = handed_back else {
                        return;
                    };
                    client = rejected;
                }
            }
        }
        entry.idle.push(client);
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn inject_idle(&self, server: &str, client: Arc<ProtocolClient>) {
        let mut state = self.lock();
        let entry = state.servers.get_mut(server).unwrap();
        entry.live += 1;
        entry.idle.push(client);
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive checkout of one protocol client; released on drop.
pub struct PooledClient {
    pool: ConnectionPool,
    server: String,
    client: Arc<ProtocolClient>,
}

impl std::ops::Deref for PooledClient {
    type Target = ProtocolClient;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        self.pool.release(&self.server, self.client.clone());
    }
}
