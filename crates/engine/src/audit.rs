//! Best-effort audit recording. Storage failures are logged and never
//! fail the call they describe.

use std::sync::{Arc, Mutex, PoisonError};

use storage::{Event, EventKind, EventStore, RunId};
use tracing::warn;

/// Shared handle on the run's audit trail.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<Mutex<EventStore>>,
    run: RunId,
}

impl AuditLog {
    pub fn new(store: EventStore, run: RunId) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            run,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run
    }

    pub fn record(&self, kind: EventKind) {
        let event = Event::new(self.run, kind);
        let store = self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(error) = store.append(&event) {
            warn!(%error, "failed to append audit event");
        }
    }

    /// All events recorded for this run so far.
    pub fn replay(&self) -> storage::Result<Vec<Event>> {
        let store = self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        store.load_run(self.run)
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("run", &self.run).finish()
    }
}
