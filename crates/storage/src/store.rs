//! SQLite event store implementation.

use crate::{Event, EventKind, Result, RunId};
use rusqlite::{params, Connection};
use std::path::Path;

/// SQLite-backed audit log.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Open or create an event store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory event store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_run
                ON events(run_id, timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Append an event to the log.
    pub fn append(&self, event: &Event) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (id, run_id, timestamp, kind, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id.to_string(),
                event.run_id.to_string(),
                event.timestamp.to_rfc3339(),
                event_kind_name(&event.kind),
                serde_json::to_string(&event.kind)?,
            ],
        )?;
        Ok(())
    }

    /// Load all events for a run, ordered by timestamp.
    pub fn load_run(&self, run_id: RunId) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, timestamp, data FROM events
             WHERE run_id = ?1 ORDER BY timestamp, id",
        )?;

        let events = stmt
            .query_map([run_id.to_string()], |row| {
                let id: String = row.get(0)?;
                let run_id: String = row.get(1)?;
                let timestamp: String = row.get(2)?;
                let data: String = row.get(3)?;
                Ok((id, run_id, timestamp, data))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(id, run_id, timestamp, data)| {
                Some(Event {
                    id: id.parse().ok()?,
                    run_id: RunId(run_id.parse().ok()?),
                    timestamp: timestamp.parse().ok()?,
                    kind: serde_json::from_str(&data).ok()?,
                })
            })
            .collect();

        Ok(events)
    }

    /// Distinct runs present in the log, newest first.
    pub fn list_runs(&self) -> Result<Vec<RunId>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, MIN(timestamp) AS started FROM events
             GROUP BY run_id ORDER BY started DESC",
        )?;
        let runs = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|raw| Some(RunId(raw.parse().ok()?)))
            .collect();
        Ok(runs)
    }
}

fn event_kind_name(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::CallSubmitted { .. } => "call_submitted",
        EventKind::CallCompleted { .. } => "call_completed",
        EventKind::Checkpoint { .. } => "checkpoint",
        EventKind::ServerRegistered { .. } => "server_registered",
        EventKind::ServerRemoved { .. } => "server_removed",
        EventKind::RunStart => "run_start",
        EventKind::RunEnd => "run_end",
    }
}
