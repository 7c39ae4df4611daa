//! SQLite-backed audit log for capability execution.
//!
//! Every capability call, checkpoint and server lifecycle change is
//! captured as an [`Event`] keyed by the owning [`RunId`], giving a
//! queryable "why did it do that?" trail for agent runs.
//!
//! # Example
//!
//! ```no_run
//! use storage::{Event, EventKind, EventStore, RunId};
//!
//! let store = EventStore::open("audit.db")?;
//! let run = RunId::new();
//!
//! store.append(&Event::new(run, EventKind::RunStart))?;
//! store.append(&Event::new(run, EventKind::ServerRegistered {
//!     server: "filesystem".to_string(),
//! }))?;
//!
//! for event in store.load_run(run)? {
//!     println!("{}: {:?}", event.timestamp, event.kind);
//! }
//! # Ok::<(), storage::Error>(())
//! ```

mod error;
mod event;
mod store;

pub use error::{Error, Result};
pub use event::{Event, EventKind, RunId};
pub use store::EventStore;
