//! Roster Sync - local-first attendance cache and live reconciliation
//!
//! Sits between a roster UI and a remote document database holding cadet
//! rosters and weekly attendance.
//!
//! ## Architecture
//!
//! - **Local cache** (`cache`): sled-backed snapshots per (collection, scope)
//!   with a last-refreshed stamp, survives restarts
//! - **Repository** (`repository`): cache-first reads with a staleness gate,
//!   merge-writes of whole records, chunked batches
//! - **Reconciliation** (`reconcile`): per-view merge of server pushes with
//!   unsaved local edits
//! - **Remote store** (`remote`): the document database boundary, plus an
//!   in-memory implementation for tests and local development
//!
//! ## Data Flow
//!
//! ```text
//! UI edit ──► local_working ──save──► diff vs server_known ──► batch merge-write
//!                   ▲                                               │
//!                   └──── push (full snapshot) ◄── subscription ◄───┘
//! ```

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod migrate;
pub mod model;
pub mod reconcile;
pub mod remote;
pub mod repository;

// Re-exports
pub use cache::{CacheEntryInfo, CachedSnapshot, LocalCache};
pub use config::Config;
pub use error::{Result, RosterError};
pub use model::{
    ActivityType, AttendanceMap, AttendanceRecord, Cadet, CadetId, Collection, Document, Slot,
    Status, Weekday,
};
pub use reconcile::{reconcile, RosterView, SnapshotEvent, ViewEvent, ViewPhase, ViewState};
pub use remote::memory::InMemoryRemoteStore;
pub use remote::{Filter, RemoteStore, Subscription};
pub use repository::{AttendanceRepository, RepositoryConfig, RosterScope};
