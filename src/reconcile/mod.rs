//! Reconciliation Layer - per-view merge of server pushes and local edits
//!
//! Each open roster view tracks two maps:
//!
//! - `server_known`: the last state this client received from or sent to the
//!   store
//! - `local_working`: what the user sees and edits
//!
//! ```text
//!            edit                 save                 ok
//!   Clean ─────────► Dirty ─────────────► Saving ─────────► Clean
//!     ▲                │ ▲                   │
//!     │   discard      │ │       failed      │
//!     └────────────────┘ └───────────────────┘
//!
//!   push while Clean  : server_known and local_working both replaced
//!   push while Dirty  : server_known replaced, local_working untouched
//!   push while Saving : server_known replaced, save not interrupted
//! ```
//!
//! [`reconcile`] is a pure transition function; [`RosterView`] drives it from
//! a live subscription.

pub mod view;

pub use view::{RosterView, SaveOutcome, ViewSnapshot};

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::model::{materialize_week, AttendanceMap, AttendanceRecord, CadetId, Document, Slot, Status};
use crate::repository::{week_scope_key, RosterScope};

/// Identity of an open view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub scope: RosterScope,
    pub week_start: NaiveDate,
}

/// A full-scope snapshot delivered by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEvent {
    /// Cache scope key of the pushed query (e.g. `week:2026-01-19`)
    pub scope: String,
    pub documents: Vec<Document>,
    pub timestamp: DateTime<Utc>,
}

impl SnapshotEvent {
    pub fn for_week(week_start: NaiveDate, documents: Vec<Document>) -> Self {
        Self {
            scope: week_scope_key(week_start),
            documents,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPhase {
    /// No unsaved edits
    Clean,
    /// Unsaved edits present
    Dirty,
    /// Write in flight
    Saving,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    Push(SnapshotEvent),
    Edit {
        cadet_id: CadetId,
        slot: Slot,
        status: Status,
    },
    SaveStarted,
    SaveSucceeded,
    SaveFailed,
    /// Throw away local edits.
    Discard,
    /// Replace everything with a freshly fetched map.
    Reload(AttendanceMap),
}

/// One slot that differs between two maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotChange {
    pub cadet_id: CadetId,
    pub slot: Slot,
    pub from: Status,
    pub to: Status,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub key: ViewKey,
    pub cadets: BTreeSet<CadetId>,
    pub server_known: AttendanceMap,
    pub local_working: AttendanceMap,
    /// The server state `local_working` was last edited against.
    pub base: AttendanceMap,
    /// Records being written by the current save, changed cadets only.
    pub in_flight: Option<AttendanceMap>,
    pub pushes: u64,
    pub last_push_at: Option<DateTime<Utc>>,
}

impl ViewState {
    pub fn new(key: ViewKey, cadets: BTreeSet<CadetId>, loaded: AttendanceMap) -> Self {
        Self {
            key,
            cadets,
            server_known: loaded.clone(),
            local_working: loaded.clone(),
            base: loaded,
            in_flight: None,
            pushes: 0,
            last_push_at: None,
        }
    }

    pub fn phase(&self) -> ViewPhase {
        if self.in_flight.is_some() {
            ViewPhase::Saving
        } else if self.local_working == self.server_known {
            ViewPhase::Clean
        } else {
            ViewPhase::Dirty
        }
    }

    /// Full records for every cadet whose working copy differs from the server.
    pub fn diff(&self) -> Vec<AttendanceRecord> {
        self.local_working
            .iter()
            .filter(|(id, local)| self.server_known.get(*id) != Some(*local))
            .map(|(_, local)| local.clone())
            .collect()
    }

    /// Slot-level view of the pending edits.
    pub fn pending_changes(&self) -> Vec<SlotChange> {
        slot_changes(&self.server_known, &self.local_working)
    }
}

/// Slots whose status differs from `from` to `to`, by strict equality.
pub fn slot_changes(from: &AttendanceMap, to: &AttendanceMap) -> Vec<SlotChange> {
    let mut changes = Vec::new();
    for (cadet_id, target) in to {
        let Some(source) = from.get(cadet_id) else {
            continue;
        };
        for slot in target.changed_slots(source) {
            changes.push(SlotChange {
                cadet_id: cadet_id.clone(),
                slot,
                from: source.get(slot),
                to: target.get(slot),
            });
        }
    }
    changes
}

/// Carry server-side changes into the working copy for every slot the user
/// has not edited since `base`.
pub fn rebase(base: &AttendanceMap, local: &AttendanceMap, server: &AttendanceMap) -> AttendanceMap {
    local
        .iter()
        .map(|(cadet_id, working)| {
            let (Some(original), Some(latest)) = (base.get(cadet_id), server.get(cadet_id)) else {
                return (cadet_id.clone(), working.clone());
            };
            let mut merged = working.clone();
            for slot in Slot::ALL {
                if working.get(slot) == original.get(slot) {
                    merged.set(slot, latest.get(slot));
                }
            }
            (cadet_id.clone(), merged)
        })
        .collect()
}

/// Apply one event to a view's state.
pub fn reconcile(mut state: ViewState, event: &ViewEvent) -> ViewState {
    match event {
        ViewEvent::Push(snapshot) => {
            let expected = week_scope_key(state.key.week_start);
            if snapshot.scope != expected {
                warn!(scope = %snapshot.scope, %expected, "Ignoring push for another scope");
                return state;
            }
            let was_clean = state.phase() == ViewPhase::Clean;
            state.server_known =
                materialize_week(&state.cadets, state.key.week_start, &snapshot.documents);
            state.pushes += 1;
            state.last_push_at = Some(snapshot.timestamp);

            if was_clean {
                state.local_working = state.server_known.clone();
            }
            if state.phase() == ViewPhase::Clean {
                state.base = state.server_known.clone();
            }
            debug!(pushes = state.pushes, adopted = was_clean, phase = ?state.phase(), "Applied push");
        }

        ViewEvent::Edit {
            cadet_id,
            slot,
            status,
        } => match state.local_working.get_mut(cadet_id) {
            Some(record) => record.set(*slot, *status),
            None => warn!(cadet = %cadet_id, "Ignoring edit for cadet outside the view"),
        },

        ViewEvent::SaveStarted => {
            if state.phase() != ViewPhase::Dirty {
                return state;
            }
            state.local_working = rebase(&state.base, &state.local_working, &state.server_known);
            state.base = state.server_known.clone();
            let changed = state
                .diff()
                .into_iter()
                .map(|record| (record.cadet_id.clone(), record))
                .collect();
            state.in_flight = Some(changed);
        }

        ViewEvent::SaveSucceeded => {
            if let Some(saved) = state.in_flight.take() {
                // Optimistic promotion of the written cadets only; pushes that
                // arrived mid-save stand for everyone else.
                for (cadet_id, record) in saved {
                    state.server_known.insert(cadet_id.clone(), record.clone());
                    state.base.insert(cadet_id, record);
                }
                let ViewState {
                    server_known,
                    local_working,
                    base,
                    ..
                } = &mut state;
                for (cadet_id, working) in local_working.iter_mut() {
                    let (Some(original), Some(latest)) =
                        (base.get_mut(cadet_id), server_known.get(cadet_id))
                    else {
                        continue;
                    };
                    if working == original {
                        *working = latest.clone();
                        *original = latest.clone();
                    }
                }
            }
        }

        ViewEvent::SaveFailed => {
            state.in_flight = None;
        }

        ViewEvent::Discard => {
            state.local_working = state.server_known.clone();
            state.base = state.server_known.clone();
        }

        ViewEvent::Reload(map) => {
            state.server_known = map.clone();
            state.local_working = map.clone();
            state.base = map.clone();
            state.in_flight = None;
        }
    }
    state
}
