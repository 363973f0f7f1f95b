//! Live roster view
//!
//! Owns one [`ViewState`] and feeds it from two directions: user calls on
//! this handle and a background pump reading the week's subscription. Every
//! transition goes through [`reconcile`] under one lock, so pushes and edits
//! are applied in arrival order.

use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{reconcile, SlotChange, SnapshotEvent, ViewEvent, ViewKey, ViewPhase, ViewState};
use crate::error::{Result, RosterError};
use crate::model::{
    ensure_week_start, materialize_week, ActivityType, AttendanceMap, CadetId, Collection, Slot,
    Status, Weekday,
};
use crate::remote::{RemoteStore, Subscription};
use crate::repository::{week_filters, week_scope_key, AttendanceRepository, RosterScope};

/// What a renderer needs after each transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub working: AttendanceMap,
    pub phase: ViewPhase,
    pub pushes: u64,
}

impl ViewSnapshot {
    fn of(state: &ViewState) -> Self {
        Self {
            working: state.local_working.clone(),
            phase: state.phase(),
            pushes: state.pushes,
        }
    }
}

/// Result of a successful save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Records written
    pub records: usize,
    /// Remote write calls issued
    pub writes: usize,
}

struct Shared {
    state: Mutex<ViewState>,
    notifier: watch::Sender<ViewSnapshot>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    async fn apply(&self, event: ViewEvent) -> ViewSnapshot {
        let mut state = self.state.lock().await;
        *state = reconcile(state.clone(), &event);
        let snapshot = ViewSnapshot::of(&state);
        self.notifier.send_replace(snapshot.clone());
        snapshot
    }

    async fn record_error(&self, operation: &str, error: &RosterError) {
        *self.last_error.lock().await = Some(format!("{}: {}", operation, error));
    }
}

pub struct RosterView<R: RemoteStore + 'static> {
    id: Uuid,
    key: ViewKey,
    repo: Arc<AttendanceRepository<R>>,
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
    closed: AtomicBool,
}

impl<R: RemoteStore + 'static> RosterView<R> {
    /// Load the scope's cadets and week, then start following the week's pushes.
    pub async fn open(
        repo: Arc<AttendanceRepository<R>>,
        scope: RosterScope,
        week_start: NaiveDate,
    ) -> Result<Self> {
        let week_start = ensure_week_start(week_start)?;
        let cadets: BTreeSet<CadetId> = repo
            .get_cadets(&scope)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let loaded = repo.attendance_for_cadets(&cadets, week_start).await?;
        let subscription = repo.subscribe_week(week_start).await?;

        let key = ViewKey { scope, week_start };
        let state = ViewState::new(key.clone(), cadets, loaded);
        let (notifier, _) = watch::channel(ViewSnapshot::of(&state));
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            notifier,
            last_error: Mutex::new(None),
        });

        let id = Uuid::new_v4();
        let pump = tokio::spawn(run_pump(
            id,
            Arc::clone(&repo),
            Arc::clone(&shared),
            subscription,
            week_start,
        ));

        info!(view = %id, scope = ?key.scope, week = %week_start, "Opened roster view");
        Ok(Self {
            id,
            key,
            repo,
            shared,
            pump,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &ViewKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RosterError::ViewClosed);
        }
        Ok(())
    }

    // ========================================================================
    // Edits
    // ========================================================================

    /// Change one slot in the working copy. Nothing is written until `save`.
    pub async fn edit(
        &self,
        cadet_id: &CadetId,
        activity: ActivityType,
        day: Weekday,
        status: Status,
    ) -> Result<()> {
        let slot = Slot::resolve(activity, day)?;
        self.edit_slot(cadet_id, slot, status).await
    }

    pub async fn edit_slot(&self, cadet_id: &CadetId, slot: Slot, status: Status) -> Result<()> {
        self.ensure_open()?;
        self.shared
            .apply(ViewEvent::Edit {
                cadet_id: cadet_id.clone(),
                slot,
                status,
            })
            .await;
        Ok(())
    }

    /// Write every changed record and promote the working copy on success.
    ///
    /// On failure the view returns to Dirty with its edits intact and the
    /// remote error is returned.
    pub async fn save(&self) -> Result<SaveOutcome> {
        self.ensure_open()?;

        let records = {
            let mut state = self.shared.state.lock().await;
            match state.phase() {
                ViewPhase::Saving => return Err(RosterError::SaveInProgress),
                ViewPhase::Clean => return Ok(SaveOutcome::default()),
                ViewPhase::Dirty => {}
            }
            *state = reconcile(state.clone(), &ViewEvent::SaveStarted);
            self.shared.notifier.send_replace(ViewSnapshot::of(&state));
            state
                .in_flight
                .as_ref()
                .map(|saving| saving.values().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        };

        let result = match records.as_slice() {
            [] => Ok(0),
            [record] => self.repo.update_whole_record(record).await.map(|_| 1),
            many => self.repo.batch_update_records(many).await,
        };

        if self.is_closed() {
            debug!(view = %self.id, "Save finished after close, result ignored");
            return result.map(|writes| SaveOutcome {
                records: records.len(),
                writes,
            });
        }

        match result {
            Ok(writes) => {
                self.shared.apply(ViewEvent::SaveSucceeded).await;
                *self.shared.last_error.lock().await = None;
                info!(view = %self.id, records = records.len(), writes, "Saved roster");
                Ok(SaveOutcome {
                    records: records.len(),
                    writes,
                })
            }
            Err(e) => {
                warn!(view = %self.id, error = %e, "Save failed, edits kept");
                self.shared.record_error("save", &e).await;
                self.shared.apply(ViewEvent::SaveFailed).await;
                Err(e)
            }
        }
    }

    /// Drop unsaved edits.
    pub async fn discard(&self) -> Result<()> {
        self.ensure_open()?;
        if self.phase().await == ViewPhase::Saving {
            return Err(RosterError::SaveInProgress);
        }
        self.shared.apply(ViewEvent::Discard).await;
        debug!(view = %self.id, "Discarded edits");
        Ok(())
    }

    /// Refetch the week from the store and replace all view state with it.
    pub async fn reload(&self) -> Result<()> {
        self.ensure_open()?;
        if self.phase().await == ViewPhase::Saving {
            return Err(RosterError::SaveInProgress);
        }
        let week_start = self.key.week_start;
        let docs = self
            .repo
            .refresh_scope(
                Collection::Attendance,
                &week_scope_key(week_start),
                &week_filters(week_start),
            )
            .await?;
        let cadets = self.shared.state.lock().await.cadets.clone();
        let map = materialize_week(&cadets, week_start, &docs);
        self.shared.apply(ViewEvent::Reload(map)).await;
        info!(view = %self.id, "Reloaded roster");
        Ok(())
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// The map currently rendered.
    pub async fn working(&self) -> AttendanceMap {
        self.shared.state.lock().await.local_working.clone()
    }

    pub async fn server_known(&self) -> AttendanceMap {
        self.shared.state.lock().await.server_known.clone()
    }

    pub async fn phase(&self) -> ViewPhase {
        self.shared.state.lock().await.phase()
    }

    pub async fn pending_changes(&self) -> Vec<SlotChange> {
        self.shared.state.lock().await.pending_changes()
    }

    pub async fn pushes(&self) -> u64 {
        self.shared.state.lock().await.pushes
    }

    /// Receiver notified after every transition.
    pub fn changes(&self) -> watch::Receiver<ViewSnapshot> {
        self.shared.notifier.subscribe()
    }

    /// Last failure reported by a save or the subscription, naming the operation.
    pub async fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().await.clone()
    }

    /// Stop following pushes. Later calls on the view fail with `ViewClosed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pump.abort();
            info!(view = %self.id, "Closed roster view");
        }
    }
}

impl<R: RemoteStore + 'static> Drop for RosterView<R> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn run_pump<R: RemoteStore + 'static>(
    view: Uuid,
    repo: Arc<AttendanceRepository<R>>,
    shared: Arc<Shared>,
    mut subscription: Subscription,
    week_start: NaiveDate,
) {
    let attempts = repo.config().resubscribe_attempts;
    let mut failures = 0u32;

    loop {
        match subscription.next().await {
            Some(Ok(documents)) => {
                failures = 0;
                repo.cache_week_push(week_start, &documents);
                let snapshot = shared
                    .apply(ViewEvent::Push(SnapshotEvent::for_week(week_start, documents)))
                    .await;
                debug!(%view, pushes = snapshot.pushes, phase = ?snapshot.phase, "Push applied");
            }
            Some(Err(e)) => {
                warn!(%view, error = %e, "Subscription error");
                shared.record_error("subscribe", &e).await;
                if failures >= attempts {
                    warn!(%view, "Giving up on live updates");
                    return;
                }
                failures += 1;
                match repo.subscribe_week(week_start).await {
                    Ok(fresh) => subscription = fresh,
                    Err(e) => {
                        shared.record_error("subscribe", &e).await;
                        return;
                    }
                }
            }
            None => {
                debug!(%view, "Subscription ended");
                return;
            }
        }
    }
}
