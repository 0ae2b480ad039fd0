mod arbiter;
mod error;
mod mutations;
mod queries;

pub use arbiter::{cancellation_allowed, now_ms};
pub use error::EngineError;
pub use queries::SlotFilter;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

/// Runtime knobs for the arbiter. All values come from config.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    /// How long one attempt waits for a slot's write lock.
    pub lock_wait: Duration,
    /// Retries after a lock-wait timeout before giving up.
    pub lock_retries: u32,
    /// Candidates may cancel only while at least this much time remains
    /// before the slot starts. Admins bypass the cutoff.
    pub cancel_cutoff_ms: Ms,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(2),
            lock_retries: 3,
            cancel_cutoff_ms: 24 * 3_600_000,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The slot booking engine. One per portal.
///
/// Serialization model: each slot has its own `RwLock`; every booking
/// decision for a slot happens under that slot's write lock (lock, then
/// decide, then commit). Requests for different slots proceed in parallel.
pub struct Engine {
    pub(super) slots: DashMap<Ulid, SharedSlotState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → slot id. Cancelled bookings stay here
    /// so repeat cancellation is distinguishable from NotFound.
    pub(super) booking_to_slot: DashMap<Ulid, Ulid>,
    /// candidate id → their active booking id. Entry presence IS the
    /// "one active booking per candidate" invariant; claims on it are
    /// atomic (sharded map entry), so two slots cannot both admit the
    /// same candidate.
    pub(super) active_by_candidate: DashMap<Ulid, Ulid>,
    /// Serializes slot creation, so a series' overlap check runs against
    /// a span set no concurrent create can change mid-series.
    pub(super) creation_lock: Mutex<()>,
    pub(super) tuning: EngineTuning,
}

/// Apply an event to a SlotState (no locking — caller holds the write lock).
fn apply_to_slot(rs: &mut SlotState, event: &Event) {
    match event {
        Event::SlotUpdated { capacity, location, .. } => {
            rs.capacity = *capacity;
            rs.location = location.clone();
        }
        Event::SlotOpenToggled { open, .. } => {
            rs.is_open = *open;
        }
        Event::BookingCreated { id, candidate_id, booked_at, .. } => {
            rs.bookings.push(BookingRecord {
                id: *id,
                candidate_id: *candidate_id,
                booked_at: *booked_at,
                status: BookingStatus::Active,
                cancelled_at: None,
            });
        }
        Event::BookingCancelled { id, cancelled_at, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.status = BookingStatus::Cancelled;
                b.cancelled_at = Some(*cancelled_at);
            }
        }
        // Created/Deleted are handled at the DashMap level, not here
        Event::SlotCreated { .. } | Event::SlotDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, tuning: EngineTuning) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: DashMap::new(),
            wal_tx,
            notify,
            booking_to_slot: DashMap::new(),
            active_by_candidate: DashMap::new(),
            creation_lock: Mutex::new(()),
            tuning,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this may
        // run inside an async context.
        for event in &events {
            match event {
                Event::SlotCreated { id, span, capacity, location, created_at } => {
                    let rs = SlotState::new(*id, *span, *capacity, location.clone(), *created_at);
                    engine.slots.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::SlotDeleted { id } => {
                    if let Some((_, rs)) = engine.slots.remove(id) {
                        let guard = rs.try_read().expect("replay: uncontended read");
                        for b in &guard.bookings {
                            engine.booking_to_slot.remove(&b.id);
                        }
                    }
                }
                other => {
                    if let Some(slot_id) = event_slot_id(other)
                        && let Some(entry) = engine.slots.get(&slot_id)
                    {
                        let rs_arc = entry.value().clone();
                        drop(entry);
                        let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                        apply_to_slot(&mut guard, other);
                        engine.index_event(&guard, other);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Maintain the booking/candidate indexes for an applied event.
    /// Idempotent, so the live path may pre-claim the candidate entry.
    fn index_event(&self, rs: &SlotState, event: &Event) {
        match event {
            Event::BookingCreated { id, slot_id, candidate_id, .. } => {
                self.booking_to_slot.insert(*id, *slot_id);
                self.active_by_candidate.insert(*candidate_id, *id);
            }
            Event::BookingCancelled { id, .. } => {
                if let Some(b) = rs.booking(*id) {
                    // Only release the claim if it still points at this booking
                    self.active_by_candidate
                        .remove_if(&b.candidate_id, |_, active| *active == *id);
                }
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_slot_state(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slot_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_slot.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + index + notify in one call. The commit point is
    /// the WAL append: if it fails, in-memory state is untouched.
    pub(super) async fn persist_and_apply(
        &self,
        slot_id: Ulid,
        rs: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slot(rs, event);
        self.index_event(rs, event);
        self.notify.send(slot_id, event);
        Ok(())
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate current state. Ledger history (cancelled bookings) survives.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        for entry in self.slots.iter() {
            let rs_arc = entry.value().clone();
            let guard = rs_arc.read().await;
            events.push(Event::SlotCreated {
                id: guard.id,
                span: guard.span,
                capacity: guard.capacity,
                location: guard.location.clone(),
                created_at: guard.created_at,
            });
            if !guard.is_open {
                events.push(Event::SlotOpenToggled { id: guard.id, open: false });
            }
            for b in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    slot_id: guard.id,
                    candidate_id: b.candidate_id,
                    booked_at: b.booked_at,
                });
                if let Some(cancelled_at) = b.cancelled_at {
                    events.push(Event::BookingCancelled {
                        id: b.id,
                        slot_id: guard.id,
                        cancelled_at,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Extract the slot id from an event (for non-Create/Delete events).
fn event_slot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SlotUpdated { id, .. } | Event::SlotOpenToggled { id, .. } => Some(*id),
        Event::BookingCreated { slot_id, .. } | Event::BookingCancelled { slot_id, .. } => {
            Some(*slot_id)
        }
        Event::SlotCreated { .. } | Event::SlotDeleted { .. } => None,
    }
}
