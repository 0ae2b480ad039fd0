use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::arbiter::{admit, cancellation_allowed, now_ms, validate_span};
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_slot(
        &self,
        id: Ulid,
        span: Span,
        capacity: u32,
        location: Location,
    ) -> Result<(), EngineError> {
        let _creation = self.creation_lock.lock().await;
        self.create_slot_locked(id, span, capacity, location).await
    }

    /// Creation body; caller holds `creation_lock`.
    async fn create_slot_locked(
        &self,
        id: Ulid,
        span: Span,
        capacity: u32,
        location: Location,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        validate_capacity(capacity)?;
        validate_location(&location)?;
        if self.slots.len() >= MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        if self.slots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let now = now_ms();
        if span.start <= now {
            return Err(EngineError::SlotInPast(id));
        }

        let event = Event::SlotCreated {
            id,
            span,
            capacity,
            location: location.clone(),
            created_at: now,
        };
        self.wal_append(&event).await?;
        let rs = SlotState::new(id, span, capacity, location, now);
        self.slots.insert(id, Arc::new(RwLock::new(rs)));
        self.notify.send(id, &event);
        Ok(())
    }

    /// Cut a window into interval-sized slots, skipping intervals that
    /// overlap an existing slot. Returns created ids and the skip count.
    pub async fn create_slot_series(
        &self,
        window: Span,
        interval_ms: Ms,
        capacity: u32,
        location: Location,
    ) -> Result<(Vec<Ulid>, usize), EngineError> {
        validate_span(&window)?;
        validate_capacity(capacity)?;
        validate_location(&location)?;
        if !(MIN_SERIES_INTERVAL_MS..=MAX_SERIES_INTERVAL_MS).contains(&interval_ms) {
            return Err(EngineError::LimitExceeded("series interval out of range"));
        }
        if window.duration_ms() / interval_ms > MAX_SERIES_SLOTS as Ms {
            return Err(EngineError::LimitExceeded("series too large"));
        }

        // Hold the creation lock for the whole series: the snapshot below
        // stays valid because no other create can interleave.
        let _creation = self.creation_lock.lock().await;
        let mut existing: Vec<Span> = Vec::new();
        let arcs: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        for rs in arcs {
            existing.push(rs.read().await.span);
        }

        let now = now_ms();
        let mut created = Vec::new();
        let mut skipped = 0usize;
        let mut cursor = window.start;
        while cursor + interval_ms <= window.end {
            let span = Span::new(cursor, cursor + interval_ms);
            cursor += interval_ms;
            if span.start <= now || existing.iter().any(|s| s.overlaps(&span)) {
                skipped += 1;
                continue;
            }
            let id = Ulid::new();
            self.create_slot_locked(id, span, capacity, location.clone()).await?;
            existing.push(span);
            created.push(id);
        }
        Ok((created, skipped))
    }

    /// Admin edit. Rejected if the new capacity would fall below the
    /// current active booking count — checked under the slot's write lock
    /// so no concurrent booking can slip past the check.
    pub async fn update_slot(
        &self,
        id: Ulid,
        capacity: u32,
        location: Location,
    ) -> Result<(), EngineError> {
        validate_capacity(capacity)?;
        validate_location(&location)?;
        let rs = self.get_slot_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = self.lock_slot(&rs).await?;
        if !self.slots.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let active = guard.active_count();
        if capacity < active {
            return Err(EngineError::CapacityBelowBookings { slot: id, active });
        }
        let event = Event::SlotUpdated { id, capacity, location };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    pub async fn set_slot_open(&self, id: Ulid, open: bool) -> Result<(), EngineError> {
        let rs = self.get_slot_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = self.lock_slot(&rs).await?;
        if !self.slots.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::SlotOpenToggled { id, open };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Delete a slot. Only allowed with zero active bookings; cancelled
    /// ledger entries for the slot are dropped with it.
    pub async fn delete_slot(&self, id: Ulid) -> Result<(), EngineError> {
        let rs = self.get_slot_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = self.lock_slot(&rs).await?;
        if !self.slots.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if guard.active_count() > 0 {
            return Err(EngineError::HasActiveBookings(id));
        }

        let event = Event::SlotDeleted { id };
        self.wal_append(&event).await?;
        for b in &guard.bookings {
            self.booking_to_slot.remove(&b.id);
        }
        self.slots.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    /// The arbitrated booking path: lock the slot, re-check capacity and
    /// the candidate's single-active-booking invariant under the lock,
    /// then commit via WAL append.
    pub async fn book_slot(
        &self,
        id: Ulid,
        slot_id: Ulid,
        candidate_id: Ulid,
    ) -> Result<BookingInfo, EngineError> {
        if self.booking_to_slot.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let rs = self
            .get_slot_state(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let mut guard = self.lock_slot(&rs).await?;
        // The slot may have been deleted while we waited for the lock.
        if !self.slots.contains_key(&slot_id) {
            return Err(EngineError::NotFound(slot_id));
        }

        let now = now_ms();
        admit(&guard, now)?;

        // Atomic claim: entry presence == active booking. Checked inside
        // the same critical section as the capacity check, so a candidate
        // racing on two slots gets exactly one of them.
        let prior_claim = {
            match self.active_by_candidate.entry(candidate_id) {
                Entry::Occupied(e) => Some(*e.get()),
                Entry::Vacant(v) => {
                    v.insert(id);
                    None
                }
            }
        };
        if let Some(existing) = prior_claim {
            // A duplicate rejection must name a committed booking. A claim
            // whose booking has not reached the ledger yet may still roll
            // back, so that window surfaces as transient instead.
            if self.booking_to_slot.contains_key(&existing) {
                return Err(EngineError::DuplicateBooking {
                    candidate: candidate_id,
                    existing,
                });
            }
            return Err(EngineError::Unavailable);
        }

        let event = Event::BookingCreated { id, slot_id, candidate_id, booked_at: now };
        if let Err(e) = self.persist_and_apply(slot_id, &mut guard, &event).await {
            // Commit failed — release the claim, nothing was applied.
            self.active_by_candidate.remove_if(&candidate_id, |_, b| *b == id);
            return Err(e);
        }

        Ok(BookingInfo {
            id,
            slot_id,
            candidate_id,
            status: BookingStatus::Active,
            booked_at: now,
            cancelled_at: None,
        })
    }

    /// Cancellation runs under the same per-slot lock as bookings, so a
    /// cancel racing a book cannot double-count availability.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        actor: Actor,
    ) -> Result<BookingInfo, EngineError> {
        let (slot_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        let (owner, status) = {
            let record = guard
                .booking(booking_id)
                .ok_or(EngineError::NotFound(booking_id))?;
            (record.candidate_id, record.status)
        };
        if status == BookingStatus::Cancelled {
            return Err(EngineError::AlreadyCancelled(booking_id));
        }
        if !actor.may_cancel(owner) {
            return Err(EngineError::Forbidden);
        }
        let now = now_ms();
        if !actor.is_admin()
            && !cancellation_allowed(guard.span.start, now, self.tuning.cancel_cutoff_ms)
        {
            return Err(EngineError::TooLateToCancel {
                slot: slot_id,
                cutoff_ms: self.tuning.cancel_cutoff_ms,
            });
        }

        let event = Event::BookingCancelled { id: booking_id, slot_id, cancelled_at: now };
        self.persist_and_apply(slot_id, &mut guard, &event).await?;

        Ok(BookingInfo {
            id: booking_id,
            slot_id,
            candidate_id: owner,
            status: BookingStatus::Cancelled,
            booked_at: guard
                .booking(booking_id)
                .map(|b| b.booked_at)
                .unwrap_or_default(),
            cancelled_at: Some(now),
        })
    }
}

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::LimitExceeded("capacity must be at least 1"));
    }
    if capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

fn validate_location(location: &Location) -> Result<(), EngineError> {
    if let Location::OnSite { room } = location
        && room.len() > MAX_ROOM_LEN
    {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    Ok(())
}
