//! The capacity arbiter: admission rules for bookings and cancellations,
//! and the bounded-wait slot lock they run under.
//!
//! The decision procedure is lock-then-decide-then-commit. The slot's write
//! lock is held across the whole read-check-write sequence and released by
//! guard drop on every exit path, success or not.

use tokio::sync::OwnedRwLockWriteGuard;
use tokio::time::{sleep, timeout};

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, SharedSlotState};

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::LimitExceeded("slot must end after it starts"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(EngineError::LimitExceeded("slot too long"));
    }
    Ok(())
}

/// Booking admission: called with the slot's write lock held, so the
/// active count it reads cannot move until the decision commits.
pub(crate) fn admit(rs: &SlotState, now: Ms) -> Result<(), EngineError> {
    if !rs.is_open {
        return Err(EngineError::SlotClosed(rs.id));
    }
    if rs.span.start <= now {
        return Err(EngineError::SlotInPast(rs.id));
    }
    if rs.active_count() >= rs.capacity {
        return Err(EngineError::SlotFull { slot: rs.id, capacity: rs.capacity });
    }
    Ok(())
}

/// Cutoff rule: cancellation is allowed while at least `cutoff_ms` remains
/// before the slot starts. Remaining time strictly below the cutoff is
/// rejected; exactly the cutoff is still allowed.
pub fn cancellation_allowed(slot_start: Ms, now: Ms, cutoff_ms: Ms) -> bool {
    slot_start - now >= cutoff_ms
}

impl Engine {
    /// Acquire a slot's write lock with a bounded wait, retrying with
    /// backoff. Exhausting the retries surfaces `Unavailable` — the caller
    /// treats it as transient, never as a booking rejection.
    pub(super) async fn lock_slot(
        &self,
        rs: &SharedSlotState,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let mut backoff = std::time::Duration::from_millis(25);
        for attempt in 0..=self.tuning.lock_retries {
            match timeout(self.tuning.lock_wait, rs.clone().write_owned()).await {
                Ok(guard) => return Ok(guard),
                Err(_) if attempt < self.tuning.lock_retries => {
                    sleep(backoff).await;
                    backoff *= 2;
                }
                Err(_) => break,
            }
        }
        metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
        Err(EngineError::Unavailable)
    }

    /// Lookup booking → slot, get slot, acquire the write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &ulid::Ulid,
    ) -> Result<(ulid::Ulid, OwnedRwLockWriteGuard<SlotState>), EngineError> {
        let slot_id = self
            .slot_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let rs = self
            .get_slot_state(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = self.lock_slot(&rs).await?;
        Ok((slot_id, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn slot(start: Ms, end: Ms, capacity: u32) -> SlotState {
        SlotState::new(Ulid::new(), Span::new(start, end), capacity, Location::Remote, 0)
    }

    fn active(candidate: Ulid) -> BookingRecord {
        BookingRecord {
            id: Ulid::new(),
            candidate_id: candidate,
            booked_at: 0,
            status: BookingStatus::Active,
            cancelled_at: None,
        }
    }

    #[test]
    fn admit_open_future_slot() {
        let rs = slot(10 * H, 11 * H, 1);
        assert!(admit(&rs, 5 * H).is_ok());
    }

    #[test]
    fn admit_rejects_closed() {
        let mut rs = slot(10 * H, 11 * H, 1);
        rs.is_open = false;
        assert!(matches!(admit(&rs, 5 * H), Err(EngineError::SlotClosed(_))));
    }

    #[test]
    fn admit_rejects_started_slot() {
        let rs = slot(10 * H, 11 * H, 1);
        // Exactly at start is already "started" — half-open span
        assert!(matches!(admit(&rs, 10 * H), Err(EngineError::SlotInPast(_))));
        assert!(admit(&rs, 10 * H - 1).is_ok());
    }

    #[test]
    fn admit_rejects_full_slot() {
        let mut rs = slot(10 * H, 11 * H, 2);
        rs.bookings.push(active(Ulid::new()));
        rs.bookings.push(active(Ulid::new()));
        assert!(matches!(admit(&rs, 5 * H), Err(EngineError::SlotFull { capacity: 2, .. })));
    }

    #[test]
    fn admit_ignores_cancelled_bookings() {
        let mut rs = slot(10 * H, 11 * H, 1);
        let mut b = active(Ulid::new());
        b.status = BookingStatus::Cancelled;
        b.cancelled_at = Some(1);
        rs.bookings.push(b);
        assert!(admit(&rs, 5 * H).is_ok());
    }

    #[test]
    fn cutoff_boundary_is_deterministic() {
        let cutoff = 24 * H;
        let start = 100 * H;
        // Exactly the cutoff remaining: allowed.
        assert!(cancellation_allowed(start, start - cutoff, cutoff));
        // One ms less than the cutoff remaining: rejected.
        assert!(!cancellation_allowed(start, start - cutoff + 1, cutoff));
        // One second more than the cutoff remaining: allowed.
        assert!(cancellation_allowed(start, start - cutoff - 1_000, cutoff));
    }

    #[test]
    fn span_validation() {
        assert!(validate_span(&Span { start: 100 * H, end: 99 * H }).is_err());
        assert!(validate_span(&Span { start: 1, end: 2 }).is_err()); // before epoch window
        let start = MIN_VALID_TIMESTAMP_MS + H;
        assert!(validate_span(&Span::new(start, start + H)).is_ok());
        assert!(validate_span(&Span::new(start, start + 25 * H)).is_err()); // too long
    }
}
