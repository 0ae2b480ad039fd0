use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Where the interview happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Location {
    Remote,
    OnSite { room: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Candidate,
}

/// Who is asking. Authorization is a capability check on this pair,
/// never a type hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn admin(id: Ulid) -> Self {
        Self { id, role: Role::Admin }
    }

    pub fn candidate(id: Ulid) -> Self {
        Self { id, role: Role::Candidate }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins may cancel any booking; candidates only their own.
    pub fn may_cancel(&self, owner: Ulid) -> bool {
        self.is_admin() || self.id == owner
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Active,
    Cancelled,
}

/// One candidate's claim on one unit of a slot's capacity.
/// Cancelled records stay in the ledger; cancellation is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: Ulid,
    pub candidate_id: Ulid,
    pub booked_at: Ms,
    pub status: BookingStatus,
    pub cancelled_at: Option<Ms>,
}

impl BookingRecord {
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Active
    }
}

/// In-memory state of one interview slot: the slot record plus its
/// booking ledger. All mutation happens under this slot's write lock.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub id: Ulid,
    pub span: Span,
    pub capacity: u32,
    pub location: Location,
    pub is_open: bool,
    pub created_at: Ms,
    pub bookings: Vec<BookingRecord>,
}

impl SlotState {
    pub fn new(id: Ulid, span: Span, capacity: u32, location: Location, created_at: Ms) -> Self {
        Self {
            id,
            span,
            capacity,
            location,
            is_open: true,
            created_at,
            bookings: Vec::new(),
        }
    }

    /// Count of active bookings. Always recomputed from the ledger,
    /// never cached — the arbiter reads this under the write lock.
    pub fn active_count(&self) -> u32 {
        self.bookings.iter().filter(|b| b.is_active()).count() as u32
    }

    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.active_count())
    }

    pub fn is_full(&self) -> bool {
        self.active_count() >= self.capacity
    }

    pub fn booking(&self, id: Ulid) -> Option<&BookingRecord> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut BookingRecord> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated {
        id: Ulid,
        span: Span,
        capacity: u32,
        location: Location,
        created_at: Ms,
    },
    SlotUpdated {
        id: Ulid,
        capacity: u32,
        location: Location,
    },
    SlotOpenToggled {
        id: Ulid,
        open: bool,
    },
    SlotDeleted {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        slot_id: Ulid,
        candidate_id: Ulid,
        booked_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        slot_id: Ulid,
        cancelled_at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A slot as shown to callers, with availability computed at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub capacity: u32,
    pub location: Location,
    pub is_open: bool,
    pub remaining: u32,
}

impl SlotInfo {
    pub fn from_state(s: &SlotState) -> Self {
        Self {
            id: s.id,
            start: s.span.start,
            end: s.span.end,
            capacity: s.capacity,
            location: s.location.clone(),
            is_open: s.is_open,
            remaining: s.remaining(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingInfo {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub candidate_id: Ulid,
    pub status: BookingStatus,
    pub booked_at: Ms,
    pub cancelled_at: Option<Ms>,
}

impl BookingInfo {
    pub fn from_record(slot_id: Ulid, r: &BookingRecord) -> Self {
        Self {
            id: r.id,
            slot_id,
            candidate_id: r.candidate_id,
            status: r.status,
            booked_at: r.booked_at,
            cancelled_at: r.cancelled_at,
        }
    }
}

/// One row of the polling snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityEntry {
    pub slot_id: Ulid,
    pub remaining: u32,
    pub is_full: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_with_bookings(capacity: u32, active: usize, cancelled: usize) -> SlotState {
        let mut s = SlotState::new(
            Ulid::new(),
            Span::new(1_000_000, 2_000_000),
            capacity,
            Location::Remote,
            0,
        );
        for _ in 0..active {
            s.bookings.push(BookingRecord {
                id: Ulid::new(),
                candidate_id: Ulid::new(),
                booked_at: 0,
                status: BookingStatus::Active,
                cancelled_at: None,
            });
        }
        for _ in 0..cancelled {
            s.bookings.push(BookingRecord {
                id: Ulid::new(),
                candidate_id: Ulid::new(),
                booked_at: 0,
                status: BookingStatus::Cancelled,
                cancelled_at: Some(100),
            });
        }
        s
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(!s.contains_instant(200)); // half-open
        assert!(s.overlaps(&Span::new(150, 250)));
        assert!(!s.overlaps(&Span::new(200, 300))); // adjacent
    }

    #[test]
    fn remaining_ignores_cancelled() {
        let s = slot_with_bookings(3, 2, 5);
        assert_eq!(s.active_count(), 2);
        assert_eq!(s.remaining(), 1);
        assert!(!s.is_full());
    }

    #[test]
    fn full_at_capacity() {
        let s = slot_with_bookings(2, 2, 0);
        assert!(s.is_full());
        assert_eq!(s.remaining(), 0);
    }

    #[test]
    fn remaining_never_underflows() {
        let mut s = slot_with_bookings(3, 3, 0);
        s.capacity = 2;
        assert_eq!(s.remaining(), 0);
    }

    #[test]
    fn actor_cancellation_capability() {
        let owner = Ulid::new();
        let stranger = Ulid::new();
        assert!(Actor::candidate(owner).may_cancel(owner));
        assert!(!Actor::candidate(stranger).may_cancel(owner));
        assert!(Actor::admin(stranger).may_cancel(owner));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SlotCreated {
            id: Ulid::new(),
            span: Span::new(1_000, 2_000),
            capacity: 2,
            location: Location::OnSite { room: "A-201".into() },
            created_at: 500,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
