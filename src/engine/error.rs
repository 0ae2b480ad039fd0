use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// All capacity units of the slot are taken.
    SlotFull { slot: Ulid, capacity: u32 },
    /// The candidate already holds an active booking.
    DuplicateBooking { candidate: Ulid, existing: Ulid },
    /// The booking was already cancelled; cancellation is terminal.
    AlreadyCancelled(Ulid),
    /// Cancellation attempted with less than the cutoff remaining.
    TooLateToCancel { slot: Ulid, cutoff_ms: Ms },
    /// Actor lacks the capability for this operation.
    Forbidden,
    /// Capacity edit would drop below the current active booking count.
    CapacityBelowBookings { slot: Ulid, active: u32 },
    /// Slot deletion requires zero active bookings.
    HasActiveBookings(Ulid),
    SlotClosed(Ulid),
    SlotInPast(Ulid),
    LimitExceeded(&'static str),
    /// Slot lock could not be acquired within the bounded wait, after retries.
    Unavailable,
    WalError(String),
}

impl EngineError {
    /// Conflict and validation outcomes are expected business results,
    /// surfaced to the caller as structured rejections rather than failures.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, EngineError::Unavailable | EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotFull { slot, capacity } => {
                write!(f, "slot {slot} is full: all {capacity} places taken")
            }
            EngineError::DuplicateBooking { candidate, existing } => {
                write!(f, "candidate {candidate} already holds active booking {existing}")
            }
            EngineError::AlreadyCancelled(id) => write!(f, "booking already cancelled: {id}"),
            EngineError::TooLateToCancel { slot, cutoff_ms } => {
                write!(
                    f,
                    "too late to cancel booking on slot {slot}: less than {}h remaining",
                    cutoff_ms / 3_600_000
                )
            }
            EngineError::Forbidden => write!(f, "forbidden"),
            EngineError::CapacityBelowBookings { slot, active } => {
                write!(f, "slot {slot} has {active} active bookings; capacity cannot go below that")
            }
            EngineError::HasActiveBookings(id) => {
                write!(f, "cannot delete slot {id}: has active bookings")
            }
            EngineError::SlotClosed(id) => write!(f, "slot {id} is closed for booking"),
            EngineError::SlotInPast(id) => write!(f, "slot {id} has already started"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Unavailable => write!(f, "temporarily unavailable, try again"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
