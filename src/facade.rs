use std::sync::Arc;

use serde::Serialize;
use tracing::{error, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, SlotFilter};
use crate::model::*;
use crate::notify::Mailer;

/// User-facing rejection reasons. These are expected business outcomes,
/// not failures — callers render them, they never retry them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    SlotFull,
    DuplicateBooking { existing: Ulid },
    AlreadyCancelled,
    TooLateToCancel { cutoff_ms: Ms },
    SlotClosed,
    SlotInPast,
    CapacityBelowBookings { active: u32 },
    HasActiveBookings,
    NotFound,
    Forbidden,
    Invalid { message: String },
}

/// Outcome of a booking or cancellation request at the facade boundary.
#[derive(Debug)]
pub enum BookingResult {
    Ok(BookingInfo),
    Rejected(Rejection),
    /// Transient: the slot lock stayed contended past the bounded retries.
    Unavailable,
    /// Internal failure; details are logged, nothing was committed.
    Failed,
}

/// Fold an engine error into the facade's result taxonomy.
pub fn classify(err: EngineError) -> BookingResult {
    match err {
        EngineError::SlotFull { .. } => BookingResult::Rejected(Rejection::SlotFull),
        EngineError::DuplicateBooking { existing, .. } => {
            BookingResult::Rejected(Rejection::DuplicateBooking { existing })
        }
        EngineError::AlreadyCancelled(_) => BookingResult::Rejected(Rejection::AlreadyCancelled),
        EngineError::TooLateToCancel { cutoff_ms, .. } => {
            BookingResult::Rejected(Rejection::TooLateToCancel { cutoff_ms })
        }
        EngineError::SlotClosed(_) => BookingResult::Rejected(Rejection::SlotClosed),
        EngineError::SlotInPast(_) => BookingResult::Rejected(Rejection::SlotInPast),
        EngineError::CapacityBelowBookings { active, .. } => {
            BookingResult::Rejected(Rejection::CapacityBelowBookings { active })
        }
        EngineError::HasActiveBookings(_) => {
            BookingResult::Rejected(Rejection::HasActiveBookings)
        }
        EngineError::NotFound(_) => BookingResult::Rejected(Rejection::NotFound),
        EngineError::AlreadyExists(_) => {
            BookingResult::Rejected(Rejection::Invalid { message: "id already used".into() })
        }
        EngineError::Forbidden => BookingResult::Rejected(Rejection::Forbidden),
        EngineError::LimitExceeded(msg) => {
            BookingResult::Rejected(Rejection::Invalid { message: msg.into() })
        }
        EngineError::Unavailable => BookingResult::Unavailable,
        EngineError::WalError(e) => {
            error!("booking commit failed: {e}");
            BookingResult::Failed
        }
    }
}

fn outcome_label(result: &BookingResult) -> &'static str {
    match result {
        BookingResult::Ok(_) => "ok",
        BookingResult::Rejected(_) => "rejected",
        BookingResult::Unavailable => "unavailable",
        BookingResult::Failed => "failed",
    }
}

/// The boundary the web layer talks to: arbiter outcomes folded into typed
/// results, confirmation mail fired after commit.
pub struct BookingFacade {
    engine: Arc<Engine>,
    mailer: Arc<dyn Mailer>,
}

impl BookingFacade {
    pub fn new(engine: Arc<Engine>, mailer: Arc<dyn Mailer>) -> Self {
        Self { engine, mailer }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn request_booking(&self, candidate_id: Ulid, slot_id: Ulid) -> BookingResult {
        let booking_id = Ulid::new();
        let result = match self.engine.book_slot(booking_id, slot_id, candidate_id).await {
            Ok(info) => {
                self.notify_after_commit(info.candidate_id, info.slot_id, Notice::Confirmed);
                BookingResult::Ok(info)
            }
            Err(e) => classify(e),
        };
        metrics::counter!(
            crate::observability::BOOKINGS_TOTAL,
            "outcome" => outcome_label(&result)
        )
        .increment(1);
        result
    }

    pub async fn request_cancellation(&self, booking_id: Ulid, actor: Actor) -> BookingResult {
        let result = match self.engine.cancel_booking(booking_id, actor).await {
            Ok(info) => {
                self.notify_after_commit(info.candidate_id, info.slot_id, Notice::Cancelled);
                BookingResult::Ok(info)
            }
            Err(e) => classify(e),
        };
        metrics::counter!(
            crate::observability::CANCELLATIONS_TOTAL,
            "outcome" => outcome_label(&result)
        )
        .increment(1);
        result
    }

    pub async fn availability_snapshot(&self) -> Vec<AvailabilityEntry> {
        self.engine.availability_snapshot().await
    }

    pub async fn list_slots(&self, filter: &SlotFilter) -> Vec<SlotInfo> {
        self.engine.list_slots(filter).await
    }

    pub async fn active_booking_for(&self, candidate_id: Ulid) -> Option<BookingInfo> {
        self.engine.active_booking_for(candidate_id).await
    }

    /// Fire-and-forget notification, on its own task so it can never sit
    /// inside the booking decision or delay the caller. Failures are
    /// logged and never retried.
    fn notify_after_commit(&self, candidate_id: Ulid, slot_id: Ulid, notice: Notice) {
        let engine = self.engine.clone();
        let mailer = self.mailer.clone();
        tokio::spawn(async move {
            let slot = match engine.get_slot(slot_id).await {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(%slot_id, "skipping notification, slot lookup failed: {e}");
                    return;
                }
            };
            let sent = match notice {
                Notice::Confirmed => mailer.booking_confirmed(candidate_id, &slot).await,
                Notice::Cancelled => mailer.booking_cancelled(candidate_id, &slot).await,
            };
            if let Err(e) = sent {
                warn!(%candidate_id, %slot_id, "notification failed: {e}");
            }
        });
    }
}

enum Notice {
    Confirmed,
    Cancelled,
}
