use serde::Deserialize;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Read-side filter for slot listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlotFilter {
    /// Keep slots starting at or after this instant.
    pub from: Option<Ms>,
    /// Keep slots starting before this instant.
    pub until: Option<Ms>,
    /// Keep only open slots with remaining capacity.
    #[serde(default)]
    pub available_only: bool,
}

impl Engine {
    /// List slots with availability computed from the ledger at read time.
    /// Read paths take plain read locks; they never serialize with each
    /// other, only with in-flight booking decisions on the same slot.
    pub async fn list_slots(&self, filter: &SlotFilter) -> Vec<SlotInfo> {
        let arcs: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for rs in arcs {
            let guard = rs.read().await;
            if let Some(from) = filter.from
                && guard.span.start < from
            {
                continue;
            }
            if let Some(until) = filter.until
                && guard.span.start >= until
            {
                continue;
            }
            if filter.available_only && !(guard.is_open && !guard.is_full()) {
                continue;
            }
            out.push(SlotInfo::from_state(&guard));
        }
        out.sort_by_key(|s| (s.start, s.id));
        out
    }

    pub async fn get_slot(&self, id: Ulid) -> Result<SlotInfo, EngineError> {
        let rs = self.get_slot_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(SlotInfo::from_state(&guard))
    }

    /// Remaining/is_full per slot, for polling displays. Recomputed from
    /// the ledger on every call — never a cached counter.
    pub async fn availability_snapshot(&self) -> Vec<AvailabilityEntry> {
        let arcs: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for rs in arcs {
            let guard = rs.read().await;
            out.push((
                guard.span.start,
                AvailabilityEntry {
                    slot_id: guard.id,
                    remaining: guard.remaining(),
                    is_full: guard.is_full(),
                },
            ));
        }
        out.sort_by_key(|(start, e)| (*start, e.slot_id));
        out.into_iter().map(|(_, e)| e).collect()
    }

    /// The candidate's active booking, if any.
    pub async fn active_booking_for(&self, candidate_id: Ulid) -> Option<BookingInfo> {
        let booking_id = *self.active_by_candidate.get(&candidate_id)?.value();
        let slot_id = self.slot_for_booking(&booking_id)?;
        let rs = self.get_slot_state(&slot_id)?;
        let guard = rs.read().await;
        guard
            .booking(booking_id)
            .filter(|b| b.is_active())
            .map(|b| BookingInfo::from_record(slot_id, b))
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<BookingInfo, EngineError> {
        let slot_id = self
            .slot_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let rs = self
            .get_slot_state(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = rs.read().await;
        guard
            .booking(booking_id)
            .map(|b| BookingInfo::from_record(slot_id, b))
            .ok_or(EngineError::NotFound(booking_id))
    }

    pub async fn bookings_for_slot(&self, slot_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let rs = self
            .get_slot_state(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = rs.read().await;
        Ok(guard
            .bookings
            .iter()
            .map(|b| BookingInfo::from_record(slot_id, b))
            .collect())
    }
}
