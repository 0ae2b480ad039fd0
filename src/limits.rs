//! Hard bounds on inputs. Everything here is a rejection limit, not a tunable.

use crate::model::Ms;

pub const MAX_SLOTS: usize = 100_000;

/// Upper bound on a single slot's capacity.
pub const MAX_CAPACITY: u32 = 1_000;

pub const MAX_ROOM_LEN: usize = 200;

/// A slot longer than a day is a data-entry error.
pub const MAX_SLOT_DURATION_MS: Ms = 24 * 3_600_000;

/// Sanity window for timestamps: 2000-01-01 .. 2100-01-01 UTC.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Bounds for bulk series creation, matching the admin form limits.
pub const MAX_SERIES_SLOTS: usize = 500;
pub const MIN_SERIES_INTERVAL_MS: Ms = 5 * 60_000;
pub const MAX_SERIES_INTERVAL_MS: Ms = 480 * 60_000;
