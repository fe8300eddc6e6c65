use crate::model::Ms;

pub const MAX_FACILITIES: usize = 10_000;
pub const MAX_SERVICES_PER_FACILITY: usize = 1_000;
pub const MAX_CUSTOMERS_PER_FACILITY: usize = 1_000_000;
pub const MAX_BOOKINGS_PER_FACILITY: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_NOTES_LEN: usize = 4_096;
pub const MAX_CATEGORY_LEN: usize = 128;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// One week.
pub const MAX_SERVICE_DURATION_MIN: u32 = 7 * 24 * 60;
pub const MIN_SLOT_MINUTES: u32 = 5;
pub const MAX_SLOT_MINUTES: u32 = 24 * 60;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
