use crate::model::{HOUR_MS, Ms};

pub const MAX_LOCATIONS: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_LOCATION: usize = 100_000;
pub const MAX_SERVICES_PER_LOCATION: usize = 1_000;
pub const MAX_REWARDS_PER_LOCATION: usize = 1_000;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;
pub const MAX_NOTES_LEN: usize = 4_096;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// No single appointment may occupy more than a week.
pub const MAX_APPOINTMENT_DURATION_MS: Ms = 7 * 24 * HOUR_MS;
/// Calendar and reporting queries cover at most a year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * HOUR_MS;
/// Catalog service durations are capped at one day.
pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;
