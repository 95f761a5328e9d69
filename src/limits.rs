//! Hard caps applied at the engine and tenant boundaries.

use crate::model::Ms;

pub const DAY_MS: Ms = 86_400_000;

// 2000-01-01T00:00:00Z .. 2200-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Longest single stay accepted (~5 years).
pub const MAX_STAY_MS: Ms = 5 * 366 * DAY_MS;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_TEXT_LEN: usize = 8192;
pub const MAX_URL_LEN: usize = 2048;

pub const MAX_USERS_PER_TENANT: usize = 1_000_000;
pub const MAX_PROPERTIES_PER_TENANT: usize = 1_000_000;
pub const MAX_BOOKINGS_PER_PROPERTY: usize = 100_000;
pub const MAX_IMAGES_PER_PROPERTY: usize = 64;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
