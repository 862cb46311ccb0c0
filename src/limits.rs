//! Hard caps that keep a single tenant from exhausting memory.

use crate::model::Minute;

pub const MIN_DURATION_MINUTES: Minute = 5;
pub const MAX_DURATION_MINUTES: Minute = 480;

/// Turnover time after a booking can't exceed a working day.
pub const MAX_BUFFER_MINUTES: Minute = 240;

pub const MAX_PROVIDERS_PER_TENANT: usize = 10_000;
pub const MAX_RULES_PER_PROVIDER: usize = 512;
pub const MAX_BOOKINGS_PER_PROVIDER_DAY: usize = 500;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 1_024;

/// Widest range a single slot request may scan.
pub const MAX_RANGE_DAYS: u32 = 92;

/// Providers a single chapter request may fan out to.
pub const MAX_CHAPTER_PROVIDERS: usize = 200;
pub const MAX_SLOTS_PER_DAY: usize = 288;
pub const MAX_NEXT_AVAILABLE: usize = 50;
