//! Hard caps that keep a single salon from exhausting the process.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_RESOURCES_PER_TENANT: usize = 1_000;
pub const MAX_SERVICES_PER_TENANT: usize = 1_000;
pub const MAX_APPOINTMENTS_PER_RESOURCE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REF_LEN: usize = 256;

/// Widest day range a single availability or timeline query may cover.
pub const MAX_QUERY_DAYS: i64 = 92;
/// Upper bound on slots returned from one search.
pub const MAX_SLOTS_PER_QUERY: usize = 2_000;
/// Candidates one suggestion search may score before it stops scanning.
pub const MAX_RANKING_SCAN: usize = 500_000;
pub const MAX_IN_CLAUSE_IDS: usize = 100;

/// How often a mutation re-resolves an appointment that moved under it.
pub const MAX_PLACEMENT_RETRIES: usize = 4;

/// Calendar years accepted for appointment starts and query days. Keeps
/// end-time and next-midnight arithmetic inside chrono's range.
pub const MIN_CALENDAR_YEAR: i32 = 1900;
pub const MAX_CALENDAR_YEAR: i32 = 9999;
