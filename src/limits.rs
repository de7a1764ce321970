/// Max resources held by one engine.
pub const MAX_RESOURCES: usize = 10_000;

/// Max availability rules per resource.
pub const MAX_RULES_PER_RESOURCE: usize = 256;

/// Max reservations (canceled included) kept per resource.
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;

pub const MAX_ACTOR_LEN: usize = 256;

pub const MAX_REASON_LEN: usize = 1024;

/// Widest range a calendar or reservation query may cover.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;

/// Longest single reservation accepted, regardless of resource policy.
pub const MAX_RESERVATION_DAYS: i64 = 31;
