/// Percentage of a video's duration at or above which it counts as watched.
pub const COMPLETION_THRESHOLD_PCT: f64 = 90.0;

/// Minimum interval between two unforced progress writes for one video.
pub const DEFAULT_PROGRESS_DEBOUNCE_SECS: u64 = 5;

/// Lifetime of a course metadata cache entry.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Upper bound for one currency unlock transaction.
pub const DEFAULT_UNLOCK_TIMEOUT_SECS: u64 = 5;

/// Capacity of the per-course sync broadcast channel.
pub const DEFAULT_SYNC_CHANNEL_CAPACITY: usize = 64;

/// Default skip-unlock costs per course tier, in coins.
pub const DEFAULT_COST_BEGINNER: u64 = 100;
pub const DEFAULT_COST_INTERMEDIATE: u64 = 200;
pub const DEFAULT_COST_ADVANCED: u64 = 300;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
