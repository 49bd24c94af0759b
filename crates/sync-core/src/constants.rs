//! Normative constants shared by relay and client.

/// Stored diffs kept per file; older rows are pruned after every insert.
pub const MAX_DIFF_HISTORY: usize = 100;

/// Debounce window for human-paced edits.
pub const DEBOUNCE_MS: u64 = 300;

/// Shortened debounce while an agent burst is active.
pub const AI_BURST_DEBOUNCE_MS: u64 = 100;

/// Inter-arrival gap below which consecutive writes count toward a burst.
pub const AI_BURST_THRESHOLD_MS: i64 = 50;

/// Consecutive rapid writes required to enter burst.
pub const AI_BURST_COUNT: usize = 3;

/// Silence after which burst classification reverts to human.
pub const AI_BURST_SILENCE_MS: i64 = 2_000;

/// Write timestamps retained by the burst detector.
pub const AI_BURST_WINDOW: usize = 20;

pub const RECONNECT_DELAY_MS: u64 = 2_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 50;

/// Relay-side absolute lock expiry.
pub const LOCK_EXPIRY_MS: i64 = 300_000;

/// Relay sweeper cadence for expired locks.
pub const LOCK_SWEEP_INTERVAL_MS: u64 = 30_000;

/// Client-side idle timer after which a held lock is released.
pub const LOCK_IDLE_RELEASE_MS: u64 = 30_000;

pub const DASHBOARD_UPDATE_INTERVAL_MS: u64 = 2_000;
pub const DASHBOARD_RECENT_DIFFS: usize = 30;
pub const DASHBOARD_RECENT_CONFLICTS: usize = 10;

/// Filesystem watcher stability window.
pub const WATCH_STABILITY_MS: u64 = 100;

/// Client gives up on a pending handshake after this long and reconnects.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Maximum wire payload; larger frames are dropped with a log entry.
pub const MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;

pub const DEFAULT_PORT: u16 = 3777;

/// Paths never watched or synchronized.
pub const DEFAULT_IGNORE: &[&str] = &[
    "**/node_modules/**",
    "**/.git/**",
    "**/dist/**",
    "**/*.db",
    "**/*.db-journal",
    "**/.DS_Store",
    "**/package-lock.json",
    "**/yarn.lock",
    "**/.partsync/**",
];
