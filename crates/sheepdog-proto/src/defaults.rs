//! Tunable operational defaults for the sheepdog node.
//!
//! Protocol-level constants (wire format, object sizes) remain in
//! [`crate::constants`]. This module centralizes the timeouts, retry
//! counts and file modes the substrate applies.

// ─── Socket Timeouts ────────────────────────────────────────────────────────

/// Send timeout applied to peer sockets (seconds). Peers should drain
/// quickly, so this is short.
pub const POLL_TIMEOUT: u64 = 5;

/// Receive timeout applied to peer sockets (seconds). Longer than the send
/// timeout because the remote node may be busy with its own disk I/O.
pub const MAX_POLLTIME: u64 = 10;

/// Number of times a timed-out read or write is retried while the epoch
/// guard allows it.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

// ─── Keepalive ──────────────────────────────────────────────────────────────

/// Idle time before the first keepalive probe (seconds).
pub const KEEPALIVE_IDLE_SECS: u32 = 5;

/// Interval between keepalive probes (seconds).
pub const KEEPALIVE_INTERVAL_SECS: u32 = 1;

/// Unanswered probes before the peer is declared dead.
pub const KEEPALIVE_COUNT: u32 = 3;

// ─── File Modes ─────────────────────────────────────────────────────────────

/// Mode for directories created under the base directory.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Mode for files created under the base directory.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

// ─── Event Loop ─────────────────────────────────────────────────────────────

/// Maximum readiness events drained per `EventLoop::wait` call.
pub const DEFAULT_EVENT_BATCH: usize = 128;

/// Largest request payload a server accepts in one frame (64 MB).
pub const DEFAULT_MAX_PAYLOAD: usize = 64 << 20;
