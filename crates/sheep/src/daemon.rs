//! Process-wide node settings.
//!
//! Built once at startup and then shared as an `Arc<SystemInfo>`. Only the
//! journal switch and the disk-space gauge change after that.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared daemon settings.
pub type SharedSys = Arc<SystemInfo>;

/// Default store driver name.
pub const DEFAULT_STORE: &str = "plain";

/// Node configuration and runtime flags.
#[derive(Debug)]
pub struct SystemInfo {
    /// Base directory for persistent data.
    pub dir: PathBuf,

    /// Gateway-only node: routes requests, stores nothing.
    pub gateway_only: bool,

    /// Open data objects with `O_DIRECT` when the I/O is sector-aligned.
    pub backend_dio: bool,

    /// Writes go through a journal, so object files skip sync flags.
    pub use_journal: AtomicBool,

    /// Skip sync flags on object writes.
    pub nosync: bool,

    /// Store driver name when none is recorded in the node config.
    pub store: String,

    /// Space the user asked to export, 0 if unspecified.
    pub user_space: u64,

    /// Bytes available for objects on this node.
    disk_space: AtomicU64,
}

impl SystemInfo {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            gateway_only: false,
            backend_dio: false,
            use_journal: AtomicBool::new(false),
            nosync: false,
            store: DEFAULT_STORE.to_string(),
            user_space: 0,
            disk_space: AtomicU64::new(0),
        }
    }

    pub fn into_shared(self) -> SharedSys {
        Arc::new(self)
    }

    pub fn use_journal(&self) -> bool {
        self.use_journal.load(Ordering::Acquire)
    }

    pub fn set_use_journal(&self, on: bool) {
        self.use_journal.store(on, Ordering::Release);
    }

    /// True when object writes must not carry `O_SYNC`/`O_DSYNC`.
    pub fn skip_sync(&self) -> bool {
        self.nosync || self.use_journal()
    }

    pub fn disk_space(&self) -> u64 {
        self.disk_space.load(Ordering::Acquire)
    }

    pub fn set_disk_space(&self, space: u64) {
        self.disk_space.store(space, Ordering::Release);
    }
}
