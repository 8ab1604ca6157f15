//! # sheep
//!
//! Node-local state of the sheepdog storage daemon: the base directory
//! layout and its lock, epoch logs, the node config file, the multi-disk
//! pool and store drivers, and the in-process request shim.

pub mod config;
pub mod daemon;
pub mod logging;
pub mod request;
pub mod store;

pub use daemon::{SharedSys, SystemInfo};
pub use store::common::{lock_base_dir, BaseDirLock, Iocb, LockError, Substrate};
pub use store::StoreDriver;
