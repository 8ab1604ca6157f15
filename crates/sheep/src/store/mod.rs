//! Storage backend abstraction layer.
//!
//! The `StoreDriver` trait defines the interface every backend implements.
//! Backends keep objects as files on the md disks and go through
//! [`common::prepare_flags`] and [`common::err_to_sderr`] for every open
//! and every OS failure.
//!
//! Available backends:
//! - **plain**: flat layout `{disk}/{oid:016x}`

use std::sync::Arc;

use sheepdog_proto::constants::STORE_LEN;
use sheepdog_proto::error::{SdError, SdResult};
use sheepdog_proto::oid::ObjectId;
use tracing::{debug, info};

use crate::config;
use common::{Iocb, Substrate};

pub mod common;
pub mod md;
pub mod plain;

/// Identity of a store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreId {
    Plain,
}

/// Trait that all storage backends must implement.
///
/// Calls are synchronous; they run on the caller's worker thread.
pub trait StoreDriver: Send + Sync {
    fn id(&self) -> StoreId;

    /// Human-readable name, as recorded in the node config.
    fn name(&self) -> &'static str;

    /// Prepare the backend on this node's disks.
    fn init(&self) -> SdResult<()>;

    fn exist(&self, oid: ObjectId) -> bool;

    /// Create an object and write its initial data.
    ///
    /// Returns `SdError::OidExist` if the object already exists.
    fn create_and_write(&self, oid: ObjectId, iocb: &Iocb<&[u8]>) -> SdResult<()>;

    /// Write into an existing object.
    fn write(&self, oid: ObjectId, iocb: &Iocb<&[u8]>) -> SdResult<()>;

    /// Fill `iocb.buf` from the object; bytes past its end read as zero.
    fn read(&self, oid: ObjectId, iocb: &mut Iocb<&mut [u8]>) -> SdResult<()>;

    fn remove(&self, oid: ObjectId) -> SdResult<()>;

    /// Release the storage behind `[start, end)` of an object.
    fn discard(&self, oid: ObjectId, start: u64, end: u64) -> SdResult<()>;

    /// All object IDs held on this node.
    fn get_obj_list(&self) -> SdResult<Vec<ObjectId>>;
}

/// A registered backend.
pub struct StoreDriverEntry {
    pub id: StoreId,
    pub name: &'static str,
    build: fn(&Substrate) -> Arc<dyn StoreDriver>,
}

static STORE_DRIVERS: &[StoreDriverEntry] = &[StoreDriverEntry {
    id: StoreId::Plain,
    name: "plain",
    build: plain::PlainStore::build,
}];

/// Look up a backend by name.
pub fn find_store_driver(name: &str) -> Option<&'static StoreDriverEntry> {
    STORE_DRIVERS.iter().find(|d| d.name == name)
}

/// List all available store driver names.
pub fn available_drivers() -> Vec<&'static str> {
    STORE_DRIVERS.iter().map(|d| d.name).collect()
}

impl Substrate {
    /// Select the store driver and, unless this node is a gateway,
    /// initialize it.
    ///
    /// The name recorded in the node config wins over the daemon default.
    /// No name at all means the node never joined a cluster; nothing is
    /// selected. An unknown or over-long name is `NoStore`.
    pub fn init_store_driver(&self, is_gateway: bool) -> SdResult<()> {
        let recorded = config::get_store_name(self.config_path())?;
        let name = if recorded.is_empty() {
            self.sys().store.clone()
        } else {
            recorded
        };

        if name.len() >= STORE_LEN {
            debug!("store name not NUL terminated");
            return Err(SdError::NoStore);
        }
        if name.is_empty() {
            return Ok(());
        }

        let entry = find_store_driver(&name).ok_or_else(|| {
            debug!("store {} not found", name);
            SdError::NoStore
        })?;
        let driver = self.store.get_or_init(|| (entry.build)(self));
        if driver.id() != entry.id {
            debug!("store {} already selected", driver.name());
            return Err(SdError::NoStore);
        }

        if is_gateway {
            return Ok(());
        }
        driver.init()?;
        info!("store driver {} is ready", driver.name());
        Ok(())
    }

    /// The selected store driver.
    pub fn store(&self) -> SdResult<&Arc<dyn StoreDriver>> {
        self.store.get().ok_or(SdError::NoStore)
    }

    pub fn store_id_match(&self, id: StoreId) -> bool {
        self.store.get().is_some_and(|s| s.id() == id)
    }
}
