//! Node configuration persistence.
//!
//! `base/config` holds the per-node settings that must survive a restart:
//! the store driver this node was formatted with and the space it exports.
//! A missing file means the node was never formatted and yields defaults.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sheepdog_proto::constants::STORE_LEN;
use sheepdog_proto::error::{SdError, SdResult};
use tracing::{debug, error};

use crate::store::common::atomic_create_and_write;

/// On-disk layout version of [`NodeConfig`].
pub const SD_FORMAT_VERSION: u16 = 0x0002;

const CONFIG_NAME: &str = "config";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub version: u16,
    /// Store driver name, empty until the node is formatted.
    pub store: String,
    /// Exported space in bytes, 0 until computed.
    pub space: u64,
    /// Cluster creation time (seconds since the epoch).
    pub ctime: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            version: SD_FORMAT_VERSION,
            store: String::new(),
            space: 0,
            ctime: 0,
        }
    }
}

/// Compute the config path under `base`.
pub fn init_config_path(base: &Path) -> PathBuf {
    base.join(CONFIG_NAME)
}

/// Load the node config, or defaults if the file does not exist yet.
pub fn load_config(path: &Path) -> SdResult<NodeConfig> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("no config at {}, using defaults", path.display());
            return Ok(NodeConfig::default());
        }
        Err(e) => {
            error!("failed to read config from {}: {}", path.display(), e);
            return Err(SdError::Eio);
        }
    };

    let config: NodeConfig = bincode::deserialize(&data).map_err(|e| {
        error!("corrupt config file {}: {}", path.display(), e);
        SdError::SystemError
    })?;
    if config.version != SD_FORMAT_VERSION {
        error!(
            "config {} has format version {:#06x}, expected {:#06x}",
            path.display(),
            config.version,
            SD_FORMAT_VERSION
        );
        return Err(SdError::SystemError);
    }
    Ok(config)
}

/// Persist the node config atomically.
pub fn save_config(path: &Path, config: &NodeConfig) -> SdResult<()> {
    let data = bincode::serialize(config).map_err(|_| SdError::SystemError)?;
    atomic_create_and_write(path, &data, true)?;
    debug!("saved config: store={:?}, space={}", config.store, config.space);
    Ok(())
}

pub fn get_node_space(path: &Path) -> SdResult<u64> {
    Ok(load_config(path)?.space)
}

pub fn set_node_space(path: &Path, space: u64) -> SdResult<()> {
    let mut config = load_config(path)?;
    config.space = space;
    save_config(path, &config)
}

pub fn get_store_name(path: &Path) -> SdResult<String> {
    Ok(load_config(path)?.store)
}

/// Record the store driver name. Names must leave room for the on-disk
/// terminator, i.e. be shorter than [`STORE_LEN`].
pub fn set_store_name(path: &Path, name: &str) -> SdResult<()> {
    if name.len() >= STORE_LEN {
        error!("store name {:?} is too long", name);
        return Err(SdError::InvalidParms);
    }
    let mut config = load_config(path)?;
    config.store = name.to_string();
    save_config(path, &config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_config_path(dir.path());
        assert_eq!(load_config(&path).unwrap(), NodeConfig::default());
        assert_eq!(get_node_space(&path).unwrap(), 0);
        assert_eq!(get_store_name(&path).unwrap(), "");
    }

    #[test]
    fn test_set_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_config_path(dir.path());

        set_node_space(&path, 1 << 30).unwrap();
        set_store_name(&path, "plain").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.space, 1 << 30);
        assert_eq!(config.store, "plain");
        assert_eq!(get_node_space(&path).unwrap(), 1 << 30);
    }

    #[test]
    fn test_store_name_too_long() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_config_path(dir.path());
        assert_eq!(
            set_store_name(&path, "a-very-long-store-name"),
            Err(SdError::InvalidParms)
        );
    }

    #[test]
    fn test_corrupt_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_config_path(dir.path());
        fs::write(&path, b"\x01").unwrap();
        assert_eq!(load_config(&path), Err(SdError::SystemError));
    }

    #[test]
    fn test_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_config_path(dir.path());
        let config = NodeConfig {
            version: 1,
            ..NodeConfig::default()
        };
        fs::write(&path, bincode::serialize(&config).unwrap()).unwrap();
        assert_eq!(load_config(&path), Err(SdError::SystemError));
    }
}
