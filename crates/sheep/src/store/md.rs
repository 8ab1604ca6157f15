//! Multi-disk (md) placement pool.
//!
//! Each disk is a directory that directly holds object files. Objects are
//! placed on a disk by hashing the oid over the current disk set; lookups
//! search every disk so objects stay reachable after the set changes.
//!
//! A disk that reports an I/O error is ejected from the pool. The caller
//! gets `NetworkError` while other disks remain, so the gateway retries
//! elsewhere, and `Eio` once the pool is empty.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use sheepdog_proto::defaults::DEFAULT_DIR_MODE;
use sheepdog_proto::error::{SdError, SdResult};
use sheepdog_proto::oid::ObjectId;
use tracing::{debug, error, info, warn};

use super::common;

/// A single object disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub disk_id: u64,
    /// Directory holding this disk's object files.
    pub path: PathBuf,
    /// Bytes available to unprivileged writers, as of the last refresh.
    pub space: u64,
}

impl DiskEntry {
    fn probe(disk_id: u64, path: PathBuf) -> SdResult<Self> {
        let space = common::get_disk_space(&path)?.available;
        Ok(Self { disk_id, path, space })
    }

    pub fn obj_path(&self, oid: ObjectId) -> PathBuf {
        self.path.join(common::oid_to_filename(oid))
    }
}

#[derive(Debug, Default)]
struct DiskTable {
    disks: Vec<DiskEntry>,
    next_id: u64,
}

/// Multi-disk manager.
#[derive(Debug, Default)]
pub struct MdManager {
    table: RwLock<DiskTable>,
    rebuild: AtomicBool,
}

impl MdManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, DiskTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DiskTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Plug a disk into the pool.
    ///
    /// The directory is created if missing. Re-adding a known path is a
    /// no-op. With `rebuild` set, objects must be redistributed; the flag
    /// is left for the recovery layer to consume with
    /// [`take_rebuild`](Self::take_rebuild).
    pub fn add_disk(&self, path: impl AsRef<Path>, rebuild: bool) -> SdResult<u64> {
        let path = path.as_ref().to_path_buf();

        fs::DirBuilder::new()
            .recursive(true)
            .mode(DEFAULT_DIR_MODE)
            .create(&path)
            .map_err(|e| {
                error!("md: failed to create {}: {}", path.display(), e);
                SdError::Eio
            })?;
        let mut entry = DiskEntry::probe(0, path)?;

        let mut table = self.write();
        if let Some(d) = table.disks.iter().find(|d| d.path == entry.path) {
            debug!("md: {} is already plugged as disk {}", entry.path.display(), d.disk_id);
            return Ok(d.disk_id);
        }
        table.next_id += 1;
        entry.disk_id = table.next_id;
        info!(
            "md: added disk {} at {} (space={})",
            entry.disk_id,
            entry.path.display(),
            entry.space
        );
        let disk_id = entry.disk_id;
        table.disks.push(entry);
        drop(table);

        if rebuild {
            self.rebuild.store(true, Ordering::Release);
        }
        Ok(disk_id)
    }

    pub fn nr_disks(&self) -> usize {
        self.read().disks.len()
    }

    pub fn disks(&self) -> Vec<DiskEntry> {
        self.read().disks.clone()
    }

    /// Refresh every disk's free space and return the sum.
    pub fn init_space(&self) -> u64 {
        let mut table = self.write();
        for disk in table.disks.iter_mut() {
            match common::get_disk_space(&disk.path) {
                Ok(space) => disk.space = space.available,
                Err(e) => warn!("md: failed to refresh space of {}: {}", disk.path.display(), e),
            }
        }
        table.disks.iter().map(|d| d.space).sum()
    }

    /// True once, after a disk was added with the rebuild flag.
    pub fn take_rebuild(&self) -> bool {
        self.rebuild.swap(false, Ordering::AcqRel)
    }

    /// Eject the disk owning `path` after an I/O failure.
    pub fn handle_eio(&self, path: &Path) -> SdError {
        let mut table = self.write();
        let Some(pos) = table.disks.iter().position(|d| path.starts_with(&d.path)) else {
            error!("md: {} is not on any object disk", path.display());
            return SdError::Eio;
        };

        let disk = table.disks.remove(pos);
        error!("md: unplugged broken disk {} at {}", disk.disk_id, disk.path.display());
        if table.disks.is_empty() {
            error!("md: no disk left");
            return SdError::Eio;
        }
        drop(table);
        self.rebuild.store(true, Ordering::Release);
        SdError::NetworkError
    }

    /// Disk an object with this oid is placed on.
    pub fn placement(&self, oid: ObjectId) -> SdResult<DiskEntry> {
        let table = self.read();
        if table.disks.is_empty() {
            return Err(SdError::NoSpace);
        }
        let h = oid.raw().wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
        Ok(table.disks[(h % table.disks.len() as u64) as usize].clone())
    }

    /// Path of the object file: where it already exists, else where it
    /// would be placed.
    pub fn obj_path(&self, oid: ObjectId) -> SdResult<PathBuf> {
        let found = self
            .read()
            .disks
            .iter()
            .map(|d| d.obj_path(oid))
            .find(|p| p.exists());
        match found {
            Some(p) => Ok(p),
            None => Ok(self.placement(oid)?.obj_path(oid)),
        }
    }

    pub fn exist(&self, oid: ObjectId) -> bool {
        self.read().disks.iter().any(|d| d.obj_path(oid).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_disk() {
        let dir = tempfile::tempdir().unwrap();
        let md = MdManager::new();
        let id = md.add_disk(dir.path().join("d1"), false).unwrap();
        assert_eq!(id, 1);
        assert!(dir.path().join("d1").is_dir());
        assert_eq!(md.add_disk(dir.path().join("d1"), false).unwrap(), 1);
        assert_eq!(md.nr_disks(), 1);
        assert!(md.init_space() > 0);
        assert!(!md.take_rebuild());
    }

    #[test]
    fn test_concurrent_add_same_disk() {
        let dir = tempfile::tempdir().unwrap();
        let md = std::sync::Arc::new(MdManager::new());
        let path = dir.path().join("d1");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let md = md.clone();
                let path = path.clone();
                std::thread::spawn(move || md.add_disk(&path, false).unwrap())
            })
            .collect();
        let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(md.nr_disks(), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[test]
    fn test_failed_add_keeps_ids() {
        let dir = tempfile::tempdir().unwrap();
        let md = MdManager::new();
        fs::write(dir.path().join("file"), b"").unwrap();

        assert_eq!(md.add_disk(dir.path().join("file").join("d0"), false), Err(SdError::Eio));
        assert_eq!(md.add_disk(dir.path().join("d1"), false).unwrap(), 1);
    }

    #[test]
    fn test_rebuild_flag() {
        let dir = tempfile::tempdir().unwrap();
        let md = MdManager::new();
        md.add_disk(dir.path().join("d1"), true).unwrap();
        assert!(md.take_rebuild());
        assert!(!md.take_rebuild());
    }

    #[test]
    fn test_handle_eio_ejects_disk() {
        let dir = tempfile::tempdir().unwrap();
        let md = MdManager::new();
        md.add_disk(dir.path().join("d1"), false).unwrap();
        md.add_disk(dir.path().join("d2"), false).unwrap();

        let broken = dir.path().join("d1").join("0000000000000001");
        assert_eq!(md.handle_eio(&broken), SdError::NetworkError);
        assert_eq!(md.nr_disks(), 1);
        assert_eq!(md.disks()[0].path, dir.path().join("d2"));

        assert_eq!(md.handle_eio(&dir.path().join("d2")), SdError::Eio);
        assert_eq!(md.nr_disks(), 0);
        assert_eq!(md.handle_eio(&dir.path().join("elsewhere")), SdError::Eio);
    }

    #[test]
    fn test_placement_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let md = MdManager::new();
        assert_eq!(md.placement(ObjectId::new(1)), Err(SdError::NoSpace));

        for i in 0..3 {
            md.add_disk(dir.path().join(format!("d{}", i)), false).unwrap();
        }
        let oid = ObjectId::new(0x0000_002a_0000_0064);
        let a = md.placement(oid).unwrap();
        assert_eq!(md.placement(oid).unwrap(), a);
        assert_eq!(md.obj_path(oid).unwrap(), a.obj_path(oid));
        assert!(!md.exist(oid));
    }

    #[test]
    fn test_obj_path_finds_existing() {
        let dir = tempfile::tempdir().unwrap();
        let md = MdManager::new();
        md.add_disk(dir.path().join("d0"), false).unwrap();
        md.add_disk(dir.path().join("d1"), false).unwrap();

        let oid = ObjectId::new(77);
        let placed = md.placement(oid).unwrap();
        let other = md.disks().into_iter().find(|d| *d != placed).unwrap();
        fs::write(other.obj_path(oid), b"x").unwrap();

        assert!(md.exist(oid));
        assert_eq!(md.obj_path(oid).unwrap(), other.obj_path(oid));
    }
}
