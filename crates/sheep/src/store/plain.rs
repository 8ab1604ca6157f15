//! Plain (flat) storage backend.
//!
//! Stores every object as one file directly in an md disk directory:
//!   `{disk}/{oid:016x}`
//!
//! New objects are written to `{oid:016x}.tmp` with `O_CREAT | O_EXCL` and
//! renamed into place, so a half-created object is never visible and two
//! concurrent creates of the same oid cannot both succeed.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use sheepdog_proto::error::{SdError, SdResult};
use sheepdog_proto::oid::ObjectId;
use tracing::{debug, error, info, warn};

use super::common::{self, EexistPolicy, Iocb, Substrate};
use super::md::MdManager;
use super::{StoreDriver, StoreId};
use crate::daemon::SharedSys;

/// Flat-directory storage backend.
pub struct PlainStore {
    sys: SharedSys,
    md: Arc<MdManager>,
}

impl PlainStore {
    pub fn new(sys: SharedSys, md: Arc<MdManager>) -> Self {
        Self { sys, md }
    }

    pub(super) fn build(sub: &Substrate) -> Arc<dyn StoreDriver> {
        Arc::new(Self::new(sub.sys().clone(), sub.md().clone()))
    }

    fn sderr(&self, path: &Path, oid: ObjectId, err: Errno) -> SdError {
        common::err_to_sderr(&self.md, path, oid, err, EexistPolicy::Retry)
    }

    fn open<B: AsRef<[u8]>>(&self, path: &Path, oid: ObjectId, iocb: &Iocb<B>, create: bool) -> SdResult<File> {
        let flags = common::prepare_flags(&self.sys, oid, iocb, create);
        common::open_object(path, flags).map_err(|e| self.sderr(path, oid, e))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

impl StoreDriver for PlainStore {
    fn id(&self) -> StoreId {
        StoreId::Plain
    }

    fn name(&self) -> &'static str {
        "plain"
    }

    fn init(&self) -> SdResult<()> {
        for disk in self.md.disks() {
            let entries = fs::read_dir(&disk.path).map_err(|e| {
                error!("failed to open {}: {}", disk.path.display(), e);
                SdError::Eio
            })?;
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    warn!("removing stale {}", path.display());
                    let _ = fs::remove_file(&path);
                }
            }
        }
        info!("plain store initialized on {} disk(s)", self.md.nr_disks());
        Ok(())
    }

    fn exist(&self, oid: ObjectId) -> bool {
        self.md.exist(oid)
    }

    fn create_and_write(&self, oid: ObjectId, iocb: &Iocb<&[u8]>) -> SdResult<()> {
        if self.md.exist(oid) {
            debug!("object {} already exists", oid);
            return Err(SdError::OidExist);
        }

        let path = self.md.placement(oid)?.obj_path(oid);
        let tmp = tmp_path(&path);
        let file = self.open(&tmp, oid, iocb, true)?;

        if let Err(e) = file.write_all_at(iocb.buf, iocb.offset) {
            let err = self.sderr(&tmp, oid, common::io_errno(&e));
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| {
            error!("failed to rename {}: {}", tmp.display(), e);
            let _ = fs::remove_file(&tmp);
            self.sderr(&path, oid, common::io_errno(&e))
        })?;
        debug!("created object {} at {}", oid, path.display());
        Ok(())
    }

    fn write(&self, oid: ObjectId, iocb: &Iocb<&[u8]>) -> SdResult<()> {
        let path = self.md.obj_path(oid)?;
        let file = self.open(&path, oid, iocb, false)?;
        file.write_all_at(iocb.buf, iocb.offset)
            .map_err(|e| self.sderr(&path, oid, common::io_errno(&e)))
    }

    fn read(&self, oid: ObjectId, iocb: &mut Iocb<&mut [u8]>) -> SdResult<()> {
        let path = self.md.obj_path(oid)?;
        let file = self.open(&path, oid, iocb, false)?;

        let mut done = 0;
        while done < iocb.buf.len() {
            match file.read_at(&mut iocb.buf[done..], iocb.offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.sderr(&path, oid, common::io_errno(&e))),
            }
        }
        iocb.buf[done..].fill(0);
        Ok(())
    }

    fn remove(&self, oid: ObjectId) -> SdResult<()> {
        let path = self.md.obj_path(oid)?;
        fs::remove_file(&path).map_err(|e| self.sderr(&path, oid, common::io_errno(&e)))
    }

    fn discard(&self, oid: ObjectId, start: u64, end: u64) -> SdResult<()> {
        let path = self.md.obj_path(oid)?;
        let file = common::open_object(&path, OFlag::O_RDWR).map_err(|e| self.sderr(&path, oid, e))?;
        common::discard(&file, start, end)
    }

    fn get_obj_list(&self) -> SdResult<Vec<ObjectId>> {
        let mut oids = Vec::new();
        for disk in self.md.disks() {
            let entries = fs::read_dir(&disk.path).map_err(|e| {
                error!("failed to read dir {}: {}", disk.path.display(), e);
                SdError::Eio
            })?;
            oids.extend(
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| common::filename_to_oid(e.file_name().to_str()?)),
            );
        }
        oids.sort();
        oids.dedup();
        debug!("found {} objects", oids.len());
        Ok(oids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::SystemInfo;

    fn store(dir: &Path) -> PlainStore {
        let md = Arc::new(MdManager::new());
        md.add_disk(dir.join("d0"), false).unwrap();
        md.add_disk(dir.join("d1"), false).unwrap();
        PlainStore::new(SystemInfo::new(dir).into_shared(), md)
    }

    #[test]
    fn test_create_read_write_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let oid = ObjectId::new(0x0000_002a_0000_0003);

        store.create_and_write(oid, &Iocb::new(&b"hello world"[..], 0)).unwrap();
        assert!(store.exist(oid));
        assert_eq!(
            store.create_and_write(oid, &Iocb::new(&b"again"[..], 0)),
            Err(SdError::OidExist)
        );

        store.write(oid, &Iocb::new(&b"WORLD"[..], 6)).unwrap();

        let mut buf = vec![0xAAu8; 16];
        store.read(oid, &mut Iocb::new(&mut buf[..], 0)).unwrap();
        assert_eq!(&buf[..11], b"hello WORLD");
        assert_eq!(&buf[11..], &[0u8; 5]);

        assert_eq!(store.get_obj_list().unwrap(), vec![oid]);
        store.remove(oid).unwrap();
        assert!(!store.exist(oid));
        assert_eq!(store.remove(oid), Err(SdError::NoObj));
    }

    #[test]
    fn test_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let oid = ObjectId::new(9);
        let mut buf = vec![0u8; 4];
        assert_eq!(store.read(oid, &mut Iocb::new(&mut buf[..], 0)), Err(SdError::NoObj));
        assert_eq!(store.write(oid, &Iocb::new(&b"x"[..], 0)), Err(SdError::NoObj));
    }

    #[test]
    fn test_create_race_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let oid = ObjectId::new(10);
        let path = store.md.placement(oid).unwrap().obj_path(oid);
        fs::write(tmp_path(&path), b"").unwrap();

        assert_eq!(
            store.create_and_write(oid, &Iocb::new(&b"x"[..], 0)),
            Err(SdError::NetworkError)
        );
        store.init().unwrap();
        store.create_and_write(oid, &Iocb::new(&b"x"[..], 0)).unwrap();
    }

    #[test]
    fn test_obj_list_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        for raw in [3u64, 1, 2] {
            store.create_and_write(ObjectId::new(raw), &Iocb::new(&b"x"[..], 0)).unwrap();
        }
        fs::write(dir.path().join("d0").join("README"), b"").unwrap();
        assert_eq!(
            store.get_obj_list().unwrap(),
            vec![ObjectId::new(1), ObjectId::new(2), ObjectId::new(3)]
        );
    }

    #[test]
    fn test_discard_keeps_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let oid = ObjectId::new(11);
        store.create_and_write(oid, &Iocb::new(&vec![1u8; 8192][..], 0)).unwrap();

        match store.discard(oid, 0, 4096) {
            Ok(()) | Err(SdError::NoSupport) => {}
            Err(e) => panic!("unexpected discard result {:?}", e),
        }
        let path = store.md.obj_path(oid).unwrap();
        assert_eq!(fs::metadata(path).unwrap().len(), 8192);
    }
}
