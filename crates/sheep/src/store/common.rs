//! Node-local on-disk state shared by every store driver.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/
//!   lock        advisory exclusive lock, held for the process lifetime
//!   config      node config (see crate::config)
//!   obj/        object directory in single-disk mode
//!   epoch/      one file per epoch: <node record>* <timestamp u64>
//! ```
//!
//! The [`Substrate`] handle binds these paths once at startup and carries
//! the multi-disk pool and the selected store driver.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::statvfs::statvfs;
use nix::unistd::{self, AccessFlags, SysconfVar};
use sheepdog_proto::constants::{EPOCH_NAME_LEN, EPOCH_TIMESTAMP_LEN, SECTOR_SIZE};
use sheepdog_proto::defaults::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use sheepdog_proto::error::{SdError, SdResult};
use sheepdog_proto::node::{decode_nodes, encode_nodes, SdNode, SD_NODE_SIZE};
use sheepdog_proto::oid::ObjectId;
use tracing::{debug, error, info, warn};

use super::md::MdManager;
use super::StoreDriver;
use crate::config;
use crate::daemon::{SharedSys, SystemInfo};

const OBJ_DIR: &str = "obj";
const EPOCH_DIR: &str = "epoch";
const LOCK_NAME: &str = "lock";

/// Format an object ID as its file name.
pub fn oid_to_filename(oid: ObjectId) -> String {
    oid.to_string()
}

/// Parse an object file name; anything but 16 hex digits is rejected.
pub fn filename_to_oid(name: &str) -> Option<ObjectId> {
    name.parse().ok()
}

fn xmkdir(path: &Path) -> io::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DEFAULT_DIR_MODE)
        .create(path)
}

/// Write `data` to `path` so that readers see either the old file or the
/// complete new one.
///
/// The data goes to `<path>.tmp`, is fsynced, then renamed over `path`.
/// A leftover temporary from a crashed writer is replaced when
/// `force_create` is set; otherwise it fails the call.
pub fn atomic_create_and_write(path: &Path, data: &[u8], force_create: bool) -> SdResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let open = || {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(DEFAULT_FILE_MODE)
            .open(&tmp)
    };
    let mut file = match open() {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && force_create => {
            debug!("removing stale {}", tmp.display());
            let _ = fs::remove_file(&tmp);
            open()
        }
        res => res,
    }
    .map_err(|e| {
        error!("failed to open temporary file {}: {}", tmp.display(), e);
        SdError::Eio
    })?;

    let written = file.write_all(data).and_then(|_| file.sync_all());
    drop(file);
    if let Err(e) = written {
        error!("failed to write {}: {}", tmp.display(), e);
        let _ = fs::remove_file(&tmp);
        return Err(SdError::Eio);
    }

    fs::rename(&tmp, path).map_err(|e| {
        error!("failed to rename {} to {}: {}", tmp.display(), path.display(), e);
        let _ = fs::remove_file(&tmp);
        SdError::Eio
    })
}

// ─── Object I/O preamble ────────────────────────────────────────────────────

/// An object I/O request: the buffer, its position in the object and the
/// epoch it was issued in.
#[derive(Debug)]
pub struct Iocb<B> {
    pub epoch: u32,
    pub offset: u64,
    pub buf: B,
}

impl<B: AsRef<[u8]>> Iocb<B> {
    pub fn new(buf: B, offset: u64) -> Self {
        Self { epoch: 0, offset, buf }
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset and length are both multiples of [`SECTOR_SIZE`].
    pub fn is_aligned(&self) -> bool {
        self.offset % SECTOR_SIZE == 0 && self.len() as u64 % SECTOR_SIZE == 0
    }

    pub fn buf_is_page_aligned(&self) -> bool {
        self.buf.as_ref().as_ptr() as usize % page_size() == 0
    }
}

fn page_size() -> usize {
    unistd::sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map_or(4096, |v| v as usize)
}

/// Open flags for an object file.
///
/// # Panics
///
/// Direct I/O needs a page-aligned buffer. An eligible request with an
/// unaligned buffer is a caller bug and aborts rather than risk corrupting
/// the object.
pub fn prepare_flags<B: AsRef<[u8]>>(
    sys: &SystemInfo,
    oid: ObjectId,
    iocb: &Iocb<B>,
    create: bool,
) -> OFlag {
    let syncflag = if create { OFlag::O_SYNC } else { OFlag::O_DSYNC };
    let mut flags = OFlag::O_RDWR | syncflag;

    if sys.skip_sync() {
        flags.remove(syncflag);
    }

    if sys.backend_dio && oid.is_data_obj() && iocb.is_aligned() {
        if !iocb.buf_is_page_aligned() {
            panic!(
                "memory isn't aligned to pagesize {:p}, oid: {}",
                iocb.buf.as_ref().as_ptr(),
                oid
            );
        }
        flags |= OFlag::O_DIRECT;
    }

    if create {
        flags |= OFlag::O_CREAT | OFlag::O_EXCL;
    }
    flags
}

/// Open an object file with flags from [`prepare_flags`].
pub fn open_object(path: &Path, flags: OFlag) -> Result<File, Errno> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).mode(DEFAULT_FILE_MODE);
    if flags.contains(OFlag::O_CREAT | OFlag::O_EXCL) {
        opts.create_new(true);
    }
    let extra = flags - (OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL);
    opts.custom_flags(extra.bits());
    opts.open(path).map_err(|e| io_errno(&e))
}

/// The OS error number behind an I/O error, `EIO` if there is none.
pub fn io_errno(e: &io::Error) -> Errno {
    e.raw_os_error().map_or(Errno::EIO, Errno::from_raw)
}

// ─── Error mapping ──────────────────────────────────────────────────────────

/// How `EEXIST` is reported by [`err_to_sderr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EexistPolicy {
    /// A create raced with another one; let the gateway retry.
    #[default]
    Retry,
    /// The object is already there.
    Exists,
}

/// Map an OS error on an object file to a result code.
///
/// Failures that look like a broken disk are handed to the md pool, which
/// ejects the disk and decides the result.
pub fn err_to_sderr(
    md: &MdManager,
    path: &Path,
    oid: ObjectId,
    err: Errno,
    policy: EexistPolicy,
) -> SdError {
    let dir = path.parent().unwrap_or(path);

    debug!("{}", path.display());
    match err {
        Errno::ENOENT => {
            if fs::metadata(dir).is_err() {
                error!("{} corrupted", dir.display());
                return md.handle_eio(dir);
            }
            debug!("object {} not found locally", oid);
            SdError::NoObj
        }
        Errno::ENOSPC => {
            error!("diskfull, oid={}", oid);
            SdError::NoSpace
        }
        Errno::EEXIST if policy == EexistPolicy::Exists => {
            debug!("object {} already exists", oid);
            SdError::OidExist
        }
        Errno::EMFILE | Errno::ENFILE | Errno::EINTR | Errno::EAGAIN | Errno::EEXIST => {
            error!("{}, oid={}", err, oid);
            SdError::NetworkError
        }
        _ => {
            error!("oid={}, {}", oid, err);
            md.handle_eio(dir)
        }
    }
}

/// Release the blocks of `[start, end)` while keeping the file size.
pub fn discard<F: AsFd>(fd: &F, start: u64, end: u64) -> SdResult<()> {
    let len = end.checked_sub(start).ok_or(SdError::InvalidParms)?;
    // SAFETY: plain syscall on a borrowed, open descriptor.
    let ret = unsafe {
        libc::fallocate(
            fd.as_fd().as_raw_fd(),
            libc::FALLOC_FL_KEEP_SIZE | libc::FALLOC_FL_PUNCH_HOLE,
            start as libc::off_t,
            len as libc::off_t,
        )
    };
    if ret == 0 {
        return Ok(());
    }
    match Errno::last() {
        Errno::ENOSYS | Errno::EOPNOTSUPP => {
            info!("FALLOC_FL_PUNCH_HOLE is not supported on this filesystem");
            Err(SdError::NoSupport)
        }
        e => {
            error!("failed to discard object, {}", e);
            Err(SdError::Eio)
        }
    }
}

// ─── Disk space ─────────────────────────────────────────────────────────────

/// Space figures of one filesystem.
#[derive(Debug, Clone, Copy)]
pub struct DiskSpace {
    pub total: u64,
    pub free: u64,
    /// Bytes available to unprivileged writers.
    pub available: u64,
}

pub fn get_disk_space(path: &Path) -> SdResult<DiskSpace> {
    let stat = statvfs(path).map_err(|e| {
        debug!("get disk space of {} failed: {}", path.display(), e);
        SdError::Eio
    })?;

    let frsize = stat.fragment_size() as u64;
    Ok(DiskSpace {
        total: stat.blocks() as u64 * frsize,
        free: stat.blocks_free() as u64 * frsize,
        available: stat.blocks_available() as u64 * frsize,
    })
}

// ─── Base directory ─────────────────────────────────────────────────────────

/// Create the base directory if missing.
pub fn init_base_path(base: &Path) -> SdResult<()> {
    xmkdir(base).map_err(|e| {
        error!("cannot create the directory {} ({})", base.display(), e);
        SdError::Eio
    })
}

/// A directory that already holds `config` and `epoch` belongs to a node.
pub fn is_meta_store(path: &Path) -> bool {
    unistd::access(path.join("config").as_path(), AccessFlags::R_OK).is_ok()
        && unistd::access(path.join(EPOCH_DIR).as_path(), AccessFlags::R_OK).is_ok()
}

/// Why the base directory could not be locked.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another sheep daemon is using {}", .0.display())]
    Busy(PathBuf),
    #[error("permission denied on lock file {}", .0.display())]
    Permission(PathBuf),
    #[error("unable to get base dir lock on {} ({errno})", .path.display())]
    Os { path: PathBuf, errno: Errno },
}

impl From<LockError> for SdError {
    fn from(_: LockError) -> Self {
        SdError::SystemError
    }
}

/// Exclusive record lock on byte 0 of `<base>/lock`; released on drop or
/// exit.
///
/// The lock belongs to the open file description, so a second open of the
/// same file conflicts even inside one process.
pub struct BaseDirLock {
    path: PathBuf,
    _file: File,
}

impl BaseDirLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for BaseDirLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseDirLock").field("path", &self.path).finish()
    }
}

fn open_lock_error(path: &Path, errno: Errno) -> LockError {
    match errno {
        Errno::EACCES | Errno::EPERM => LockError::Permission(path.to_path_buf()),
        errno => LockError::Os { path: path.to_path_buf(), errno },
    }
}

fn take_lock_error(base: &Path, path: &Path, errno: Errno) -> LockError {
    match errno {
        // record-lock conflicts surface as either code
        Errno::EAGAIN | Errno::EACCES => LockError::Busy(base.to_path_buf()),
        errno => LockError::Os { path: path.to_path_buf(), errno },
    }
}

/// Take the base-directory lock without blocking.
pub fn lock_base_dir(base: &Path) -> Result<BaseDirLock, LockError> {
    let path = base.join(LOCK_NAME);

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(DEFAULT_FILE_MODE)
        .open(&path)
        .map_err(|e| {
            error!("failed to open lock file {} ({})", path.display(), e);
            open_lock_error(&path, io_errno(&e))
        })?;

    let region = libc::flock {
        l_type: libc::F_WRLCK as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 1,
        l_pid: 0,
    };
    match fcntl(file.as_raw_fd(), FcntlArg::F_OFD_SETLK(&region)) {
        Ok(_) => {
            debug!("locked {}", path.display());
            Ok(BaseDirLock { path, _file: file })
        }
        Err(errno) => {
            let err = take_lock_error(base, &path, errno);
            error!("{}", err);
            Err(err)
        }
    }
}

// ─── Substrate handle ───────────────────────────────────────────────────────

/// Paths, disk pool and store driver of this node.
pub struct Substrate {
    sys: SharedSys,
    obj_path: PathBuf,
    epoch_path: PathBuf,
    config_path: PathBuf,
    md: Arc<MdManager>,
    pub(super) store: OnceLock<Arc<dyn StoreDriver>>,
}

impl fmt::Debug for Substrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Substrate")
            .field("base", &self.sys.dir)
            .field("nr_disks", &self.md.nr_disks())
            .field("store", &self.store.get().map(|s| s.name()))
            .finish()
    }
}

impl Substrate {
    /// Bind the object, epoch and config paths under `sys.dir`.
    ///
    /// `disks` is the comma-separated disk argument. Its first field names
    /// the base directory itself and is skipped; every other field becomes
    /// an object disk. Without extra fields, `<base>/obj` is the only disk.
    /// A field that is already some node's meta store is refused with
    /// `NoStore` before any disk is plugged.
    pub fn init_global_pathnames(sys: SharedSys, disks: Option<&str>) -> SdResult<Self> {
        let base = sys.dir.clone();
        init_base_path(&base)?;

        let obj_path = base.join(OBJ_DIR);
        let md = Arc::new(MdManager::new());

        let extra: Vec<&str> = disks
            .unwrap_or_default()
            .split(',')
            .skip(1)
            .filter(|p| !p.is_empty())
            .collect();
        if let Some(p) = extra.iter().find(|p| is_meta_store(Path::new(p))) {
            error!("{} is meta-store, abort", p);
            return Err(SdError::NoStore);
        }

        if extra.is_empty() {
            if let Err(e) = md.add_disk(&obj_path, false) {
                warn!("failed to add {}: {}", obj_path.display(), e);
            }
        }
        for p in &extra {
            if let Err(e) = md.add_disk(p, false) {
                warn!("failed to add {}: {}", p, e);
            }
        }
        if md.nr_disks() == 0 {
            error!("There isn't any available disk!");
            return Err(SdError::Eio);
        }

        xmkdir(&obj_path).map_err(|e| {
            error!("cannot create {} ({})", obj_path.display(), e);
            SdError::Eio
        })?;

        let epoch_path = base.join(EPOCH_DIR);
        xmkdir(&epoch_path).map_err(|e| {
            error!("cannot create {} ({})", epoch_path.display(), e);
            SdError::Eio
        })?;

        let config_path = config::init_config_path(&base);

        Ok(Self {
            sys,
            obj_path,
            epoch_path,
            config_path,
            md,
            store: OnceLock::new(),
        })
    }

    pub fn sys(&self) -> &SharedSys {
        &self.sys
    }

    pub fn md(&self) -> &Arc<MdManager> {
        &self.md
    }

    pub fn base_path(&self) -> &Path {
        &self.sys.dir
    }

    pub fn obj_path(&self) -> &Path {
        &self.obj_path
    }

    pub fn epoch_path(&self) -> &Path {
        &self.epoch_path
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn epoch_file(&self, epoch: u32) -> PathBuf {
        self.epoch_path.join(format!("{:0width$}", epoch, width = EPOCH_NAME_LEN))
    }

    /// Publish the node list of `epoch`, stamped with the current time.
    pub fn update_epoch_log(&self, epoch: u32, nodes: &[SdNode]) -> SdResult<()> {
        debug!("update epoch: {}, {}", epoch, nodes.len());

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut buf = encode_nodes(nodes)?;
        buf.extend_from_slice(&now.to_ne_bytes());

        atomic_create_and_write(&self.epoch_file(epoch), &buf, true)
    }

    fn do_epoch_log_read(&self, epoch: u32, buf: &mut [u8]) -> SdResult<(usize, u64)> {
        let path = self.epoch_file(epoch);
        let mut file = File::open(&path).map_err(|e| {
            debug!("failed to open epoch {} log, {}", epoch, e);
            SdError::NoTag
        })?;
        let size = file.metadata().map_err(|e| {
            error!("failed to stat epoch {} log, {}", epoch, e);
            SdError::NoTag
        })?;

        let payload = match (size.len() as usize).checked_sub(EPOCH_TIMESTAMP_LEN) {
            Some(n) if n % SD_NODE_SIZE == 0 => n,
            _ => {
                error!("invalid epoch {} log", epoch);
                return Err(SdError::NoTag);
            }
        };
        if buf.len() < payload {
            return Err(SdError::BufferSmall);
        }

        let mut ts = [0u8; EPOCH_TIMESTAMP_LEN];
        file.read_exact(&mut buf[..payload])
            .and_then(|_| file.read_exact(&mut ts))
            .map_err(|e| {
                error!("failed to read epoch {} log, {}", epoch, e);
                SdError::NoTag
            })?;

        Ok((payload / SD_NODE_SIZE, u64::from_ne_bytes(ts)))
    }

    /// Read the raw node records of `epoch` into `buf`; returns the number
    /// of nodes. A missing or size-inconsistent log is `NoTag`.
    pub fn epoch_log_read(&self, epoch: u32, buf: &mut [u8]) -> SdResult<usize> {
        self.do_epoch_log_read(epoch, buf).map(|(nr, _)| nr)
    }

    /// Like [`epoch_log_read`](Self::epoch_log_read), also returning the
    /// creation timestamp.
    pub fn epoch_log_read_with_timestamp(&self, epoch: u32, buf: &mut [u8]) -> SdResult<(usize, u64)> {
        self.do_epoch_log_read(epoch, buf)
    }

    /// Decoded node list of `epoch`.
    pub fn epoch_log_nodes(&self, epoch: u32) -> SdResult<Vec<SdNode>> {
        let len = fs::metadata(self.epoch_file(epoch))
            .map(|m| m.len() as usize)
            .map_err(|_| SdError::NoTag)?;
        let mut buf = vec![0u8; len.saturating_sub(EPOCH_TIMESTAMP_LEN)];
        let nr = self.epoch_log_read(epoch, &mut buf)?;
        decode_nodes(&buf[..nr * SD_NODE_SIZE])
    }

    fn scan_epochs(&self) -> SdResult<Vec<(u32, PathBuf)>> {
        let entries = fs::read_dir(&self.epoch_path).map_err(|e| {
            error!("failed to get the latest epoch: {}", e);
            SdError::Eio
        })?;
        Ok(entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let epoch = parse_epoch_name(entry.file_name().to_str()?)?;
                Some((epoch, entry.path()))
            })
            .collect())
    }

    /// Highest epoch with a log file, 0 if there is none.
    ///
    /// An unreadable epoch directory is an error: without it the node
    /// cannot tell which state it is in.
    pub fn get_latest_epoch(&self) -> SdResult<u32> {
        Ok(self
            .scan_epochs()?
            .into_iter()
            .map(|(e, _)| e)
            .max()
            .unwrap_or(0))
    }

    /// Delete the logs of every epoch after `epoch`.
    pub fn remove_epoch_logs_after(&self, epoch: u32) -> SdResult<()> {
        for (e, path) in self.scan_epochs()? {
            if e <= epoch {
                continue;
            }
            warn!("removing stale epoch log: {}", e);
            fs::remove_file(&path).map_err(|err| {
                error!("failed to remove {}: {}", path.display(), err);
                SdError::Eio
            })?;
        }
        Ok(())
    }

    /// Settle the space this node exports.
    ///
    /// A restarted node keeps its recorded space. Otherwise the user's
    /// figure wins, then the md pool's free space, then the free space of
    /// the base filesystem. The result is recorded in the node config.
    pub fn init_disk_space(&self) -> SdResult<()> {
        if self.sys.gateway_only {
            return Ok(());
        }

        // md space must be refreshed even when it is not used
        let mds = self.md.init_space();

        let recorded = config::get_node_space(&self.config_path)?;
        let space = if recorded != 0 {
            self.sys.set_disk_space(recorded);
            debug!("disk free space is {}", recorded);
            return Ok(());
        } else if self.sys.user_space != 0 {
            self.sys.user_space
        } else if mds != 0 {
            mds
        } else {
            get_disk_space(self.base_path())?.available
        };

        self.sys.set_disk_space(space);
        debug!("disk free space is {}", space);
        config::set_node_space(&self.config_path, space)
    }
}

/// Epoch log names are exactly [`EPOCH_NAME_LEN`] decimal digits.
fn parse_epoch_name(name: &str) -> Option<u32> {
    if name.len() != EPOCH_NAME_LEN || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheepdog_proto::node::{DiskInfo, NodeId};
    use std::net::Ipv4Addr;

    fn substrate(dir: &Path) -> Substrate {
        let sys = SystemInfo::new(dir.join("base")).into_shared();
        Substrate::init_global_pathnames(sys, None).unwrap()
    }

    fn nodes(n: u8) -> Vec<SdNode> {
        (0..n)
            .map(|i| {
                let mut node = SdNode::new(NodeId::new(Ipv4Addr::new(10, 0, 0, i + 1), 7000));
                node.zone = i as u32;
                node.disks = vec![DiskInfo { disk_id: 1, disk_space: 1 << 30 }];
                node
            })
            .collect()
    }

    #[test]
    fn test_filename_to_oid() {
        let oid = ObjectId::new(0x8000_002a_0000_0000);
        assert_eq!(filename_to_oid(&oid_to_filename(oid)), Some(oid));
        assert_eq!(filename_to_oid("0000002a00000064.tmp"), None);
        assert_eq!(filename_to_oid("xyz"), None);
    }

    #[test]
    fn test_layout() {
        let dir = tempfile::tempdir().unwrap();
        let sub = substrate(dir.path());
        let base = dir.path().join("base");
        assert!(base.join("obj").is_dir());
        assert!(base.join("epoch").is_dir());
        assert_eq!(sub.config_path(), base.join("config"));
        assert_eq!(sub.md().nr_disks(), 1);
        assert_eq!(sub.md().disks()[0].path, base.join("obj"));
    }

    #[test]
    fn test_extra_disks() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let arg = format!(
            "{},{},{}",
            base.display(),
            dir.path().join("d1").display(),
            dir.path().join("d2").display()
        );
        let sys = SystemInfo::new(&base).into_shared();
        let sub = Substrate::init_global_pathnames(sys, Some(&arg)).unwrap();
        let paths: Vec<_> = sub.md().disks().into_iter().map(|d| d.path).collect();
        assert_eq!(paths, vec![dir.path().join("d1"), dir.path().join("d2")]);
    }

    #[test]
    fn test_epoch_log_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sub = substrate(dir.path());
        let list = nodes(3);

        sub.update_epoch_log(1, &list).unwrap();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();

        let mut buf = vec![0u8; 3 * SD_NODE_SIZE];
        let (nr, ts) = sub.epoch_log_read_with_timestamp(1, &mut buf).unwrap();
        assert_eq!(nr, 3);
        assert!(now.abs_diff(ts) <= 1);
        assert_eq!(decode_nodes(&buf).unwrap(), list);
        assert_eq!(sub.epoch_log_nodes(1).unwrap(), list);
        assert!(!sub.epoch_path().join("00000001.tmp").exists());
    }

    #[test]
    fn test_epoch_log_buffer_small() {
        let dir = tempfile::tempdir().unwrap();
        let sub = substrate(dir.path());
        sub.update_epoch_log(2, &nodes(2)).unwrap();

        let mut buf = vec![0u8; SD_NODE_SIZE];
        assert_eq!(sub.epoch_log_read(2, &mut buf), Err(SdError::BufferSmall));
        let mut buf = vec![0u8; 2 * SD_NODE_SIZE];
        assert_eq!(sub.epoch_log_read(2, &mut buf), Ok(2));
    }

    #[test]
    fn test_epoch_log_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let sub = substrate(dir.path());
        let mut buf = vec![0u8; 4 * SD_NODE_SIZE];
        assert_eq!(sub.epoch_log_read(9, &mut buf), Err(SdError::NoTag));

        fs::write(sub.epoch_path().join("00000003"), [0u8; 4]).unwrap();
        assert_eq!(sub.epoch_log_read(3, &mut buf), Err(SdError::NoTag));

        fs::write(sub.epoch_path().join("00000004"), vec![0u8; SD_NODE_SIZE + 3 + 8]).unwrap();
        assert_eq!(sub.epoch_log_read(4, &mut buf), Err(SdError::NoTag));

        // an empty node list is valid
        sub.update_epoch_log(5, &[]).unwrap();
        assert_eq!(sub.epoch_log_read(5, &mut buf), Ok(0));
    }

    #[test]
    fn test_latest_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let sub = substrate(dir.path());
        assert_eq!(sub.get_latest_epoch().unwrap(), 0);

        sub.update_epoch_log(3, &nodes(1)).unwrap();
        sub.update_epoch_log(12, &nodes(1)).unwrap();
        fs::write(sub.epoch_path().join("99"), b"").unwrap();
        fs::write(sub.epoch_path().join("000000099"), b"").unwrap();
        fs::write(sub.epoch_path().join("0000002x"), b"").unwrap();
        fs::write(sub.epoch_path().join("00000050.tmp"), b"").unwrap();
        assert_eq!(sub.get_latest_epoch().unwrap(), 12);
    }

    #[test]
    fn test_latest_epoch_unreadable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sub = substrate(dir.path());
        fs::remove_dir(sub.epoch_path()).unwrap();
        assert_eq!(sub.get_latest_epoch(), Err(SdError::Eio));
    }

    #[test]
    fn test_remove_epoch_logs_after() {
        let dir = tempfile::tempdir().unwrap();
        let sub = substrate(dir.path());
        for e in 1..=5 {
            sub.update_epoch_log(e, &nodes(1)).unwrap();
        }
        sub.remove_epoch_logs_after(2).unwrap();
        assert_eq!(sub.get_latest_epoch().unwrap(), 2);
        assert!(sub.epoch_log_nodes(1).is_ok());
        assert_eq!(sub.epoch_log_nodes(3), Err(SdError::NoTag));
    }

    #[test]
    fn test_atomic_write_replaces_stale_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(dir.path().join("file.tmp"), b"junk").unwrap();

        assert_eq!(atomic_create_and_write(&path, b"new", false), Err(SdError::Eio));
        atomic_create_and_write(&path, b"new", true).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(!dir.path().join("file.tmp").exists());
    }

    #[test]
    fn test_prepare_flags() {
        let mut sys = SystemInfo::new("/nonexistent");
        let data = ObjectId::new(0x0000_002a_0000_0001);
        let vdi = ObjectId::from_vid(0x2a);
        let buf = vec![0u8; 100];
        let iocb = Iocb::new(&buf[..], 0);

        assert_eq!(prepare_flags(&sys, data, &iocb, false), OFlag::O_RDWR | OFlag::O_DSYNC);
        assert_eq!(
            prepare_flags(&sys, data, &iocb, true),
            OFlag::O_RDWR | OFlag::O_SYNC | OFlag::O_CREAT | OFlag::O_EXCL
        );

        sys.nosync = true;
        assert_eq!(prepare_flags(&sys, data, &iocb, false), OFlag::O_RDWR);
        sys.nosync = false;
        sys.set_use_journal(true);
        assert_eq!(prepare_flags(&sys, data, &iocb, false), OFlag::O_RDWR);
        sys.set_use_journal(false);

        sys.backend_dio = true;
        // unaligned length: no direct I/O, no alignment check
        assert!(!prepare_flags(&sys, data, &iocb, false).contains(OFlag::O_DIRECT));

        let page = page_size();
        let backing = vec![0u8; 2 * page];
        let off = (page - backing.as_ptr() as usize % page) % page;
        let aligned = Iocb::new(&backing[off..off + 512], 1024);
        assert!(prepare_flags(&sys, data, &aligned, false).contains(OFlag::O_DIRECT));
        assert!(!prepare_flags(&sys, vdi, &aligned, false).contains(OFlag::O_DIRECT));
    }

    #[test]
    #[should_panic(expected = "aligned to pagesize")]
    fn test_prepare_flags_unaligned_buffer() {
        let mut sys = SystemInfo::new("/nonexistent");
        sys.backend_dio = true;
        let backing = vec![0u8; 4096 + 1];
        let iocb = Iocb::new(&backing[1..513], 0);
        prepare_flags(&sys, ObjectId::new(1), &iocb, false);
    }

    #[test]
    fn test_err_to_sderr() {
        let dir = tempfile::tempdir().unwrap();
        let md = MdManager::new();
        md.add_disk(dir.path().join("d1"), false).unwrap();
        md.add_disk(dir.path().join("d2"), false).unwrap();
        let oid = ObjectId::new(1);
        let obj = dir.path().join("d1").join(oid_to_filename(oid));
        let map = |e| err_to_sderr(&md, &obj, oid, e, EexistPolicy::Retry);

        assert_eq!(map(Errno::ENOENT), SdError::NoObj);
        assert_eq!(map(Errno::ENOSPC), SdError::NoSpace);
        for e in [Errno::EMFILE, Errno::ENFILE, Errno::EINTR, Errno::EAGAIN, Errno::EEXIST] {
            assert_eq!(map(e), SdError::NetworkError);
        }
        assert_eq!(
            err_to_sderr(&md, &obj, oid, Errno::EEXIST, EexistPolicy::Exists),
            SdError::OidExist
        );
        assert_eq!(md.nr_disks(), 2);

        // an unknown failure ejects the disk
        assert_eq!(map(Errno::EIO), SdError::NetworkError);
        assert_eq!(md.nr_disks(), 1);

        // a vanished directory is a broken disk too
        let gone = dir.path().join("d2").join("sub").join(oid_to_filename(oid));
        assert_eq!(
            err_to_sderr(&md, &gone, oid, Errno::ENOENT, EexistPolicy::Retry),
            SdError::Eio
        );
        assert_eq!(md.nr_disks(), 0);
    }

    #[test]
    fn test_discard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj");
        fs::write(&path, vec![0xffu8; 8192]).unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();

        match discard(&file, 0, 4096) {
            Ok(()) | Err(SdError::NoSupport) => {}
            Err(e) => panic!("unexpected discard result {:?}", e),
        }
        assert_eq!(fs::metadata(&path).unwrap().len(), 8192);
        assert_eq!(discard(&file, 10, 5), Err(SdError::InvalidParms));
    }

    #[test]
    fn test_init_disk_space() {
        let dir = tempfile::tempdir().unwrap();
        let sub = substrate(dir.path());
        sub.init_disk_space().unwrap();
        let space = sub.sys().disk_space();
        assert!(space > 0);
        assert_eq!(config::get_node_space(sub.config_path()).unwrap(), space);

        // a restart keeps the recorded space
        config::set_node_space(sub.config_path(), 12345).unwrap();
        sub.init_disk_space().unwrap();
        assert_eq!(sub.sys().disk_space(), 12345);
    }

    #[test]
    fn test_init_disk_space_user_and_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let mut sys = SystemInfo::new(dir.path().join("base"));
        sys.user_space = 1 << 20;
        let sub = Substrate::init_global_pathnames(sys.into_shared(), None).unwrap();
        sub.init_disk_space().unwrap();
        assert_eq!(sub.sys().disk_space(), 1 << 20);

        let mut sys = SystemInfo::new(dir.path().join("gw"));
        sys.gateway_only = true;
        let sub = Substrate::init_global_pathnames(sys.into_shared(), None).unwrap();
        sub.init_disk_space().unwrap();
        assert_eq!(sub.sys().disk_space(), 0);
        assert!(!sub.config_path().exists());
    }

    #[test]
    fn test_lock_conflicts_with_byte_zero_record_lock() {
        let dir = tempfile::tempdir().unwrap();
        let holder = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.path().join(LOCK_NAME))
            .unwrap();
        let region = libc::flock {
            l_type: libc::F_WRLCK as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: 0,
            l_len: 1,
            l_pid: 0,
        };
        fcntl(holder.as_raw_fd(), FcntlArg::F_OFD_SETLK(&region)).unwrap();

        assert!(matches!(lock_base_dir(dir.path()), Err(LockError::Busy(p)) if p == dir.path()));
        drop(holder);

        let lock = lock_base_dir(dir.path()).unwrap();
        assert_eq!(lock.path(), dir.path().join(LOCK_NAME));
    }

    #[test]
    fn test_lock_error_mapping() {
        let base = Path::new("/var/lib/sheep");
        let path = base.join(LOCK_NAME);

        for errno in [Errno::EACCES, Errno::EPERM] {
            assert!(matches!(open_lock_error(&path, errno), LockError::Permission(p) if p == path));
        }
        assert!(matches!(
            open_lock_error(&path, Errno::EROFS),
            LockError::Os { errno: Errno::EROFS, .. }
        ));

        for errno in [Errno::EWOULDBLOCK, Errno::EACCES] {
            assert!(matches!(take_lock_error(base, &path, errno), LockError::Busy(p) if p == base));
        }
        assert!(matches!(
            take_lock_error(base, &path, Errno::ENOLCK),
            LockError::Os { errno: Errno::ENOLCK, .. }
        ));
        assert!(take_lock_error(base, &path, Errno::EAGAIN)
            .to_string()
            .contains("/var/lib/sheep"));
    }
}
