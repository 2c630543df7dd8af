//! Path-addressed passthrough operations over the backing directory.
//!
//! Everything except `read` is delegated straight to the backing store. How
//! `read` is served depends on the mount [`Mode`]: in capture mode the live
//! bytes are returned and persisted, in replay mode the persisted bytes are
//! returned and the backing file is never touched.

use std::collections::{BTreeSet, HashMap};
use std::ffi::OsString;
use std::fs::{self, DirBuilder, File, Metadata, OpenOptions, Permissions};
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use nix::fcntl::AT_FDCWD;
use nix::sys::stat::{mknod, utimensat, Mode as PermMode, SFlag, UtimensatFlags};
use nix::sys::statvfs::{statvfs, Statvfs};
use nix::sys::time::TimeSpec;
use nix::unistd::{access, chown, AccessFlags, Gid, Uid};

use crate::config::{Mode, MountConfig};
use crate::error::{OpError, OpResult};
use crate::resolve::PathResolver;
use crate::store::{SectorKey, SectorStore};

/// New value for a file timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    Now,
    At(SystemTime),
}

impl SetTime {
    fn to_timespec(time: Option<SetTime>) -> TimeSpec {
        match time {
            Some(SetTime::At(at)) => match at.duration_since(UNIX_EPOCH) {
                Ok(after) => TimeSpec::new(after.as_secs() as _, after.subsec_nanos() as _),
                // before the epoch: negative seconds, nanoseconds kept in [0, 1e9)
                Err(e) => {
                    let before = e.duration();
                    let mut secs = -(before.as_secs() as i64);
                    let mut nanos = before.subsec_nanos() as i64;
                    if nanos > 0 {
                        secs -= 1;
                        nanos = 1_000_000_000 - nanos;
                    }
                    TimeSpec::new(secs as _, nanos as _)
                }
            },
            Some(SetTime::Now) => TimeSpec::UTIME_NOW,
            None => TimeSpec::UTIME_OMIT,
        }
    }
}

/// An open backing file; dropping it closes the descriptor
struct OpenFile {
    file: File,
    path: PathBuf,
}

pub struct Passthrough {
    config: Arc<MountConfig>,
    resolver: PathResolver,
    store: SectorStore,
    handles: HashMap<u64, OpenFile>,
    next_fh: u64,
    /// Keys captured during this mount, to spot writes over them
    captured: BTreeSet<SectorKey>,
}

impl Passthrough {
    pub fn new(config: Arc<MountConfig>) -> Self {
        let resolver = PathResolver::new(&config.root);
        let store = SectorStore::new(&config.datadir);
        Self {
            config,
            resolver,
            store,
            handles: HashMap::new(),
            next_fh: 1,
            captured: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn full_path(&self, path: &Path) -> PathBuf {
        self.resolver.resolve(path)
    }

    fn handle(&self, fh: u64) -> OpResult<&OpenFile> {
        self.handles.get(&fh).ok_or(OpError::BadHandle(fh))
    }

    fn insert_handle(&mut self, file: File, path: PathBuf) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, OpenFile { file, path });
        fh
    }

    // Metadata
    // ========

    pub fn getattr(&self, path: &Path) -> OpResult<Metadata> {
        Ok(fs::symlink_metadata(self.full_path(path))?)
    }

    /// Entry names of a directory, starting with `.` and `..`
    pub fn readdir(&self, path: &Path) -> OpResult<Vec<OsString>> {
        let full_path = self.full_path(path);
        let mut entries = vec![OsString::from("."), OsString::from("..")];
        if full_path.is_dir() {
            for entry in fs::read_dir(&full_path)? {
                entries.push(entry?.file_name());
            }
        }
        Ok(entries)
    }

    /// Link target, with absolute targets made relative to the backing root
    pub fn readlink(&self, path: &Path) -> OpResult<PathBuf> {
        let target = fs::read_link(self.full_path(path))?;
        Ok(self.resolver.relativize(&target))
    }

    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> OpResult<()> {
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = PermMode::from_bits_truncate(mode & 0o7777);
        mknod(&self.full_path(path), kind, perm, rdev as libc::dev_t)?;
        Ok(())
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> OpResult<()> {
        DirBuilder::new().mode(mode).create(self.full_path(path))?;
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> OpResult<()> {
        fs::remove_dir(self.full_path(path))?;
        Ok(())
    }

    pub fn unlink(&self, path: &Path) -> OpResult<()> {
        fs::remove_file(self.full_path(path))?;
        Ok(())
    }

    /// Create a symlink at `path` pointing at `target`, which is stored verbatim
    pub fn symlink(&self, path: &Path, target: &Path) -> OpResult<()> {
        std::os::unix::fs::symlink(target, self.full_path(path))?;
        Ok(())
    }

    pub fn rename(&self, old: &Path, new: &Path) -> OpResult<()> {
        fs::rename(self.full_path(old), self.full_path(new))?;
        Ok(())
    }

    /// Hard-link the existing `path` as `new_path`
    pub fn link(&self, path: &Path, new_path: &Path) -> OpResult<()> {
        fs::hard_link(self.full_path(path), self.full_path(new_path))?;
        Ok(())
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> OpResult<()> {
        fs::set_permissions(self.full_path(path), Permissions::from_mode(mode))?;
        Ok(())
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> OpResult<()> {
        chown(
            &self.full_path(path),
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
        )?;
        Ok(())
    }

    pub fn truncate(&self, path: &Path, length: u64) -> OpResult<()> {
        let file = OpenOptions::new().write(true).open(self.full_path(path))?;
        file.set_len(length)?;
        Ok(())
    }

    pub fn utimens(&self, path: &Path, atime: Option<SetTime>, mtime: Option<SetTime>) -> OpResult<()> {
        utimensat(
            AT_FDCWD,
            &self.full_path(path),
            &SetTime::to_timespec(atime),
            &SetTime::to_timespec(mtime),
            UtimensatFlags::FollowSymlink,
        )?;
        Ok(())
    }

    pub fn statfs(&self, path: &Path) -> OpResult<Statvfs> {
        Ok(statvfs(&self.full_path(path))?)
    }

    /// Fails with `EACCES` whenever the backing path denies `mask`
    pub fn access(&self, path: &Path, mask: i32) -> OpResult<()> {
        access(&self.full_path(path), AccessFlags::from_bits_truncate(mask))
            .map_err(|_| OpError::from(nix::Error::EACCES))
    }

    // File handles
    // ============

    pub fn open(&mut self, path: &Path, flags: i32) -> OpResult<u64> {
        let full_path = self.full_path(path);
        let file = open_options(flags).open(&full_path)?;
        let fh = self.insert_handle(file, full_path);
        debug!("open {} flags=0x{:x} fh={}", path.display(), flags, fh);
        Ok(fh)
    }

    /// Create (or open, if it exists) `path` for writing
    pub fn create(&mut self, path: &Path, mode: u32, flags: i32) -> OpResult<u64> {
        let full_path = self.full_path(path);
        let mut options = open_options(flags);
        options.write(true).create(true).mode(mode);
        let file = options.open(&full_path)?;
        let fh = self.insert_handle(file, full_path);
        debug!("create {} mode=0o{:o} fh={}", path.display(), mode, fh);
        Ok(fh)
    }

    /// Serve a read according to the mount mode.
    ///
    /// Capture: one positional read of up to `size` bytes from the open
    /// handle, persisted under `(offset, size)` even when fewer bytes came
    /// back. Replay: the stored payload for `(offset, size)`, whatever its
    /// length; `fh` is never looked at.
    pub fn read(&mut self, path: &Path, size: u32, offset: u64, fh: Option<u64>) -> OpResult<Vec<u8>> {
        let key = SectorKey::new(offset, size);
        match self.config.mode {
            Mode::Replay => {
                info!("r {} {} {} replay", path.display(), offset, size);
                Ok(self.store.retrieve(key)?)
            }
            Mode::Capture => {
                info!("r {} {} {} capture", path.display(), offset, size);
                let fh = fh.ok_or(OpError::from(nix::Error::EBADF))?;
                let handle = self.handle(fh)?;
                let mut buf = vec![0u8; size as usize];
                let n = handle.file.read_at(&mut buf, offset)?;
                buf.truncate(n);
                if n < size as usize {
                    debug!(
                        "short read on {}: {} of {} bytes, stored under the requested length",
                        handle.path.display(),
                        n,
                        size
                    );
                }
                self.store.capture(key, &buf)?;
                self.captured.insert(key);
                Ok(buf)
            }
        }
    }

    /// Write `data` live to the backing file in either mode
    pub fn write(&mut self, path: &Path, data: &[u8], offset: u64, fh: u64) -> OpResult<usize> {
        info!("w {} {} {} {}", path.display(), offset, data.len(), self.config.mode);
        if let Some(key) = self
            .captured
            .iter()
            .find(|key| key.overlaps(offset, data.len() as u64))
        {
            warn!(
                "write to {} at {} overlaps captured sector ({}); replay will return the old bytes",
                path.display(),
                offset,
                key
            );
        }
        let handle = self.handle(fh)?;
        Ok(handle.file.write_at(data, offset)?)
    }

    pub fn flush(&self, path: &Path, fh: u64) -> OpResult<()> {
        debug!("flush {} fh={}", path.display(), fh);
        self.handle(fh)?.file.sync_all()?;
        Ok(())
    }

    pub fn fsync(&self, path: &Path, datasync: bool, fh: u64) -> OpResult<()> {
        debug!("fsync {} fh={} datasync={}", path.display(), fh, datasync);
        let file = &self.handle(fh)?.file;
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Close `fh`; unknown handles are ignored
    pub fn release(&mut self, path: &Path, fh: u64) {
        debug!("release {} fh={}", path.display(), fh);
        self.handles.remove(&fh);
    }
}

/// Translate open(2) flags into `OpenOptions`
fn open_options(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            options.write(true);
        }
        libc::O_RDWR => {
            options.read(true).write(true);
        }
        _ => {
            options.read(true);
        }
    }
    if flags & libc::O_APPEND != 0 {
        options.append(true);
    }
    if flags & libc::O_TRUNC != 0 {
        options.truncate(true);
    }
    options.custom_flags(flags & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_TRUNC | libc::O_CREAT));
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn mount(backing: &Path, datadir: &Path, mode: Mode) -> Passthrough {
        Passthrough::new(Arc::new(MountConfig {
            root: backing.to_path_buf(),
            mountpoint: PathBuf::from("/mnt/unused"),
            datadir: datadir.to_path_buf(),
            mode,
            allow_other: false,
        }))
    }

    #[test]
    fn handles_are_allocated_sequentially_and_released() {
        let backing = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        fs::write(backing.path().join("a"), b"abc").unwrap();
        let mut pt = mount(backing.path(), data.path(), Mode::Capture);

        let fh1 = pt.open(Path::new("/a"), libc::O_RDONLY).unwrap();
        let fh2 = pt.open(Path::new("/a"), libc::O_RDONLY).unwrap();
        assert_eq!((fh1, fh2), (1, 2));
        assert_eq!(pt.open_handles(), 2);

        pt.release(Path::new("/a"), fh1);
        pt.release(Path::new("/a"), fh1);
        assert_eq!(pt.open_handles(), 1);
        assert!(matches!(pt.flush(Path::new("/a"), fh1), Err(OpError::BadHandle(1))));
    }

    #[test]
    fn capture_read_needs_open_handle() {
        let backing = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let mut pt = mount(backing.path(), data.path(), Mode::Capture);
        let err = pt.read(Path::new("/a"), 16, 0, Some(42)).unwrap_err();
        assert_eq!(err.errno(), libc::EBADF);
    }

    #[test]
    fn readdir_lists_dot_entries_first() {
        let backing = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        fs::write(backing.path().join("disk.img"), b"").unwrap();
        let pt = mount(backing.path(), data.path(), Mode::Capture);

        let entries = pt.readdir(Path::new("/")).unwrap();
        assert_eq!(entries, vec![OsString::from("."), OsString::from(".."), OsString::from("disk.img")]);
    }

    #[test]
    fn readlink_relativizes_absolute_targets() {
        let backing = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        let target = backing.path().join("real");
        fs::write(&target, b"x").unwrap();
        std::os::unix::fs::symlink(&target, backing.path().join("abs")).unwrap();
        let pt = mount(backing.path(), data.path(), Mode::Capture);

        assert_eq!(pt.readlink(Path::new("/abs")).unwrap(), PathBuf::from("real"));
    }

    #[test]
    fn timespec_keeps_times_before_the_epoch() {
        let at = |t| SetTime::to_timespec(Some(SetTime::At(t)));
        let ts = at(UNIX_EPOCH - Duration::from_secs(100));
        assert_eq!((ts.tv_sec(), ts.tv_nsec()), (-100, 0));
        let ts = at(UNIX_EPOCH - Duration::from_millis(1500));
        assert_eq!((ts.tv_sec(), ts.tv_nsec()), (-2, 500_000_000));
        let ts = at(UNIX_EPOCH + Duration::new(7, 25));
        assert_eq!((ts.tv_sec(), ts.tv_nsec()), (7, 25));
    }

    #[test]
    fn utimens_sets_pre_epoch_mtime() {
        let backing = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();
        fs::write(backing.path().join("old"), b"").unwrap();
        let pt = mount(backing.path(), data.path(), Mode::Replay);

        let mtime = UNIX_EPOCH - Duration::from_secs(100);
        pt.utimens(Path::new("/old"), None, Some(SetTime::At(mtime))).unwrap();
        let modified = fs::metadata(backing.path().join("old")).unwrap().modified().unwrap();
        assert_eq!(modified, mtime);
    }

    #[test]
    fn open_options_follow_access_mode() {
        let backing = TempDir::new().unwrap();
        let path = backing.path().join("f");
        fs::write(&path, b"data").unwrap();

        let mut file = open_options(libc::O_RDONLY).open(&path).unwrap();
        assert!(std::io::Write::write_all(&mut file, b"x").is_err());

        open_options(libc::O_WRONLY | libc::O_TRUNC).open(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"");
    }
}
