//! Kernel-facing side of the mount.
//!
//! The FUSE protocol addresses files by inode while [`Passthrough`] works on
//! paths, so this adapter keeps an inode table, filled in by `lookup` and
//! the creating operations and emptied again by `forget`. Inode numbers are
//! the backing store's own, except the mount root which is always
//! [`FUSE_ROOT_ID`].

mod attr;
mod inodes;

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow, FUSE_ROOT_ID,
};
use libc::c_int;
use log::{debug, info, warn};

use crate::config::MountConfig;
use crate::error::{OpError, OpResult};
use crate::passthrough::{Passthrough, SetTime};
use inodes::InodeTable;

/// How long the kernel may cache attributes and entries
const TTL: Duration = Duration::from_secs(1);

pub struct SectorFs {
    ops: Passthrough,
    inodes: InodeTable,
}

impl SectorFs {
    pub fn new(config: Arc<MountConfig>) -> Self {
        Self {
            ops: Passthrough::new(config),
            inodes: InodeTable::new(),
        }
    }

    fn path(&self, ino: u64) -> OpResult<PathBuf> {
        self.inodes
            .path(ino)
            .map(Path::to_path_buf)
            .ok_or_else(|| OpError::from(nix::Error::ENOENT))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> OpResult<PathBuf> {
        Ok(self.path(parent)?.join(name))
    }

    fn stat(&self, path: &Path) -> OpResult<FileAttr> {
        let meta = self.ops.getattr(path)?;
        let ino = if path == Path::new("/") {
            FUSE_ROOT_ID
        } else {
            meta.ino()
        };
        Ok(attr::file_attr(&meta, ino))
    }

    /// Stat `path` and hand its inode to the kernel, which will `forget` it
    fn enter(&mut self, path: PathBuf) -> OpResult<FileAttr> {
        let attr = self.stat(&path)?;
        self.inodes.remember(attr.ino, path);
        self.inodes.lookup(attr.ino);
        Ok(attr)
    }

    fn directory_entries(&self, ino: u64) -> OpResult<Vec<(u64, FileType, PathBuf)>> {
        let path = self.path(ino)?;
        let mut entries = Vec::new();
        for name in self.ops.readdir(&path)? {
            let entry = if name == "." {
                (ino, FileType::Directory, PathBuf::from("."))
            } else if name == ".." {
                let parent = path.parent().unwrap_or(Path::new("/")).to_path_buf();
                let parent_ino = self.stat(&parent).map_or(FUSE_ROOT_ID, |attr| attr.ino);
                (parent_ino, FileType::Directory, PathBuf::from(".."))
            } else {
                match self.stat(&path.join(&name)) {
                    Ok(attr) => (attr.ino, attr.kind, PathBuf::from(name)),
                    Err(e) => {
                        debug!("readdir: skipping {:?} in {}: {}", name, path.display(), e);
                        continue;
                    }
                }
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    fn set_attributes(
        &mut self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> OpResult<FileAttr> {
        let path = self.path(ino)?;
        if let Some(size) = size {
            self.ops.truncate(&path, size)?;
        }
        if let Some(mode) = mode {
            self.ops.chmod(&path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.ops.chown(&path, uid, gid)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.ops
                .utimens(&path, atime.map(set_time), mtime.map(set_time))?;
        }
        self.stat(&path)
    }

    fn create_file(&mut self, parent: u64, name: &OsStr, mode: u32, flags: i32) -> OpResult<(FileAttr, u64)> {
        let path = self.child_path(parent, name)?;
        let fh = self.ops.create(&path, mode, flags)?;
        match self.enter(path.clone()) {
            Ok(attr) => Ok((attr, fh)),
            Err(e) => {
                self.ops.release(&path, fh);
                Err(e)
            }
        }
    }
}

fn set_time(time: TimeOrNow) -> SetTime {
    match time {
        TimeOrNow::Now => SetTime::Now,
        TimeOrNow::SpecificTime(at) => SetTime::At(at),
    }
}

fn offset(offset: i64) -> OpResult<u64> {
    u64::try_from(offset).map_err(|_| OpError::from(nix::Error::EINVAL))
}

fn reply_err(op: &str, e: &OpError) -> c_int {
    let errno = e.errno();
    if errno == libc::ENOENT {
        debug!("{}: {}", op, e);
    } else {
        warn!("{}: {}", op, e);
    }
    errno
}

impl Filesystem for SectorFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        let config = self.ops.config();
        info!(
            "mounted {} on {} in {} mode, sectors in {}",
            config.root.display(),
            config.mountpoint.display(),
            config.mode,
            config.datadir.display()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("unmounted {}", self.ops.config().mountpoint.display());
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self
            .child_path(parent, name)
            .and_then(|path| self.enter(path))
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(reply_err("lookup", &e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.path(ino).and_then(|path| self.stat(&path)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(reply_err("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.set_attributes(ino, mode, uid, gid, size, atime, mtime) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(reply_err("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.path(ino).and_then(|path| self.ops.readlink(&path)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(reply_err("readlink", &e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.ops.mknod(&path, mode, u64::from(rdev))?;
            self.enter(path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(reply_err("mknod", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.ops.mkdir(&path, mode)?;
            self.enter(path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(reply_err("mkdir", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self
            .child_path(parent, name)
            .and_then(|path| {
                self.ops.unlink(&path)?;
                self.inodes.unlink(&path);
                Ok(())
            }) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self
            .child_path(parent, name)
            .and_then(|path| {
                self.ops.rmdir(&path)?;
                self.inodes.unlink(&path);
                Ok(())
            }) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.child_path(parent, link_name).and_then(|path| {
            self.ops.symlink(&path, target)?;
            self.enter(path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(reply_err("symlink", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.child_path(parent, name).and_then(|old| {
            let new = self.child_path(newparent, newname)?;
            self.ops.rename(&old, &new)?;
            self.inodes.rename(&old, &new);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err("rename", &e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.path(ino).and_then(|path| {
            let new_path = self.child_path(newparent, newname)?;
            self.ops.link(&path, &new_path)?;
            self.enter(new_path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(reply_err("link", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.path(ino).and_then(|path| self.ops.open(&path, flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(reply_err("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.path(ino).and_then(|path| {
            let offset = self::offset(offset)?;
            self.ops.read(&path, size, offset, Some(fh))
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(reply_err("read", &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self.path(ino).and_then(|path| {
            let offset = self::offset(offset)?;
            self.ops.write(&path, data, offset, fh)
        });
        match result {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(reply_err("write", &e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.path(ino).and_then(|path| self.ops.flush(&path, fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err("flush", &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = self.path(ino).unwrap_or_default();
        self.ops.release(&path, fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self
            .path(ino)
            .and_then(|path| self.ops.fsync(&path, datasync, fh))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err("fsync", &e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.path(ino) {
            Ok(_) => reply.opened(0, 0),
            Err(e) => reply.error(reply_err("opendir", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.directory_entries(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(reply_err("readdir", &e));
                return;
            }
        };
        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            // true once the reply buffer is full
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.path(ino).and_then(|path| self.ops.statfs(&path)) {
            Ok(stat) => reply.statfs(
                stat.blocks() as u64,
                stat.blocks_free() as u64,
                stat.blocks_available() as u64,
                stat.files() as u64,
                stat.files_free() as u64,
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(e) => reply.error(reply_err("statfs", &e)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.path(ino).and_then(|path| self.ops.access(&path, mask)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err("access", &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_file(parent, name, mode, flags) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(reply_err("create", &e)),
        }
    }
}

/// Mount options for `config`
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("sector-rr".to_string()),
        MountOption::Subtype(config.mode.to_string()),
    ];
    // fuser only honours auto_unmount together with allow_other/allow_root
    if config.allow_other {
        options.push(MountOption::AllowOther);
        options.push(MountOption::AutoUnmount);
    }
    options
}

/// Mount `config.root` on `config.mountpoint` and serve requests on the
/// calling thread until the filesystem is unmounted.
pub fn mount(config: Arc<MountConfig>) -> anyhow::Result<()> {
    let options = mount_options(&config);
    let mountpoint = config.mountpoint.clone();
    fuser::mount2(SectorFs::new(config), &mountpoint, &options)
        .with_context(|| format!("failed to mount on {}", mountpoint.display()))
}
