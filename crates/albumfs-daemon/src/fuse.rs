//! FUSE shim
//!
//! A thin adapter translating kernel requests onto the [`AlbumFs`] facade:
//! an inode table mapping FUSE inodes to locators, attribute conversion,
//! and errno mapping at the boundary. No caching or synchronization logic
//! lives here.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr as FuserAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyWrite, ReplyXattr, Request,
};
use parking_lot::Mutex;
use tracing::debug;

use albumfs_core::Locator;

use crate::fs::{AlbumFs, Attributes};

/// TTL handed to the kernel for attribute/entry caching
const TTL: Duration = Duration::from_secs(1);

struct InodeTable {
    by_ino: HashMap<u64, Locator>,
    by_key: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            by_ino: HashMap::new(),
            by_key: HashMap::new(),
            next: fuser::FUSE_ROOT_ID + 1,
        };
        table
            .by_ino
            .insert(fuser::FUSE_ROOT_ID, Locator::root());
        table
            .by_key
            .insert(Locator::root().key(), fuser::FUSE_ROOT_ID);
        table
    }

    fn resolve(&self, ino: u64) -> Option<Locator> {
        self.by_ino.get(&ino).cloned()
    }

    fn assign(&mut self, locator: &Locator) -> u64 {
        let key = locator.key();
        if let Some(ino) = self.by_key.get(&key) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, locator.clone());
        self.by_key.insert(key, ino);
        ino
    }
}

pub struct AlbumFuse {
    fs: Arc<AlbumFs>,
    inodes: Mutex<InodeTable>,
}

impl AlbumFuse {
    pub fn new(fs: Arc<AlbumFs>) -> Self {
        Self {
            fs,
            inodes: Mutex::new(InodeTable::new()),
        }
    }

    fn locator(&self, ino: u64) -> Option<Locator> {
        self.inodes.lock().resolve(ino)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Option<Locator> {
        let parent = self.locator(parent)?;
        let name = name.to_str()?;
        Some(parent.join(name))
    }

    fn to_fuser_attr(&self, ino: u64, attr: &Attributes) -> FuserAttr {
        let (kind, nlink, mut perm) = if attr.directory {
            (FileType::Directory, 2, 0o500)
        } else {
            (FileType::RegularFile, 1, 0o400)
        };
        if attr.world_readable {
            perm |= if attr.directory { 0o055 } else { 0o044 };
        }
        if attr.writeable {
            perm |= 0o200;
        }
        let mtime = UNIX_EPOCH + Duration::from_secs(attr.modified);
        FuserAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

impl Filesystem for AlbumFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(locator) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.attributes(&locator) {
            Ok(attr) => {
                let ino = self.inodes.lock().assign(&locator);
                reply.entry(&TTL, &self.to_fuser_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(locator) = self.locator(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.attributes(&locator) {
            Ok(attr) => reply.attr(&TTL, &self.to_fuser_attr(ino, &attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(locator) = self.locator(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(size) = size {
            if let Err(e) = self.fs.truncate(&locator, size) {
                reply.error(e.errno());
                return;
            }
        }
        match self.fs.attributes(&locator) {
            Ok(attr) => reply.attr(&TTL, &self.to_fuser_attr(ino, &attr)),
            Err(e) => reply.error(e.errno()),
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
        let Some(locator) = self.locator(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let names = match self.fs.list(&locator) {
            Ok(names) => names,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        for name in names {
            let child = locator.join(&name);
            let kind = match self.fs.attributes(&child) {
                Ok(attr) if attr.directory => FileType::Directory,
                Ok(_) => FileType::RegularFile,
                Err(_) => continue,
            };
            let child_ino = self.inodes.lock().assign(&child);
            entries.push((child_ino, kind, name));
        }

        for (i, (entry_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(locator) = self.locator(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.read(&locator, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(locator) = self.locator(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.write(&locator, data, offset.max(0) as u64) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let Some(locator) = self.locator(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let write = (flags & libc::O_ACCMODE) != libc::O_RDONLY;
        match self.fs.open(&locator, write) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(locator) = self.locator(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.close(&locator) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let Some(locator) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Err(e) = self.fs.create(&locator) {
            reply.error(e.errno());
            return;
        }
        if let Err(e) = self.fs.open(&locator, true) {
            reply.error(e.errno());
            return;
        }
        match self.fs.attributes(&locator) {
            Ok(attr) => {
                let ino = self.inodes.lock().assign(&locator);
                reply.created(&TTL, &self.to_fuser_attr(ino, &attr), 0, 0, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(locator) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Err(e) = self.fs.mkdir(&locator) {
            reply.error(e.errno());
            return;
        }
        match self.fs.attributes(&locator) {
            Ok(attr) => {
                let ino = self.inodes.lock().assign(&locator);
                reply.entry(&TTL, &self.to_fuser_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(locator) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.unlink(&locator) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(locator) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rmdir(&locator) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let Some(locator) = self.locator(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENODATA);
            return;
        };
        // shell tools address attributes through the user namespace
        let name = name.strip_prefix("user.").unwrap_or(name);
        match self.fs.get_xattr(&locator, name) {
            Ok(value) => {
                let bytes = value.as_bytes();
                if size == 0 {
                    reply.size(bytes.len() as u32);
                } else if bytes.len() as u32 <= size {
                    reply.data(bytes);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => {
                debug!("no xattr {name} on {locator}");
                reply.error(match e.errno() {
                    libc::ENOENT => libc::ENODATA,
                    errno => errno,
                });
            }
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(locator) = self.locator(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.list_xattr(&locator) {
            Ok(names) => {
                let mut out = Vec::new();
                for name in names {
                    out.extend_from_slice(b"user.");
                    out.extend_from_slice(name.as_bytes());
                    out.push(0);
                }
                if size == 0 {
                    reply.size(out.len() as u32);
                } else if out.len() as u32 <= size {
                    reply.data(&out);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(e.errno()),
        }
    }
}
