//! FUSE adapter for the filter front end. The transport (fuser) supplies
//! the threads and the protocol; every stat/readdir decision is delegated
//! to [Filter].

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use fuser::{
    Config, Errno, FileAttr, FileHandle, FileType, Filesystem, Generation, INodeNo, MountOption,
    ReplyAttr, ReplyDirectory, ReplyEntry, Request, SessionACL,
};

use crate::error::Error;

use super::{Caller, EntryAttr, Filter, FilterError};

const ZERO_TTL: Duration = Duration::ZERO;

/// Paths are the identity here; inodes exist only because FUSE insists.
#[derive(Default)]
struct InodeCache {
    paths: HashMap<u64, String>,
    inodes: HashMap<String, u64>,
    next: u64,
}

impl InodeCache {
    fn new() -> InodeCache {
        let mut cache = InodeCache {
            next: 2,
            ..InodeCache::default()
        };
        cache.paths.insert(1, "/".to_string());
        cache.inodes.insert("/".to_string(), 1);
        cache
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    fn inode_for(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.inodes.get(path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(ino, path.to_string());
        self.inodes.insert(path.to_string(), ino);
        ino
    }
}

pub struct FilterFs {
    filter: Filter,
    inodes: Mutex<InodeCache>,
}

impl FilterFs {
    pub fn new(filter: Filter) -> FilterFs {
        FilterFs {
            filter,
            inodes: Mutex::new(InodeCache::new()),
        }
    }

    fn caller(req: &Request) -> Caller {
        Caller {
            pid: req.pid() as i32,
            uid: req.uid(),
            gid: req.gid(),
        }
    }

    fn file_attr(&self, ino: u64, attr: &EntryAttr) -> FileAttr {
        FileAttr {
            ino: INodeNo(ino),
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: attr.mtime,
            mtime: attr.mtime,
            ctime: attr.mtime,
            crtime: SystemTime::UNIX_EPOCH,
            kind: file_type_of(attr.mode),
            perm: (attr.mode & 0o7777) as u16,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev as u32,
            blksize: 512,
            flags: 0,
        }
    }
}

fn file_type_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn errno_of(e: FilterError) -> Errno {
    match e {
        FilterError::NotFound => Errno::ENOENT,
        FilterError::Io => Errno::EIO,
    }
}

impl Filesystem for FilterFs {
    fn lookup(&self, req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let caller = Self::caller(req);
        let parent_path = {
            let inodes = self.inodes.lock().unwrap_or_else(|e| e.into_inner());
            inodes.path_of(parent.0)
        };
        let Some(parent_path) = parent_path else {
            reply.error(Errno::ENOENT);
            return;
        };
        let name = name.to_string_lossy();
        let path = if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        };

        // predicates may fork; don't hold the inode table across them
        match self.filter.stat(&path, &caller) {
            Ok(attr) => {
                let ino = {
                    let mut inodes = self.inodes.lock().unwrap_or_else(|e| e.into_inner());
                    inodes.inode_for(&path)
                };
                reply.entry(&ZERO_TTL, &self.file_attr(ino, &attr), Generation(0));
            }
            Err(e) => reply.error(errno_of(e)),
        }
    }

    fn getattr(&self, req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let caller = Self::caller(req);
        let path = {
            let inodes = self.inodes.lock().unwrap_or_else(|e| e.into_inner());
            inodes.path_of(ino.0)
        };
        let Some(path) = path else {
            reply.error(Errno::ENOENT);
            return;
        };

        match self.filter.stat(&path, &caller) {
            Ok(attr) => reply.attr(&ZERO_TTL, &self.file_attr(ino.0, &attr)),
            Err(e) => reply.error(errno_of(e)),
        }
    }

    fn readdir(
        &self,
        req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let caller = Self::caller(req);
        let path = {
            let inodes = self.inodes.lock().unwrap_or_else(|e| e.into_inner());
            inodes.path_of(ino.0)
        };
        let Some(path) = path else {
            reply.error(Errno::ENOENT);
            return;
        };

        let entries = match self.filter.readdir(&path, &caller) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno_of(e));
                return;
            }
        };

        let mut inodes = self.inodes.lock().unwrap_or_else(|e| e.into_inner());
        for (index, entry) in entries.iter().enumerate().skip(offset as usize) {
            let child_path = if path == "/" {
                format!("/{}", entry.name)
            } else {
                format!("{path}/{}", entry.name)
            };
            let child_ino = inodes.inode_for(&child_path);
            let kind = file_type_of(entry.attr.mode);
            if reply.add(INodeNo(child_ino), (index + 1) as u64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }
}

/// Mount the filter view. `dev` and `allow_other` are always forced on;
/// anything else the caller passed with -o rides along.
pub fn mount(filter: Filter, mountpoint: &std::path::Path, extra: &[String]) -> Result<(), Error> {
    let mut options = vec![
        MountOption::FSName("vdevfs".to_string()),
        MountOption::Dev,
    ];
    for option in extra {
        match option.as_str() {
            "dev" | "allow_other" => (),
            "ro" => options.push(MountOption::RO),
            "rw" => options.push(MountOption::RW),
            "exec" => options.push(MountOption::Exec),
            "noexec" => options.push(MountOption::NoExec),
            "suid" => options.push(MountOption::Suid),
            "nosuid" => options.push(MountOption::NoSuid),
            other => options.push(MountOption::CUSTOM(other.to_string())),
        }
    }

    let mut config = Config::default();
    config.mount_options = options;
    config.acl = SessionACL::All;
    fuser::mount2(FilterFs::new(filter), mountpoint, &config)?;
    Ok(())
}
