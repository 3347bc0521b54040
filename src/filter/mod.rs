//! The filter front end: serves per-caller `stat` and `readdir` views of
//! the managed directory by running every entry through the ACL engine.

pub mod fuse;

use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::acl::{apply_all, Decision, FileStat, ProcessSnapshot};
use crate::config::Config;
use crate::rules::AclRule;

/// Identity of the process asking for a view.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Why a route refused to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterError {
    /// The entry does not exist for this caller
    NotFound,
    /// The ACL engine failed; surfaces as EIO
    Io,
}

/// Attributes served for one visible entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryAttr {
    pub uid: u32,
    pub gid: u32,
    /// Full st_mode after ACL rewriting
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub rdev: u64,
    pub mtime: SystemTime,
}

/// One visible directory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub attr: EntryAttr,
}

pub struct Filter {
    config: Config,
    rules: Vec<AclRule>,
    /// The managed root being served
    root: PathBuf,
}

impl Filter {
    pub fn new(config: Config, rules: Vec<AclRule>, root: PathBuf) -> Filter {
        Filter { config, rules, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a view path ("/", "/null", "/input/mouse0") to the
    /// underlying filesystem path. Paths escaping the root are refused.
    fn real_path(&self, path: &str) -> Result<PathBuf, FilterError> {
        let relative = Path::new(path.trim_start_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => (),
                _ => return Err(FilterError::NotFound),
            }
        }
        Ok(self.root.join(relative))
    }

    /// Serve `stat`: seed a stat buffer from the underlying entry, run the
    /// ACL engine for this caller, and refuse to admit the entry exists
    /// when the engine hides it or strips every permission bit.
    pub fn stat(&self, path: &str, caller: &Caller) -> Result<EntryAttr, FilterError> {
        log::debug!(
            "stat('{path}') from user {} group {} task {}",
            caller.uid,
            caller.gid,
            caller.pid
        );

        let snapshot = snapshot_caller(caller)?;
        let metadata = std::fs::symlink_metadata(self.real_path(path)?)
            .map_err(|_| FilterError::NotFound)?;
        self.filter_entry(path, caller, &snapshot, &metadata)
    }

    /// Serve `readdir`: enumerate the underlying directory and drop every
    /// entry the ACL engine hides from this caller.
    pub fn readdir(&self, path: &str, caller: &Caller) -> Result<Vec<DirEntry>, FilterError> {
        log::debug!(
            "readdir('{path}') from user {} group {} task {}",
            caller.uid,
            caller.gid,
            caller.pid
        );

        let snapshot = snapshot_caller(caller)?;
        let dir = std::fs::read_dir(self.real_path(path)?).map_err(|_| FilterError::NotFound)?;

        let mut entries = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|_| FilterError::Io)?;
            let name = entry.file_name().to_string_lossy().to_string();
            let child_path = if path == "/" {
                format!("/{name}")
            } else {
                format!("{}/{name}", path.trim_end_matches('/'))
            };

            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            match self.filter_entry(&child_path, caller, &snapshot, &metadata) {
                Ok(attr) => entries.push(DirEntry { name, attr }),
                Err(FilterError::NotFound) => {
                    log::debug!("filter '{child_path}'");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    /// Run one entry through the ACL engine.
    fn filter_entry(
        &self,
        path: &str,
        caller: &Caller,
        snapshot: &ProcessSnapshot,
        metadata: &std::fs::Metadata,
    ) -> Result<EntryAttr, FilterError> {
        let mut stat = seed_stat(metadata, &self.config);

        let decision = apply_all(
            &self.config,
            &self.rules,
            path,
            snapshot,
            caller.uid,
            caller.gid,
            &mut stat,
        )
        .map_err(|e| {
            log::error!("apply_all('{path}', uid={}, gid={}): {e}", caller.uid, caller.gid);
            FilterError::Io
        })?;

        if decision == Decision::Hide || stat.mode & 0o777 == 0 {
            return Err(FilterError::NotFound);
        }

        Ok(EntryAttr {
            uid: stat.uid,
            gid: stat.gid,
            mode: stat.mode,
            size: metadata.size(),
            nlink: metadata.nlink() as u32,
            rdev: metadata.rdev(),
            mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }
}

fn snapshot_caller(caller: &Caller) -> Result<ProcessSnapshot, FilterError> {
    ProcessSnapshot::new(caller.pid).map_err(|e| {
        log::error!("snapshot of caller {}: {e}", caller.pid);
        FilterError::Io
    })
}

/// Build the stat buffer the ACL engine starts from. The node was created
/// mode 0777 on disk; device files present the configured default
/// permission bits until an ACL says otherwise.
fn seed_stat(metadata: &std::fs::Metadata, config: &Config) -> FileStat {
    let mut mode = metadata.mode();
    let file_type = mode & libc::S_IFMT;
    if file_type == libc::S_IFCHR || file_type == libc::S_IFBLK {
        mode = file_type | config.default_mode;
    }
    FileStat {
        uid: metadata.uid(),
        gid: metadata.gid(),
        mode,
    }
}
