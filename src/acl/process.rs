//! Caller process snapshots: the binary path, inode, and (lazily) the
//! SHA-256 of the executable behind a pid.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use sha2::{Digest, Sha256};

use crate::error::Error;

#[derive(Debug)]
pub struct ProcessSnapshot {
    pid: i32,
    exe: Option<PathBuf>,
    exe_inode: Option<u64>,
    /// Hashing the binary is expensive; do it only when an ACL asks
    exe_sha256: OnceLock<Option<[u8; 32]>>,
}

impl ProcessSnapshot {
    /// Snapshot the process behind `pid` via procfs. A vanished or
    /// unreadable process yields an error; an unreadable exe link (kernel
    /// threads) yields a snapshot without binary information.
    pub fn new(pid: i32) -> Result<ProcessSnapshot, Error> {
        let process = procfs::process::Process::new(pid)
            .map_err(|e| Error::NotFound(format!("process {pid}: {e}")))?;
        let exe = process.exe().ok();
        Ok(Self::with_exe(pid, exe))
    }

    /// Build a snapshot from an already-known binary path.
    pub fn with_exe(pid: i32, exe: Option<PathBuf>) -> ProcessSnapshot {
        let exe_inode = exe
            .as_ref()
            .and_then(|path| std::fs::metadata(path).ok())
            .map(|meta| meta.ino());
        ProcessSnapshot {
            pid,
            exe,
            exe_inode,
            exe_sha256: OnceLock::new(),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn exe(&self) -> Option<&Path> {
        self.exe.as_deref()
    }

    pub fn exe_inode(&self) -> Option<u64> {
        self.exe_inode
    }

    /// SHA-256 of the process binary, computed once per snapshot.
    pub fn exe_sha256(&self) -> Option<[u8; 32]> {
        *self.exe_sha256.get_or_init(|| {
            let path = self.exe.as_ref()?;
            let contents = std::fs::read(path).ok()?;
            let digest = Sha256::digest(&contents);
            Some(digest.into())
        })
    }
}
