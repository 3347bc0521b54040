use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// Represents all possible errors raised by the vdev core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("syscall failed: {0}")]
    Errno(#[from] Errno),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("bad rule: {0}")]
    BadRule(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("subprocess '{command}' failed with status {status}")]
    Subprocess { command: String, status: i32 },
    #[error("subprocess output exceeded {0} bytes")]
    Truncated(usize),
    #[error("interrupted")]
    Interrupted,
}

impl Error {
    /// Returns true if the failed operation should be retried. Interrupted
    /// syscalls are retried internally everywhere except during shutdown.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Interrupted => true,
            Error::Errno(e) => *e == Errno::EINTR || *e == Errno::EAGAIN,
            Error::Io(e) => e.kind() == io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}
