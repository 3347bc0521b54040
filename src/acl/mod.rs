//! The ACL evaluator: rewrites ownership and permission bits of a stat
//! buffer per caller, or decides that a device must be hidden from the
//! caller entirely.

#[cfg(test)]
mod acl_test;
pub mod process;

use std::process::{Command, Stdio};

use crate::config::Config;
use crate::error::Error;
use crate::rules::AclRule;

pub use process::ProcessSnapshot;

/// The slice of a stat buffer the ACL engine is allowed to rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub uid: u32,
    pub gid: u32,
    /// Full st_mode, type bits included; ACLs replace the low 9 bits
    pub mode: u32,
}

/// The evaluator's verdict for one path and caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Serve the (possibly rewritten) stat buffer
    Allow,
    /// Pretend the entry does not exist
    Hide,
}

/// Scan the rule list in order and apply every matching rule's overrides
/// to the stat buffer.
///
/// A rule is *relevant* when one of its path regexes matches (an empty
/// list matches everything); relevance alone keeps the entry visible. Its
/// overrides apply only when the rule also speaks for this caller: the
/// match-uid/match-gid equal the caller's, and the process criteria hold.
/// With no relevant rule at all the entry is hidden; with an empty rule
/// list the configured default policy decides.
pub fn apply_all(
    config: &Config,
    rules: &[AclRule],
    path: &str,
    caller: &ProcessSnapshot,
    uid: u32,
    gid: u32,
    stat: &mut FileStat,
) -> Result<Decision, Error> {
    if rules.is_empty() {
        return Ok(if config.default_policy_allow {
            Decision::Allow
        } else {
            Decision::Hide
        });
    }

    let mut found = false;
    for rule in rules {
        if !rule.matches_path(path) {
            continue;
        }
        found = true;

        if !caller_matches(rule, caller, uid, gid)? {
            continue;
        }

        // setuid and setgid take effect only for the caller the rule names
        if let (Some(match_uid), Some(setuid)) = (rule.uid, rule.setuid) {
            if match_uid == uid {
                stat.uid = setuid;
            }
        }
        if let (Some(match_gid), Some(setgid)) = (rule.gid, rule.setgid) {
            if match_gid == gid {
                stat.gid = setgid;
            }
        }
        if let Some(mode) = rule.setmode {
            stat.mode = (stat.mode & !0o777) | mode;
        }
    }

    Ok(if found { Decision::Allow } else { Decision::Hide })
}

/// Check every caller criterion the rule declares. All criteria AND
/// together; a rule with none applies to every caller.
fn caller_matches(
    rule: &AclRule,
    caller: &ProcessSnapshot,
    uid: u32,
    gid: u32,
) -> Result<bool, Error> {
    if let Some(match_uid) = rule.uid {
        if match_uid != uid {
            return Ok(false);
        }
    }
    if let Some(match_gid) = rule.gid {
        if match_gid != gid {
            return Ok(false);
        }
    }

    if let Some(required_path) = &rule.proc_path {
        match caller.exe() {
            Some(exe) if exe == std::path::Path::new(required_path) => (),
            _ => return Ok(false),
        }
    }

    if let Some(required_inode) = rule.proc_inode {
        if caller.exe_inode() != Some(required_inode) {
            return Ok(false);
        }
    }

    if let Some(required_sha256) = &rule.proc_sha256 {
        match caller.exe_sha256() {
            Some(digest) if digest == *required_sha256 => (),
            _ => return Ok(false),
        }
    }

    if let Some(predicate) = &rule.predicate {
        if !run_predicate(predicate, caller, uid, gid)? {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Run an ACL predicate command. The caller's identity is passed in the
/// environment; exit status 0 means the rule applies.
fn run_predicate(
    command: &str,
    caller: &ProcessSnapshot,
    uid: u32,
    gid: u32,
) -> Result<bool, Error> {
    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .env_clear()
        .env("VDEV_UID", uid.to_string())
        .env("VDEV_GID", gid.to_string())
        .env("VDEV_PID", caller.pid().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;

    Ok(status.success())
}
