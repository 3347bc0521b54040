//! Rule model and parser. ACL rules and action rules are loaded once at
//! startup from directories of INI files, in lexicographic filename order,
//! and are immutable afterwards.

pub mod acl;
pub mod action;

use std::path::{Path, PathBuf};

use ini::Properties;
use nix::unistd::{Gid, Group, Uid, User};
use regex::Regex;

use crate::error::Error;

pub use acl::AclRule;
pub use action::{ActionRule, IfExists};

/// Length of a printable SHA-256 digest, in hex digits.
pub const SHA256_HEX_LEN: usize = 64;

/// List the regular files in a rule directory, sorted by filename. Entries
/// that are not regular files are skipped.
pub fn rule_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        files.push(entry.path());
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Load every ACL rule in the given directory, in lexicographic order.
pub fn load_acls(dir: &Path) -> Result<Vec<AclRule>, Error> {
    let mut rules = Vec::new();
    for path in rule_files(dir)? {
        log::debug!("Load ACL {}", path.display());
        let rule = AclRule::load(&path)?;
        rule.sanity_check()?;
        rules.push(rule);
    }
    Ok(rules)
}

/// Load every action rule in the given directory, in lexicographic order.
pub fn load_actions(dir: &Path) -> Result<Vec<ActionRule>, Error> {
    let mut rules = Vec::new();
    for path in rule_files(dir)? {
        log::debug!("Load action {}", path.display());
        let rule = ActionRule::load(&path)?;
        rule.sanity_check()?;
        rules.push(rule);
    }
    Ok(rules)
}

/// Fetch a scalar field from an INI section; a repeated occurrence is an
/// error.
pub(crate) fn scalar<'a>(props: &'a Properties, key: &str) -> Result<Option<&'a str>, Error> {
    let mut values = props.get_all(key);
    let first = values.next();
    if values.next().is_some() {
        return Err(Error::Parse(format!("duplicate field '{key}'")));
    }
    Ok(first)
}

/// Compile a device path regex. A syntactically invalid pattern aborts the
/// rule being parsed.
pub(crate) fn compile_regex(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|e| Error::Parse(format!("invalid regex '{pattern}': {e}")))
}

/// Parse a user field: either a decimal UID or a name resolved through the
/// system user database.
pub fn parse_uid(value: &str) -> Result<u32, Error> {
    if let Ok(uid) = value.parse::<u32>() {
        return Ok(uid);
    }
    match User::from_name(value) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        Ok(None) => Err(Error::NotFound(format!("user '{value}'"))),
        Err(e) => Err(Error::Errno(e)),
    }
}

/// Parse a group field: either a decimal GID or a name resolved through the
/// system group database.
pub fn parse_gid(value: &str) -> Result<u32, Error> {
    if let Ok(gid) = value.parse::<u32>() {
        return Ok(gid);
    }
    match Group::from_name(value) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        Ok(None) => Err(Error::NotFound(format!("group '{value}'"))),
        Err(e) => Err(Error::Errno(e)),
    }
}

/// Verify that a UID resolves in the system user database.
pub fn validate_uid(uid: u32) -> Result<(), Error> {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(Error::BadRule(format!("unknown uid {uid}"))),
        Err(e) => Err(Error::Errno(e)),
    }
}

/// Verify that a GID resolves in the system group database.
pub fn validate_gid(gid: u32) -> Result<(), Error> {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(Error::BadRule(format!("unknown gid {gid}"))),
        Err(e) => Err(Error::Errno(e)),
    }
}

/// Parse a printable SHA-256 digest (64 hex characters, case-insensitive)
/// into its binary form.
pub fn parse_sha256(value: &str) -> Result<[u8; 32], Error> {
    if value.len() != SHA256_HEX_LEN || !value.is_ascii() {
        return Err(Error::Parse(format!("invalid SHA-256 '{value}'")));
    }
    let mut digest = [0u8; 32];
    for (i, byte) in digest.iter_mut().enumerate() {
        let pair = &value[2 * i..2 * i + 2];
        *byte = u8::from_str_radix(pair, 16)
            .map_err(|_| Error::Parse(format!("invalid SHA-256 '{value}'")))?;
    }
    Ok(digest)
}
