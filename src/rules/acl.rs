//! ACL rules: per-caller ownership/mode overrides and visibility decisions
//! over device paths, loaded from `[acl]` INI sections.

use std::path::{Path, PathBuf};

use ini::Ini;
use regex::Regex;

use crate::error::Error;

use super::{compile_regex, parse_gid, parse_sha256, parse_uid, scalar, validate_gid, validate_uid};

/// One access control rule. All declared criteria are conjunctive: a rule
/// applies its overrides to a caller only when every declared match field
/// holds for that caller.
#[derive(Debug, Clone, Default)]
pub struct AclRule {
    /// Rule source file, for diagnostics
    pub source: PathBuf,
    /// Caller UID this rule speaks for
    pub uid: Option<u32>,
    /// Caller GID this rule speaks for
    pub gid: Option<u32>,
    pub setuid: Option<u32>,
    pub setgid: Option<u32>,
    /// Replacement permission bits, masked to 0o777
    pub setmode: Option<u32>,
    /// Required caller binary path
    pub proc_path: Option<String>,
    /// Required SHA-256 of the caller binary
    pub proc_sha256: Option<[u8; 32]>,
    /// Required inode of the caller binary
    pub proc_inode: Option<u64>,
    /// Predicate command; exit status 0 means the rule applies
    pub predicate: Option<String>,
    /// Device path regexes; an empty list matches every path
    pub paths: Vec<Regex>,
}

impl AclRule {
    /// Load an ACL rule from an INI file with a single `[acl]` section.
    pub fn load(path: &Path) -> Result<AclRule, Error> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| Error::Parse(format!("{}: {e}", path.display())))?;
        let section = ini
            .section(Some("acl"))
            .ok_or_else(|| Error::Parse(format!("{}: missing [acl] section", path.display())))?;

        let mut rule = AclRule {
            source: path.to_path_buf(),
            ..AclRule::default()
        };

        for (key, _) in section.iter() {
            match key {
                "uid" | "gid" | "setuid" | "setgid" | "setmode" | "bin" | "predicate"
                | "pidlist" | "sha256" | "inode" | "devices" => (),
                _ => {
                    return Err(Error::Parse(format!(
                        "{}: unrecognized field '{key}'",
                        path.display()
                    )))
                }
            }
        }

        if let Some(value) = scalar(section, "uid")? {
            rule.uid = Some(parse_uid(value)?);
        }
        if let Some(value) = scalar(section, "gid")? {
            rule.gid = Some(parse_gid(value)?);
        }
        if let Some(value) = scalar(section, "setuid")? {
            rule.setuid = Some(parse_uid(value)?);
        }
        if let Some(value) = scalar(section, "setgid")? {
            rule.setgid = Some(parse_gid(value)?);
        }
        if let Some(value) = scalar(section, "setmode")? {
            rule.setmode = Some(crate::config::parse_octal_mode(value)?);
        }
        if let Some(value) = scalar(section, "bin")? {
            rule.proc_path = Some(value.to_string());
        }
        if let Some(value) = scalar(section, "sha256")? {
            rule.proc_sha256 = Some(parse_sha256(value)?);
        }
        if let Some(value) = scalar(section, "inode")? {
            let inode = value
                .parse::<u64>()
                .map_err(|_| Error::Parse(format!("invalid inode '{value}'")))?;
            rule.proc_inode = Some(inode);
        }
        if let Some(value) = scalar(section, "predicate")? {
            rule.predicate = Some(value.to_string());
        }
        if let Some(value) = scalar(section, "pidlist")? {
            // deprecated spelling of predicate=
            if rule.predicate.is_some() {
                return Err(Error::Parse(format!(
                    "{}: both 'predicate' and 'pidlist' given",
                    path.display()
                )));
            }
            log::warn!(
                "{}: 'pidlist' is deprecated; use 'predicate'",
                path.display()
            );
            rule.predicate = Some(value.to_string());
        }
        for value in section.get_all("devices") {
            rule.paths.push(compile_regex(value)?);
        }

        Ok(rule)
    }

    /// Verify that every declared uid/gid field resolves in the system
    /// user/group database.
    pub fn sanity_check(&self) -> Result<(), Error> {
        if let Some(uid) = self.uid {
            validate_uid(uid)?;
        }
        if let Some(uid) = self.setuid {
            validate_uid(uid)?;
        }
        if let Some(gid) = self.gid {
            validate_gid(gid)?;
        }
        if let Some(gid) = self.setgid {
            validate_gid(gid)?;
        }
        Ok(())
    }

    /// Returns true if the rule carries any process-match criterion.
    pub fn has_process_match(&self) -> bool {
        self.proc_path.is_some()
            || self.proc_sha256.is_some()
            || self.proc_inode.is_some()
            || self.predicate.is_some()
    }

    /// Returns whether any of this rule's path regexes match the given
    /// path. An empty regex list matches all paths.
    pub fn matches_path(&self, path: &str) -> bool {
        self.paths.is_empty() || self.paths.iter().any(|re| re.is_match(path))
    }
}
