//! Action rules: per-event commands and renames, loaded from
//! `[vdev-action]` INI sections.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use ini::Ini;
use regex::Regex;

use crate::config::{parse_bool, Config};
use crate::device::{EventKind, NodeKind};
use crate::error::Error;

use super::{compile_regex, scalar};

/// What to do when the device node already existed at add time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfExists {
    /// Treat the pre-existing node as an error; skip this rule's command
    Error,
    /// Suppress this rule's command
    Mask,
    /// Run the command regardless
    #[default]
    Run,
}

impl IfExists {
    fn parse(value: &str) -> Result<IfExists, Error> {
        match value {
            "error" => Ok(IfExists::Error),
            "mask" => Ok(IfExists::Mask),
            "run" => Ok(IfExists::Run),
            _ => Err(Error::Parse(format!("invalid if_exists '{value}'"))),
        }
    }
}

/// Success count and cumulative runtime for a rule's command.
#[derive(Debug, Default)]
pub struct RunStats {
    pub calls: AtomicU64,
    pub total_micros: AtomicU64,
}

impl RunStats {
    pub fn record(&self, elapsed: std::time::Duration) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }
}

/// One action rule. Matching is conjunctive over trigger, path regex,
/// device type, and the OS parameter map.
#[derive(Debug, Default)]
pub struct ActionRule {
    /// Rule name (source file stem)
    pub name: String,
    pub source: PathBuf,
    pub trigger: EventKind,
    pub path_regex: Option<Regex>,
    /// Restrict to block or char devices
    pub node_filter: Option<NodeKind>,
    /// Command whose stdout becomes the new device path
    pub rename_command: Option<String>,
    /// Side-effecting command
    pub command: Option<String>,
    /// Helper program name, resolved under the helpers directory
    pub helper: Option<String>,
    pub is_async: bool,
    /// Run the command through /bin/sh -c
    pub shell: bool,
    /// Keep a persistent subprocess fed one environment block per event
    pub daemonlet: bool,
    pub if_exists: IfExists,
    /// Expected OS parameters; an empty expected value matches any value
    pub os_params: BTreeMap<String, String>,
    /// Extra environment variables for the helper, in declaration order
    pub helper_vars: Vec<(String, String)>,
    pub stats: RunStats,
}

impl ActionRule {
    /// Load an action rule from an INI file with a single `[vdev-action]`
    /// section.
    pub fn load(path: &Path) -> Result<ActionRule, Error> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| Error::Parse(format!("{}: {e}", path.display())))?;
        let section = ini.section(Some("vdev-action")).ok_or_else(|| {
            Error::Parse(format!("{}: missing [vdev-action] section", path.display()))
        })?;

        let mut rule = ActionRule {
            name: path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
            source: path.to_path_buf(),
            trigger: EventKind::Invalid,
            shell: true,
            ..ActionRule::default()
        };

        for (key, value) in section.iter() {
            if let Some(param) = key.strip_prefix("OS_") {
                rule.os_params.insert(param.to_string(), value.to_string());
                continue;
            }
            if let Some(var) = key.strip_prefix("VAR_") {
                rule.helper_vars.push((var.to_string(), value.to_string()));
                continue;
            }
            match key {
                "event" | "path" | "type" | "rename_command" | "command" | "helper"
                | "async" | "shell" | "daemonlet" | "if_exists" => (),
                _ => {
                    return Err(Error::Parse(format!(
                        "{}: unrecognized field '{key}'",
                        path.display()
                    )))
                }
            }
        }

        if let Some(value) = scalar(section, "event")? {
            rule.trigger = EventKind::from_trigger(value);
            if rule.trigger == EventKind::Invalid {
                return Err(Error::Parse(format!("invalid event type '{value}'")));
            }
        }
        if let Some(value) = scalar(section, "path")? {
            rule.path_regex = Some(compile_regex(value)?);
        }
        if let Some(value) = scalar(section, "type")? {
            rule.node_filter = Some(match value {
                _ if value.eq_ignore_ascii_case("block") => NodeKind::Block,
                _ if value.eq_ignore_ascii_case("char") => NodeKind::Char,
                _ => return Err(Error::Parse(format!("invalid device type '{value}'"))),
            });
        }
        if let Some(value) = scalar(section, "rename_command")? {
            rule.rename_command = Some(value.to_string());
        }
        if let Some(value) = scalar(section, "command")? {
            rule.command = Some(value.to_string());
        }
        if let Some(value) = scalar(section, "helper")? {
            rule.helper = Some(value.to_string());
        }
        if let Some(value) = scalar(section, "async")? {
            rule.is_async = parse_bool(value)?;
        }
        if let Some(value) = scalar(section, "shell")? {
            rule.shell = parse_bool(value)?;
        }
        if let Some(value) = scalar(section, "daemonlet")? {
            rule.daemonlet = parse_bool(value)?;
        }
        if let Some(value) = scalar(section, "if_exists")? {
            rule.if_exists = IfExists::parse(value)?;
        }

        Ok(rule)
    }

    /// An action must name something to do and a trigger to do it on.
    pub fn sanity_check(&self) -> Result<(), Error> {
        if self.command.is_none() && self.rename_command.is_none() && self.helper.is_none() {
            return Err(Error::BadRule(format!(
                "{}: missing 'command=' or 'rename_command='",
                self.source.display()
            )));
        }
        if self.trigger == EventKind::Invalid {
            return Err(Error::BadRule(format!(
                "{}: missing 'event='",
                self.source.display()
            )));
        }
        Ok(())
    }

    /// The command to run for this rule: the literal `command=` if given,
    /// else the helper resolved under the configured helpers directory.
    pub fn effective_command(&self, config: &Config) -> Option<String> {
        if self.command.is_some() {
            return self.command.clone();
        }
        self.helper
            .as_ref()
            .map(|h| config.helpers_dir.join(h).display().to_string())
    }
}
