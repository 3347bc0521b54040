//! Device requests: one record per device lifecycle event, carrying the
//! parameters needed to materialize the node and to build subprocess
//! environments.

#[cfg(test)]
mod request_test;

pub mod node;
#[cfg(test)]
mod node_test;

use std::collections::BTreeMap;

use crate::config::Config;
use crate::error::Error;

/// Sentinel path for devices whose name could not be determined.
pub const PATH_UNKNOWN: &str = "UNKNOWN";

/// The kind of device lifecycle event. `Any` is only meaningful as an
/// action rule trigger; it never appears on a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventKind {
    #[default]
    Invalid,
    Add,
    Remove,
    Change,
    Any,
}

impl EventKind {
    /// Parse a kernel uevent ACTION value.
    pub fn from_uevent(value: &str) -> EventKind {
        match value {
            "add" => EventKind::Add,
            "remove" => EventKind::Remove,
            "change" => EventKind::Change,
            _ => EventKind::Invalid,
        }
    }

    /// Parse an action rule trigger (`event=` field).
    pub fn from_trigger(value: &str) -> EventKind {
        match value {
            "add" => EventKind::Add,
            "remove" => EventKind::Remove,
            "change" => EventKind::Change,
            "any" => EventKind::Any,
            _ => EventKind::Invalid,
        }
    }

    /// The value exported as VDEV_ACTION.
    pub fn as_env_str(&self) -> &'static str {
        match self {
            EventKind::Add => "add",
            EventKind::Remove => "remove",
            EventKind::Change => "any",
            _ => "none",
        }
    }
}

/// File type of the device node to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeKind {
    #[default]
    None,
    Block,
    Char,
}

impl NodeKind {
    /// The value exported as VDEV_MODE.
    pub fn as_env_str(&self) -> &'static str {
        match self {
            NodeKind::Block => "block",
            NodeKind::Char => "char",
            NodeKind::None => "none",
        }
    }
}

/// A single device lifecycle event, from parsing until the worker has
/// finished processing it.
#[derive(Debug, Clone)]
pub struct DeviceRequest {
    kind: EventKind,
    /// Device path relative to the mountpoint, as reported by the OS
    path: String,
    /// Path derived by rename commands, once computed
    renamed: Option<String>,
    major: u64,
    minor: u64,
    node_kind: NodeKind,
    /// OS parameters; keys are unique, iterated in order
    params: BTreeMap<String, String>,
}

impl DeviceRequest {
    pub fn new(kind: EventKind, path: &str) -> DeviceRequest {
        DeviceRequest {
            kind,
            path: path.to_string(),
            renamed: None,
            major: 0,
            minor: 0,
            node_kind: NodeKind::None,
            params: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: EventKind) {
        self.kind = kind;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    /// The renamed path if one was derived, else the original path.
    pub fn effective_path(&self) -> &str {
        self.renamed.as_deref().unwrap_or(&self.path)
    }

    pub fn renamed(&self) -> Option<&str> {
        self.renamed.as_deref()
    }

    pub fn set_renamed(&mut self, path: &str) {
        self.renamed = Some(path.to_string());
    }

    pub fn dev(&self) -> (u64, u64) {
        (self.major, self.minor)
    }

    pub fn set_dev(&mut self, major: u64, minor: u64) {
        self.major = major;
        self.minor = minor;
    }

    pub fn node_kind(&self) -> NodeKind {
        self.node_kind
    }

    pub fn set_node_kind(&mut self, kind: NodeKind) {
        self.node_kind = kind;
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Record an OS parameter. Keys must be unique.
    pub fn add_param(&mut self, key: &str, value: &str) -> Result<(), Error> {
        if self.params.contains_key(key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        self.params.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Requests must carry a concrete kind and a non-empty path before they
    /// may be enqueued.
    pub fn sanity_check(&self) -> Result<(), Error> {
        if matches!(self.kind, EventKind::Invalid | EventKind::Any) {
            return Err(Error::InvalidState("request has no event kind".into()));
        }
        if self.path.is_empty() {
            return Err(Error::InvalidState("request has no path".into()));
        }
        Ok(())
    }

    /// Build the environment for a subprocess handling this request. The
    /// well-known variables always come first, in a fixed order, followed
    /// by one VDEV_OS_ variable per OS parameter.
    pub fn to_env(&self, config: &Config) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(7 + self.params.len());
        env.push((
            "VDEV_MOUNTPOINT".to_string(),
            config.mountpoint.display().to_string(),
        ));
        env.push(("VDEV_ACTION".to_string(), self.kind.as_env_str().to_string()));
        env.push(("VDEV_PATH".to_string(), self.effective_path().to_string()));
        env.push(("VDEV_MAJOR".to_string(), self.major.to_string()));
        env.push(("VDEV_MINOR".to_string(), self.minor.to_string()));
        env.push((
            "VDEV_MODE".to_string(),
            self.node_kind.as_env_str().to_string(),
        ));
        env.push((
            "VDEV_HELPERS".to_string(),
            config.helpers_dir.display().to_string(),
        ));
        for (key, value) in &self.params {
            env.push((format!("VDEV_OS_{key}"), value.clone()));
        }
        env
    }
}
