//! Daemon configuration, loaded from an INI file with `[vdev-config]` and
//! `[vdev-OS]` sections.

#[cfg(test)]
mod config_test;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ini::Ini;
use rand::RngCore;

use crate::error::Error;

/// Name of the directory under the mountpoint holding per-device metadata.
pub const METADATA_DIR: &str = "metadata";

/// Reserved metadata file name recording the instance nonce of the run
/// that created a device. OS parameters may not use this name.
pub const INSTANCE_PARAM: &str = "vdev_instance";

/// Size of the per-process instance nonce, in bytes.
pub const INSTANCE_NONCE_LEN: usize = 32;

/// Set when the managed directory lives on devtmpfs: the kernel has already
/// created the device node, so the materializer skips mknod.
pub const QUIRK_DEVICE_EXISTS: u32 = 1 << 0;

/// Typed view of the `[vdev-config]` section plus the pass-through
/// `[vdev-OS]` parameter map.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory searched by firmware helpers
    pub firmware_dir: PathBuf,
    /// Directory of ACL rule files
    pub acls_dir: PathBuf,
    /// Directory of action rule files
    pub actions_dir: PathBuf,
    /// Directory of helper programs, exported as VDEV_HELPERS
    pub helpers_dir: PathBuf,
    /// Permission bits presented for device nodes before ACLs run
    pub default_mode: u32,
    /// Whether an empty ACL rule list allows (true) or denies (false)
    pub default_policy_allow: bool,
    pub pidfile: Option<PathBuf>,
    /// Log destination; the special value "syslog" diverts to syslog
    pub logfile: Option<String>,
    pub loglevel: log::LevelFilter,
    /// Managed directory under which nodes and metadata are created
    pub mountpoint: PathBuf,
    /// Exit after the coldplug walk instead of listening on netlink
    pub once: bool,
    pub foreground: bool,
    /// Script run before any rules are loaded
    pub preseed: Option<PathBuf>,
    pub coldplug_only: bool,
    /// Persistent network interface name database
    pub ifnames_path: Option<PathBuf>,
    /// OS-specific parameters, forwarded verbatim from `[vdev-OS]`
    pub os_params: BTreeMap<String, String>,
    /// Platform quirk bits (see QUIRK_*)
    pub quirks: u32,
    /// Per-process random nonce, 64 lowercase hex digits
    pub instance_nonce: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            firmware_dir: PathBuf::from("/lib/firmware"),
            acls_dir: PathBuf::from("/etc/vdev/acls"),
            actions_dir: PathBuf::from("/etc/vdev/actions"),
            helpers_dir: PathBuf::from("/lib/vdev"),
            default_mode: 0o666,
            default_policy_allow: true,
            pidfile: None,
            logfile: None,
            loglevel: log::LevelFilter::Warn,
            mountpoint: PathBuf::from("/dev"),
            once: false,
            foreground: false,
            preseed: None,
            coldplug_only: false,
            ifnames_path: None,
            os_params: BTreeMap::new(),
            quirks: 0,
            instance_nonce: make_instance_nonce(),
        }
    }
}

impl Config {
    /// Load a [Config] from the given INI file. Unrecognized keys in
    /// `[vdev-config]` are rejected; all `[vdev-OS]` keys are forwarded.
    pub fn load(path: &Path) -> Result<Config, Error> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| Error::Parse(format!("{}: {e}", path.display())))?;
        let mut config = Config::default();

        if let Some(section) = ini.section(Some("vdev-config")) {
            for (key, value) in section.iter() {
                config.set_key(key, value)?;
            }
        }

        if let Some(section) = ini.section(Some("vdev-OS")) {
            for (key, value) in section.iter() {
                config.os_params.insert(key.to_string(), value.to_string());
            }
        }

        Ok(config)
    }

    fn set_key(&mut self, key: &str, value: &str) -> Result<(), Error> {
        match key {
            "firmware" => self.firmware_dir = PathBuf::from(value),
            "acls" => self.acls_dir = PathBuf::from(value),
            "actions" => self.actions_dir = PathBuf::from(value),
            "helpers" => self.helpers_dir = PathBuf::from(value),
            "default_permissions" => {
                self.default_mode = parse_octal_mode(value)?;
            }
            "default_policy" => {
                self.default_policy_allow = match value {
                    "allow" => true,
                    "deny" => false,
                    _ => {
                        return Err(Error::Parse(format!(
                            "invalid default_policy '{value}'"
                        )))
                    }
                };
            }
            "pidfile" => self.pidfile = Some(PathBuf::from(value)),
            "logfile" => self.logfile = Some(value.to_string()),
            "loglevel" => {
                self.loglevel = match value {
                    "debug" => log::LevelFilter::Debug,
                    "info" => log::LevelFilter::Info,
                    "warn" => log::LevelFilter::Warn,
                    "error" => log::LevelFilter::Error,
                    _ => {
                        return Err(Error::Parse(format!("invalid loglevel '{value}'")))
                    }
                };
            }
            "mountpoint" => self.mountpoint = PathBuf::from(value),
            "coldplug_only" => self.coldplug_only = parse_bool(value)?,
            "preseed" => self.preseed = Some(PathBuf::from(value)),
            "ifnames" => self.ifnames_path = Some(PathBuf::from(value)),
            "once" => self.once = parse_bool(value)?,
            _ => {
                return Err(Error::Parse(format!(
                    "unknown key '{key}' in [vdev-config]"
                )))
            }
        }
        Ok(())
    }

    /// Returns the metadata directory for a device path relative to the
    /// mountpoint.
    pub fn metadata_path(&self, device_path: &str) -> PathBuf {
        self.mountpoint
            .join(METADATA_DIR)
            .join(device_path.trim_start_matches('/'))
    }

    pub fn has_quirk(&self, quirk: u32) -> bool {
        self.quirks & quirk != 0
    }

    pub fn set_quirk(&mut self, quirk: u32) {
        self.quirks |= quirk;
    }
}

/// Parse a base-8 mode value, masked to the permission bits.
pub fn parse_octal_mode(value: &str) -> Result<u32, Error> {
    let mode = u32::from_str_radix(value, 8)
        .map_err(|_| Error::Parse(format!("invalid octal mode '{value}'")))?;
    Ok(mode & 0o777)
}

/// Parse a boolean config value ("true"|"false"|"1"|"0").
pub fn parse_bool(value: &str) -> Result<bool, Error> {
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        _ if value.eq_ignore_ascii_case("true") => Ok(true),
        _ if value.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err(Error::Parse(format!("invalid boolean '{value}'"))),
    }
}

/// Generate the per-process instance nonce as 64 lowercase hex digits.
fn make_instance_nonce() -> String {
    let mut nonce = [0u8; INSTANCE_NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    nonce.iter().map(|b| format!("{b:02x}")).collect()
}
