use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use crate::config::{parse_bool, parse_octal_mode, Config};

fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("vdev.conf");
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn load_full_config() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[vdev-config]
firmware=/lib/firmware
acls=/etc/vdev/acls
actions=/etc/vdev/actions
helpers=/lib/vdev
default_permissions=0660
default_policy=deny
pidfile=/run/vdevd.pid
logfile=syslog
loglevel=debug
mountpoint=/dev
coldplug_only=true
once=1

[vdev-OS]
ifnames=/etc/vdev/ifnames.conf
subsystems=all
"#,
    );

    let config = Config::load(&path).unwrap();
    assert_eq!(config.default_mode, 0o660);
    assert!(!config.default_policy_allow);
    assert_eq!(config.logfile.as_deref(), Some("syslog"));
    assert_eq!(config.loglevel, log::LevelFilter::Debug);
    assert_eq!(config.mountpoint, PathBuf::from("/dev"));
    assert!(config.coldplug_only);
    assert!(config.once);
    assert_eq!(
        config.os_params.get("subsystems").map(String::as_str),
        Some("all")
    );
}

#[test]
fn unknown_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[vdev-config]\nnot_a_key=1\n");
    assert!(Config::load(&path).is_err());
}

#[test]
fn nonce_is_64_hex_digits_and_fresh() {
    let a = Config::default();
    let b = Config::default();
    assert_eq!(a.instance_nonce.len(), 64);
    assert!(a.instance_nonce.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a.instance_nonce, b.instance_nonce);
}

#[test]
fn mode_parsing_masks_to_permission_bits() {
    assert_eq!(parse_octal_mode("0666").unwrap(), 0o666);
    assert_eq!(parse_octal_mode("7777").unwrap(), 0o777);
    assert!(parse_octal_mode("99").is_err());
}

#[test]
fn bool_parsing_accepts_both_spellings() {
    assert!(parse_bool("true").unwrap());
    assert!(parse_bool("1").unwrap());
    assert!(!parse_bool("false").unwrap());
    assert!(!parse_bool("0").unwrap());
    assert!(parse_bool("yes").is_err());
}

#[test]
fn metadata_path_strips_leading_slash() {
    let config = Config {
        mountpoint: PathBuf::from("/dev"),
        ..Config::default()
    };
    assert_eq!(
        config.metadata_path("/input/mouse0"),
        PathBuf::from("/dev/metadata/input/mouse0")
    );
}
