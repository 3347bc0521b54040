use std::path::PathBuf;

use crate::config::Config;
use crate::device::{DeviceRequest, EventKind, NodeKind};

fn test_config() -> Config {
    Config {
        mountpoint: PathBuf::from("/dev"),
        helpers_dir: PathBuf::from("/lib/vdev"),
        ..Config::default()
    }
}

#[test]
fn env_has_fixed_prefix_in_order() {
    let mut req = DeviceRequest::new(EventKind::Add, "null");
    req.set_dev(1, 3);
    req.set_node_kind(NodeKind::Char);
    req.add_param("SUBSYSTEM", "mem").unwrap();
    req.add_param("DEVPATH", "/devices/virtual/mem/null").unwrap();

    let env = req.to_env(&test_config());
    let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(
        keys,
        vec![
            "VDEV_MOUNTPOINT",
            "VDEV_ACTION",
            "VDEV_PATH",
            "VDEV_MAJOR",
            "VDEV_MINOR",
            "VDEV_MODE",
            "VDEV_HELPERS",
            "VDEV_OS_DEVPATH",
            "VDEV_OS_SUBSYSTEM",
        ]
    );
    assert_eq!(env[1].1, "add");
    assert_eq!(env[2].1, "null");
    assert_eq!(env[3].1, "1");
    assert_eq!(env[4].1, "3");
    assert_eq!(env[5].1, "char");
}

#[test]
fn env_path_prefers_renamed() {
    let mut req = DeviceRequest::new(EventKind::Add, "raw");
    req.set_renamed("second");
    let env = req.to_env(&test_config());
    assert_eq!(env[2], ("VDEV_PATH".to_string(), "second".to_string()));
}

#[test]
fn duplicate_params_are_rejected() {
    let mut req = DeviceRequest::new(EventKind::Add, "null");
    req.add_param("SUBSYSTEM", "mem").unwrap();
    assert!(req.add_param("SUBSYSTEM", "mem").is_err());
}

#[test]
fn sanity_check_requires_kind_and_path() {
    let req = DeviceRequest::new(EventKind::Invalid, "null");
    assert!(req.sanity_check().is_err());

    let req = DeviceRequest::new(EventKind::Any, "null");
    assert!(req.sanity_check().is_err());

    let req = DeviceRequest::new(EventKind::Add, "");
    assert!(req.sanity_check().is_err());

    let req = DeviceRequest::new(EventKind::Remove, "null");
    assert!(req.sanity_check().is_ok());
}

#[test]
fn action_env_strings() {
    assert_eq!(EventKind::Add.as_env_str(), "add");
    assert_eq!(EventKind::Remove.as_env_str(), "remove");
    assert_eq!(EventKind::Change.as_env_str(), "any");
    assert_eq!(EventKind::Invalid.as_env_str(), "none");
}
