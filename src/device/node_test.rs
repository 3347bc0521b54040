use std::fs;
use std::os::unix::fs::FileTypeExt;

use tempfile::TempDir;

use crate::config::{Config, QUIRK_DEVICE_EXISTS};
use crate::device::node::{add, find_unplugged, remove};
use crate::device::{DeviceRequest, EventKind, NodeKind, PATH_UNKNOWN};

fn test_config(dir: &TempDir) -> Config {
    Config {
        mountpoint: dir.path().to_path_buf(),
        ..Config::default()
    }
}

fn add_request(path: &str) -> DeviceRequest {
    let mut req = DeviceRequest::new(EventKind::Add, path);
    req.set_dev(1, 3);
    req.set_node_kind(NodeKind::Char);
    req.add_param("SUBSYSTEM", "mem").unwrap();
    req.add_param("DEVPATH", "/devices/virtual/mem/null").unwrap();
    req
}

#[test]
fn add_creates_node_and_metadata() {
    if !nix::unistd::geteuid().is_root() {
        // mknod needs CAP_MKNOD
        return;
    }
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let req = add_request("null");

    let outcome = add(&req, &config).unwrap();
    assert!(outcome.created);
    assert!(!outcome.existed);

    let node = dir.path().join("null");
    let file_type = fs::metadata(&node).unwrap().file_type();
    assert!(file_type.is_char_device());

    let metadata = dir.path().join("metadata/null");
    assert_eq!(
        fs::read_to_string(metadata.join("SUBSYSTEM")).unwrap(),
        "mem\n"
    );
    assert_eq!(
        fs::read_to_string(metadata.join("DEVPATH")).unwrap(),
        "/devices/virtual/mem/null\n"
    );
    assert_eq!(
        fs::read_to_string(metadata.join("vdev_instance")).unwrap(),
        format!("{}\n", config.instance_nonce)
    );
}

#[test]
fn add_with_device_exists_quirk_skips_mknod_but_writes_metadata() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.set_quirk(QUIRK_DEVICE_EXISTS);

    let req = add_request("null");
    let outcome = add(&req, &config).unwrap();
    assert!(!outcome.created);

    // no node, but the metadata tree is fully published
    assert!(!dir.path().join("null").exists());
    assert_eq!(
        fs::read_to_string(dir.path().join("metadata/null/SUBSYSTEM")).unwrap(),
        "mem\n"
    );
}

#[test]
fn add_uses_the_renamed_path() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.set_quirk(QUIRK_DEVICE_EXISTS);

    let mut req = add_request("raw");
    req.set_renamed("disks/by-label/root");
    add(&req, &config).unwrap();

    assert!(dir
        .path()
        .join("metadata/disks/by-label/root/SUBSYSTEM")
        .is_file());
}

#[test]
fn add_skips_incomplete_requests() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    // no device number
    let mut req = DeviceRequest::new(EventKind::Add, "eth0");
    req.set_node_kind(NodeKind::Char);
    let outcome = add(&req, &config).unwrap();
    assert!(!outcome.created && !outcome.existed);
    assert!(!dir.path().join("metadata").exists());

    // unknown path
    let mut req = DeviceRequest::new(EventKind::Add, PATH_UNKNOWN);
    req.set_dev(1, 3);
    req.set_node_kind(NodeKind::Char);
    let outcome = add(&req, &config).unwrap();
    assert!(!outcome.created && !outcome.existed);
}

#[test]
fn remove_drops_node_metadata_and_empty_parents() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    // materialize by hand; remove works on any file type
    let node = dir.path().join("input/mouse0");
    fs::create_dir_all(node.parent().unwrap()).unwrap();
    fs::write(&node, "").unwrap();
    let metadata = dir.path().join("metadata/input/mouse0");
    fs::create_dir_all(&metadata).unwrap();
    fs::write(metadata.join("SUBSYSTEM"), "input\n").unwrap();
    fs::write(metadata.join("vdev_instance"), "00\n").unwrap();

    let req = DeviceRequest::new(EventKind::Remove, "input/mouse0");
    remove(&req, &config).unwrap();

    assert!(!node.exists());
    assert!(!metadata.exists());
    // empty ancestors are pruned up to, but excluding, the roots
    assert!(!dir.path().join("input").exists());
    assert!(!dir.path().join("metadata/input").exists());
    assert!(dir.path().exists());
}

#[test]
fn remove_of_a_missing_node_succeeds() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let req = DeviceRequest::new(EventKind::Remove, "nonexistent");
    remove(&req, &config).unwrap();
}

#[test]
fn remove_keeps_nonempty_parents() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let node = dir.path().join("input/mouse0");
    fs::create_dir_all(node.parent().unwrap()).unwrap();
    fs::write(&node, "").unwrap();
    fs::write(dir.path().join("input/mouse1"), "").unwrap();

    let req = DeviceRequest::new(EventKind::Remove, "input/mouse0");
    remove(&req, &config).unwrap();

    assert!(dir.path().join("input").exists());
    assert!(dir.path().join("input/mouse1").exists());
}

#[test]
fn unplugged_devices_are_found_by_nonce() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    // stale: written by a previous instance
    let stale = dir.path().join("metadata/null");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("SUBSYSTEM"), "mem\n").unwrap();
    fs::write(stale.join("vdev_instance"), format!("{}\n", "a".repeat(64))).unwrap();

    // fresh: written by this instance
    let fresh = dir.path().join("metadata/zero");
    fs::create_dir_all(&fresh).unwrap();
    fs::write(
        fresh.join("vdev_instance"),
        format!("{}\n", config.instance_nonce),
    )
    .unwrap();

    let unplugged = find_unplugged(&config).unwrap();
    assert_eq!(unplugged.len(), 1);
    let req = &unplugged[0];
    assert_eq!(req.kind(), EventKind::Remove);
    assert_eq!(req.path(), "null");
    // parameters are rebuilt from the metadata files, minus the nonce
    assert_eq!(req.params().get("SUBSYSTEM").map(String::as_str), Some("mem"));
    assert!(!req.params().contains_key("vdev_instance"));
}

#[test]
fn gc_processes_stale_devices_and_preserves_fresh_ones() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let stale_node = dir.path().join("null");
    fs::write(&stale_node, "").unwrap();
    let stale_meta = dir.path().join("metadata/null");
    fs::create_dir_all(&stale_meta).unwrap();
    fs::write(stale_meta.join("vdev_instance"), format!("{}\n", "a".repeat(64))).unwrap();

    let fresh_node = dir.path().join("zero");
    fs::write(&fresh_node, "").unwrap();
    let fresh_meta = dir.path().join("metadata/zero");
    fs::create_dir_all(&fresh_meta).unwrap();
    fs::write(
        fresh_meta.join("vdev_instance"),
        format!("{}\n", config.instance_nonce),
    )
    .unwrap();

    for req in find_unplugged(&config).unwrap() {
        remove(&req, &config).unwrap();
    }

    assert!(!stale_node.exists());
    assert!(!stale_meta.exists());
    assert!(fresh_node.exists());
    assert!(fresh_meta.exists());
}

#[test]
fn empty_metadata_tree_has_no_unplugged_devices() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    assert!(find_unplugged(&config).unwrap().is_empty());
}
