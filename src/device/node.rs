//! The device materializer: creates and removes device nodes under the
//! mountpoint and publishes per-device metadata files.

use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

use nix::sys::stat::{makedev, mknod, Mode, SFlag};

use crate::config::{Config, INSTANCE_PARAM, METADATA_DIR, QUIRK_DEVICE_EXISTS};
use crate::device::{DeviceRequest, EventKind, NodeKind, PATH_UNKNOWN};
use crate::error::Error;

/// What the materializer did for an add request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddOutcome {
    /// A node was created by this call
    pub created: bool,
    /// The node already existed (devtmpfs, or a duplicate event)
    pub existed: bool,
}

/// Create the device node and its parent directories, then publish the
/// request's OS parameters as metadata. Requests without a concrete path,
/// device number and type have nothing to materialize.
pub fn add(req: &DeviceRequest, config: &Config) -> Result<AddOutcome, Error> {
    let path = req.effective_path();
    let (major, minor) = req.dev();

    if path == PATH_UNKNOWN || (major, minor) == (0, 0) || req.node_kind() == NodeKind::None {
        return Ok(AddOutcome::default());
    }

    let node_path = config.mountpoint.join(path.trim_start_matches('/'));
    let mut outcome = AddOutcome::default();

    if let Some(parent) = node_path.parent() {
        // 0777 is fine: the ACL engine re-filters everything it serves
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o777)
            .create(parent)?;
    }

    let kind = match req.node_kind() {
        NodeKind::Block => SFlag::S_IFBLK,
        _ => SFlag::S_IFCHR,
    };

    if config.has_quirk(QUIRK_DEVICE_EXISTS) {
        // devtmpfs made the node for us
        outcome.existed = node_path.exists();
    } else {
        // permission bits are applied later by the ACL layer
        match mknod(
            &node_path,
            kind,
            Mode::from_bits_truncate(0o777),
            makedev(major, minor),
        ) {
            Ok(()) => outcome.created = true,
            Err(nix::errno::Errno::EEXIST) => {
                log::debug!("node '{}' already exists", node_path.display());
                outcome.existed = true;
            }
            Err(e) => {
                log::error!(
                    "mknod('{}', dev=({major}, {minor})): {e}",
                    node_path.display()
                );
                return Err(Error::Errno(e));
            }
        }
    }

    if let Err(e) = write_metadata(req, config) {
        // the node is live; a metadata failure is logged, not fatal
        log::error!("write metadata for '{path}': {e}");
    }

    Ok(outcome)
}

/// Write `<mountpoint>/metadata/<path>/<key>` = `value\n` for every OS
/// parameter, plus the instance nonce that marks this run as the creator.
fn write_metadata(req: &DeviceRequest, config: &Config) -> Result<(), Error> {
    let base = config.metadata_path(req.effective_path());
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(&base)?;

    for (key, value) in req.params() {
        if key == INSTANCE_PARAM {
            log::warn!("OS parameter '{key}' is reserved; skipped");
            continue;
        }
        write_metadata_file(&base.join(key), value)?;
    }
    write_metadata_file(&base.join(INSTANCE_PARAM), &config.instance_nonce)?;
    Ok(())
}

fn write_metadata_file(path: &Path, value: &str) -> Result<(), Error> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    file.write_all(value.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Unlink the device node (a missing node is not an error), drop its
/// metadata, and prune now-empty ancestor directories.
pub fn remove(req: &DeviceRequest, config: &Config) -> Result<(), Error> {
    let path = req.effective_path();
    if path == PATH_UNKNOWN {
        return Ok(());
    }

    let node_path = config.mountpoint.join(path.trim_start_matches('/'));
    match std::fs::remove_file(&node_path) {
        Ok(()) => (),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => {
            log::error!("unlink('{}'): {e}", node_path.display());
            return Err(Error::Io(e));
        }
    }

    let metadata = config.metadata_path(path);
    match std::fs::remove_dir_all(&metadata) {
        Ok(()) => (),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => log::warn!("remove metadata '{}': {e}", metadata.display()),
    }

    remove_empty_ancestors(&node_path, &config.mountpoint);
    remove_empty_ancestors(&metadata, &config.mountpoint.join(METADATA_DIR));
    Ok(())
}

/// Best-effort rmdir of the ancestor chain of `path`, stopping at (and
/// excluding) `root` or at the first non-empty directory.
fn remove_empty_ancestors(path: &Path, root: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if !dir.starts_with(root) || dir == root {
            break;
        }
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

/// Walk the metadata tree and synthesize a remove request for every device
/// created by a different instance of vdevd. This is how once-mode drops
/// devices that disappeared between runs.
pub fn find_unplugged(config: &Config) -> Result<Vec<DeviceRequest>, Error> {
    let root = config.mountpoint.join(METADATA_DIR);
    let mut stale = Vec::new();
    if root.is_dir() {
        scan_metadata_dir(&root, &root, config, &mut stale)?;
    }
    Ok(stale)
}

fn scan_metadata_dir(
    dir: &Path,
    root: &Path,
    config: &Config,
    stale: &mut Vec<DeviceRequest>,
) -> Result<(), Error> {
    let nonce_file = dir.join(INSTANCE_PARAM);
    if nonce_file.is_file() {
        let nonce = std::fs::read_to_string(&nonce_file)?;
        if nonce.trim_end() != config.instance_nonce {
            let path = dir
                .strip_prefix(root)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            log::info!("device '{path}' is unplugged; removing");
            stale.push(stale_remove_request(&path, dir)?);
        }
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            scan_metadata_dir(&entry.path(), root, config, stale)?;
        }
    }
    Ok(())
}

/// Rebuild a remove request from a device's metadata directory so the
/// remove commands see the same OS parameters the add did.
fn stale_remove_request(path: &str, metadata_dir: &Path) -> Result<DeviceRequest, Error> {
    let mut req = DeviceRequest::new(EventKind::Remove, path);
    for entry in std::fs::read_dir(metadata_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let key = entry.file_name().to_string_lossy().to_string();
        if key == INSTANCE_PARAM {
            continue;
        }
        let value = std::fs::read_to_string(entry.path())?;
        req.add_param(&key, value.trim_end_matches('\n'))?;
    }
    Ok(req)
}
