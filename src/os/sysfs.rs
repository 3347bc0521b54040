//! Sysfs access: the coldplug device walk and the attribute reads that
//! backfill uevents, plus /proc/mounts inspection.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::error::Error;

const PROC_MOUNTS: &str = "/proc/mounts";

/// Handle to a mounted sysfs tree.
#[derive(Debug, Clone)]
pub struct Sysfs {
    mountpoint: PathBuf,
}

impl Sysfs {
    /// Locate sysfs via /proc/mounts. It should be at /sys, but you never
    /// know.
    pub fn discover() -> Sysfs {
        let mountpoint = std::fs::read_to_string(PROC_MOUNTS)
            .ok()
            .and_then(|mounts| fs_mounts(&mounts, "sysfs").into_iter().next())
            .unwrap_or_else(|| PathBuf::from("/sys"));
        Sysfs { mountpoint }
    }

    pub fn at(mountpoint: PathBuf) -> Sysfs {
        Sysfs { mountpoint }
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Resolve a kernel devpath (leading slash, relative to sysfs) to a
    /// real path, optionally appending an attribute name.
    fn devpath_attr(&self, devpath: &str, attr: &str) -> PathBuf {
        self.mountpoint
            .join(devpath.trim_start_matches('/'))
            .join(attr)
    }

    /// Read a device's major/minor numbers from its `dev` attribute
    /// (`MAJOR:MINOR\n`).
    pub fn read_dev_nums(&self, devpath: &str) -> Option<(u64, u64)> {
        let contents = std::fs::read_to_string(self.devpath_attr(devpath, "dev")).ok()?;
        let (major, minor) = contents.trim_end().split_once(':')?;
        Some((major.parse().ok()?, minor.parse().ok()?))
    }

    /// Read a device's subsystem from the basename of its `subsystem`
    /// symlink.
    pub fn read_subsystem(&self, devpath: &str) -> Option<String> {
        let target = std::fs::read_link(self.devpath_attr(devpath, "subsystem")).ok()?;
        Some(target.file_name()?.to_string_lossy().to_string())
    }

    /// Walk `<sysfs>/devices` breadth-first and collect the uevent file of
    /// every directory that has one.
    pub fn find_device_uevents(&self) -> Result<Vec<PathBuf>, Error> {
        let root = self.mountpoint.join("devices");
        let mut uevents = Vec::new();
        let mut frontier = VecDeque::new();
        frontier.push_back(root);

        while let Some(dir) = frontier.pop_front() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!("read_dir('{}'): {e}", dir.display());
                    continue;
                }
            };
            for entry in entries {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    frontier.push_back(entry.path());
                } else if file_type.is_file() && entry.file_name() == "uevent" {
                    uevents.push(entry.path());
                }
            }
        }

        Ok(uevents)
    }

    /// Read a uevent file and synthesize a netlink-shaped buffer from it:
    /// newlines become NULs, and ACTION/DEVPATH records are appended.
    pub fn synthesize_add_event(&self, uevent_path: &Path) -> Result<Vec<u8>, Error> {
        let mut buf = std::fs::read(uevent_path)?;
        for byte in buf.iter_mut() {
            if *byte == b'\n' {
                *byte = 0;
            }
        }
        if buf.last() != Some(&0) {
            buf.push(0);
        }

        let device_dir = uevent_path.parent().unwrap_or(Path::new("/"));
        let devpath = device_dir
            .strip_prefix(&self.mountpoint)
            .map_err(|_| {
                Error::InvalidState(format!(
                    "'{}' is outside sysfs",
                    uevent_path.display()
                ))
            })?;

        buf.extend_from_slice(b"ACTION=add\0");
        buf.extend_from_slice(format!("DEVPATH=/{}\0", devpath.display()).as_bytes());
        Ok(buf)
    }
}

/// Extract the mountpoints of every mount of the given filesystem type from
/// /proc/mounts-formatted contents.
pub fn fs_mounts(mounts: &str, fstype: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        let (Some(mountpoint), Some(kind)) = (fields.next(), fields.next()) else {
            continue;
        };
        if kind == fstype {
            found.push(PathBuf::from(mountpoint));
        }
    }
    found
}

/// Returns true if `path` equals `base` or lies underneath it.
pub fn path_within(base: &Path, path: &Path) -> bool {
    path.starts_with(base)
}

/// Returns true if the mountpoint's canonical path lies under a devtmpfs
/// mount, in which case the kernel creates device nodes for us.
pub fn mountpoint_on_devtmpfs(mountpoint: &Path) -> Result<bool, Error> {
    let mounts = std::fs::read_to_string(PROC_MOUNTS)?;
    let real_mountpoint = mountpoint
        .canonicalize()
        .unwrap_or_else(|_| mountpoint.to_path_buf());

    for devtmpfs in fs_mounts(&mounts, "devtmpfs") {
        let real_devtmpfs = devtmpfs.canonicalize().unwrap_or(devtmpfs);
        if path_within(&real_devtmpfs, &real_mountpoint) {
            return Ok(true);
        }
    }
    Ok(false)
}
