//! Kernel uevent parsing. A message is a contiguous sequence of
//! NUL-terminated KEY=VALUE records, optionally preceded by an
//! `ACTION@DEVPATH` summary record.

use crate::device::{DeviceRequest, EventKind, NodeKind, PATH_UNKNOWN};
use crate::error::Error;

use super::sysfs::Sysfs;

/// Parse a uevent buffer into a device request, filling in device numbers
/// and the subsystem from sysfs when the message itself omits them.
pub fn parse_uevent(buf: &[u8], sysfs: &Sysfs) -> Result<DeviceRequest, Error> {
    let mut req = DeviceRequest::new(EventKind::Invalid, PATH_UNKNOWN);

    let mut major: Option<u64> = None;
    let mut minor: Option<u64> = None;
    let mut devpath: Option<String> = None;
    let mut devname: Option<String> = None;
    let mut subsystem: Option<String> = None;

    let mut records = buf.split(|b| *b == 0).filter(|r| !r.is_empty());

    // the ACTION@DEVPATH header repeats information carried by the
    // KEY=VALUE records; drop it
    let mut first = records.next();
    if let Some(record) = first {
        if record.contains(&b'@') {
            first = records.next();
        }
    }

    let mut line = 0;
    for record in first.into_iter().chain(records) {
        line += 1;
        let text = std::str::from_utf8(record)
            .map_err(|_| Error::Parse(format!("line {line}: not UTF-8")))?;
        let Some((key, value)) = text.split_once('=') else {
            return Err(Error::Parse(format!("line {line}: '{text}'")));
        };

        // ACTION, MAJOR and MINOR are consumed here; every other key,
        // including DEVPATH/DEVNAME/SUBSYSTEM, doubles as an OS parameter
        let mut consumed = false;
        match key {
            "ACTION" => {
                let kind = EventKind::from_uevent(value);
                if kind == EventKind::Invalid {
                    return Err(Error::Parse(format!("invalid ACTION '{value}'")));
                }
                req.set_kind(kind);
                consumed = true;
            }
            "DEVPATH" => devpath = Some(value.to_string()),
            "DEVNAME" => devname = Some(value.to_string()),
            "SUBSYSTEM" => subsystem = Some(value.to_string()),
            "MAJOR" if major.is_none() => {
                major = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| Error::Parse(format!("invalid MAJOR '{value}'")))?,
                );
                consumed = true;
            }
            "MINOR" if minor.is_none() => {
                minor = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| Error::Parse(format!("invalid MINOR '{value}'")))?,
                );
                consumed = true;
            }
            _ => (),
        }

        if !consumed {
            req.add_param(key, value)?;
        }
    }

    if req.kind() == EventKind::Invalid {
        return Err(Error::Parse("no ACTION given".to_string()));
    }

    if major.is_some() != minor.is_some() {
        return Err(Error::Parse(format!(
            "missing device information: major={} minor={}",
            major.is_some(),
            minor.is_some()
        )));
    }

    if let Some(devname) = devname {
        req.set_path(&devname);
    }

    if let Some(devpath) = devpath.as_deref() {
        // the uevent may not carry everything; sysfs usually does
        if major.is_none() {
            if let Some((maj, min)) = sysfs.read_dev_nums(devpath) {
                major = Some(maj);
                minor = Some(min);
            }
        }
        if subsystem.is_none() {
            match sysfs.read_subsystem(devpath) {
                Some(name) => {
                    req.add_param("SUBSYSTEM", &name)?;
                    subsystem = Some(name);
                }
                None => log::warn!("no subsystem found for '{devpath}'"),
            }
        }
    }

    if let (Some(major), Some(minor)) = (major, minor) {
        req.set_dev(major, minor);
        let kind = match subsystem.as_deref() {
            Some(s) if s.eq_ignore_ascii_case("block") => NodeKind::Block,
            _ => NodeKind::Char,
        };
        req.set_node_kind(kind);
    }

    // tell helpers where sysfs is mounted
    req.add_param("SYSFS_MOUNTPOINT", &sysfs.mountpoint().display().to_string())?;

    Ok(req)
}
