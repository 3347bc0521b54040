//! The OS event source: a netlink hotplug listener seeded by a sysfs
//! coldplug walk. Coldplug requests are always drained before any live
//! event is surfaced.

pub mod netlink;
pub mod sysfs;
pub mod uevent;

use std::collections::VecDeque;

use crate::config::{Config, QUIRK_DEVICE_EXISTS};
use crate::device::DeviceRequest;
use crate::error::Error;

use netlink::{NetlinkSocket, UEVENT_BUF_MAX};
use sysfs::Sysfs;

/// One step of the event source.
#[derive(Debug)]
pub enum Poll {
    /// A parsed device request
    Event(DeviceRequest),
    /// Nothing usable this time; call next() again
    Retry,
    /// No more events will ever arrive
    Eof,
}

pub struct EventSource {
    netlink: Option<NetlinkSocket>,
    sysfs: Sysfs,
    coldplug: VecDeque<DeviceRequest>,
    flushed: bool,
}

impl EventSource {
    /// Detect platform quirks, open the hotplug socket (unless this run
    /// will exit after coldplug), and seed the coldplug queue from sysfs.
    pub fn new(config: &mut Config) -> Result<EventSource, Error> {
        if sysfs::mountpoint_on_devtmpfs(&config.mountpoint)? {
            log::info!("'{}' is on devtmpfs", config.mountpoint.display());
            config.set_quirk(QUIRK_DEVICE_EXISTS);
        } else {
            log::info!("'{}' is not on devtmpfs", config.mountpoint.display());
        }

        let netlink = if config.once || config.coldplug_only {
            None
        } else {
            Some(NetlinkSocket::open()?)
        };

        let sysfs = Sysfs::discover();
        log::debug!("sysfs mounted at '{}'", sysfs.mountpoint().display());

        let mut source = EventSource {
            netlink,
            sysfs,
            coldplug: VecDeque::new(),
            flushed: false,
        };
        source.seed_coldplug()?;
        Ok(source)
    }

    /// Walk sysfs and synthesize one "add" request per discovered device.
    /// A device whose uevent cannot be parsed is logged and skipped.
    fn seed_coldplug(&mut self) -> Result<(), Error> {
        for uevent_path in self.sysfs.find_device_uevents()? {
            log::debug!("register device '{}'", uevent_path.display());
            let buf = match self.sysfs.synthesize_add_event(&uevent_path) {
                Ok(buf) => buf,
                Err(e) => {
                    log::warn!("read '{}': {e}", uevent_path.display());
                    continue;
                }
            };
            match uevent::parse_uevent(&buf, &self.sysfs) {
                Ok(req) => self.coldplug.push_back(req),
                Err(e) => {
                    log::warn!("parse '{}': {e}", uevent_path.display());
                }
            }
        }
        log::info!("coldplug: {} devices pending", self.coldplug.len());
        Ok(())
    }

    /// True once every coldplug-seeded request has been handed out.
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Yield the next device request: buffered coldplug requests first,
    /// then live netlink traffic. Returns Eof when no live source exists
    /// and the coldplug queue is drained.
    pub fn next(&mut self) -> Result<Poll, Error> {
        if let Some(req) = self.coldplug.pop_front() {
            if self.coldplug.is_empty() {
                self.flushed = true;
            }
            return Ok(Poll::Event(req));
        }
        self.flushed = true;

        let Some(netlink) = &self.netlink else {
            return Ok(Poll::Eof);
        };

        let mut buf = [0u8; UEVENT_BUF_MAX];
        let len = match netlink.recv(&mut buf) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(Poll::Retry),
            Err(Error::Interrupted) => return Ok(Poll::Retry),
            Err(e) => return Err(e),
        };

        match uevent::parse_uevent(&buf[..len], &self.sysfs) {
            Ok(req) => Ok(Poll::Event(req)),
            Err(e) => {
                log::error!("uevent parse error: {e}");
                Ok(Poll::Retry)
            }
        }
    }
}
