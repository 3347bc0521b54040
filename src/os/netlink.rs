//! The kernel hotplug socket: a NETLINK_KOBJECT_UEVENT datagram socket
//! bound to every multicast group, with peer credentials enabled so that
//! forged userspace messages can be dropped.

use std::io::IoSliceMut;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::cmsg_space;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    bind, recvmsg, setsockopt, socket, sockopt, AddressFamily, ControlMessageOwned, MsgFlags,
    NetlinkAddr, SockFlag, SockProtocol, SockType, UnixCredentials,
};
use nix::unistd::{geteuid, getpid};

use crate::error::Error;

/// Largest uevent payload we accept. Anything at or above this is
/// truncated garbage.
pub const UEVENT_BUF_MAX: usize = 4097;

/// Shortest payload worth parsing.
const UEVENT_MIN_LEN: usize = 32;

/// Kernel receive buffer, forced large so a coldplug storm cannot drop
/// events.
const RECV_BUF_LEN: usize = 128 * 1024 * 1024;

/// Messages from udev's own multicast traffic start with this magic.
const UDEV_MAGIC: &[u8] = b"libudev\0";

pub struct NetlinkSocket {
    fd: OwnedFd,
}

impl NetlinkSocket {
    /// Open, configure and bind the hotplug socket.
    pub fn open() -> Result<NetlinkSocket, Error> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::empty(),
            SockProtocol::NetlinkKObjectUEvent,
        )?;

        // SO_RCVBUFFORCE needs CAP_NET_ADMIN
        if geteuid().is_root() {
            setsockopt(&fd, sockopt::RcvBufForce, &RECV_BUF_LEN)?;
        }
        setsockopt(&fd, sockopt::PassCred, &true)?;

        let addr = NetlinkAddr::new(getpid().as_raw() as u32, u32::MAX);
        bind(fd.as_raw_fd(), &addr)?;

        Ok(NetlinkSocket { fd })
    }

    /// Block until a kernel message arrives and copy it into `buf`.
    /// Returns the payload length, or None when the message should be
    /// ignored (wrong size, wrong sender, or udev traffic).
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        let mut pollfd = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        match poll(&mut pollfd, PollTimeout::NONE) {
            Ok(_) => (),
            Err(nix::errno::Errno::EINTR) => return Err(Error::Interrupted),
            Err(e) => return Err(Error::Errno(e)),
        }

        let (len, credentials, src_pid) = {
            let mut iov = [IoSliceMut::new(&mut buf[..])];
            let mut cmsg_buf = cmsg_space!(UnixCredentials);
            let msg = match recvmsg::<NetlinkAddr>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            ) {
                Ok(msg) => msg,
                Err(nix::errno::Errno::EINTR) => return Err(Error::Interrupted),
                Err(e) => return Err(Error::Errno(e)),
            };

            let mut credentials: Option<UnixCredentials> = None;
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmCredentials(creds) = cmsg {
                    credentials = Some(creds);
                }
            }
            let src_pid = msg.address.as_ref().map(|addr| addr.pid());
            (msg.bytes, credentials, src_pid)
        };

        if len < UEVENT_MIN_LEN || len >= buf.len() {
            log::warn!("netlink message is {len} bytes; ignoring");
            return Ok(None);
        }

        let Some(credentials) = credentials else {
            log::warn!("netlink message has no credentials; ignoring");
            return Ok(None);
        };
        if credentials.uid() != 0 {
            log::warn!("ignoring message from non-root uid {}", credentials.uid());
            return Ok(None);
        }

        if buf[..len].starts_with(UDEV_MAGIC) {
            // udev multicast traffic, not a kernel event
            return Ok(None);
        }

        // kernel messages don't come from userspace
        if let Some(pid) = src_pid {
            if pid > 0 {
                log::warn!("ignoring message from pid {pid}");
                return Ok(None);
            }
        }

        Ok(Some(len))
    }
}
