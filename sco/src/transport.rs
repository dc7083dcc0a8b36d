//! Packet transport under a SCO session.
//!
//! [`ScoTransport`] is what the session reads from and writes to: one call
//! moves one HCI SCO packet. [`ScoSocket`] is the real thing, a connected
//! non-blocking Bluetooth SCO socket handed over by the profile layer.
//! Tests and the replay tool provide their own implementations.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::debug;

/// `SOL_BLUETOOTH` socket level.
pub const SOL_BLUETOOTH: libc::c_int = 274;

/// Ancillary message type carrying the per-packet receive status.
pub const BT_SCM_PKT_STATUS: libc::c_int = 0x03;

/// Socket option enabling [`BT_SCM_PKT_STATUS`] delivery.
pub const BT_PKT_STATUS: libc::c_int = 16;

/// HCI receive status of one SCO packet.
///
/// `0x00` correctly received, `0x01` possibly invalid, `0x02` no data,
/// `0x03` partially lost. Anything non-zero is treated as bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketStatus(pub u8);

impl PacketStatus {
    // ---
    pub const GOOD: PacketStatus = PacketStatus(0);

    pub fn is_bad(self) -> bool {
        self.0 > 0
    }
}

/// One SCO packet per call in each direction.
pub trait ScoTransport: Send {
    // ---
    /// Descriptor to poll, if this transport has one.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Sends one packet. Returns the bytes the link accepted.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Receives one packet into `buf`. Returns its length.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Receives one packet together with its link-layer status.
    fn recv_with_status(&mut self, buf: &mut [u8]) -> io::Result<(usize, PacketStatus)> {
        // ---
        Ok((self.recv(buf)?, PacketStatus::GOOD))
    }
}

/// Sends `buf`, reissuing the call while it is interrupted.
pub(crate) fn send_retrying(transport: &mut dyn ScoTransport, buf: &[u8]) -> io::Result<usize> {
    // ---
    loop {
        match transport.send(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

pub(crate) fn recv_retrying(transport: &mut dyn ScoTransport, buf: &mut [u8]) -> io::Result<usize> {
    // ---
    loop {
        match transport.recv(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

pub(crate) fn recv_with_status_retrying(
    transport: &mut dyn ScoTransport,
    buf: &mut [u8],
) -> io::Result<(usize, PacketStatus)> {
    // ---
    loop {
        match transport.recv_with_status(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Connected SCO socket.
///
/// The descriptor is owned and closed on drop. The profile layer is
/// expected to have set `O_NONBLOCK` before handing it over.
#[derive(Debug)]
pub struct ScoSocket {
    // ---
    fd: OwnedFd,
}

impl ScoSocket {
    // ---
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Takes ownership of a raw descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be an open socket not owned by anything else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        // ---
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    /// Asks the kernel to attach packet status to every received packet.
    pub fn enable_packet_status(&self) -> io::Result<()> {
        // ---
        let on: libc::c_int = 1;
        // SAFETY: valid fd, option value points at a live c_int of the given size.
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                SOL_BLUETOOTH,
                BT_PKT_STATUS,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Puts the socket in non-blocking mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        // ---
        let fd = self.fd.as_raw_fd();
        // SAFETY: fcntl on an owned, open descriptor.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above.
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for ScoSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl ScoTransport for ScoSocket {
    // ---
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        // ---
        // SAFETY: buf is a valid readable region of buf.len() bytes.
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // ---
        // SAFETY: buf is a valid writable region of buf.len() bytes.
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn recv_with_status(&mut self, buf: &mut [u8]) -> io::Result<(usize, PacketStatus)> {
        // ---
        // Room for one cmsg carrying an int, u64-aligned.
        let mut control = [0u64; 8];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        // SAFETY: zeroed msghdr is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = mem::size_of_val(&control) as _;

        // SAFETY: msg points at live iov and control buffers for the call.
        let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut status = PacketStatus::GOOD;
        // SAFETY: walking the control buffer the kernel just filled, bounded
        // by msg_controllen through CMSG_NXTHDR.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let hdr = &*cmsg;
                if hdr.cmsg_level == SOL_BLUETOOTH && hdr.cmsg_type == BT_SCM_PKT_STATUS {
                    let data_len = hdr.cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    if data_len >= 1 {
                        status = PacketStatus(*libc::CMSG_DATA(cmsg));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        if status.is_bad() {
            debug!(status = status.0, len = n, "SCO packet status");
        }

        Ok((n as usize, status))
    }
}
