//! Passing descriptors to another process over a local datagram socket
//!
//! Wire format: one datagram carrying the number of descriptors (native
//! endian `i32`), then one datagram per descriptor whose payload is the
//! destination descriptor number and whose control data holds exactly one
//! `SCM_RIGHTS` descriptor.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    recv, recvmsg, send, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType,
};
use tracing::debug;

use crate::error::{ProcessError, Result};

const HEADER_LEN: usize = std::mem::size_of::<i32>();

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const SOCKET_FLAGS: SockFlag = SockFlag::SOCK_CLOEXEC;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const SOCKET_FLAGS: SockFlag = SockFlag::empty();

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// A descriptor received together with the number it should get
#[derive(Debug)]
pub struct ReceivedDescriptor {
    pub fd: OwnedFd,
    pub child_fd: RawFd,
}

/// Create the `(parent, child)` ends of a transfer channel.
pub fn channel() -> Result<(OwnedFd, OwnedFd)> {
    let (parent, child) = socketpair(AddressFamily::Unix, SockType::Datagram, None, SOCKET_FLAGS)
        .map_err(ProcessError::system("socketpair"))?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        crate::sys::set_cloexec(parent.as_raw_fd())?;
        crate::sys::set_cloexec(child.as_raw_fd())?;
    }
    Ok((parent, child))
}

/// Send one descriptor, to be installed as `child_fd` on the other side.
pub fn send_fd(socket: BorrowedFd<'_>, fd: BorrowedFd<'_>, child_fd: RawFd) -> Result<()> {
    let payload = child_fd.to_ne_bytes();
    let iov = [IoSlice::new(&payload)];
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];

    retry_eintr(|| sendmsg::<()>(socket.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None))
        .map_err(ProcessError::system("sendmsg"))?;
    debug!(fd = fd.as_raw_fd(), child_fd, "Sent descriptor");
    Ok(())
}

/// Receive one descriptor. `Ok(None)` means the sender went away.
pub fn recv_fd(socket: BorrowedFd<'_>) -> Result<Option<ReceivedDescriptor>> {
    // One spare byte so an oversized payload shows up as a length mismatch.
    let mut payload = [0u8; HEADER_LEN + 1];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    let (bytes, mut received) = {
        let mut iov = [IoSliceMut::new(&mut payload)];
        let msg = loop {
            match recvmsg::<()>(socket.as_raw_fd(), &mut iov, Some(&mut cmsg_buf), RECV_FLAGS) {
                Ok(msg) => break msg,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => return Ok(None),
                Err(errno) => return Err(ProcessError::System { operation: "recvmsg", errno }),
            }
        };

        let mut received = Vec::new();
        let cmsgs = msg
            .cmsgs()
            .map_err(|_| ProcessError::Protocol("control data truncated".to_string()))?;
        for cmsg in cmsgs {
            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                // SAFETY: SCM_RIGHTS hands us freshly allocated descriptors.
                received.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
        (msg.bytes, received)
    };

    if bytes == 0 && received.is_empty() {
        return Ok(None);
    }
    if received.len() != 1 {
        return Err(ProcessError::Protocol(format!(
            "expected exactly one descriptor per message, got {}",
            received.len()
        )));
    }
    if bytes != HEADER_LEN {
        return Err(ProcessError::Protocol(format!(
            "expected a {HEADER_LEN}-byte destination, got {bytes} bytes"
        )));
    }

    let child_fd = RawFd::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if child_fd < 0 {
        return Err(ProcessError::Protocol(format!("invalid destination {child_fd}")));
    }
    let fd = received.remove(0);
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    crate::sys::set_cloexec(fd.as_raw_fd())?;

    Ok(Some(ReceivedDescriptor { fd, child_fd }))
}

/// Sending side of the framed transfer
pub struct FdSender<'a> {
    socket: BorrowedFd<'a>,
}

impl<'a> FdSender<'a> {
    pub fn new(socket: &'a impl AsFd) -> Self {
        Self {
            socket: socket.as_fd(),
        }
    }

    /// Send the count header, then every `(fd, child_fd)` pair.
    pub fn send_all(&self, fds: &[(BorrowedFd<'_>, RawFd)]) -> Result<()> {
        let count = i32::try_from(fds.len())
            .map_err(|_| ProcessError::Protocol("too many descriptors".to_string()))?;
        retry_eintr(|| send(self.socket.as_raw_fd(), &count.to_ne_bytes(), MsgFlags::empty()))
            .map_err(ProcessError::system("send"))?;

        for (fd, child_fd) in fds {
            send_fd(self.socket, *fd, *child_fd)?;
        }
        Ok(())
    }
}

/// Receiving side of the framed transfer
pub struct FdReceiver<'a> {
    socket: BorrowedFd<'a>,
}

impl<'a> FdReceiver<'a> {
    pub fn new(socket: BorrowedFd<'a>) -> Self {
        Self { socket }
    }

    /// Read the count header and exactly that many descriptors.
    ///
    /// A destination requested twice is a protocol error.
    pub fn receive_all(&self) -> Result<Vec<ReceivedDescriptor>> {
        let mut header = [0u8; HEADER_LEN + 1];
        let n = retry_eintr(|| recv(self.socket.as_raw_fd(), &mut header, MsgFlags::empty()))
            .map_err(ProcessError::system("recv"))?;
        if n != HEADER_LEN {
            return Err(ProcessError::Protocol(format!(
                "expected a {HEADER_LEN}-byte count header, got {n} bytes"
            )));
        }
        let count = i32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        let count = usize::try_from(count)
            .map_err(|_| ProcessError::Protocol(format!("invalid descriptor count {count}")))?;

        let mut received: Vec<ReceivedDescriptor> = Vec::with_capacity(count);
        while received.len() < count {
            let Some(desc) = recv_fd(self.socket)? else {
                return Err(ProcessError::Protocol(format!(
                    "channel closed after {} of {count} descriptors",
                    received.len()
                )));
            };
            if received.iter().any(|r| r.child_fd == desc.child_fd) {
                return Err(ProcessError::Protocol(format!(
                    "descriptor {} sent twice",
                    desc.child_fd
                )));
            }
            received.push(desc);
        }
        Ok(received)
    }
}

fn retry_eintr<T>(mut op: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, Write};

    #[test]
    fn test_descriptor_round_trip_across_threads() {
        let (parent, child) = channel().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"shared contents").unwrap();
        file.rewind().unwrap();

        let receiver = std::thread::spawn(move || recv_fd(child.as_fd()).unwrap().unwrap());
        send_fd(parent.as_fd(), file.as_fd(), 7).unwrap();
        let received = receiver.join().unwrap();

        assert_eq!(received.child_fd, 7);
        assert_ne!(received.fd.as_raw_fd(), file.as_raw_fd());
        let mut copy = File::from(received.fd);
        let mut text = String::new();
        copy.read_to_string(&mut text).unwrap();
        assert_eq!(text, "shared contents");
    }

    #[test]
    fn test_framed_transfer() {
        let (parent, child) = channel().unwrap();
        let a = File::open("/dev/null").unwrap();
        let b = File::open("/dev/null").unwrap();

        FdSender::new(&parent)
            .send_all(&[(a.as_fd(), 0), (b.as_fd(), 9)])
            .unwrap();
        let received = FdReceiver::new(child.as_fd()).receive_all().unwrap();

        let dests: Vec<RawFd> = received.iter().map(|r| r.child_fd).collect();
        assert_eq!(dests, vec![0, 9]);
    }

    #[test]
    fn test_duplicate_destination_rejected() {
        let (parent, child) = channel().unwrap();
        let a = File::open("/dev/null").unwrap();

        FdSender::new(&parent)
            .send_all(&[(a.as_fd(), 4), (a.as_fd(), 4)])
            .unwrap();
        let err = FdReceiver::new(child.as_fd()).receive_all().unwrap_err();
        assert!(matches!(err, ProcessError::Protocol(_)));
    }

    #[test]
    fn test_message_without_descriptor_rejected() {
        let (parent, child) = channel().unwrap();
        send(parent.as_raw_fd(), &5i32.to_ne_bytes(), MsgFlags::empty()).unwrap();
        let err = recv_fd(child.as_fd()).unwrap_err();
        assert!(matches!(err, ProcessError::Protocol(_)));
    }
}
