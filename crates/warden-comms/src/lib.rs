//! warden-comms: the buffered, message-framed IPC channel
//!
//! One [`Comms`] end sits in the monitor, the peer end in the sandboxed
//! child (and a second pair connects the monitor to the unwinder helper).
//! The protocol is deliberately small:
//!
//! - bare `u32` words for handshakes ([`CLIENT_DONE`]),
//! - length-prefixed JSON frames for structured messages,
//! - a status frame for ok/error replies,
//! - file descriptors passed as `SCM_RIGHTS` ancillary data.
//!
//! The underlying socketpair is kernel-buffered, so the monitor can send
//! the handshake word even while the peer is ptrace-stopped.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use warden_core::{Result, WardenError};

/// Handshake word: the monitor is attached and the child may proceed.
pub const CLIENT_DONE: u32 = 0x7744_0001;

/// Length prefix size: 4 bytes (u32 big-endian)
const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame size; a symbolized stack trace fits with a wide margin.
const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Status reply frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
enum StatusFrame {
    Ok,
    Err(String),
}

/// One end of the comms channel.
pub struct Comms {
    stream: UnixStream,
}

impl Comms {
    /// Create a connected pair. One end stays in the monitor, the other is
    /// inherited by (or handed to) the peer process.
    pub fn pair() -> Result<(Comms, Comms)> {
        let (a, b) = UnixStream::pair()
            .map_err(|e| WardenError::Comms(format!("socketpair failed: {}", e)))?;
        Ok((Comms { stream: a }, Comms { stream: b }))
    }

    /// Wrap an existing stream, e.g. an inherited fd after fork.
    pub fn from_stream(stream: UnixStream) -> Self {
        Comms { stream }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Send a bare word. Used for handshakes only.
    pub fn send_u32(&mut self, value: u32) -> Result<()> {
        self.stream
            .write_all(&value.to_be_bytes())
            .map_err(|e| WardenError::Comms(format!("failed to send word: {}", e)))
    }

    /// Receive a bare word.
    pub fn recv_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.stream
            .read_exact(&mut buf)
            .map_err(|e| WardenError::Comms(format!("failed to receive word: {}", e)))?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Send a structured message as a length-prefixed JSON frame.
    pub fn send_msg<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let payload = serde_json::to_vec(msg)
            .map_err(|e| WardenError::Comms(format!("failed to serialize message: {}", e)))?;
        self.write_frame(&payload)
    }

    /// Receive a structured message.
    pub fn recv_msg<T: DeserializeOwned>(&mut self) -> Result<T> {
        let payload = self.read_frame()?;
        serde_json::from_slice(&payload)
            .map_err(|e| WardenError::Comms(format!("failed to deserialize message: {}", e)))
    }

    /// Send an ok/error status frame.
    pub fn send_status(&mut self, status: std::result::Result<(), String>) -> Result<()> {
        let frame = match status {
            Ok(()) => StatusFrame::Ok,
            Err(msg) => StatusFrame::Err(msg),
        };
        self.send_msg(&frame)
    }

    /// Receive a status frame previously sent with [`Comms::send_status`].
    pub fn recv_status(&mut self) -> Result<std::result::Result<(), String>> {
        match self.recv_msg::<StatusFrame>()? {
            StatusFrame::Ok => Ok(Ok(())),
            StatusFrame::Err(msg) => Ok(Err(msg)),
        }
    }

    /// Pass a file descriptor to the peer via `SCM_RIGHTS`.
    pub fn send_fd(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        use std::mem;

        let raw = fd.as_raw_fd();
        let data: [u8; 1] = [0];
        let iov = libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: 1,
        };

        // SAFETY: the cmsg buffer is sized with CMSG_SPACE for exactly one
        // RawFd and all pointers refer to locals that outlive the call.
        unsafe {
            let cmsg_space = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize;
            let mut cmsg_buf = vec![0u8; cmsg_space];

            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = &iov as *const libc::iovec as *mut libc::iovec;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = cmsg_space as _;

            let cmsg = &mut *(cmsg_buf.as_mut_ptr().cast::<libc::cmsghdr>());
            cmsg.cmsg_level = libc::SOL_SOCKET;
            cmsg.cmsg_type = libc::SCM_RIGHTS;
            cmsg.cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
            std::ptr::copy_nonoverlapping(
                &raw as *const RawFd as *const u8,
                libc::CMSG_DATA(cmsg),
                mem::size_of::<RawFd>(),
            );

            if libc::sendmsg(self.stream.as_raw_fd(), &msg, 0) < 0 {
                return Err(WardenError::Comms(format!(
                    "failed to send fd: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }

    /// Receive a file descriptor from the peer.
    pub fn recv_fd(&mut self) -> Result<OwnedFd> {
        use std::mem;

        let mut data: [u8; 1] = [0];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: 1,
        };

        // SAFETY: as in send_fd; the received cmsg header is validated
        // before the fd payload is read.
        unsafe {
            let cmsg_space = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize;
            let mut cmsg_buf = vec![0u8; cmsg_space];

            let mut msg: libc::msghdr = mem::zeroed();
            msg.msg_iov = &mut iov as *mut libc::iovec;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = cmsg_space as _;

            if libc::recvmsg(self.stream.as_raw_fd(), &mut msg, 0) < 0 {
                return Err(WardenError::Comms(format!(
                    "failed to receive fd: {}",
                    std::io::Error::last_os_error()
                )));
            }

            let cmsg = &*(cmsg_buf.as_ptr().cast::<libc::cmsghdr>());
            if cmsg.cmsg_level != libc::SOL_SOCKET || cmsg.cmsg_type != libc::SCM_RIGHTS {
                return Err(WardenError::Comms(
                    "no SCM_RIGHTS data in received message".to_string(),
                ));
            }

            let mut fd: RawFd = -1;
            std::ptr::copy_nonoverlapping(
                libc::CMSG_DATA(cmsg),
                &mut fd as *mut RawFd as *mut u8,
                mem::size_of::<RawFd>(),
            );
            if fd < 0 {
                return Err(WardenError::Comms("received invalid fd".to_string()));
            }
            Ok(OwnedFd::from_raw_fd(fd))
        }
    }

    fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_MESSAGE_SIZE as usize {
            return Err(WardenError::Comms(format!(
                "message too large: {} bytes (max {})",
                payload.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        let len_bytes = (payload.len() as u32).to_be_bytes();
        self.stream
            .write_all(&len_bytes)
            .map_err(|e| WardenError::Comms(format!("failed to write frame length: {}", e)))?;
        self.stream
            .write_all(payload)
            .map_err(|e| WardenError::Comms(format!("failed to write frame payload: {}", e)))
    }

    fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
        self.stream
            .read_exact(&mut len_bytes)
            .map_err(|e| WardenError::Comms(format!("failed to read frame length: {}", e)))?;
        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_MESSAGE_SIZE {
            return Err(WardenError::Comms(format!(
                "message too large: {} bytes (max {})",
                len, MAX_MESSAGE_SIZE
            )));
        }
        let mut payload = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut payload)
            .map_err(|e| WardenError::Comms(format!("failed to read frame payload: {}", e)))?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        seq: u32,
        text: String,
    }

    #[test]
    fn word_roundtrip() {
        let (mut a, mut b) = Comms::pair().unwrap();
        a.send_u32(CLIENT_DONE).unwrap();
        assert_eq!(b.recv_u32().unwrap(), CLIENT_DONE);
    }

    #[test]
    fn message_roundtrip() {
        let (mut a, mut b) = Comms::pair().unwrap();
        let msg = Ping {
            seq: 7,
            text: "hello".to_string(),
        };
        a.send_msg(&msg).unwrap();
        let back: Ping = b.recv_msg().unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn status_roundtrip() {
        let (mut a, mut b) = Comms::pair().unwrap();
        a.send_status(Ok(())).unwrap();
        assert_eq!(b.recv_status().unwrap(), Ok(()));

        a.send_status(Err("walk failed".to_string())).unwrap();
        assert_eq!(b.recv_status().unwrap(), Err("walk failed".to_string()));
    }

    #[test]
    fn fd_passing() {
        use std::io::{Seek, SeekFrom, Write as _};

        let (mut a, mut b) = Comms::pair().unwrap();
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(b"fd payload").unwrap();
        tmp.seek(SeekFrom::Start(0)).unwrap();

        a.send_fd(tmp.as_fd()).unwrap();
        let received = b.recv_fd().unwrap();

        let mut contents = String::new();
        let mut file = std::fs::File::from(received);
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "fd payload");
    }

    #[test]
    fn oversized_frame_rejected() {
        let (mut a, _b) = Comms::pair().unwrap();
        let huge = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        assert!(a.write_frame(&huge).is_err());
    }
}
