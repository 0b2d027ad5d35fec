//! Async unix `SOCK_SEQPACKET` sockets.
//!
//! tokio has no seqpacket type, so these wrap the raw descriptor in an
//! [`AsyncFd`] and drive `accept4`/`recv`/`send` on readiness. Message
//! boundaries are preserved: one `recv` returns one message, and
//! [`SeqpacketStream::recv_message`] grows its buffer so the message is whole.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use nix::sys::socket::{self as sock, AddressFamily, MsgFlags, Shutdown, SockFlag, SockType};
use tokio::io::unix::AsyncFd;

use super::message::reserve_next_message;
use super::native::{self, RawConnection};
use crate::config::Protocol;
use crate::forward::{Endpoint, UnixName};

/// A listening seqpacket socket.
#[derive(Debug)]
pub struct SeqpacketListener {
    fd: AsyncFd<OwnedFd>,
}

impl SeqpacketListener {
    /// Wrap a bound, listening, non-blocking descriptor.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    pub async fn accept(&self) -> io::Result<SeqpacketStream> {
        loop {
            let mut guard = self.fd.readable().await?;
            let accepted = guard.try_io(|fd| {
                sock::accept4(
                    fd.as_raw_fd(),
                    SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
                )
                .map_err(io::Error::from)
            });
            if let Ok(result) = accepted {
                // SAFETY: accept4 returned a fresh descriptor that nothing else owns.
                let fd = unsafe { OwnedFd::from_raw_fd(result?) };
                return SeqpacketStream::from_fd(fd);
            }
        }
    }
}

/// A connected seqpacket socket. Clones share the descriptor, so one task
/// can receive while another sends.
#[derive(Debug, Clone)]
pub struct SeqpacketStream {
    fd: Arc<AsyncFd<OwnedFd>>,
}

impl SeqpacketStream {
    /// Wrap a connected, non-blocking descriptor.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            fd: Arc::new(AsyncFd::new(fd)?),
        })
    }

    /// Connect from the current namespace.
    pub fn connect(name: &UnixName) -> io::Result<Self> {
        match native::connect(Protocol::Unixpacket, &Endpoint::Unix(name.clone()))? {
            RawConnection::Seqpacket(fd) => Self::from_fd(fd),
            other => Err(io::Error::other(format!("expected a seqpacket socket, got {:?}", other))),
        }
    }

    /// An anonymous connected pair.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = sock::socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )?;
        Ok((Self::from_fd(a)?, Self::from_fd(b)?))
    }

    /// Receive one message. `Ok(0)` means the peer closed.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let received = guard.try_io(|fd| {
                sock::recv(fd.as_raw_fd(), &mut *buf, MsgFlags::empty()).map_err(io::Error::from)
            });
            if let Ok(result) = received {
                return result;
            }
        }
    }

    /// Receive one whole message, growing `buf` to fit it. `Ok(0)` means
    /// the peer closed.
    pub async fn recv_message(&self, buf: &mut Vec<u8>) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let received = guard.try_io(|fd| {
                reserve_next_message(fd.as_raw_fd(), buf)?;
                sock::recv(fd.as_raw_fd(), buf.as_mut_slice(), MsgFlags::empty()).map_err(io::Error::from)
            });
            if let Ok(result) = received {
                return result;
            }
        }
    }

    /// Send one message.
    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            let sent = guard.try_io(|fd| {
                sock::send(fd.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL).map_err(io::Error::from)
            });
            if let Ok(result) = sent {
                return result;
            }
        }
    }

    /// Signal end-of-input to the peer.
    pub fn shutdown_write(&self) -> io::Result<()> {
        sock::shutdown(self.fd.as_raw_fd(), Shutdown::Write).map_err(io::Error::from)
    }
}
