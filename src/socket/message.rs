//! Whole-message I/O for unix packet sockets.
//!
//! Unix datagram and seqpacket messages can be as large as the sender's
//! socket buffer, so a fixed receive buffer would silently cut them short.
//! Every receive here peeks at the pending message's real length first
//! (`MSG_PEEK | MSG_TRUNC`) and grows the buffer to fit before reading it.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use nix::sys::socket::{self as sock, MsgFlags, UnixAddr};
use tokio::io::Interest;
use tokio::net::UnixDatagram;

/// Grow `buf` to hold the next pending message on `fd`.
pub(crate) fn reserve_next_message(fd: RawFd, buf: &mut Vec<u8>) -> io::Result<()> {
    let len = sock::recv(fd, buf.as_mut_slice(), MsgFlags::MSG_PEEK | MsgFlags::MSG_TRUNC)?;
    if len > buf.len() {
        buf.resize(len, 0);
    }
    Ok(())
}

/// True if replies can be addressed to `addr`. Unbound senders cannot be.
pub fn is_reachable(addr: &UnixAddr) -> bool {
    addr.path().is_some() || addr.as_abstract().is_some()
}

/// Receive one whole datagram and its sender's address.
pub async fn recv_from(socket: &UnixDatagram, buf: &mut Vec<u8>) -> io::Result<(usize, Option<UnixAddr>)> {
    loop {
        socket.readable().await?;
        let received = socket.try_io(Interest::READABLE, || {
            let fd = socket.as_raw_fd();
            reserve_next_message(fd, buf)?;
            sock::recvfrom::<UnixAddr>(fd, buf.as_mut_slice()).map_err(io::Error::from)
        });
        match received {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            other => return other,
        }
    }
}

/// Receive one whole datagram on a connected socket.
pub async fn recv(socket: &UnixDatagram, buf: &mut Vec<u8>) -> io::Result<usize> {
    recv_from(socket, buf).await.map(|(n, _)| n)
}

/// Send one datagram to `addr`, abstract or pathname.
pub async fn send_to(socket: &UnixDatagram, buf: &[u8], addr: &UnixAddr) -> io::Result<usize> {
    loop {
        socket.writable().await?;
        let sent = socket.try_io(Interest::WRITABLE, || {
            sock::sendto(socket.as_raw_fd(), buf, addr, MsgFlags::MSG_NOSIGNAL).map_err(io::Error::from)
        });
        match sent {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            other => return other,
        }
    }
}
