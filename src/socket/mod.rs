//! Sockets for every forward transport.
//!
//! [`native`] creates blocking sockets on the calling thread, which is what
//! the namespace switch needs. [`Listener`] and [`Connection`] are the async
//! forms the relay works with once the socket exists.

pub mod factory;
pub mod message;
pub mod native;
pub mod seqpacket;

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixDatagram, UnixListener, UnixStream};

use crate::config::Protocol;

pub use factory::SocketFactory;
pub use native::{RawConnection, RawListener, SocketFile};
pub use seqpacket::{SeqpacketListener, SeqpacketStream};

/// A listening socket. Datagram transports have no accept step, so their
/// "listener" is simply the bound socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Udp(UdpSocket),
    Unix(UnixListener),
    Unixgram(UnixDatagram),
    Seqpacket(SeqpacketListener),
}

impl Listener {
    /// Register a freshly created socket with the runtime.
    pub fn from_raw(raw: RawListener) -> io::Result<Self> {
        Ok(match raw {
            RawListener::Tcp(l) => {
                l.set_nonblocking(true)?;
                Listener::Tcp(TcpListener::from_std(l)?)
            }
            RawListener::Udp(s) => {
                s.set_nonblocking(true)?;
                Listener::Udp(UdpSocket::from_std(s)?)
            }
            RawListener::Unix(l) => {
                l.set_nonblocking(true)?;
                Listener::Unix(UnixListener::from_std(l)?)
            }
            RawListener::Unixgram(s) => {
                s.set_nonblocking(true)?;
                Listener::Unixgram(UnixDatagram::from_std(s)?)
            }
            RawListener::Seqpacket(fd) => Listener::Seqpacket(SeqpacketListener::from_fd(fd)?),
        })
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Listener::Tcp(_) => Protocol::Tcp,
            Listener::Udp(_) => Protocol::Udp,
            Listener::Unix(_) => Protocol::Unix,
            Listener::Unixgram(_) => Protocol::Unixgram,
            Listener::Seqpacket(_) => Protocol::Unixpacket,
        }
    }

    /// Bound address for ip transports (resolves port 0).
    pub fn inet_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Udp(s) => s.local_addr().ok(),
            _ => None,
        }
    }

    /// Accept one connection and describe its peer.
    pub async fn accept_connection(&self) -> io::Result<(Connection, String)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Connection::Tcp(stream), peer.to_string()))
            }
            Listener::Unix(l) => {
                let (stream, peer) = l.accept().await?;
                let peer = peer
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unix peer".to_string());
                Ok((Connection::Unix(stream), peer))
            }
            Listener::Seqpacket(l) => {
                let stream = l.accept().await?;
                Ok((Connection::Seqpacket(stream), "seqpacket peer".to_string()))
            }
            Listener::Udp(_) | Listener::Unixgram(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "datagram sockets do not accept connections",
            )),
        }
    }
}

/// A connected socket, one leg of a relay.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Unix(UnixStream),
    Unixgram(UnixDatagram),
    Seqpacket(SeqpacketStream),
}

impl Connection {
    /// Register a freshly connected socket with the runtime.
    pub fn from_raw(raw: RawConnection) -> io::Result<Self> {
        Ok(match raw {
            RawConnection::Tcp(s) => {
                s.set_nonblocking(true)?;
                Connection::Tcp(TcpStream::from_std(s)?)
            }
            RawConnection::Udp(s) => {
                s.set_nonblocking(true)?;
                Connection::Udp(UdpSocket::from_std(s)?)
            }
            RawConnection::Unix(s) => {
                s.set_nonblocking(true)?;
                Connection::Unix(UnixStream::from_std(s)?)
            }
            RawConnection::Unixgram(s) => {
                s.set_nonblocking(true)?;
                Connection::Unixgram(UnixDatagram::from_std(s)?)
            }
            RawConnection::Seqpacket(fd) => Connection::Seqpacket(SeqpacketStream::from_fd(fd)?),
        })
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Connection::Tcp(_) => Protocol::Tcp,
            Connection::Udp(_) => Protocol::Udp,
            Connection::Unix(_) => Protocol::Unix,
            Connection::Unixgram(_) => Protocol::Unixgram,
            Connection::Seqpacket(_) => Protocol::Unixpacket,
        }
    }
}
