//! Blocking socket creation.
//!
//! These run on whatever thread the caller is on, inside whatever network
//! namespace that thread currently has, which is the point: the namespace
//! switch wraps exactly these calls.

use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{self, UnixDatagram, UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{self as sock, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};

use crate::config::Protocol;
use crate::forward::{Endpoint, UnixName};

/// A freshly created listening (or bound, for datagrams) socket.
#[derive(Debug)]
pub enum RawListener {
    Tcp(TcpListener),
    Udp(UdpSocket),
    Unix(UnixListener),
    Unixgram(UnixDatagram),
    Seqpacket(OwnedFd),
}

/// A freshly connected socket.
#[derive(Debug)]
pub enum RawConnection {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Unix(UnixStream),
    Unixgram(UnixDatagram),
    Seqpacket(OwnedFd),
}

/// Bind and listen on `endpoint`. A socket file left behind at a path
/// name is removed first.
pub fn listen(protocol: Protocol, endpoint: &Endpoint) -> io::Result<RawListener> {
    if let Endpoint::Unix(UnixName::Path(path)) = endpoint {
        remove_stale_socket(path)?;
    }
    match (protocol, endpoint) {
        (Protocol::Tcp, Endpoint::Inet { host, port }) => {
            TcpListener::bind((host.as_str(), *port)).map(RawListener::Tcp)
        }
        (Protocol::Udp, Endpoint::Inet { host, port }) => {
            UdpSocket::bind((host.as_str(), *port)).map(RawListener::Udp)
        }
        (Protocol::Unix, Endpoint::Unix(name)) => {
            UnixListener::bind_addr(&unix_addr(name)?).map(RawListener::Unix)
        }
        (Protocol::Unixgram, Endpoint::Unix(name)) => {
            UnixDatagram::bind_addr(&unix_addr(name)?).map(RawListener::Unixgram)
        }
        (Protocol::Unixpacket, Endpoint::Unix(name)) => {
            seqpacket_listen(name).map(RawListener::Seqpacket)
        }
        _ => Err(mismatch(protocol, endpoint)),
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            tracing::debug!("Removing stale socket {}", path.display());
            fs::remove_file(path)
        }
        _ => Ok(()),
    }
}

/// The socket file of a path-bound listener. Dropping it unlinks the file.
#[derive(Debug)]
pub struct SocketFile {
    path: PathBuf,
}

impl SocketFile {
    /// The file a listener on `endpoint` creates, if any.
    pub fn for_endpoint(endpoint: &Endpoint) -> Option<Self> {
        match endpoint {
            Endpoint::Unix(UnixName::Path(path)) => Some(Self { path: path.clone() }),
            _ => None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed socket {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove socket {}: {}", self.path.display(), e),
        }
    }
}

/// Connect to `endpoint`.
pub fn connect(protocol: Protocol, endpoint: &Endpoint) -> io::Result<RawConnection> {
    match (protocol, endpoint) {
        (Protocol::Tcp, Endpoint::Inet { host, port }) => {
            TcpStream::connect((host.as_str(), *port)).map(RawConnection::Tcp)
        }
        (Protocol::Udp, Endpoint::Inet { host, port }) => {
            udp_connect(host, *port).map(RawConnection::Udp)
        }
        (Protocol::Unix, Endpoint::Unix(name)) => {
            UnixStream::connect_addr(&unix_addr(name)?).map(RawConnection::Unix)
        }
        (Protocol::Unixgram, Endpoint::Unix(name)) => {
            unixgram_connect(name).map(RawConnection::Unixgram)
        }
        (Protocol::Unixpacket, Endpoint::Unix(name)) => {
            seqpacket_connect(name).map(RawConnection::Seqpacket)
        }
        _ => Err(mismatch(protocol, endpoint)),
    }
}

fn mismatch(protocol: Protocol, endpoint: &Endpoint) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} cannot use address {}", protocol, endpoint),
    )
}

fn unix_addr(name: &UnixName) -> io::Result<net::SocketAddr> {
    match name {
        UnixName::Abstract(name) => net::SocketAddr::from_abstract_name(name.as_bytes()),
        UnixName::Path(path) => net::SocketAddr::from_pathname(path),
    }
}

fn nix_unix_addr(name: &UnixName) -> io::Result<UnixAddr> {
    let addr = match name {
        UnixName::Abstract(name) => UnixAddr::new_abstract(name.as_bytes()),
        UnixName::Path(path) => UnixAddr::new(path.as_path()),
    };
    addr.map_err(io::Error::from)
}

fn udp_connect(host: &str, port: u16) -> io::Result<UdpSocket> {
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        let local = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        match UdpSocket::bind(local).and_then(|socket| socket.connect(addr).map(|_| socket)) {
            Ok(socket) => return Ok(socket),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "could not resolve to any address")
    }))
}

/// Datagram replies need a return address, so the dialing side binds a
/// unique abstract name first.
fn unixgram_connect(name: &UnixName) -> io::Result<UnixDatagram> {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    let own = format!(
        "nsrelay-{}-{}",
        std::process::id(),
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    );
    let socket = UnixDatagram::bind_addr(&net::SocketAddr::from_abstract_name(own.as_bytes())?)?;
    socket.connect_addr(&unix_addr(name)?)?;
    Ok(socket)
}

fn seqpacket_listen(name: &UnixName) -> io::Result<OwnedFd> {
    let addr = nix_unix_addr(name)?;
    let fd = sock::socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )?;
    sock::bind(fd.as_raw_fd(), &addr)?;
    sock::listen(&fd, Backlog::MAXCONN)?;
    Ok(fd)
}

fn seqpacket_connect(name: &UnixName) -> io::Result<OwnedFd> {
    let addr = nix_unix_addr(name)?;
    let fd = sock::socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    sock::connect(fd.as_raw_fd(), &addr)?;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn inet(host: &str, port: u16) -> Endpoint {
        Endpoint::Inet {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_tcp_listen_and_connect() {
        let RawListener::Tcp(listener) = listen(Protocol::Tcp, &inet("127.0.0.1", 0)).unwrap() else {
            panic!("expected tcp listener");
        };
        let port = listener.local_addr().unwrap().port();

        let RawConnection::Tcp(mut client) = connect(Protocol::Tcp, &inet("127.0.0.1", port)).unwrap()
        else {
            panic!("expected tcp stream");
        };
        let (mut server, _) = listener.accept().unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_stale_socket_path_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let endpoint = Endpoint::Unix(UnixName::Path(path.clone()));

        let first = listen(Protocol::Unix, &endpoint).unwrap();
        drop(first);
        assert!(path.exists());

        let RawListener::Unix(_listener) = listen(Protocol::Unix, &endpoint).unwrap() else {
            panic!("expected unix listener");
        };
        assert!(connect(Protocol::Unix, &endpoint).is_ok());
    }

    #[test]
    fn test_regular_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        fs::write(&path, b"data").unwrap();

        let err = listen(Protocol::Unixgram, &Endpoint::Unix(UnixName::Path(path.clone()))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert_eq!(fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn test_socket_file_unlinks_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(UnixName::Path(dir.path().join("relay.sock")));
        let _listener = listen(Protocol::Unix, &endpoint).unwrap();

        let file = SocketFile::for_endpoint(&endpoint).unwrap();
        let path = file.path().to_path_buf();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());

        assert!(SocketFile::for_endpoint(&inet("127.0.0.1", 80)).is_none());
        let abstract_name = UnixName::Abstract("nsrelay-native-file".to_string());
        assert!(SocketFile::for_endpoint(&Endpoint::Unix(abstract_name)).is_none());
    }

    #[test]
    fn test_abstract_unix_listen_and_connect() {
        let name = UnixName::Abstract(format!("nsrelay-native-test-{}", std::process::id()));
        let endpoint = Endpoint::Unix(name);
        let RawListener::Unix(listener) = listen(Protocol::Unix, &endpoint).unwrap() else {
            panic!("expected unix listener");
        };
        let RawConnection::Unix(mut client) = connect(Protocol::Unix, &endpoint).unwrap() else {
            panic!("expected unix stream");
        };
        let (mut server, _) = listener.accept().unwrap();
        server.write_all(b"pong").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_unixgram_dial_gets_reply_address() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(UnixName::Path(dir.path().join("gram.sock")));
        let RawListener::Unixgram(server) = listen(Protocol::Unixgram, &endpoint).unwrap() else {
            panic!("expected unix datagram socket");
        };
        let RawConnection::Unixgram(client) = connect(Protocol::Unixgram, &endpoint).unwrap() else {
            panic!("expected unix datagram socket");
        };

        client.send(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(from.as_abstract_name().is_some());

        server.send_to_addr(b"back", &from).unwrap();
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"back");
    }

    #[test]
    fn test_seqpacket_listen_and_connect() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(UnixName::Path(dir.path().join("seq.sock")));
        assert!(matches!(
            listen(Protocol::Unixpacket, &endpoint).unwrap(),
            RawListener::Seqpacket(_)
        ));
        assert!(matches!(
            connect(Protocol::Unixpacket, &endpoint).unwrap(),
            RawConnection::Seqpacket(_)
        ));
    }

    #[test]
    fn test_protocol_endpoint_mismatch() {
        let err = listen(Protocol::Tcp, &Endpoint::Unix(UnixName::Abstract("x".into()))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_connect_refused() {
        let RawListener::Tcp(listener) = listen(Protocol::Tcp, &inet("127.0.0.1", 0)).unwrap() else {
            panic!("expected tcp listener");
        };
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(connect(Protocol::Tcp, &inet("127.0.0.1", port)).is_err());
    }
}
