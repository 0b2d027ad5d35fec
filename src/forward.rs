//! Forward descriptor resolution.
//!
//! A [`ForwardConfig`] is string-typed and may be incomplete. Resolving it
//! yields a [`Forward`] whose local and remote endpoints, and the namespace
//! each side lives in, are fixed before any socket is touched:
//!
//! | type   | transport | local (listen)                 | remote (dial)                  |
//! |--------|-----------|--------------------------------|--------------------------------|
//! | client | ip        | `127.0.0.1:port`, sandbox      | `destination:port`, caller     |
//! | client | unix      | `@destination`, sandbox        | `destination`, caller          |
//! | server | ip        | `destination:port`, caller     | `127.0.0.1:port`, sandbox      |
//! | server | unix      | `destination`, caller          | `destination`, sandbox         |

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use crate::config::{Direction, ForwardConfig, Protocol};
use crate::error::ConfigError;

/// Address used when no destination is configured for an ip transport.
pub const LOOPBACK: &str = "127.0.0.1";

/// Longest name that fits in `sockaddr_un.sun_path`, minus the terminator.
const MAX_UNIX_NAME: usize = 107;

/// Which network namespace a socket operation runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The relay's own ambient namespace.
    Caller,
    /// The sandboxed process's namespace.
    Sandbox,
}

/// Unix socket name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnixName {
    /// Linux abstract namespace; bound to the socket's network namespace.
    Abstract(String),
    /// Filesystem path.
    Path(PathBuf),
}

impl UnixName {
    /// `@name` is abstract, anything else a filesystem path.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        let parsed = match name.strip_prefix('@') {
            Some(abstract_name) => UnixName::Abstract(abstract_name.to_string()),
            None => UnixName::Path(PathBuf::from(name)),
        };
        parsed.check(name)?;
        Ok(parsed)
    }

    fn check(&self, original: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            endpoint: original.to_string(),
            reason: reason.to_string(),
        };
        let len = match self {
            UnixName::Abstract(name) if name.is_empty() => {
                return Err(invalid("abstract socket name is empty"))
            }
            UnixName::Abstract(name) => name.len(),
            UnixName::Path(path) => path.as_os_str().len(),
        };
        if len > MAX_UNIX_NAME {
            return Err(invalid("socket name is too long"));
        }
        Ok(())
    }
}

impl fmt::Display for UnixName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnixName::Abstract(name) => write!(f, "@{}", name),
            UnixName::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A resolved socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Inet { host: String, port: u16 },
    Unix(UnixName),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Endpoint::Inet { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix(name) => name.fmt(f),
        }
    }
}

/// A forward whose addresses and scopes are fully determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub direction: Direction,
    pub protocol: Protocol,
    /// Address the forward listens on.
    pub local: Endpoint,
    /// Address each relayed connection is dialed to.
    pub remote: Endpoint,
}

impl Forward {
    /// Resolve a configured forward. Disabled slots resolve to `None`.
    pub fn resolve(config: &ForwardConfig) -> Result<Option<Self>, ConfigError> {
        let Some(direction) = config.direction else {
            return Ok(None);
        };
        let protocol = config.proto.ok_or(ConfigError::MissingProtocol)?;

        let (local, remote) = if protocol.is_ip() {
            let port = match config.port {
                Some(port) if port != 0 => port,
                _ => return Err(ConfigError::MissingPort(protocol.as_str())),
            };
            let destination = inet_host(&config.destination)?;
            let loopback = Endpoint::Inet {
                host: LOOPBACK.to_string(),
                port,
            };
            let outer = Endpoint::Inet {
                host: destination,
                port,
            };
            match direction {
                Direction::Client => (loopback, outer),
                Direction::Server => (outer, loopback),
            }
        } else {
            if config.destination.is_empty() {
                return Err(ConfigError::MissingEndpoint(protocol.as_str()));
            }
            let named = UnixName::parse(&config.destination)?;
            match direction {
                Direction::Client => {
                    let inner = config
                        .destination
                        .strip_prefix('@')
                        .unwrap_or(&config.destination);
                    let inner = UnixName::Abstract(inner.to_string());
                    inner.check(&config.destination)?;
                    (Endpoint::Unix(inner), Endpoint::Unix(named))
                }
                Direction::Server => (Endpoint::Unix(named.clone()), Endpoint::Unix(named)),
            }
        };

        Ok(Some(Forward {
            direction,
            protocol,
            local,
            remote,
        }))
    }

    /// Namespace the listener is created in.
    pub fn listen_scope(&self) -> Scope {
        match self.direction {
            Direction::Client => Scope::Sandbox,
            Direction::Server => Scope::Caller,
        }
    }

    /// Namespace each peer leg is dialed from.
    pub fn dial_scope(&self) -> Scope {
        match self.direction {
            Direction::Client => Scope::Caller,
            Direction::Server => Scope::Sandbox,
        }
    }
}

impl fmt::Display for Forward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{proto}://{} --> {proto}://{}",
            self.local,
            self.remote,
            proto = self.protocol
        )
    }
}

/// Empty destinations default to loopback; a destination must not carry its own port.
fn inet_host(destination: &str) -> Result<String, ConfigError> {
    let host = destination.trim();
    if host.is_empty() {
        return Ok(LOOPBACK.to_string());
    }

    let invalid = |reason: &str| ConfigError::InvalidEndpoint {
        endpoint: destination.to_string(),
        reason: reason.to_string(),
    };

    if host.parse::<SocketAddr>().is_ok() {
        return Err(invalid("destination must not include a port"));
    }
    let unbracketed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if unbracketed.parse::<IpAddr>().is_ok() {
        return Ok(unbracketed.to_string());
    }
    if host.contains(|c: char| c.is_whitespace() || c == '/' || c == ':') {
        return Err(invalid("not a host name or address"));
    }
    Ok(host.to_string())
}
