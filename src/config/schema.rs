//! Configuration schema for forward descriptors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;
use crate::forward::Forward;

/// Forwarding direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Out of the sandbox: listen inside, dial from the caller's namespace.
    #[serde(alias = "out-of-sandbox")]
    Client,
    /// Into the sandbox: listen in the caller's namespace, dial inside.
    #[serde(alias = "into-sandbox")]
    Server,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Client => "client",
            Direction::Server => "server",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" | "out-of-sandbox" => Ok(Direction::Client),
            "server" | "into-sandbox" => Ok(Direction::Server),
            other => Err(ConfigError::ParseError(format!("unknown forward type '{}'", other))),
        }
    }
}

/// Transport protocol of a forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    #[serde(alias = "unix-stream")]
    Unix,
    #[serde(alias = "unix-datagram")]
    Unixgram,
    #[serde(alias = "unix-seqpacket")]
    Unixpacket,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Unix => "unix",
            Protocol::Unixgram => "unixgram",
            Protocol::Unixpacket => "unixpacket",
        }
    }

    /// IP transports carry a port; unix transports carry a socket name.
    pub fn is_ip(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    /// Datagram transports have no accept step and no end-of-stream.
    pub fn is_datagram(&self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Unixgram)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "unix" | "unix-stream" => Ok(Protocol::Unix),
            "unixgram" | "unix-datagram" => Ok(Protocol::Unixgram),
            "unixpacket" | "unix-seqpacket" => Ok(Protocol::Unixpacket),
            other => Err(ConfigError::ParseError(format!("unknown protocol '{}'", other))),
        }
    }
}

/// One configured forward, as written in the settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// One of client, server. Empty means the slot is disabled.
    #[serde(
        rename = "type",
        alias = "direction",
        default,
        deserialize_with = "empty_as_none"
    )]
    pub direction: Option<Direction>,

    /// One of tcp, udp, unix, unixgram, unixpacket.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub proto: Option<Protocol>,

    /// TCP or UDP port number.
    #[serde(default)]
    pub port: Option<u16>,

    /// Optional destination address.
    /// In client mode: the outer address to connect to.
    /// In server mode: the outer address to bind to.
    /// For unix sockets this is the socket name, `@` prefix for abstract.
    #[serde(default)]
    pub destination: String,
}

impl ForwardConfig {
    /// Shorthand for an enabled forward.
    pub fn new(direction: Direction, proto: Protocol, port: Option<u16>, destination: &str) -> Self {
        Self {
            direction: Some(direction),
            proto: Some(proto),
            port,
            destination: destination.to_string(),
        }
    }

    /// Disabled slots are skipped silently during setup.
    pub fn is_enabled(&self) -> bool {
        self.direction.is_some()
    }
}

impl fmt::Display for ForwardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{type:{} proto:{} port:{} destination:{}}}",
            self.direction.map(|d| d.as_str()).unwrap_or(""),
            self.proto.map(|p| p.as_str()).unwrap_or(""),
            self.port.unwrap_or(0),
            self.destination
        )
    }
}

/// Parses `TYPE,PROTO,PORT[,DESTINATION]`, e.g. `client,tcp,8080` or
/// `server,unix,,@svc`.
impl FromStr for ForwardConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidForward {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.splitn(4, ',').map(str::trim).collect();
        if parts.len() < 3 {
            return Err(invalid("expected TYPE,PROTO,PORT[,DESTINATION]"));
        }

        let direction = parts[0].parse::<Direction>().map_err(|e| invalid(&e.to_string()))?;
        let proto = parts[1].parse::<Protocol>().map_err(|e| invalid(&e.to_string()))?;
        let port = match parts[2] {
            "" => None,
            p => Some(p.parse::<u16>().map_err(|_| invalid("port is not a number"))?),
        };
        let destination = parts.get(3).copied().unwrap_or("");

        Ok(ForwardConfig::new(direction, proto, port, destination))
    }
}

fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Ordered forward list; disabled slots keep their index.
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

impl RelayConfig {
    /// Check that every enabled forward resolves to a local and remote address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, forward) in self.forwards.iter().enumerate() {
            Forward::resolve(forward).map_err(|e| ConfigError::InvalidSlot {
                index,
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    /// Number of forwards that will actually start.
    pub fn enabled_count(&self) -> usize {
        self.forwards.iter().filter(|f| f.is_enabled()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_error_format() {
        let config = ForwardConfig::new(Direction::Client, Protocol::Tcp, Some(1234), "127.0.0.1");
        assert_eq!(
            config.to_string(),
            "{type:client proto:tcp port:1234 destination:127.0.0.1}"
        );

        let disabled = ForwardConfig::default();
        assert_eq!(disabled.to_string(), "{type: proto: port:0 destination:}");
    }

    #[test]
    fn test_deserialize_empty_type_is_disabled() {
        let config: ForwardConfig =
            serde_json::from_str(r#"{"type": "", "proto": "tcp", "port": 80}"#).unwrap();
        assert!(!config.is_enabled());
        assert_eq!(config.proto, Some(Protocol::Tcp));

        let config: ForwardConfig = serde_json::from_str(r#"{"proto": "udp"}"#).unwrap();
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_deserialize_aliases() {
        let config: ForwardConfig = serde_json::from_str(
            r#"{"direction": "into-sandbox", "proto": "unix-seqpacket", "destination": "@svc"}"#,
        )
        .unwrap();
        assert_eq!(config.direction, Some(Direction::Server));
        assert_eq!(config.proto, Some(Protocol::Unixpacket));
        assert_eq!(config.destination, "@svc");
    }

    #[test]
    fn test_deserialize_unknown_protocol_fails() {
        let result: Result<ForwardConfig, _> =
            serde_json::from_str(r#"{"type": "client", "proto": "sctp"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_inline_forward() {
        let config: ForwardConfig = "client,tcp,8080".parse().unwrap();
        assert_eq!(config, ForwardConfig::new(Direction::Client, Protocol::Tcp, Some(8080), ""));

        let config: ForwardConfig = "server,unix,,@svc".parse().unwrap();
        assert_eq!(config.port, None);
        assert_eq!(config.destination, "@svc");

        // Destination keeps its own commas and colons.
        let config: ForwardConfig = "client,udp,53,::1".parse().unwrap();
        assert_eq!(config.destination, "::1");

        assert!("client,tcp".parse::<ForwardConfig>().is_err());
        assert!("sideways,tcp,80".parse::<ForwardConfig>().is_err());
        assert!("client,tcp,http".parse::<ForwardConfig>().is_err());
    }

    #[test]
    fn test_validate_reports_slot() {
        let config = RelayConfig {
            forwards: vec![
                ForwardConfig::default(),
                ForwardConfig::new(Direction::Client, Protocol::Tcp, None, ""),
            ],
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSlot { index: 1, .. }));
        assert_eq!(config.enabled_count(), 1);
    }

    #[test]
    fn test_protocol_classes() {
        assert!(Protocol::Tcp.is_ip());
        assert!(Protocol::Udp.is_datagram());
        assert!(Protocol::Unixgram.is_datagram());
        assert!(!Protocol::Unixpacket.is_datagram());
        assert!(!Protocol::Unix.is_ip());
    }
}
