//! Error types for the namespace relay.

use std::io;

use thiserror::Error;

/// Main error type for the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Namespace(#[from] NamespaceError),

    #[error("Socket: {0}")]
    Io(#[from] io::Error),

    #[error("Forward {0} is already running")]
    AlreadyRunning(usize),

    /// A failure tied to one configured forward. The descriptor text is
    /// embedded verbatim so the caller can tell which slot failed.
    #[error("{forward}, {source}")]
    Forward {
        forward: String,
        source: Box<RelayError>,
    },
}

impl RelayError {
    /// Annotate an error with the descriptor that triggered it.
    pub fn for_forward(forward: impl ToString, source: RelayError) -> Self {
        RelayError::Forward {
            forward: forward.to_string(),
            source: Box::new(source),
        }
    }

    /// True when the root cause is a namespace open/set/restore failure.
    pub fn is_namespace(&self) -> bool {
        match self {
            RelayError::Namespace(_) => true,
            RelayError::Forward { source, .. } => source.is_namespace(),
            _ => false,
        }
    }
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing protocol")]
    MissingProtocol,

    #[error("Missing port for {0} forward")]
    MissingPort(&'static str),

    #[error("Missing destination for {0} forward")]
    MissingEndpoint(&'static str),

    #[error("Invalid destination '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Invalid forward '{spec}': {reason}")]
    InvalidForward { spec: String, reason: String },

    #[error("Forward #{index}: {source}")]
    InvalidSlot {
        index: usize,
        source: Box<ConfigError>,
    },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Failures of the namespace gateway.
#[derive(Error, Debug)]
pub enum NamespaceError {
    #[error("Unable to open namespace of pid {pid}: {source}")]
    Open { pid: i32, source: io::Error },

    #[error("Unable to open current namespace: {0}")]
    OpenCurrent(io::Error),

    #[error("Unable to set namespace: {0}")]
    Set(io::Error),

    #[error("Unable to restore namespace: {0}")]
    Restore(io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
