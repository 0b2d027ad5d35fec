//! Namespace Relay - socket forwarding across network namespace boundaries.
//!
//! This library bridges sockets between the caller's network namespace and the
//! namespace of a sandboxed process:
//! - client forwards: listen inside the sandbox, dial out from the caller
//! - server forwards: listen in the caller's namespace, dial into the sandbox

#[cfg(not(target_os = "linux"))]
compile_error!("nsrelay requires Linux network namespaces");

pub mod cli;
pub mod config;
pub mod error;
pub mod forward;
pub mod netns;
pub mod relay;
pub mod socket;
pub mod utils;

pub use config::{Direction, ForwardConfig, Protocol, RelayConfig};
pub use error::{ConfigError, NamespaceError, RelayError, Result};
pub use forward::{Endpoint, Forward, Scope, UnixName};
pub use netns::{NamespaceGateway, NamespaceSwitch, ProcNamespace};
pub use relay::{proxy_setup, ForwardInfo, RelayManager};

/// Re-export commonly used items.
pub mod prelude {
    pub use crate::config::{ForwardConfig, RelayConfig};
    pub use crate::error::{RelayError, Result};
    pub use crate::netns::{NamespaceGateway, ProcNamespace};
    pub use crate::relay::{proxy_setup, RelayManager};
}
