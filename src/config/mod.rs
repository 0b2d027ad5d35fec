//! Configuration module.

pub mod loader;
pub mod schema;

pub use loader::{default_settings_path, load_config, load_default_config, parse_config};
pub use schema::{Direction, ForwardConfig, Protocol, RelayConfig};
