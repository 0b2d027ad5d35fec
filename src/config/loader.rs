//! Configuration loader from ~/.nsrelay-settings.json.

use std::path::{Path, PathBuf};

use crate::config::schema::RelayConfig;
use crate::error::ConfigError;

/// Default settings file name.
const DEFAULT_SETTINGS_FILE: &str = ".nsrelay-settings.json";

/// Get the default settings file path.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_SETTINGS_FILE))
}

/// Load configuration from a file path.
pub fn load_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ParseError(format!("Failed to read config file: {}", e)))?;

    parse_config(&content)
}

/// Load configuration from the default path, or return an empty config if not found.
pub fn load_default_config() -> Result<RelayConfig, ConfigError> {
    match default_settings_path() {
        Some(path) if path.exists() => load_config(&path),
        _ => Ok(RelayConfig::default()),
    }
}

/// Parse configuration from a JSON string.
pub fn parse_config(json: &str) -> Result<RelayConfig, ConfigError> {
    let config: RelayConfig = serde_json::from_str(json)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse config JSON: {}", e)))?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::{Direction, Protocol};

    #[test]
    fn test_parse_minimal_config() {
        let config = parse_config("{}").unwrap();
        assert!(config.forwards.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "forwards": [
                {"type": "client", "proto": "tcp", "port": 80, "destination": "10.0.0.1"},
                {"type": "", "proto": "tcp", "port": 81},
                {"type": "server", "proto": "unix", "destination": "@dbus"},
                {"type": "server", "proto": "udp", "port": 53}
            ]
        }"#;

        let config = parse_config(json).unwrap();
        assert_eq!(config.forwards.len(), 4);
        assert_eq!(config.enabled_count(), 3);
        assert_eq!(config.forwards[0].direction, Some(Direction::Client));
        assert_eq!(config.forwards[0].port, Some(80));
        assert_eq!(config.forwards[2].proto, Some(Protocol::Unix));
        assert_eq!(config.forwards[3].destination, "");
    }

    #[test]
    fn test_unresolvable_forward_rejected() {
        let json = r#"{"forwards": [{"type": "server", "proto": "unixgram"}]}"#;
        let err = parse_config(json).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSlot { index: 0, .. }));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            parse_config("{\"forwards\": }"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"forwards": [{{"type": "client", "proto": "udp", "port": 5353}}]}}"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.forwards.len(), 1);
        assert_eq!(config.forwards[0].proto, Some(Protocol::Udp));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
