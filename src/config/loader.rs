//! Configuration file loader.

use std::path::{Path, PathBuf};

use super::ClientConfig;

/// Environment variable naming a config file searched before the defaults.
pub const CONFIG_ENV_VAR: &str = "SECMON_CLIENT_CONFIG";

/// Configuration loader that searches multiple locations.
#[derive(Debug)]
pub struct ConfigLoader {
    /// Search paths in order of priority.
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader with default search paths, preceded by
    /// `$SECMON_CLIENT_CONFIG` when set.
    #[must_use]
    pub fn new() -> Self {
        Self::with_override(std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
    }

    fn with_override(override_path: Option<PathBuf>) -> Self {
        let mut search_paths = Vec::new();

        // 0. Explicit override from the environment
        if let Some(path) = override_path.filter(|p| !p.as_os_str().is_empty()) {
            search_paths.push(path);
        }

        // 1. Current directory: .secmon-client.toml
        search_paths.push(PathBuf::from(".secmon-client.toml"));

        // 2. User config directory: ~/.config/secmon-client/config.toml
        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("secmon-client").join("config.toml"));
        }

        Self { search_paths }
    }

    /// Create a config loader with a specific config file path.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            search_paths: vec![path],
        }
    }

    /// Load configuration from the first available file, or return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read, parsed or
    /// validated.
    pub fn load(&self) -> Result<ClientConfig, ConfigError> {
        for path in &self.search_paths {
            if path.exists() {
                tracing::debug!(path = %path.display(), "Loading config file");
                return Self::load_from_path(path);
            }
        }

        tracing::debug!("No config file found, using defaults");
        Ok(ClientConfig::default())
    }

    fn load_from_path(path: &Path) -> Result<ClientConfig, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: ClientConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                source: e,
            })?;

        Self::validate(&config).map_err(|reason| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(config)
    }

    /// Rejects values that would make every call fail.
    fn validate(config: &ClientConfig) -> Result<(), String> {
        if config.timeout_ms == 0 {
            return Err("timeout_ms must be greater than zero".to_string());
        }
        if config.codec.max_payload_bytes == 0 {
            return Err("codec.max_payload_bytes must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Get the search paths for debugging.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find the first config file that exists.
    #[must_use]
    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths.iter().find(|p| p.exists()).cloned()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config file {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_search_paths() {
        let loader = ConfigLoader::new();
        assert!(!loader.search_paths().is_empty());
        assert!(loader.search_paths()[0].ends_with(".secmon-client.toml"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loader = ConfigLoader::with_path(PathBuf::from("/nonexistent/path.toml"));
        let config = loader.load().unwrap();
        assert_eq!(config, ClientConfig::default());
        assert!(loader.find_config_file().is_none());
    }

    #[test]
    fn reads_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timeout_ms = 1200\nreconnect_delay_ms = 50").unwrap();

        let loader = ConfigLoader::with_path(file.path().to_path_buf());
        let config = loader.load().unwrap();
        assert_eq!(config.timeout_ms, 1200);
        assert_eq!(config.reconnect_delay_ms, 50);
        assert_eq!(loader.find_config_file().as_deref(), Some(file.path()));
    }

    #[test]
    fn reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timeout_ms = \"soon\"").unwrap();

        let loader = ConfigLoader::with_path(file.path().to_path_buf());
        let err = loader.load().unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn env_override_is_searched_first() {
        let loader = ConfigLoader::with_override(Some(PathBuf::from("/etc/secmon/client.toml")));
        assert_eq!(
            loader.search_paths()[0],
            PathBuf::from("/etc/secmon/client.toml")
        );
        assert!(loader.search_paths()[1].ends_with(".secmon-client.toml"));

        let loader = ConfigLoader::with_override(Some(PathBuf::new()));
        assert!(loader.search_paths()[0].ends_with(".secmon-client.toml"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timeout_ms = 0").unwrap();

        let loader = ConfigLoader::with_path(file.path().to_path_buf());
        let err = loader.load().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("timeout_ms must be greater than zero"));
    }

    #[test]
    fn rejects_zero_payload_limit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[codec]\nmax_payload_bytes = 0").unwrap();

        let loader = ConfigLoader::with_path(file.path().to_path_buf());
        assert!(matches!(loader.load(), Err(ConfigError::Invalid { .. })));
    }
}
