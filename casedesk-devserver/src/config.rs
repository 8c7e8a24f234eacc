//! Configuration system for the development server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/casedesk-devserver/config.toml`)
//! 4. Compiled defaults

use std::path::{Path, PathBuf};

use crate::state::{DEFAULT_ACCESS_TTL_SECS, DEFAULT_REFRESH_TTL_SECS};

/// Errors that can occur when loading server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    access_ttl_secs: Option<i64>,
    refresh_ttl_secs: Option<i64>,
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the development server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "In-memory case desk API for development")]
pub struct ServerCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "CASEDESK_DEV_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/casedesk-devserver/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Lifetime of issued access credentials, in seconds.
    #[arg(long)]
    pub access_ttl_secs: Option<i64>,

    /// Lifetime of issued refresh credentials, in seconds.
    #[arg(long)]
    pub refresh_ttl_secs: Option<i64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, env = "CASEDESK_DEV_LOG")]
    pub log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to (e.g., `127.0.0.1:8000`).
    pub bind_addr: String,
    /// Access credential lifetime in seconds.
    pub access_ttl_secs: i64,
    /// Refresh credential lifetime in seconds.
    pub refresh_ttl_secs: i64,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            access_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
            refresh_ttl_secs: DEFAULT_REFRESH_TTL_SECS,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ServerConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &ServerCliArgs, file: &ServerConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            access_ttl_secs: cli
                .access_ttl_secs
                .or(file.server.access_ttl_secs)
                .unwrap_or(defaults.access_ttl_secs),
            refresh_ttl_secs: cli
                .refresh_ttl_secs
                .or(file.server.refresh_ttl_secs)
                .unwrap_or(defaults.refresh_ttl_secs),
            log_level: cli
                .log_level
                .clone()
                .or_else(|| file.server.log_level.clone())
                .unwrap_or(defaults.log_level),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the server.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ServerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ServerConfigFile::default());
        };
        config_dir.join("casedesk-devserver").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8000");
        assert_eq!(config.access_ttl_secs, 300);
        assert_eq!(config.refresh_ttl_secs, 86_400);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn toml_parsing_full() {
        let toml_str = r#"
[server]
bind_addr = "0.0.0.0:9100"
access_ttl_secs = 30
refresh_ttl_secs = 600
log_level = "debug"
"#;
        let file: ServerConfigFile = toml::from_str(toml_str).unwrap();
        let config = ServerConfig::resolve(&ServerCliArgs::default(), &file);

        assert_eq!(config.bind_addr, "0.0.0.0:9100");
        assert_eq!(config.access_ttl_secs, 30);
        assert_eq!(config.refresh_ttl_secs, 600);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn toml_parsing_empty() {
        let file: ServerConfigFile = toml::from_str("").unwrap();
        let config = ServerConfig::resolve(&ServerCliArgs::default(), &file);
        assert_eq!(config.bind_addr, "127.0.0.1:8000");
        assert_eq!(config.access_ttl_secs, 300);
    }

    #[test]
    fn cli_overrides_file() {
        let toml_str = r#"
[server]
bind_addr = "127.0.0.1:8080"
access_ttl_secs = 30
"#;
        let file: ServerConfigFile = toml::from_str(toml_str).unwrap();
        let cli = ServerCliArgs {
            bind: Some("0.0.0.0:3000".to_string()),
            access_ttl_secs: None, // not set on CLI, falls through to file
            ..Default::default()
        };
        let config = ServerConfig::resolve(&cli, &file);

        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.access_ttl_secs, 30);
    }

    #[test]
    fn explicit_missing_config_file_returns_error() {
        let result = load_config_file(Some(Path::new("/nonexistent/config.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
