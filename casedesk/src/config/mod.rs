//! Configuration system for the `casedesk` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/casedesk/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use casedesk_proto::ids::UserId;
use casedesk_proto::message::BroadcastScope;

use crate::chat::SyncConfig;

/// Errors that can occur when loading configuration.
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
struct ConfigFile {
    api: ApiFileConfig,
    session: SessionFileConfig,
    chat: ChatFileConfig,
}

/// `[api]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ApiFileConfig {
    base_url: Option<String>,
    request_timeout_secs: Option<u64>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    credentials_path: Option<PathBuf>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    foreground_poll_secs: Option<u64>,
    background_poll_secs: Option<u64>,
    event_buffer: Option<usize>,
    max_message_len: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- API --
    /// Base URL every endpoint path is joined onto.
    pub base_url: String,
    /// Per-request timeout of the HTTP client.
    pub request_timeout: Duration,

    // -- Session --
    /// File holding the stored credential pair.
    pub credentials_path: PathBuf,

    // -- Chat --
    /// Poll intervals, event buffer and message limit.
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            request_timeout: Duration::from_secs(30),
            credentials_path: default_credentials_path(),
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or if any config file present cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// CLI args over defaults, ignoring any config file.
    ///
    /// Used when an implicit config file is unreadable, so flags such as
    /// `--base-url` and `--credentials` still apply.
    #[must_use]
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self::resolve(cli, &ConfigFile::default())
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` so it can be
    /// tested without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            base_url: cli
                .base_url
                .clone()
                .or_else(|| file.api.base_url.clone())
                .unwrap_or(defaults.base_url),
            request_timeout: cli
                .request_timeout_secs
                .or(file.api.request_timeout_secs)
                .map_or(defaults.request_timeout, Duration::from_secs),
            credentials_path: cli
                .credentials
                .clone()
                .or_else(|| file.session.credentials_path.clone())
                .unwrap_or(defaults.credentials_path),
            sync: SyncConfig {
                foreground_poll: file
                    .chat
                    .foreground_poll_secs
                    .map_or(defaults.sync.foreground_poll, Duration::from_secs),
                background_poll: file
                    .chat
                    .background_poll_secs
                    .map_or(defaults.sync.background_poll, Duration::from_secs),
                event_buffer: file
                    .chat
                    .event_buffer
                    .unwrap_or(defaults.sync.event_buffer),
                max_message_len: file
                    .chat
                    .max_message_len
                    .unwrap_or(defaults.sync.max_message_len),
            },
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Case desk messaging client")]
pub struct CliArgs {
    /// Base URL of the case desk API.
    #[arg(long, env = "CASEDESK_API_URL", global = true)]
    pub base_url: Option<String>,

    /// Per-request timeout in seconds.
    #[arg(long, global = true)]
    pub request_timeout_secs: Option<u64>,

    /// Credential file (default: `<data dir>/casedesk/session.json`).
    #[arg(long, env = "CASEDESK_CREDENTIALS", global = true)]
    pub credentials: Option<PathBuf>,

    /// Path to config file (default: `~/.config/casedesk/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CASEDESK_LOG", global = true)]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/casedesk.log`).
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// What to do.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Client subcommands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Sign in and store the issued credentials.
    Login {
        /// Account email.
        #[arg(long)]
        email: String,
        /// Account password.
        #[arg(long, env = "CASEDESK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the stored credentials.
    Logout,
    /// Show the signed-in user.
    Whoami,
    /// List the people you can message.
    Peers,
    /// List conversations with unread counts.
    Conversations,
    /// Follow one conversation until Ctrl-C.
    Watch {
        /// Peer user id.
        peer: UserId,
    },
    /// Send a direct message.
    Send {
        /// Peer user id.
        peer: UserId,
        /// Message text.
        text: String,
    },
    /// Send a broadcast (administrators only).
    Broadcast {
        /// Audience: all, investigators or victims.
        #[arg(long, default_value = "all")]
        scope: BroadcastScope,
        /// Message text.
        text: String,
    },
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_credentials_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("casedesk")
        .join("session.json")
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("casedesk").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
