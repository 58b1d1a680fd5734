//! Configuration system for the `chatlink` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatlink/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use chatlink_proto::message::ConversationId;

use crate::auth::{ConfiguredSource, FileCredentialSource, Identity, StaticCredentialSource};
use crate::reachability::TcpProbe;
use crate::session::SessionConfig;
use crate::transport::ReconnectPolicy;
use crate::transport::ws::WsConnector;

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

    /// Could not determine the user's config directory.
    #[error("could not determine config directory (no HOME or XDG_CONFIG_HOME)")]
    NoConfigDir,

    /// No backend address was configured.
    #[error("no backend address configured (set --base-url or [server] base_url)")]
    MissingBaseUrl,

    /// The backend address is not a valid URL.
    #[error("invalid backend address {url}: {source}")]
    InvalidUrl {
        /// The rejected value.
        url: String,
        /// Parser error.
        source: url::ParseError,
    },

    /// Neither a token nor a token file was configured.
    #[error("no credential configured (set --token, --token-file or [auth])")]
    MissingCredential,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    auth: AuthFileConfig,
    reconnect: ReconnectFileConfig,
    session: SessionFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    base_url: Option<String>,
    namespace: Option<String>,
    probe_addr: Option<String>,
}

/// `[auth]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthFileConfig {
    identity: Option<String>,
    token: Option<String>,
    token_file: Option<PathBuf>,
    refresh_interval_secs: Option<u64>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    path: Option<String>,
    channel_capacity: Option<usize>,
    connect_timeout_secs: Option<u64>,
    auth_timeout_secs: Option<u64>,
    probe_interval_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// Backend base address.
    pub base_url: Option<String>,
    /// Channel namespace appended to the base address.
    pub namespace: String,
    /// `host:port` probed for reachability; derived from `base_url` if unset.
    pub probe_addr: Option<String>,

    // -- Auth --
    /// Acting user.
    pub identity: Option<String>,
    /// Fixed bearer token.
    pub token: Option<String>,
    /// File holding a rotating bearer token. Wins over `token`.
    pub token_file: Option<PathBuf>,
    /// Credential refresh cadence.
    pub refresh_interval: Duration,

    // -- Reconnect --
    /// Channel reconnection policy.
    pub reconnect: ReconnectPolicy,

    // -- Session --
    /// View path used by the "Refresh page" action.
    pub path: String,
    /// Capacity of event channels.
    pub channel_capacity: usize,
    /// WebSocket connect timeout.
    pub connect_timeout: Duration,
    /// Handshake answer timeout.
    pub auth_timeout: Duration,
    /// Delay between reachability probes.
    pub probe_interval: Duration,
    /// Conversation to open on start.
    pub conversation: Option<String>,
    /// Whether to run the reachability probe.
    pub probe_enabled: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            namespace: "chat".to_string(),
            probe_addr: None,
            identity: None,
            token: None,
            token_file: None,
            refresh_interval: Duration::from_secs(60),
            reconnect: ReconnectPolicy::default(),
            path: "chat".to_string(),
            channel_capacity: 256,
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(5),
            conversation: None,
            probe_enabled: true,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/chatlink/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve from CLI args and env vars alone, ignoring any config file.
    #[must_use]
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self::resolve(cli, &ConfigFile::default())
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            base_url: cli
                .base_url
                .clone()
                .or_else(|| file.server.base_url.clone()),
            namespace: cli
                .namespace
                .clone()
                .or_else(|| file.server.namespace.clone())
                .unwrap_or(defaults.namespace),
            probe_addr: file.server.probe_addr.clone(),
            identity: cli
                .identity
                .clone()
                .or_else(|| file.auth.identity.clone()),
            token: cli.token.clone().or_else(|| file.auth.token.clone()),
            token_file: cli
                .token_file
                .clone()
                .or_else(|| file.auth.token_file.clone()),
            refresh_interval: file
                .auth
                .refresh_interval_secs
                .map_or(defaults.refresh_interval, Duration::from_secs),
            reconnect: ReconnectPolicy {
                max_attempts: file
                    .reconnect
                    .max_attempts
                    .or(defaults.reconnect.max_attempts),
                initial_delay: file
                    .reconnect
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: file
                    .reconnect
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, Duration::from_millis),
            },
            path: file.session.path.clone().unwrap_or(defaults.path),
            channel_capacity: file
                .session
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            connect_timeout: file
                .session
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            auth_timeout: file
                .session
                .auth_timeout_secs
                .map_or(defaults.auth_timeout, Duration::from_secs),
            probe_interval: file
                .session
                .probe_interval_secs
                .map_or(defaults.probe_interval, Duration::from_secs),
            conversation: cli.chat.clone(),
            probe_enabled: !cli.no_probe,
        }
    }

    /// Build the [`SessionConfig`] for this configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingBaseUrl`] or [`ConfigError::InvalidUrl`].
    pub fn to_session_config(&self) -> Result<SessionConfig, ConfigError> {
        let base_url = self.parsed_base_url()?;
        let identity = self
            .identity
            .as_deref()
            .filter(|i| !i.is_empty())
            .map(Identity::new);

        let mut session = SessionConfig::new(base_url, self.namespace.clone(), identity);
        session.path.clone_from(&self.path);
        session.policy = self.reconnect;
        session.refresh_interval = self.refresh_interval;
        session.channel_capacity = self.channel_capacity;
        session.conversation = self
            .conversation
            .as_deref()
            .map(ConversationId::from_external);
        Ok(session)
    }

    /// The credential source: the token file if set, else the fixed token.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingCredential`] if neither is set.
    pub fn credential_source(&self) -> Result<ConfiguredSource, ConfigError> {
        if let Some(path) = &self.token_file {
            return Ok(ConfiguredSource::File(FileCredentialSource::new(path)));
        }
        self.token
            .as_deref()
            .map(|t| ConfiguredSource::Static(StaticCredentialSource::new(t)))
            .ok_or(ConfigError::MissingCredential)
    }

    /// WebSocket connector with the configured timeouts.
    #[must_use]
    pub fn ws_connector(&self) -> WsConnector {
        WsConnector::new()
            .with_connect_timeout(self.connect_timeout)
            .with_auth_timeout(self.auth_timeout)
            .with_frame_buffer(self.channel_capacity)
    }

    /// Reachability probe, unless disabled or no address can be derived.
    #[must_use]
    pub fn probe(&self) -> Option<TcpProbe> {
        if !self.probe_enabled {
            return None;
        }
        let addr = self.probe_addr.clone().or_else(|| {
            let url = self.parsed_base_url().ok()?;
            let host = url.host_str()?;
            let port = url.port_or_known_default()?;
            Some(format!("{host}:{port}"))
        })?;
        Some(TcpProbe::new(addr).with_interval(self.probe_interval))
    }

    fn parsed_base_url(&self) -> Result<Url, ConfigError> {
        let raw = self.base_url.as_deref().ok_or(ConfigError::MissingBaseUrl)?;
        Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
            url: raw.to_string(),
            source,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Real-time chat session client")]
pub struct CliArgs {
    /// Backend base address (e.g. `wss://chat.example.com`).
    #[arg(long, env = "CHATLINK_URL")]
    pub base_url: Option<String>,

    /// Channel namespace.
    #[arg(long, env = "CHATLINK_NAMESPACE")]
    pub namespace: Option<String>,

    /// Acting user identity.
    #[arg(long, env = "CHATLINK_IDENTITY")]
    pub identity: Option<String>,

    /// Bearer token.
    #[arg(long, env = "CHATLINK_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// File holding a bearer token, re-read on every refresh.
    #[arg(long, env = "CHATLINK_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// Conversation id to open instead of a fresh one.
    #[arg(long)]
    pub chat: Option<String>,

    /// Disable the TCP reachability probe.
    #[arg(long)]
    pub no_probe: bool,

    /// Path to config file (default: `~/.config/chatlink/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATLINK_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/chatlink.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        default_config_path()?
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

/// `~/.config/chatlink/config.toml` (platform equivalent).
///
/// # Errors
///
/// [`ConfigError::NoConfigDir`] if the platform has no config directory.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("chatlink").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}
