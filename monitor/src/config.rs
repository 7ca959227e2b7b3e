//! Configuration module for twaybar.
//!
//! Configuration comes from two places: environment variables for identity
//! and endpoints, and a small JSON flags file selecting which event
//! categories to subscribe to.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TWAYBAR_CLIENT_ID` | Yes | - | Application client id |
//! | `TWAYBAR_CLIENT_SECRET` | Yes | - | Application client secret |
//! | `TWAYBAR_USER_LOGIN` | Yes | - | Login of the account reading chat |
//! | `TWAYBAR_BROADCASTER_LOGIN` | Yes | - | Login of the channel to watch |
//! | `TWAYBAR_REDIRECT_PORT` | No | 8080 | Port of the local OAuth callback listener |
//! | `TWAYBAR_TOKEN_PATH` | No | `<data dir>/twaybar/token.json` | Stored user token |
//! | `TWAYBAR_LOGIN_TIMEOUT_SECS` | No | 60 | How long to wait for the browser redirect |
//! | `TWAYBAR_CONFIG` | No | `<config dir>/twaybar/conf.json` | Flags file |
//! | `TWAYBAR_ID_URL` | No | `https://id.twitch.tv` | Identity service base URL |
//! | `TWAYBAR_API_URL` | No | `https://api.twitch.tv/helix` | Platform API base URL |
//! | `TWAYBAR_EVENTSUB_URL` | No | `wss://eventsub.wss.twitch.tv/ws` | Event stream URL |
//!
//! # Flags File
//!
//! ```json
//! { "chat": true, "subs": true, "resubs": false, "debug": false }
//! ```
//!
//! Missing keys default to `false`.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::types::SubscriptionKind;

/// Application directory name under the platform config/data dirs.
const APP_DIR: &str = "twaybar";

/// Default flags file name.
const DEFAULT_FLAGS_FILE: &str = "conf.json";

/// Default token file name.
const DEFAULT_TOKEN_FILE: &str = "token.json";

/// Default OAuth callback port.
const DEFAULT_REDIRECT_PORT: u16 = 8080;

/// Default wait for the interactive login redirect.
const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 60;

const DEFAULT_ID_URL: &str = "https://id.twitch.tv";
const DEFAULT_API_URL: &str = "https://api.twitch.tv/helix";
const DEFAULT_EVENTSUB_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

const ENV_CLIENT_ID: &str = "TWAYBAR_CLIENT_ID";
const ENV_CLIENT_SECRET: &str = "TWAYBAR_CLIENT_SECRET";
const ENV_USER_LOGIN: &str = "TWAYBAR_USER_LOGIN";
const ENV_BROADCASTER_LOGIN: &str = "TWAYBAR_BROADCASTER_LOGIN";
const ENV_REDIRECT_PORT: &str = "TWAYBAR_REDIRECT_PORT";
const ENV_TOKEN_PATH: &str = "TWAYBAR_TOKEN_PATH";
const ENV_LOGIN_TIMEOUT: &str = "TWAYBAR_LOGIN_TIMEOUT_SECS";
const ENV_CONFIG: &str = "TWAYBAR_CONFIG";
const ENV_ID_URL: &str = "TWAYBAR_ID_URL";
const ENV_API_URL: &str = "TWAYBAR_API_URL";
const ENV_EVENTSUB_URL: &str = "TWAYBAR_EVENTSUB_URL";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,

    /// The flags file could not be read.
    #[error("failed to read flags file {path}: {source}")]
    FlagsUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The flags file is not valid JSON for [`EventFlags`].
    #[error("malformed flags file {path}: {source}")]
    FlagsMalformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Which event categories to subscribe to, plus the diagnostic switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventFlags {
    /// Subscribe to chat messages.
    pub chat: bool,
    /// Subscribe to new subscriptions.
    pub subs: bool,
    /// Subscribe to resubscription messages.
    pub resubs: bool,
    /// Log raw resub registration traffic.
    pub debug: bool,
}

impl EventFlags {
    /// Reads flags from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FlagsUnreadable`] if the file cannot be read and
    /// [`ConfigError::FlagsMalformed`] if it is not a JSON object of booleans.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::FlagsUnreadable {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&data).map_err(|source| ConfigError::FlagsMalformed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Enabled categories, in registration order (chat, subs, resubs).
    #[must_use]
    pub fn enabled_kinds(&self) -> Vec<SubscriptionKind> {
        let mut kinds = Vec::with_capacity(3);
        if self.chat {
            kinds.push(SubscriptionKind::ChatMessage);
        }
        if self.subs {
            kinds.push(SubscriptionKind::ChannelSubscribe);
        }
        if self.resubs {
            kinds.push(SubscriptionKind::SubscriptionMessage);
        }
        kinds
    }
}

/// Base URLs of the platform services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Identity service (`/oauth2/token`, `/oauth2/authorize`).
    pub id_url: String,
    /// REST API (`/users`, `/eventsub/subscriptions`).
    pub api_url: String,
    /// EventSub WebSocket URL.
    pub eventsub_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            id_url: DEFAULT_ID_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            eventsub_url: DEFAULT_EVENTSUB_URL.to_string(),
        }
    }
}

/// Configuration for the monitor.
#[derive(Clone)]
pub struct Config {
    /// Application client id.
    pub client_id: String,

    /// Application client secret.
    pub client_secret: String,

    /// Login of the account whose chat view is used.
    pub user_login: String,

    /// Login of the channel to watch.
    pub broadcaster_login: String,

    /// Port for the local OAuth callback listener.
    pub redirect_port: u16,

    /// Path of the persisted user token.
    pub token_path: PathBuf,

    /// How long the interactive login waits for the redirect.
    pub login_timeout: Duration,

    /// Path the flags were read from.
    pub flags_path: PathBuf,

    /// Event category switches.
    pub flags: EventFlags,

    /// Platform endpoints.
    pub endpoints: Endpoints,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("user_login", &self.user_login)
            .field("broadcaster_login", &self.broadcaster_login)
            .field("redirect_port", &self.redirect_port)
            .field("token_path", &self.token_path)
            .field("login_timeout", &self.login_timeout)
            .field("flags_path", &self.flags_path)
            .field("flags", &self.flags)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl Config {
    /// Creates a new `Config` from environment variables and the flags file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - a required variable is not set
    /// - `TWAYBAR_REDIRECT_PORT` or `TWAYBAR_LOGIN_TIMEOUT_SECS` is not a positive integer
    /// - the flags file is missing or malformed
    /// - the home directory cannot be determined (needed for default paths)
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = required(ENV_CLIENT_ID)?;
        let client_secret = required(ENV_CLIENT_SECRET)?;
        let user_login = required(ENV_USER_LOGIN)?;
        let broadcaster_login = required(ENV_BROADCASTER_LOGIN)?;

        let redirect_port = match env::var(ENV_REDIRECT_PORT) {
            Ok(val) => match val.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: ENV_REDIRECT_PORT.to_string(),
                        message: format!("expected port 1-65535, got '{val}'"),
                    })
                }
            },
            Err(_) => DEFAULT_REDIRECT_PORT,
        };

        let login_timeout = match env::var(ENV_LOGIN_TIMEOUT) {
            Ok(val) => {
                let secs = val.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                    key: ENV_LOGIN_TIMEOUT.to_string(),
                    message: format!("expected positive integer, got '{val}'"),
                })?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: ENV_LOGIN_TIMEOUT.to_string(),
                        message: "timeout must be at least 1 second".to_string(),
                    });
                }
                Duration::from_secs(secs)
            }
            Err(_) => Duration::from_secs(DEFAULT_LOGIN_TIMEOUT_SECS),
        };

        let token_path = resolve_token_path()?;
        let flags_path = resolve_flags_path();
        let flags = EventFlags::load(&flags_path)?;

        let endpoints = Endpoints {
            id_url: url_var(ENV_ID_URL, DEFAULT_ID_URL),
            api_url: url_var(ENV_API_URL, DEFAULT_API_URL),
            eventsub_url: env::var(ENV_EVENTSUB_URL)
                .unwrap_or_else(|_| DEFAULT_EVENTSUB_URL.to_string()),
        };

        Ok(Self {
            client_id,
            client_secret,
            user_login,
            broadcaster_login,
            redirect_port,
            token_path,
            login_timeout,
            flags_path,
            flags,
            endpoints,
        })
    }
}

/// Resolves the token file path: `TWAYBAR_TOKEN_PATH` or the platform data dir.
///
/// # Errors
///
/// Returns [`ConfigError::NoHomeDirectory`] if no override is set and the
/// platform data directory cannot be determined.
pub fn resolve_token_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var(ENV_TOKEN_PATH) {
        return Ok(PathBuf::from(path));
    }

    let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
    Ok(base_dirs
        .data_dir()
        .join(APP_DIR)
        .join(DEFAULT_TOKEN_FILE))
}

/// Resolves the flags file: `TWAYBAR_CONFIG`, then the platform config dir
/// if a file exists there, then `conf.json` in the working directory.
#[must_use]
pub fn resolve_flags_path() -> PathBuf {
    if let Ok(path) = env::var(ENV_CONFIG) {
        return PathBuf::from(path);
    }

    BaseDirs::new()
        .map(|dirs| dirs.config_dir().join(APP_DIR).join(DEFAULT_FLAGS_FILE))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FLAGS_FILE))
}

fn required(key: &str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(ConfigError::MissingEnvVar(key.to_string())),
    }
}

fn url_var(key: &str, default: &str) -> String {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim_end_matches('/')
        .to_string()
}
