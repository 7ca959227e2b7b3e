//! Error types for twaybar.
//!
//! Every component owns a narrow error enum; they all converge on
//! [`MonitorError`], which also carries the top-level handling policy
//! (see [`MonitorError::policy`]).

use std::time::Duration;

use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::dispatcher::{DecodeError, DispatchError};
use crate::helix::HelixError;
use crate::login::LoginError;
use crate::output::OutputError;
use crate::session::SessionError;
use crate::subscriptions::SubscriptionError;
use crate::token_store::TokenStoreError;

/// What the event loop should do when an error reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Drop the connection, back off, dial again and re-register.
    Reconnect,
    /// Stop the process with a diagnostic.
    Fatal,
    /// Log the error and keep going.
    LogAndContinue,
}

/// Errors that can occur during monitor operations.
///
/// This is the primary error type for the crate, encompassing all
/// possible failure modes.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Missing or malformed configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Token exchange or token validity failure.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Interactive authorization was not completed in time.
    #[error("authorization not completed within {0:?}")]
    Timeout(Duration),

    /// WebSocket dial, read, or liveness failure.
    #[error("transport error: {0}")]
    Transport(#[from] SessionError),

    /// The platform rejected a subscription registration.
    #[error("subscription error: {0}")]
    Subscription(SubscriptionError),

    /// An event payload did not match its expected shape.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Token persistence failure.
    #[error("token store error: {0}")]
    TokenStore(#[from] TokenStoreError),

    /// Writing the status record failed.
    #[error("output error: {0}")]
    Output(#[from] OutputError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error talking to the platform API.
    #[error("HTTP error: {0}")]
    Http(String),
}

impl MonitorError {
    /// Maps the error to the action the event loop takes.
    ///
    /// | Kind | Policy |
    /// |------|--------|
    /// | `Transport` | reconnect |
    /// | `Decode`, `Io`, token store I/O | log and continue |
    /// | everything else | fatal |
    #[must_use]
    pub fn policy(&self) -> ErrorPolicy {
        match self {
            Self::Transport(_) => ErrorPolicy::Reconnect,
            Self::Decode(_) | Self::Io(_) => ErrorPolicy::LogAndContinue,
            Self::TokenStore(TokenStoreError::Io(_)) => ErrorPolicy::LogAndContinue,
            Self::Config(_)
            | Self::Auth(_)
            | Self::Timeout(_)
            | Self::Subscription(_)
            | Self::TokenStore(_)
            | Self::Output(_)
            | Self::Json(_)
            | Self::Http(_) => ErrorPolicy::Fatal,
        }
    }
}

impl From<SubscriptionError> for MonitorError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::Unauthorized { kind } => {
                Self::Auth(AuthError::Unauthorized(format!(
                    "user token rejected while registering {kind}"
                )))
            }
            other => Self::Subscription(other),
        }
    }
}

impl From<LoginError> for MonitorError {
    fn from(err: LoginError) -> Self {
        match err {
            LoginError::Timeout(waited) => Self::Timeout(waited),
            LoginError::Auth(auth) => Self::Auth(auth),
        }
    }
}

impl From<DispatchError> for MonitorError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Decode(decode) => Self::Decode(decode),
            DispatchError::Output(output) => Self::Output(output),
        }
    }
}

impl From<HelixError> for MonitorError {
    fn from(err: HelixError) -> Self {
        match err {
            HelixError::UnknownLogin(login) => Self::Config(ConfigError::InvalidValue {
                key: "login".to_string(),
                message: format!("no platform user named '{login}'"),
            }),
            HelixError::Unauthorized => Self::Auth(AuthError::Unauthorized(
                "app token rejected by user lookup".to_string(),
            )),
            other => Self::Http(other.to_string()),
        }
    }
}

/// A specialized `Result` type for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
