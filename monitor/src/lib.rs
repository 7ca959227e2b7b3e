//! twaybar - Twitch EventSub watcher for Waybar.
//!
//! This crate keeps a WebSocket session open with the Twitch EventSub
//! service and turns chat, subscription and resubscription events into a
//! `{"text", "tooltip"}` JSON line per event for a Waybar custom module.
//!
//! # Overview
//!
//! Startup resolves a [`context::RunContext`]: the stored user token (or a
//! fresh one from the interactive login), an app token, and the account ids
//! of the viewer and the watched channel. The [`session`] then connects,
//! registers the enabled subscriptions once the server welcomes it, and
//! feeds every notification to the [`dispatcher`].
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables and the flags file
//! - [`token_store`]: Persisted user credential
//! - [`auth`]: OAuth token endpoint and authorize URL
//! - [`login`]: Interactive authorization-code flow with a local callback
//! - [`browser`]: Opening the authorize page
//! - [`helix`]: User lookup by login
//! - [`subscriptions`]: EventSub subscription registration
//! - [`session`]: WebSocket session and reconnect supervisor
//! - [`dispatcher`]: Classification, decoding and projection of events
//! - [`events`]: Typed event bodies
//! - [`output`]: Status record and JSON line sink
//! - [`backoff`]: Reconnect backoff with jitter
//! - [`context`]: Per-run resolved state
//! - [`types`]: Wire frames
//! - [`error`]: Error types and handling policy

pub mod auth;
pub mod backoff;
pub mod browser;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod helix;
pub mod login;
pub mod output;
pub mod session;
pub mod subscriptions;
pub mod token_store;
pub mod types;

pub use auth::{AuthError, OAuthClient};
pub use backoff::Backoff;
pub use browser::{BrowserOpener, ManualBrowser, SystemBrowser};
pub use config::{Config, ConfigError, EventFlags};
pub use context::RunContext;
pub use dispatcher::{DecodedEvent, DecoderRegistry, EventDispatcher, EventKind};
pub use error::{ErrorPolicy, MonitorError, Result};
pub use login::{LoginError, UserAuthenticator};
pub use output::{JsonLineSink, StatusRecord, StatusSink};
pub use session::{EventStreamSession, SessionError, SessionStatus};
pub use subscriptions::{SubscriptionError, SubscriptionRegistrar};
pub use token_store::{Credential, TokenStore, TokenStoreError};
pub use types::{InboundFrame, SubscriptionKind};
