//! EventSub WebSocket session.
//!
//! # Lifecycle
//!
//! 1. **connecting**: dial the event service and wait (bounded) for
//!    `session_welcome`, which carries the session id and keepalive window
//! 2. register every enabled category against that session id
//! 3. **active**: read frames until the connection fails or shutdown is
//!    requested; notifications go to the dispatcher
//! 4. **closed**: on a transport failure the supervisor in
//!    [`EventStreamSession::run`] backs off and starts over at step 1
//!
//! A `session_reconnect` frame is handled inside step 3: the session dials
//! the supplied URL and swaps connections once it welcomes, without
//! registering again, since subscriptions migrate with the session.
//! Notifications still arriving on the old connection meanwhile are
//! dispatched.
//!
//! A welcome alone does not make a connection healthy. The retry budget and
//! backoff are only restored once a frame arrives after registration.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::context::RunContext;
use crate::dispatcher::{DecoderRegistry, EventDispatcher};
use crate::error::{ErrorPolicy, MonitorError, Result};
use crate::output::StatusSink;
use crate::subscriptions::SubscriptionRegistrar;
use crate::types::{InboundFrame, SessionInfo};

/// WebSocket connection to the event service.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a fresh connection may take to send its welcome.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

/// Slack added to the server's keepalive window before declaring it silent.
const KEEPALIVE_GRACE: Duration = Duration::from_secs(5);

/// Keepalive assumed when the welcome does not state one.
const DEFAULT_KEEPALIVE_SECS: u64 = 10;

/// Consecutive failed connection attempts before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Transport-level failures. All of them lead to a reconnect.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The connection could not be opened.
    #[error("failed to connect to {url}: {source}")]
    Dial {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    /// Reading from the connection failed.
    #[error("read failed: {0}")]
    Read(#[source] tungstenite::Error),

    /// The server closed the connection.
    #[error("connection closed: {}", .0.as_deref().unwrap_or("no reason given"))]
    Closed(Option<String>),

    /// No welcome arrived in time.
    #[error("no welcome within {0:?}")]
    WelcomeTimeout(Duration),

    /// The first frame on a connection was not a welcome.
    #[error("expected session_welcome, got {0}")]
    UnexpectedFrame(String),

    /// The server went silent for longer than its keepalive window.
    #[error("no frame within {0:?}")]
    KeepaliveTimeout(Duration),
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Active,
    Closed,
}

/// The server-side session bound to the current connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub keepalive: Duration,
}

impl Session {
    fn from_welcome(info: &SessionInfo) -> Self {
        Self {
            id: info.id.clone(),
            status: SessionStatus::Connecting,
            keepalive: Duration::from_secs(
                info.keepalive_timeout_seconds
                    .unwrap_or(DEFAULT_KEEPALIVE_SECS),
            ),
        }
    }
}

/// What the receive loop does after a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    /// Move to the given URL without re-registering.
    Reconnect(String),
}

/// Owns the event-stream connection and its supervisor loop.
pub struct EventStreamSession<'a, S: StatusSink> {
    ctx: &'a RunContext,
    registrar: SubscriptionRegistrar,
    dispatcher: EventDispatcher<S>,
    url: String,
    session: Option<Session>,
    backoff: Backoff,
    failures: u32,
    max_reconnects: u32,
    welcome_timeout: Duration,
    keepalive_grace: Duration,
}

impl<'a, S: StatusSink> EventStreamSession<'a, S> {
    /// Creates a session for `ctx` that writes records to `sink`.
    pub fn new(ctx: &'a RunContext, sink: S) -> Self {
        Self {
            ctx,
            registrar: ctx.registrar(),
            dispatcher: EventDispatcher::new(DecoderRegistry::builtin(), sink),
            url: ctx.config.endpoints.eventsub_url.clone(),
            session: None,
            backoff: Backoff::default(),
            failures: 0,
            max_reconnects: MAX_RECONNECT_ATTEMPTS,
            welcome_timeout: WELCOME_TIMEOUT,
            keepalive_grace: KEEPALIVE_GRACE,
        }
    }

    /// Replaces the reconnect backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets how many consecutive failed attempts are tolerated.
    #[must_use]
    pub fn with_max_reconnects(mut self, max_reconnects: u32) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }

    /// Sets how long to wait for a welcome frame.
    #[must_use]
    pub fn with_welcome_timeout(mut self, timeout: Duration) -> Self {
        self.welcome_timeout = timeout;
        self
    }

    /// Sets the slack allowed past the server's keepalive window.
    #[must_use]
    pub fn with_keepalive_grace(mut self, grace: Duration) -> Self {
        self.keepalive_grace = grace;
        self
    }

    /// The current server-side session, if one was ever established.
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// The dispatcher, for inspecting the current record.
    #[must_use]
    pub fn dispatcher(&self) -> &EventDispatcher<S> {
        &self.dispatcher
    }

    /// Consumes the session, returning its dispatcher.
    pub fn into_dispatcher(self) -> EventDispatcher<S> {
        self.dispatcher
    }

    /// Runs until `shutdown` completes or a non-recoverable error occurs.
    ///
    /// Transport failures are retried with backoff. The attempt counter
    /// resets once a registered connection delivers its first frame, so a
    /// server that welcomes and then drops the connection still exhausts it.
    ///
    /// # Errors
    ///
    /// Returns the first error whose policy is not `Reconnect`, or the last
    /// transport error once the retry limit is exhausted.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let established = tokio::select! {
                biased;
                () = shutdown.as_mut() => None,
                result = self.establish() => Some(result),
            };

            let result = match established {
                None => {
                    info!("Shutdown requested while connecting");
                    self.mark_closed();
                    return Ok(());
                }
                Some(Ok(ws)) => self.receive_loop(ws, &mut shutdown).await,
                Some(Err(e)) => Err(e),
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            self.mark_closed();

            if err.policy() != ErrorPolicy::Reconnect {
                error!(error = %err, "Session failed");
                return Err(err);
            }

            self.failures += 1;
            if self.failures > self.max_reconnects {
                error!(
                    error = %err,
                    attempts = self.failures - 1,
                    "Giving up after repeated connection failures"
                );
                return Err(err);
            }

            let delay = self.backoff.next_delay();
            warn!(
                error = %err,
                attempt = self.failures,
                delay_ms = delay.as_millis() as u64,
                "Connection lost, reconnecting"
            );

            tokio::select! {
                biased;
                () = shutdown.as_mut() => {
                    info!("Shutdown requested while waiting to reconnect");
                    return Ok(());
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Dials, waits for the welcome and registers every enabled category.
    async fn establish(&mut self) -> Result<WsStream> {
        info!(url = %self.url, "Connecting to event service");
        let mut ws = dial(&self.url).await?;

        let welcome = match await_welcome(&mut ws, self.welcome_timeout).await {
            Ok(info) => info,
            Err(e) => {
                let _ = ws.close(None).await;
                return Err(e.into());
            }
        };

        let mut session = Session::from_welcome(&welcome);
        info!(
            session_id = %session.id,
            keepalive_secs = session.keepalive.as_secs(),
            "Session welcomed"
        );
        self.session = Some(session.clone());

        let credential = self.ctx.ensure_user_credential()?;
        let kinds = self.ctx.enabled_kinds();
        if kinds.is_empty() {
            warn!("No event categories enabled");
        }

        self.registrar
            .register_all(
                &session.id,
                &credential.access_token,
                &self.ctx.user.id,
                &self.ctx.broadcaster.id,
                &kinds,
            )
            .await?;

        session.status = SessionStatus::Active;
        info!(session_id = %session.id, subscriptions = kinds.len(), "Session active");
        self.session = Some(session);
        Ok(ws)
    }

    /// Reads frames until the connection fails or `shutdown` completes.
    async fn receive_loop<F>(&mut self, mut ws: WsStream, shutdown: &mut Pin<&mut F>) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut stable = false;

        loop {
            let window = self.keepalive_window();

            let next = tokio::select! {
                biased;
                () = shutdown.as_mut() => None,
                frame = tokio::time::timeout(window, ws.next()) => Some(frame),
            };

            let Some(frame) = next else {
                info!("Shutdown requested, closing session");
                let close = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "shutdown".into(),
                };
                if let Err(e) = ws.close(Some(close)).await {
                    debug!(error = %e, "Close handshake failed");
                }
                self.mark_closed();
                return Ok(());
            };

            let message = match frame {
                Err(_) => return Err(SessionError::KeepaliveTimeout(window).into()),
                Ok(None) => return Err(SessionError::Closed(None).into()),
                Ok(Some(Err(e))) => return Err(SessionError::Read(e).into()),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => {
                    if !stable {
                        stable = true;
                        self.mark_stable();
                    }

                    match self.apply_frame(text.as_str()) {
                        Ok(FrameAction::Continue) => {}
                        Ok(FrameAction::Reconnect(url)) => {
                            ws = self.migrate(ws, &url).await?;
                        }
                        Err(err) => {
                            let _ = ws.close(None).await;
                            return Err(err);
                        }
                    }
                }
                Message::Close(frame) => {
                    let reason = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()));
                    return Err(SessionError::Closed(reason).into());
                }
                _ => {}
            }
        }
    }

    /// Applies a frame, logging and skipping recoverable failures.
    fn apply_frame(&mut self, text: &str) -> Result<FrameAction> {
        match self.handle_frame(text) {
            Err(err) if err.policy() == ErrorPolicy::LogAndContinue => {
                warn!(error = %err, "Skipping notification");
                Ok(FrameAction::Continue)
            }
            other => other,
        }
    }

    /// Applies one text frame.
    ///
    /// Malformed frames are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns the dispatcher's error for a notification that cannot be
    /// decoded or written.
    pub fn handle_frame(&mut self, text: &str) -> Result<FrameAction> {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed frame");
                return Ok(FrameAction::Continue);
            }
        };

        match frame {
            InboundFrame::Notification(notification) => {
                let kind = self.dispatcher.dispatch(&notification)?;
                debug!(?kind, "Dispatched notification");
            }
            InboundFrame::Keepalive => debug!("Keepalive"),
            InboundFrame::Reconnect(info) => match info.reconnect_url {
                Some(url) => return Ok(FrameAction::Reconnect(url)),
                None => warn!("Reconnect frame without a URL"),
            },
            InboundFrame::Revocation(subscription) => {
                warn!(
                    subscription_type = %subscription.subscription_type,
                    status = %subscription.status,
                    "Subscription revoked"
                );
            }
            InboundFrame::Welcome(info) => {
                debug!(session_id = %info.id, "Ignoring welcome on an active session");
            }
            InboundFrame::Other(message_type) => {
                debug!(%message_type, "Ignoring frame");
            }
        }

        Ok(FrameAction::Continue)
    }

    /// Moves to `url` after a `session_reconnect`, keeping subscriptions.
    ///
    /// The old connection keeps being read until the new one welcomes.
    async fn migrate(&mut self, mut old: WsStream, url: &str) -> Result<WsStream> {
        info!(url, "Server requested reconnect");

        let mut ws = dial(url).await?;
        let outcome = {
            let welcome = await_welcome(&mut ws, self.welcome_timeout);
            tokio::pin!(welcome);
            let mut old_open = true;

            loop {
                tokio::select! {
                    biased;
                    frame = old.next(), if old_open => match frame {
                        Some(Ok(Message::Text(text))) => match self.apply_frame(text.as_str()) {
                            Ok(FrameAction::Continue) => {}
                            Ok(FrameAction::Reconnect(url)) => {
                                debug!(url = %url, "Ignoring reconnect while already migrating");
                            }
                            Err(err) => break Err(err),
                        },
                        Some(Ok(Message::Close(_)) | Err(_)) | None => {
                            debug!("Previous connection ended before the new welcome");
                            old_open = false;
                        }
                        Some(Ok(_)) => {}
                    },
                    result = &mut welcome => break result.map_err(MonitorError::from),
                }
            }
        };

        let welcome = match outcome {
            Ok(info) => info,
            Err(e) => {
                let _ = ws.close(None).await;
                return Err(e);
            }
        };

        let mut session = Session::from_welcome(&welcome);
        session.status = SessionStatus::Active;
        info!(session_id = %session.id, "Session migrated");
        self.session = Some(session);

        if let Err(e) = old.close(None).await {
            debug!(error = %e, "Closing previous connection failed");
        }
        Ok(ws)
    }

    fn keepalive_window(&self) -> Duration {
        let keepalive = self
            .session
            .as_ref()
            .map_or(Duration::from_secs(DEFAULT_KEEPALIVE_SECS), |s| s.keepalive);
        keepalive + self.keepalive_grace
    }

    fn mark_stable(&mut self) {
        if self.failures > 0 {
            debug!(failures = self.failures, "Connection stable, resetting retry budget");
        }
        self.failures = 0;
        self.backoff.reset();
    }

    fn mark_closed(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.status = SessionStatus::Closed;
        }
    }
}

/// Opens a WebSocket connection.
async fn dial(url: &str) -> std::result::Result<WsStream, SessionError> {
    let (ws, _response) = connect_async(url)
        .await
        .map_err(|source| SessionError::Dial {
            url: url.to_string(),
            source,
        })?;
    Ok(ws)
}

/// Waits for `session_welcome`, skipping control and malformed frames.
async fn await_welcome(
    ws: &mut WsStream,
    timeout: Duration,
) -> std::result::Result<SessionInfo, SessionError> {
    let deadline = Instant::now() + timeout;

    loop {
        let message = match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return Err(SessionError::WelcomeTimeout(timeout)),
            Ok(None) => return Err(SessionError::Closed(None)),
            Ok(Some(Err(e))) => return Err(SessionError::Read(e)),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => match InboundFrame::parse(text.as_str()) {
                Ok(InboundFrame::Welcome(info)) => return Ok(info),
                Ok(other) => {
                    return Err(SessionError::UnexpectedFrame(
                        other.message_type().to_string(),
                    ))
                }
                Err(e) => warn!(error = %e, "Ignoring malformed frame before welcome"),
            },
            Message::Close(frame) => {
                let reason = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()));
                return Err(SessionError::Closed(reason));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Endpoints, EventFlags};
    use crate::helix::HelixUser;
    use crate::output::{JsonLineSink, StatusRecord};
    use crate::token_store::Credential;
    use chrono::Utc;
    use serde_json::json;
    use std::path::PathBuf;

    fn context() -> RunContext {
        let config = Config {
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            user_login: "viewer".to_string(),
            broadcaster_login: "streamer".to_string(),
            redirect_port: 8080,
            token_path: PathBuf::from("token.json"),
            login_timeout: Duration::from_secs(60),
            flags_path: PathBuf::from("conf.json"),
            flags: EventFlags {
                chat: true,
                ..EventFlags::default()
            },
            endpoints: Endpoints::default(),
        };
        RunContext {
            config,
            http: reqwest::Client::new(),
            user_credential: Credential::new("user", 3600, Utc::now()),
            app_credential: Credential::new("app", 3600, Utc::now()),
            user: HelixUser {
                id: "u1".to_string(),
                login: "viewer".to_string(),
                display_name: "Viewer".to_string(),
            },
            broadcaster: HelixUser {
                id: "b1".to_string(),
                login: "streamer".to_string(),
                display_name: "Streamer".to_string(),
            },
        }
    }

    fn notification(subscription_type: &str, event: serde_json::Value) -> String {
        json!({
            "metadata": {"message_type": "notification", "subscription_type": subscription_type},
            "payload": {
                "subscription": {"id": "s", "type": subscription_type, "version": "1"},
                "event": event
            }
        })
        .to_string()
    }

    fn records(session: EventStreamSession<'_, JsonLineSink<Vec<u8>>>) -> Vec<String> {
        String::from_utf8(session.into_dispatcher().into_sink().into_inner())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_session_takes_keepalive_from_welcome() {
        let info = SessionInfo {
            id: "abc".to_string(),
            status: "connected".to_string(),
            connected_at: None,
            keepalive_timeout_seconds: Some(30),
            reconnect_url: None,
        };
        let session = Session::from_welcome(&info);
        assert_eq!(session.keepalive, Duration::from_secs(30));
        assert_eq!(session.status, SessionStatus::Connecting);
    }

    #[test]
    fn test_notification_is_dispatched() {
        let ctx = context();
        let mut session = EventStreamSession::new(&ctx, JsonLineSink::new(Vec::new()));

        let action = session
            .handle_frame(&notification(
                "channel.chat.message",
                json!({"chatter_user_name": "bob", "message": {"text": "hi"}}),
            ))
            .unwrap();

        assert_eq!(action, FrameAction::Continue);
        assert_eq!(records(session), vec![r#"{"text":"bob: hi"}"#]);
    }

    #[test]
    fn test_reconnect_frame_requests_migration() {
        let ctx = context();
        let mut session = EventStreamSession::new(&ctx, JsonLineSink::new(Vec::new()));

        let frame = json!({
            "metadata": {"message_type": "session_reconnect"},
            "payload": {"session": {"id": "abc", "reconnect_url": "wss://example.test/ws?id=abc"}}
        })
        .to_string();

        assert_eq!(
            session.handle_frame(&frame).unwrap(),
            FrameAction::Reconnect("wss://example.test/ws?id=abc".to_string())
        );
    }

    #[test]
    fn test_control_and_unknown_frames_emit_nothing() {
        let ctx = context();
        let mut session = EventStreamSession::new(&ctx, JsonLineSink::new(Vec::new()));

        for frame in [
            r#"{"metadata":{"message_type":"session_keepalive"},"payload":{}}"#.to_string(),
            r#"{"metadata":{"message_type":"session_mystery"},"payload":{}}"#.to_string(),
            r#"{"metadata":{"message_type":"revocation"},"payload":{"subscription":{"type":"channel.subscribe","status":"user_removed"}}}"#.to_string(),
            "not json at all".to_string(),
        ] {
            assert_eq!(session.handle_frame(&frame).unwrap(), FrameAction::Continue);
        }

        assert!(records(session).is_empty());
    }

    #[test]
    fn test_decode_failure_is_recoverable() {
        let ctx = context();
        let mut session = EventStreamSession::new(&ctx, JsonLineSink::new(Vec::new()));

        let err = session
            .handle_frame(&notification("channel.subscribe", json!({"tier": "1000"})))
            .unwrap_err();
        assert_eq!(err.policy(), ErrorPolicy::LogAndContinue);
        assert_eq!(session.dispatcher().record(), &StatusRecord::default());
    }

    #[test]
    fn test_session_error_display() {
        assert_eq!(
            SessionError::Closed(None).to_string(),
            "connection closed: no reason given"
        );
        assert_eq!(
            SessionError::Closed(Some("4003 connection unused".to_string())).to_string(),
            "connection closed: 4003 connection unused"
        );
    }
}
