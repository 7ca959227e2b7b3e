//! Interactive authorization-code login.
//!
//! The flow binds a loopback HTTP listener with a single `GET /callback`
//! route, sends the user to the authorize page, and waits for the provider
//! to redirect back with a `code`. The first callback wins: its outcome is
//! handed over a one-shot channel and every later callback only gets the
//! acknowledgment page. The listener is shut down on every exit path.

use std::future::IntoFuture;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, OAuthClient};
use crate::browser::BrowserOpener;
use crate::token_store::{Credential, TokenStore};

/// Route the provider redirects to.
pub const CALLBACK_PATH: &str = "/callback";

/// Scopes requested for the user token.
pub const DEFAULT_SCOPES: [&str; 2] = ["channel:read:subscriptions", "user:read:chat"];

const SUCCESS_PAGE: &str = "Authorization successful! You can close this window.";
const FAILURE_PAGE: &str = "Authorization failed!";

/// Upper bound on graceful listener shutdown before the task is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors that can occur during interactive login.
#[derive(Error, Debug)]
pub enum LoginError {
    /// No callback arrived in time.
    #[error("no authorization received within {0:?}")]
    Timeout(Duration),

    /// The listener, the provider, or the code exchange failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// What the provider sent back to the callback route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The user granted access.
    Code(String),
    /// The provider redirected back with an `error`.
    Denied(String),
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

type CodeSlot = Arc<Mutex<Option<oneshot::Sender<CallbackOutcome>>>>;

/// Builds the callback router. The first valid callback is delivered on `tx`.
pub fn callback_router(tx: oneshot::Sender<CallbackOutcome>) -> Router {
    let slot: CodeSlot = Arc::new(Mutex::new(Some(tx)));
    Router::new()
        .route(CALLBACK_PATH, get(handle_callback))
        .with_state(slot)
}

async fn handle_callback(
    State(slot): State<CodeSlot>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<&'static str>) {
    let outcome = match (params.code, params.error) {
        (Some(code), _) if !code.is_empty() => CallbackOutcome::Code(code),
        (_, Some(error)) => CallbackOutcome::Denied(params.error_description.unwrap_or(error)),
        _ => {
            warn!("Callback without code or error");
            return (StatusCode::BAD_REQUEST, Html(FAILURE_PAGE));
        }
    };

    let page = match outcome {
        CallbackOutcome::Code(_) => SUCCESS_PAGE,
        CallbackOutcome::Denied(_) => FAILURE_PAGE,
    };

    let sender = match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };

    match sender {
        Some(tx) => {
            if tx.send(outcome).is_err() {
                debug!("Login no longer waiting for the callback");
            }
        }
        None => debug!("Ignoring repeated callback"),
    }

    (StatusCode::OK, Html(page))
}

/// A running callback listener.
pub struct CallbackServer {
    redirect_uri: String,
    outcome: oneshot::Receiver<CallbackOutcome>,
    stop: Option<watch::Sender<bool>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl CallbackServer {
    /// Binds `127.0.0.1:<port>` and, when available, `[::1]:<port>`, then
    /// starts serving the callback route on both.
    ///
    /// The redirect URI names `localhost`, which browsers may resolve to
    /// either loopback. Port `0` picks a free port;
    /// [`CallbackServer::redirect_uri`] reflects the port actually bound.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Listener`] if the IPv4 port cannot be bound.
    pub async fn bind(port: u16) -> Result<Self, AuthError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(AuthError::Listener)?;
        let bound = listener.local_addr().map_err(AuthError::Listener)?;

        let listener_v6 = match TcpListener::bind((Ipv6Addr::LOCALHOST, bound.port())).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                debug!(error = %e, "IPv6 loopback unavailable, serving IPv4 only");
                None
            }
        };

        let (code_tx, code_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let app = callback_router(code_tx);

        let task = tokio::spawn(async move {
            let v4 = axum::serve(listener, app.clone())
                .with_graceful_shutdown(stopped(stop_rx.clone()))
                .into_future();

            match listener_v6 {
                Some(listener_v6) => {
                    let v6 = axum::serve(listener_v6, app)
                        .with_graceful_shutdown(stopped(stop_rx))
                        .into_future();
                    let (v4, v6) = tokio::join!(v4, v6);
                    v4.and(v6)
                }
                None => v4.await,
            }
        });

        debug!(addr = %bound, "Callback listener started");

        Ok(Self {
            redirect_uri: format!("http://localhost:{}{CALLBACK_PATH}", bound.port()),
            outcome: code_rx,
            stop: Some(stop_tx),
            task,
        })
    }

    /// The redirect URI to register in the authorize request.
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Waits for the first callback.
    ///
    /// # Errors
    ///
    /// Returns [`LoginError::Timeout`] if nothing arrives within `timeout`,
    /// and [`AuthError::Listener`] if the listener stopped early.
    pub async fn wait(&mut self, timeout: Duration) -> Result<CallbackOutcome, LoginError> {
        match tokio::time::timeout(timeout, &mut self.outcome).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(AuthError::Listener(std::io::Error::other(
                "callback listener stopped before a code arrived",
            ))
            .into()),
            Err(_) => Err(LoginError::Timeout(timeout)),
        }
    }

    /// Stops the listener, aborting it if in-flight connections do not
    /// drain within a few seconds.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task).await {
            Ok(Ok(Ok(()))) => debug!("Callback listener stopped"),
            Ok(Ok(Err(e))) => warn!(error = %e, "Callback listener failed"),
            Ok(Err(e)) => warn!(error = %e, "Callback listener task failed"),
            Err(_) => {
                warn!("Callback listener did not drain in time, aborting");
                self.task.abort();
            }
        }
    }
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Runs the authorization-code flow and persists the resulting credential.
pub struct UserAuthenticator<'a> {
    oauth: &'a OAuthClient,
    store: &'a TokenStore,
    opener: &'a dyn BrowserOpener,
}

impl<'a> UserAuthenticator<'a> {
    pub fn new(oauth: &'a OAuthClient, store: &'a TokenStore, opener: &'a dyn BrowserOpener) -> Self {
        Self {
            oauth,
            store,
            opener,
        }
    }

    /// Obtains a user credential interactively.
    ///
    /// On success the credential is saved; a save failure is logged and the
    /// credential is still returned. On timeout nothing is saved.
    ///
    /// # Errors
    ///
    /// - [`LoginError::Timeout`] if no callback arrives within `timeout`
    /// - [`LoginError::Auth`] if the listener cannot bind, the user denies
    ///   access, or the code exchange fails
    pub async fn authenticate(
        &self,
        client_id: &str,
        client_secret: &str,
        port: u16,
        scopes: &[&str],
        timeout: Duration,
    ) -> Result<Credential, LoginError> {
        let mut server = CallbackServer::bind(port).await?;
        let redirect_uri = server.redirect_uri().to_string();

        let url = match self.oauth.authorize_url(client_id, &redirect_uri, scopes) {
            Ok(url) => url,
            Err(e) => {
                server.shutdown().await;
                return Err(e.into());
            }
        };

        info!(redirect_uri = %redirect_uri, timeout_secs = timeout.as_secs(), "Waiting for authorization");
        if let Err(e) = self.opener.open(&url) {
            warn!(error = %e, "Could not open a browser");
            eprintln!("Open this URL in a browser to authorize twaybar:\n\n    {url}\n");
        }

        let outcome = server.wait(timeout).await;
        server.shutdown().await;

        let code = match outcome? {
            CallbackOutcome::Code(code) => code,
            CallbackOutcome::Denied(reason) => return Err(AuthError::Denied(reason).into()),
        };

        let credential = self
            .oauth
            .exchange_code(client_id, client_secret, &code, &redirect_uri)
            .await?;

        match self.store.save(&credential) {
            Ok(()) => info!(path = %self.store.path().display(), "Stored user credential"),
            Err(e) => warn!(error = %e, "Failed to store user credential"),
        }

        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_callback(app: Router, query: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("{CALLBACK_PATH}{query}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_first_code_wins() {
        let (tx, rx) = oneshot::channel();
        let app = callback_router(tx);

        let (status, body) = get_callback(app.clone(), "?code=first").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, SUCCESS_PAGE);

        let (status, body) = get_callback(app, "?code=second").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, SUCCESS_PAGE);

        assert_eq!(rx.await.unwrap(), CallbackOutcome::Code("first".to_string()));
    }

    #[tokio::test]
    async fn test_missing_code_does_not_consume_slot() {
        let (tx, rx) = oneshot::channel();
        let app = callback_router(tx);

        let (status, body) = get_callback(app.clone(), "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, FAILURE_PAGE);

        get_callback(app, "?code=late").await;
        assert_eq!(rx.await.unwrap(), CallbackOutcome::Code("late".to_string()));
    }

    #[tokio::test]
    async fn test_provider_error_is_denied() {
        let (tx, rx) = oneshot::channel();
        let app = callback_router(tx);

        let (_, body) = get_callback(
            app,
            "?error=access_denied&error_description=The+user+denied+you+access",
        )
        .await;
        assert_eq!(body, FAILURE_PAGE);
        assert_eq!(
            rx.await.unwrap(),
            CallbackOutcome::Denied("The user denied you access".to_string())
        );
    }

    #[tokio::test]
    async fn test_server_times_out_and_shuts_down() {
        let mut server = CallbackServer::bind(0).await.unwrap();
        assert!(server.redirect_uri().starts_with("http://localhost:"));
        assert!(server.redirect_uri().ends_with(CALLBACK_PATH));

        let err = server.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, LoginError::Timeout(_)));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_callbacks_do_not_block() {
        let mut server = CallbackServer::bind(0).await.unwrap();
        let callback = server.redirect_uri().replace("localhost", "127.0.0.1");
        let client = reqwest::Client::new();

        let (first, second) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                client.get(format!("{callback}?code=first")).send(),
                client.get(format!("{callback}?code=second")).send(),
            )
        })
        .await
        .unwrap();
        assert_eq!(first.unwrap().status(), reqwest::StatusCode::OK);
        assert_eq!(second.unwrap().status(), reqwest::StatusCode::OK);

        let outcome = server.wait(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            outcome,
            CallbackOutcome::Code(ref code) if code == "first" || code == "second"
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_callback_reachable_on_ipv6_loopback() {
        if std::net::TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).is_err() {
            return;
        }

        let mut server = CallbackServer::bind(0).await.unwrap();
        let port = url::Url::parse(server.redirect_uri())
            .unwrap()
            .port()
            .unwrap();

        let response = reqwest::get(format!("http://[::1]:{port}{CALLBACK_PATH}?code=v6"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        assert_eq!(
            server.wait(Duration::from_secs(1)).await.unwrap(),
            CallbackOutcome::Code("v6".to_string())
        );
        server.shutdown().await;
    }
}
