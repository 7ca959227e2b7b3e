//! EventSub subscription registration.
//!
//! After a welcome frame the session registers one subscription per enabled
//! category, binding it to the connection through `transport.session_id`.
//! Registrations are connection scoped: a fresh connection (other than a
//! server-initiated reconnect) needs a fresh set.

use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::SubscriptionKind;

/// Errors from a registration request.
#[derive(Error, Debug)]
pub enum SubscriptionError {
    /// The request could not be sent or its body read.
    #[error("registration request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The platform refused the registration.
    #[error("registration of {kind} rejected with {status}: {body}")]
    Rejected {
        kind: SubscriptionKind,
        status: u16,
        body: String,
    },

    /// The user token was rejected.
    #[error("user token rejected while registering {kind}")]
    Unauthorized { kind: SubscriptionKind },
}

/// Who a subscription is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub broadcaster_user_id: String,
    /// Reading account; only chat subscriptions carry it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Where events are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transport {
    pub method: &'static str,
    pub session_id: String,
}

/// Body of `POST /eventsub/subscriptions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "type")]
    pub kind: SubscriptionKind,
    pub version: &'static str,
    pub condition: Condition,
    pub transport: Transport,
}

impl SubscriptionRequest {
    /// Builds the request for `kind` on session `session_id`.
    pub fn new(
        kind: SubscriptionKind,
        session_id: &str,
        user_id: &str,
        broadcaster_id: &str,
    ) -> Self {
        let user_id = match kind {
            SubscriptionKind::ChatMessage => Some(user_id.to_string()),
            SubscriptionKind::ChannelSubscribe | SubscriptionKind::SubscriptionMessage => None,
        };

        Self {
            kind,
            version: kind.version(),
            condition: Condition {
                broadcaster_user_id: broadcaster_id.to_string(),
                user_id,
            },
            transport: Transport {
                method: "websocket",
                session_id: session_id.to_string(),
            },
        }
    }
}

/// Sends registration requests.
#[derive(Debug, Clone)]
pub struct SubscriptionRegistrar {
    http: Client,
    api_url: String,
    client_id: String,
    debug: bool,
}

impl SubscriptionRegistrar {
    pub fn new(http: Client, api_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            debug: false,
        }
    }

    /// Logs resub registration traffic at info level.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Registers one subscription.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Unauthorized`] on 401 and
    /// [`SubscriptionError::Rejected`] on any other non-success status.
    pub async fn register(
        &self,
        session_id: &str,
        user_token: &str,
        user_id: &str,
        broadcaster_id: &str,
        kind: SubscriptionKind,
    ) -> Result<(), SubscriptionError> {
        let request = SubscriptionRequest::new(kind, session_id, user_id, broadcaster_id);
        let dump = self.debug && kind == SubscriptionKind::SubscriptionMessage;

        if dump {
            match serde_json::to_string(&request) {
                Ok(body) => info!(%kind, body = %body, "Subscription request"),
                Err(e) => debug!(error = %e, "Could not render subscription request"),
            }
        }

        let response = self
            .http
            .post(format!("{}/eventsub/subscriptions", self.api_url))
            .bearer_auth(user_token)
            .header("Client-Id", &self.client_id)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if dump {
            info!(%kind, status = status.as_u16(), body = %body, "Subscription response");
        }

        if status == StatusCode::UNAUTHORIZED {
            return Err(SubscriptionError::Unauthorized { kind });
        }
        if !status.is_success() {
            return Err(SubscriptionError::Rejected {
                kind,
                status: status.as_u16(),
                body,
            });
        }

        info!(%kind, session_id, "Registered subscription");
        Ok(())
    }

    /// Registers every kind in `kinds`, in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first registration error.
    pub async fn register_all(
        &self,
        session_id: &str,
        user_token: &str,
        user_id: &str,
        broadcaster_id: &str,
        kinds: &[SubscriptionKind],
    ) -> Result<(), SubscriptionError> {
        for &kind in kinds {
            self.register(session_id, user_token, user_id, broadcaster_id, kind)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registrar_for(server: &MockServer) -> SubscriptionRegistrar {
        SubscriptionRegistrar::new(Client::new(), server.uri(), "cid")
    }

    #[test]
    fn test_chat_request_carries_user_id() {
        let body =
            serde_json::to_value(SubscriptionRequest::new(SubscriptionKind::ChatMessage, "abc", "u1", "b1"))
                .unwrap();
        assert_eq!(
            body,
            json!({
                "type": "channel.chat.message",
                "version": "1",
                "condition": {"broadcaster_user_id": "b1", "user_id": "u1"},
                "transport": {"method": "websocket", "session_id": "abc"}
            })
        );
    }

    #[test]
    fn test_subscribe_request_omits_user_id() {
        let body = serde_json::to_value(SubscriptionRequest::new(
            SubscriptionKind::ChannelSubscribe,
            "abc",
            "u1",
            "b1",
        ))
        .unwrap();
        assert_eq!(body["condition"], json!({"broadcaster_user_id": "b1"}));
        assert_eq!(body["type"], "channel.subscribe");
    }

    #[tokio::test]
    async fn test_chat_only_registers_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/eventsub/subscriptions"))
            .and(header("Authorization", "Bearer user-token"))
            .and(header("Client-Id", "cid"))
            .and(body_json(json!({
                "type": "channel.chat.message",
                "version": "1",
                "condition": {"broadcaster_user_id": "b1", "user_id": "u1"},
                "transport": {"method": "websocket", "session_id": "abc"}
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        registrar_for(&server)
            .register_all("abc", "user-token", "u1", "b1", &[SubscriptionKind::ChatMessage])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejection_stops_registration() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/eventsub/subscriptions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad condition"))
            .expect(1)
            .mount(&server)
            .await;

        let err = registrar_for(&server)
            .register_all("abc", "t", "u1", "b1", &SubscriptionKind::ALL)
            .await
            .unwrap_err();

        match err {
            SubscriptionError::Rejected { kind, status, body } => {
                assert_eq!(kind, SubscriptionKind::ChatMessage);
                assert_eq!(status, 400);
                assert_eq!(body, "bad condition");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/eventsub/subscriptions"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = registrar_for(&server)
            .register("abc", "t", "u1", "b1", SubscriptionKind::ChannelSubscribe)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SubscriptionError::Unauthorized {
                kind: SubscriptionKind::ChannelSubscribe
            }
        ));
    }

    #[tokio::test]
    async fn test_debug_mode_does_not_change_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/eventsub/subscriptions"))
            .respond_with(ResponseTemplate::new(202).set_body_string(r#"{"data":[]}"#))
            .expect(1)
            .mount(&server)
            .await;

        registrar_for(&server)
            .with_debug(true)
            .register("abc", "t", "u1", "b1", SubscriptionKind::SubscriptionMessage)
            .await
            .unwrap();
    }
}
