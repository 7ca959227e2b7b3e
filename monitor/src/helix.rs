//! Platform REST API: user lookup by login.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors from the user lookup.
#[derive(Error, Debug)]
pub enum HelixError {
    /// The request could not be sent or its body read.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The bearer token was rejected.
    #[error("token rejected by platform API")]
    Unauthorized,

    /// Any other non-success answer.
    #[error("platform API returned {status}: {body}")]
    Rejected { status: u16, body: String },

    /// No account has this login.
    #[error("unknown login '{0}'")]
    UnknownLogin(String),

    /// The answer was not the expected JSON.
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A platform account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HelixUser {
    pub id: String,
    pub login: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    data: Vec<HelixUser>,
}

/// Minimal client for the platform REST API.
#[derive(Debug, Clone)]
pub struct HelixClient {
    http: Client,
    api_url: String,
    client_id: String,
}

impl HelixClient {
    pub fn new(http: Client, api_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        }
    }

    /// Resolves `login` to its account.
    ///
    /// # Errors
    ///
    /// - [`HelixError::Unauthorized`] on 401, so the caller can re-mint the token
    /// - [`HelixError::UnknownLogin`] if the API returns no account
    /// - [`HelixError::Rejected`] on any other non-success status
    pub async fn user_by_login(&self, token: &str, login: &str) -> Result<HelixUser, HelixError> {
        let response = self
            .http
            .get(format!("{}/users", self.api_url))
            .query(&[("login", login)])
            .bearer_auth(token)
            .header("Client-Id", &self.client_id)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(HelixError::Unauthorized);
        }
        if !status.is_success() {
            return Err(HelixError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let users: UsersResponse = serde_json::from_str(&body)?;
        let user = users
            .data
            .into_iter()
            .next()
            .ok_or_else(|| HelixError::UnknownLogin(login.to_string()))?;

        debug!(login = %user.login, id = %user.id, "Resolved user");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HelixClient {
        HelixClient::new(Client::new(), format!("{}/helix", server.uri()), "cid")
    }

    #[tokio::test]
    async fn test_user_by_login() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .and(query_param("login", "twitchdev"))
            .and(header("Authorization", "Bearer app-token"))
            .and(header("Client-Id", "cid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{
                    "id": "141981764",
                    "login": "twitchdev",
                    "display_name": "TwitchDev",
                    "type": "",
                    "broadcaster_type": "partner"
                }]
            })))
            .mount(&server)
            .await;

        let user = client_for(&server)
            .user_by_login("app-token", "twitchdev")
            .await
            .unwrap();
        assert_eq!(user.id, "141981764");
        assert_eq!(user.display_name, "TwitchDev");
    }

    #[tokio::test]
    async fn test_empty_result_is_unknown_login() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .user_by_login("t", "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, HelixError::UnknownLogin(ref l) if l == "ghost"));
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .mount(&server)
            .await;

        let err = client_for(&server).user_by_login("t", "x").await.unwrap_err();
        assert!(matches!(err, HelixError::Unauthorized));
    }

    #[tokio::test]
    async fn test_server_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/helix/users"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let err = client_for(&server).user_by_login("t", "x").await.unwrap_err();
        assert!(matches!(err, HelixError::Rejected { status: 503, .. }));
    }
}
