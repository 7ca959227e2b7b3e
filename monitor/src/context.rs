//! Everything a run needs, resolved once at startup.
//!
//! [`RunContext::bootstrap`] loads (or interactively obtains) the user
//! credential, mints an app credential, and resolves both logins to
//! account ids. The result is passed by reference to the session.

use std::time::Duration;

use reqwest::Client;
use tracing::{info, warn};

use crate::auth::{AuthError, OAuthClient};
use crate::browser::BrowserOpener;
use crate::config::Config;
use crate::error::{MonitorError, Result};
use crate::helix::{HelixClient, HelixError, HelixUser};
use crate::login::{LoginError, UserAuthenticator, DEFAULT_SCOPES};
use crate::subscriptions::SubscriptionRegistrar;
use crate::token_store::{Credential, TokenStore, TokenStoreError};
use crate::types::SubscriptionKind;

/// HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Builds the shared HTTP client.
///
/// # Errors
///
/// Returns [`MonitorError::Http`] if the TLS backend cannot be initialized.
pub fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| MonitorError::Http(e.to_string()))
}

/// Runs the interactive login and stores the resulting user credential.
///
/// # Errors
///
/// See [`UserAuthenticator::authenticate`].
pub async fn login(
    config: &Config,
    oauth: &OAuthClient,
    store: &TokenStore,
    opener: &dyn BrowserOpener,
) -> std::result::Result<Credential, LoginError> {
    UserAuthenticator::new(oauth, store, opener)
        .authenticate(
            &config.client_id,
            &config.client_secret,
            config.redirect_port,
            &DEFAULT_SCOPES,
            config.login_timeout,
        )
        .await
}

/// Resolved state for one run of the monitor.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Config,
    pub http: Client,
    pub user_credential: Credential,
    pub app_credential: Credential,
    /// The account reading chat.
    pub user: HelixUser,
    /// The channel being watched.
    pub broadcaster: HelixUser,
}

impl RunContext {
    /// Resolves credentials and account ids.
    ///
    /// # Errors
    ///
    /// - `Auth` / `Timeout` if no user credential can be obtained
    /// - `Auth` if the app credential cannot be minted or is rejected twice
    /// - `Config` if a login does not exist
    /// - `TokenStore` if the stored record exists but cannot be read
    pub async fn bootstrap(config: Config, opener: &dyn BrowserOpener) -> Result<Self> {
        let http = http_client()?;
        let oauth = OAuthClient::new(http.clone(), config.endpoints.id_url.as_str());
        let store = TokenStore::new(config.token_path.clone());

        let user_credential = match store.load() {
            Ok(credential) => {
                info!(path = %store.path().display(), "Using stored user credential");
                credential
            }
            Err(e @ (TokenStoreError::NotFound | TokenStoreError::Expired { .. })) => {
                info!(reason = %e, "Interactive authorization required");
                login(&config, &oauth, &store, opener).await?
            }
            Err(e) => return Err(e.into()),
        };

        let mut app_credential = oauth
            .app_token(&config.client_id, &config.client_secret)
            .await?;

        let helix = HelixClient::new(
            http.clone(),
            config.endpoints.api_url.as_str(),
            config.client_id.as_str(),
        );

        let user = lookup(&helix, &oauth, &config, &mut app_credential, &config.user_login).await?;
        let broadcaster = lookup(
            &helix,
            &oauth,
            &config,
            &mut app_credential,
            &config.broadcaster_login,
        )
        .await?;

        info!(
            user = %user.login,
            user_id = %user.id,
            broadcaster = %broadcaster.login,
            broadcaster_id = %broadcaster.id,
            "Resolved accounts"
        );

        Ok(Self {
            config,
            http,
            user_credential,
            app_credential,
            user,
            broadcaster,
        })
    }

    /// Categories enabled in the flags file.
    #[must_use]
    pub fn enabled_kinds(&self) -> Vec<SubscriptionKind> {
        self.config.flags.enabled_kinds()
    }

    /// A registrar bound to this run's API endpoint and client id.
    #[must_use]
    pub fn registrar(&self) -> SubscriptionRegistrar {
        SubscriptionRegistrar::new(
            self.http.clone(),
            self.config.endpoints.api_url.as_str(),
            self.config.client_id.as_str(),
        )
        .with_debug(self.config.flags.debug)
    }

    /// Fails with [`AuthError::Expired`] once the user credential has lapsed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Expired`] if the credential is no longer valid.
    pub fn ensure_user_credential(&self) -> std::result::Result<&Credential, AuthError> {
        if self.user_credential.is_valid() {
            Ok(&self.user_credential)
        } else {
            Err(AuthError::Expired)
        }
    }
}

/// Resolves `login`, re-minting the app credential once if it is rejected.
async fn lookup(
    helix: &HelixClient,
    oauth: &OAuthClient,
    config: &Config,
    app_credential: &mut Credential,
    login: &str,
) -> Result<HelixUser> {
    match helix
        .user_by_login(&app_credential.access_token, login)
        .await
    {
        Err(HelixError::Unauthorized) => {
            warn!(login, "App credential rejected, minting a new one");
            *app_credential = oauth
                .app_token(&config.client_id, &config.client_secret)
                .await?;
            Ok(helix
                .user_by_login(&app_credential.access_token, login)
                .await?)
        }
        other => Ok(other?),
    }
}
