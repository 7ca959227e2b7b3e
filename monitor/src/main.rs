//! twaybar - Twitch EventSub watcher for Waybar.
//!
//! This binary streams chat and subscription events for one channel and
//! prints a Waybar status line per event on stdout. Logs go to stderr.
//!
//! # Commands
//!
//! - `twaybar run`: Start the watcher (default)
//! - `twaybar login`: Authorize interactively and store the user token
//! - `twaybar logout`: Delete the stored user token
//! - `twaybar status`: Show whether a user token is stored and when it expires
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use twaybar_monitor::auth::OAuthClient;
use twaybar_monitor::browser::{BrowserOpener, ManualBrowser, SystemBrowser};
use twaybar_monitor::config::{self, Config};
use twaybar_monitor::context::{self, RunContext};
use twaybar_monitor::output::JsonLineSink;
use twaybar_monitor::session::EventStreamSession;
use twaybar_monitor::token_store::TokenStore;

/// twaybar - Twitch EventSub watcher for Waybar.
///
/// Streams chat, subscription and resubscription events for a channel and
/// prints one `{"text","tooltip"}` JSON object per event on stdout.
#[derive(Parser, Debug)]
#[command(name = "twaybar")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    TWAYBAR_CLIENT_ID          Application client id (required)
    TWAYBAR_CLIENT_SECRET      Application client secret (required)
    TWAYBAR_USER_LOGIN         Account reading chat (required)
    TWAYBAR_BROADCASTER_LOGIN  Channel to watch (required)
    TWAYBAR_REDIRECT_PORT      OAuth callback port (default: 8080)
    TWAYBAR_TOKEN_PATH         Stored token (default: <data dir>/twaybar/token.json)
    TWAYBAR_CONFIG             Flags file (default: <config dir>/twaybar/conf.json)

EXAMPLES:
    # Authorize once
    twaybar login

    # Waybar module
    \"custom/twitch\": { \"exec\": \"twaybar\", \"return-type\": \"json\" }
")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the watcher.
    ///
    /// Logs in interactively first if no valid user token is stored.
    Run,

    /// Authorize interactively and store the user token.
    Login {
        /// Print the authorize URL instead of opening a browser.
        #[arg(long)]
        no_browser: bool,
    },

    /// Delete the stored user token.
    Logout,

    /// Show whether a user token is stored and when it expires.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // A missing .env is normal; the environment may already be set.
    let _ = dotenvy::dotenv();

    init_logging(cli.json_logs);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => block_on(run_watcher()),
        Command::Login { no_browser } => block_on(run_login(no_browser)),
        Command::Logout => run_logout(),
        Command::Status => run_status(),
    }
}

fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(future)
}

/// Runs the watcher until a signal or a fatal error.
async fn run_watcher() -> Result<()> {
    info!("Starting twaybar");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        broadcaster = %config.broadcaster_login,
        flags = ?config.flags,
        token_path = %config.token_path.display(),
        "Configuration loaded"
    );

    let ctx = RunContext::bootstrap(config, &SystemBrowser)
        .await
        .context("Failed to initialize")?;

    let mut session = EventStreamSession::new(&ctx, JsonLineSink::stdout());
    match session.run(wait_for_shutdown()).await {
        Ok(()) => {
            info!("twaybar stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, policy = ?e.policy(), "twaybar stopped on error");
            Err(e).context("Event session failed")
        }
    }
}

/// Runs the interactive login and stores the token.
async fn run_login(no_browser: bool) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let http = context::http_client()?;
    let oauth = OAuthClient::new(http, config.endpoints.id_url.as_str());
    let store = TokenStore::new(config.token_path.clone());

    let opener: &dyn BrowserOpener = if no_browser {
        &ManualBrowser
    } else {
        &SystemBrowser
    };

    let credential = context::login(&config, &oauth, &store, opener)
        .await
        .context("Login failed")?;

    if store.holds(&credential) {
        eprintln!("Logged in. Token stored at: {}", store.path().display());
    } else {
        warn!(path = %store.path().display(), "Token was obtained but could not be stored");
        eprintln!("Logged in, but the token could not be stored.");
    }
    if let Some(expires_at) = credential.expires_at() {
        eprintln!("Expires at: {}", expires_at.to_rfc3339());
    }
    Ok(())
}

/// Deletes the stored token.
fn run_logout() -> Result<()> {
    let path = config::resolve_token_path().context("Failed to resolve token path")?;
    let store = TokenStore::new(path);

    if store.clear().context("Failed to delete token")? {
        eprintln!("Removed token at: {}", store.path().display());
    } else {
        eprintln!("No token stored at: {}", store.path().display());
    }
    Ok(())
}

/// Prints the stored token's state.
fn run_status() -> Result<()> {
    let path = config::resolve_token_path().context("Failed to resolve token path")?;
    let store = TokenStore::new(path);

    let Some(credential) = store.peek() else {
        eprintln!("No token stored at: {}", store.path().display());
        eprintln!("Run 'twaybar login' to authorize.");
        std::process::exit(1);
    };

    let now = Utc::now();
    eprintln!("Token: {}", store.path().display());
    match credential.expires_at() {
        Some(expires_at) if credential.is_valid_at(now) => {
            let remaining = expires_at - now;
            eprintln!(
                "Valid until {} ({} minutes left)",
                expires_at.to_rfc3339(),
                remaining.num_minutes()
            );
        }
        Some(expires_at) => {
            eprintln!("Expired at {}", expires_at.to_rfc3339());
            eprintln!("Run 'twaybar login' to authorize again.");
            std::process::exit(1);
        }
        None => eprintln!("Valid (no expiry)"),
    }
    Ok(())
}

/// Initializes the tracing subscriber on stderr.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
