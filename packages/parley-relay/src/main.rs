//! Parley Relay Server
//!
//! Loads the identity directory, opens the message store, picks a
//! notification dispatcher and serves the WebSocket relay.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use parley_relay::identity::{IdentityProvider, TokenDirectory};
use parley_relay::notify::{LogDispatcher, NotificationDispatcher, WebhookDispatcher};
use parley_relay::routes;
use parley_relay::router::DEFAULT_MAX_CONTENT_CHARS;
use parley_relay::store::MessageStore;
use parley_relay::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "parley-relay", version, about = "Parley messaging relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// SQLite database file for the message log (in-memory when unset)
    #[arg(long, env = "DATABASE_PATH")]
    database_path: Option<String>,

    /// JSON file listing principals and their token digests
    #[arg(long, env = "IDENTITY_FILE")]
    identity_file: Option<String>,

    /// Webhook that receives offline notifications. Notifications are only
    /// logged when unset.
    #[arg(long, env = "NOTIFY_WEBHOOK_URL")]
    notify_webhook_url: Option<String>,

    /// Notification timeout in milliseconds, retries included
    #[arg(long, default_value_t = 5000, env = "NOTIFY_TIMEOUT_MS")]
    notify_timeout_ms: u64,

    /// Retries after a failed notification attempt
    #[arg(long, default_value_t = 2, env = "NOTIFY_RETRIES")]
    notify_retries: u32,

    /// Maximum message length in characters
    #[arg(long, default_value_t = DEFAULT_MAX_CONTENT_CHARS, env = "MAX_CONTENT_CHARS")]
    max_content_chars: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Server region label (e.g. "US East", "EU West")
    #[arg(long, default_value = "US East", env = "RELAY_REGION")]
    region: String,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "parley_relay=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = RelayConfig {
        port: args.port,
        database_path: args.database_path,
        max_content_chars: args.max_content_chars,
        notify_timeout: Duration::from_millis(args.notify_timeout_ms),
        notify_retries: args.notify_retries,
        region: args.region,
        ..RelayConfig::default()
    };

    // ── Collaborators ─────────────────────────────────────────────────────

    let store = match MessageStore::open(config.database_path.as_deref()) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open message store");
            std::process::exit(1);
        }
    };
    if config.database_path.is_none() {
        tracing::warn!("No DATABASE_PATH set, messages are kept in memory only");
    }

    let identity: Arc<dyn IdentityProvider> = match args.identity_file.as_deref() {
        Some(path) => match TokenDirectory::load(path) {
            Ok(dir) => Arc::new(dir),
            Err(e) => {
                tracing::error!(path, error = %e, "Failed to load identity directory");
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("No IDENTITY_FILE set, every authentication will be rejected");
            Arc::new(TokenDirectory::new())
        }
    };

    let notifier: Arc<dyn NotificationDispatcher> = match args.notify_webhook_url.as_deref() {
        Some(url) => match WebhookDispatcher::new(url, config.notify_request_timeout()) {
            Ok(webhook) => {
                tracing::info!(url, "Offline notifications via webhook");
                Arc::new(webhook)
            }
            Err(e) => {
                tracing::error!(url, error = %e, "Failed to build notification webhook");
                std::process::exit(1);
            }
        },
        None => {
            tracing::info!("Offline notifications are logged only (no NOTIFY_WEBHOOK_URL)");
            Arc::new(LogDispatcher)
        }
    };

    let state = RelayState::new(config, store, identity, notifier);
    let app = routes::app(state);

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("Parley relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::try_parse_from(["parley-relay"]).unwrap();
        assert_eq!(args.port, 8080);
        assert_eq!(args.notify_timeout_ms, 5000);
        assert_eq!(args.notify_retries, 2);
        assert_eq!(args.max_content_chars, DEFAULT_MAX_CONTENT_CHARS);
        assert!(!args.log_json);
        assert!(args.identity_file.is_none());
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "parley-relay",
            "--port",
            "9000",
            "--max-content-chars",
            "280",
            "--log-json",
            "--region",
            "EU West",
        ])
        .unwrap();
        assert_eq!(args.port, 9000);
        assert_eq!(args.max_content_chars, 280);
        assert!(args.log_json);
        assert_eq!(args.region, "EU West");
    }
}
