//! # fitlink-server
//!
//! Realtime messaging and presence core for the client/trainer marketplace.
//!
//! This binary provides:
//! - **REST API** (axum) over conversations and messages
//! - **Realtime gateway** on `/ws`: room fan-out of messages, receipts,
//!   typing indicators and presence
//! - **Presence registry** with a reconnect grace period
//! - **Typing coordinator** with auto-expiry
//! - **Per-IP and per-user rate limiting**
//!
//! `fitlink-server issue-token <user-id> <client|trainer>` prints a signed
//! identity token for local testing.

mod api;
mod auth;
mod config;
mod directory;
mod error;
mod gateway;
mod notify;
mod presence;
mod rate_limit;
mod timers;
mod typing;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use fitlink_shared::constants::APP_NAME;
use fitlink_shared::Role;
use fitlink_store::{Database, MessageStore};

use crate::api::AppState;
use crate::auth::TokenAuthenticator;
use crate::config::ServerConfig;
use crate::gateway::{Gateway, GatewaySettings};
use crate::notify::LogNotifier;
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fitlink_server=debug")),
        )
        .init();

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("issue-token") {
        return issue_token(&config, &args[1..]);
    }

    info!("Starting {} server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    info!(path = ?db.path(), "Database ready");

    let (store, store_events) = MessageStore::with_events(db);

    let gateway = Gateway::start(
        store,
        store_events,
        Arc::new(TokenAuthenticator::new(config.auth_secret.as_bytes())),
        Arc::new(LogNotifier),
        GatewaySettings::from(&config),
    );

    let rate_limiter = RateLimiter::new(config.http_rate, config.http_burst);

    let app_state = AppState {
        gateway: gateway.clone(),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let http_rl = rate_limiter.clone();
    let send_rl = gateway.send_limiter().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            http_rl.purge_stale(600.0).await;
            send_rl.purge_stale(600.0).await;
        }
    });

    // Evict offline presence entries past retention
    let presence = gateway.presence().clone();
    let retention = config.presence_retention;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            let evicted = presence.purge_offline(retention);
            if evicted > 0 {
                info!(evicted, "Purged stale presence entries");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let result = tokio::select! {
        result = api::serve(app_state, config.http_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    gateway.shutdown().await;

    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    result
}

fn issue_token(config: &ServerConfig, args: &[String]) -> anyhow::Result<()> {
    let (Some(user_id), Some(role)) = (args.first(), args.get(1)) else {
        anyhow::bail!("usage: fitlink-server issue-token <user-id> <client|trainer>");
    };
    let role: Role = role.parse()?;

    let token = TokenAuthenticator::new(config.auth_secret.as_bytes())
        .issue(user_id, role, chrono::Duration::days(30))?;
    println!("{token}");
    Ok(())
}
