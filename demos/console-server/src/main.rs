//! NetConsole demo server.
//!
//! Run with: cargo run -p console-server
//!
//! Accounts, sessions and variables live in memory unless
//! `NETCONSOLE_DATABASE_URL` points at a SQLite database (for example
//! `sqlite://netconsole.db?mode=rwc`). Set
//! `NETCONSOLE_ADMIN_PASSWORD` to provision the administrator account.

mod app;
mod config;

use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use netconsole_protocol::{ConsoleApp, Protocol, http};
use netconsole_store::{MemoryStore, SqliteStore, Store, ensure_user};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{app::DemoApp, config::ServerConfig};

/// How often stale sessions are swept.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerConfig::from_env();

    if let Some(url) = &config.database_url {
        let store = SqliteStore::connect(url)
            .await
            .with_context(|| format!("failed to open database {url}"))?;
        tracing::info!(url, "using SQLite store");
        serve(store, config).await
    } else {
        tracing::info!("using in-memory store");
        serve(MemoryStore::new(), config).await
    }
}

async fn serve<S: Store + 'static>(store: S, config: ServerConfig) -> anyhow::Result<()> {
    match &config.admin_password {
        Some(password) => {
            ensure_user(&store, &config.admin_user, password, true)
                .await
                .context("failed to provision administrator")?;
        }
        None => tracing::warn!(
            user = %config.admin_user,
            "NETCONSOLE_ADMIN_PASSWORD not set; administrator not provisioned"
        ),
    }

    let protocol = Arc::new(Protocol::new(
        store,
        DemoApp::new(Duration::from_millis(250)),
        config.protocol.clone(),
    ));
    tokio::spawn(purge_loop(Arc::clone(&protocol)));

    let app = http::router(protocol)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(
        "Console listening on http://{}{}",
        config.bind,
        http::CONSOLE_PATH
    );
    axum::serve(listener, app).await?;
    Ok(())
}

async fn purge_loop<S: Store + 'static, A: ConsoleApp>(protocol: Arc<Protocol<S, A>>) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = protocol.purge_stale().await {
            tracing::warn!("session purge failed: {e}");
        }
    }
}
