// src/main.rs

use clap::Parser;
use realtime_chat::{
    config::Config,
    database::{MemoryMessageStore, MemoryUserStore, MessageStore, PgStore, UserStore, setup_database},
    hub::ConnectionHub,
    identity::JwtIdentity,
    presence::{PresenceTracker, SWEEP_INTERVAL},
    routes::build_router,
    state::AppState,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// The main entry point for our application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(config.json_logs);

    tracing::info!("realtime_chat v{} starting", env!("CARGO_PKG_VERSION"));

    let in_memory = config.database_url.is_none();
    let (messages, users): (Arc<dyn MessageStore>, Arc<dyn UserStore>) = match &config.database_url {
        Some(url) => {
            let store = Arc::new(PgStore::new(setup_database(url).await?));
            (store.clone() as Arc<dyn MessageStore>, store as Arc<dyn UserStore>)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores");
            (
                Arc::new(MemoryMessageStore::new()) as Arc<dyn MessageStore>,
                Arc::new(MemoryUserStore::new()) as Arc<dyn UserStore>,
            )
        }
    };

    let presence = Arc::new(PresenceTracker::new(users.clone()));
    let sweep = presence.start_sweep(SWEEP_INTERVAL);
    let mut identity = JwtIdentity::new(config.jwt_secret.as_bytes(), users);
    if in_memory {
        // No user table to look names up in.
        identity = identity.with_claims_fallback();
    }
    let identity = Arc::new(identity);

    let state = AppState::new(ConnectionHub::new(), presence, messages, identity)
        .with_outbound_capacity(config.outbound_queue);
    let app = build_router(state);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {addr}, websocket at ws://{addr}/api/v1/chat/rooms/{{id}}/ws");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweep.stop();
    tracing::info!("server stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("realtime_chat=info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
