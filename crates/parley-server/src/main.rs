use anyhow::Result;
use axum::{extract::State, routing::get, Json};
use clap::Parser;
use parley_core::auth::JwtIdentity;
use parley_core::notify::{LogSink, NotificationDispatcher, NotificationSink, WebhookSink};
use parley_core::relationships::DbRelationships;
use parley_core::{reconcile, AppState};
use parley_ws::GatewayState;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parley=info,tower_http=debug"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let mut config = config::Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    init_tracing(config.logging.json);
    tracing::info!(path = %args.config, "configuration loaded");

    let db = parley_db::create_pool_full(
        &config.database.url,
        config.database.max_connections,
        Some(parley_db::PgConnectOptions {
            statement_timeout_secs: config.database.statement_timeout_secs,
        }),
    )
    .await?;
    parley_db::run_migrations(&db).await?;

    // ── Notifications ────────────────────────────────────────────────────────
    let notification_timeout = Duration::from_millis(config.engine.notification_timeout_ms);
    let (notifications, queue) = NotificationDispatcher::new(config.engine.notification_queue_size);
    let sink: Arc<dyn NotificationSink> = match &config.notifications.webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "offline notifications go to webhook");
            Arc::new(WebhookSink::new(url.clone(), notification_timeout)?)
        }
        None => Arc::new(LogSink),
    };
    queue.spawn(sink, notification_timeout);

    let state = AppState::new(
        db.clone(),
        Arc::new(JwtIdentity::new(config.auth.jwt_secret.clone())),
        Arc::new(DbRelationships::new(db)),
        notifications,
        config.engine_config(),
    );

    // ── Background tasks ─────────────────────────────────────────────────────
    if config.engine.reconcile_interval_seconds > 0 {
        reconcile::spawn_periodic(
            state.clone(),
            Duration::from_secs(config.engine.reconcile_interval_seconds),
        );
    } else {
        tracing::info!("unread reconcile pass disabled");
    }

    let gateway = GatewayState::new(state, config.gateway.gateway_config());
    gateway.spawn_limiter_cleanup(LIMITER_CLEANUP_INTERVAL);

    let app = parley_ws::gateway_router()
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(bind = %config.server.bind_address, "parley server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn health(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.app.registry.connection_count(),
        "onlineUsers": state.app.registry.online_user_count(),
        "pendingConnections": state
            .active_connections()
            .saturating_sub(state.app.registry.connection_count()),
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down (ctrl-c)...");
}
