mod handler;
mod limits;
mod session;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use limits::{ConnectionSlots, UserRateLimits};
use parley_core::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Transport tunables, filled from the `[gateway]` config section.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Advertised to clients in `hello`.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is closed.
    pub heartbeat_timeout: Duration,
    pub identify_timeout: Duration,
    pub max_connections: usize,
    pub max_connections_per_user: usize,
    pub events_per_minute: u32,
    pub typing_per_minute: u32,
    pub signals_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(41_250),
            heartbeat_timeout: Duration::from_secs(90),
            identify_timeout: Duration::from_secs(30),
            max_connections: 2_000,
            max_connections_per_user: 5,
            events_per_minute: 240,
            typing_per_minute: 120,
            signals_per_minute: 120,
        }
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub app: AppState,
    pub config: Arc<GatewayConfig>,
    slots: Arc<ConnectionSlots>,
    rate_limits: Arc<UserRateLimits>,
}

impl GatewayState {
    pub fn new(app: AppState, config: GatewayConfig) -> Self {
        Self {
            slots: Arc::new(ConnectionSlots::new(
                config.max_connections,
                config.max_connections_per_user,
            )),
            rate_limits: Arc::new(UserRateLimits::new(&config)),
            config: Arc::new(config),
            app,
        }
    }

    /// Connections currently holding a gateway slot, identified or not.
    pub fn active_connections(&self) -> usize {
        self.slots.active()
    }

    /// Periodically prune rate limiter entries of users who went quiet.
    pub fn spawn_limiter_cleanup(&self, every: Duration) -> JoinHandle<()> {
        let rate_limits = self.rate_limits.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                rate_limits.prune();
                tracing::trace!("rate limiter cleanup: pruned stale entries");
            }
        })
    }
}

pub fn gateway_router() -> Router<GatewayState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state))
}
