pub mod auth;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod pipeline;
pub mod presence;
pub mod receipts;
pub mod reconcile;
pub mod registry;
pub mod relationships;
pub mod signaling;
pub mod store;

use auth::IdentityResolver;
use notify::NotificationDispatcher;
use parley_util::validation::ContentLimits;
use registry::ConnectionRegistry;
use relationships::Relationships;
use std::sync::Arc;
use std::time::Duration;
use store::ConversationStore;

/// Engine tunables, filled from the `[engine]` and `[gateway]` config sections.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub limits: ContentLimits,
    /// Bound on every store call.
    pub store_timeout: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue_size: usize,
    /// Snowflake worker id of this process.
    pub worker_id: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: ContentLimits::default(),
            store_timeout: Duration::from_secs(5),
            outbound_queue_size: 256,
            worker_id: 0,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConversationStore>,
    /// Users currently connected to the gateway and the rooms they joined.
    pub registry: Arc<ConnectionRegistry>,
    pub identity: Arc<dyn IdentityResolver>,
    pub relationships: Arc<dyn Relationships>,
    pub notifications: NotificationDispatcher,
    pub config: EngineConfig,
}

impl AppState {
    pub fn new(
        pool: parley_db::DbPool,
        identity: Arc<dyn IdentityResolver>,
        relationships: Arc<dyn Relationships>,
        notifications: NotificationDispatcher,
        config: EngineConfig,
    ) -> Self {
        Self {
            store: Arc::new(ConversationStore::new(
                pool,
                config.store_timeout,
                config.worker_id,
            )),
            registry: Arc::new(ConnectionRegistry::new()),
            identity,
            relationships,
            notifications,
            config,
        }
    }
}
