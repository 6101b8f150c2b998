use parley_core::registry::ConnectionId;
use parley_models::UserId;
use tokio::time::Instant;

/// Bookkeeping for one identified socket, reported when it closes.
pub struct Session {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    opened_at: Instant,
    received: u64,
    sent: u64,
}

impl Session {
    pub fn new(user_id: UserId, connection_id: ConnectionId) -> Self {
        Self {
            user_id,
            connection_id,
            opened_at: Instant::now(),
            received: 0,
            sent: 0,
        }
    }

    pub fn record_received(&mut self) {
        self.received += 1;
    }

    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    pub fn log_closed(&self, reason: &str, abnormal: bool) {
        let lifetime_ms = self.opened_at.elapsed().as_millis() as u64;
        if abnormal {
            tracing::warn!(
                user_id = self.user_id,
                connection_id = %self.connection_id,
                received = self.received,
                sent = self.sent,
                lifetime_ms,
                "client disconnected: {reason}"
            );
        } else {
            tracing::info!(
                user_id = self.user_id,
                connection_id = %self.connection_id,
                received = self.received,
                sent = self.sent,
                lifetime_ms,
                "client disconnected: {reason}"
            );
        }
    }
}
