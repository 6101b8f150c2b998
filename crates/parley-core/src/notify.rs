use async_trait::async_trait;
use parley_models::message::Message;
use parley_models::UserId;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    NewMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    #[serde(with = "parley_models::id_str")]
    pub recipient: UserId,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

impl NotificationRequest {
    /// Offline-recipient notice for a freshly persisted message.
    pub fn new_message(recipient: UserId, message: &Message) -> Self {
        let preview: String = message.content.chars().take(PREVIEW_CHARS).collect();
        Self {
            recipient,
            kind: NotificationKind::NewMessage,
            payload: serde_json::json!({
                "conversationId": message.conversation_id.to_string(),
                "messageId": message.id.to_string(),
                "senderId": message.sender_id.to_string(),
                "preview": preview,
                "attachmentCount": message.attachments.len(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(String),
    #[error("notification service returned {0}")]
    Rejected(u16),
}

/// The external notification-delivery service. It owns retries and the
/// actual push/email delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn enqueue_notification(&self, request: &NotificationRequest) -> Result<(), NotifyError>;
}

/// Posts each request as JSON to a webhook.
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("parley/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NotifyError::Http(e.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn enqueue_notification(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        let resp = self
            .http
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected(resp.status().as_u16()))
        }
    }
}

/// Used when no webhook is configured.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn enqueue_notification(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = request.recipient,
            kind = ?request.kind,
            "notification (no webhook configured)"
        );
        Ok(())
    }
}

/// Sending half of the notification queue. Enqueueing never waits.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::Sender<NotificationRequest>,
}

/// Receiving half, drained by [`NotificationQueue::spawn`].
pub struct NotificationQueue {
    rx: mpsc::Receiver<NotificationRequest>,
}

impl NotificationDispatcher {
    pub fn new(capacity: usize) -> (Self, NotificationQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, NotificationQueue { rx })
    }

    /// Returns `false` when the request was dropped.
    pub fn enqueue(&self, request: NotificationRequest) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(req)) => {
                tracing::warn!(recipient = req.recipient, "notification queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(req)) => {
                tracing::warn!(recipient = req.recipient, "notification worker stopped, dropping");
                false
            }
        }
    }
}

impl NotificationQueue {
    /// Pull the next request without waiting. Mostly useful in tests.
    pub fn try_next(&mut self) -> Option<NotificationRequest> {
        self.rx.try_recv().ok()
    }

    /// Drain the queue into `sink` until every dispatcher is dropped.
    pub fn spawn(mut self, sink: Arc<dyn NotificationSink>, timeout: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = self.rx.recv().await {
                match tokio::time::timeout(timeout, sink.enqueue_notification(&request)).await {
                    Ok(Ok(())) => {
                        tracing::debug!(recipient = request.recipient, "notification handed off");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(recipient = request.recipient, "notification failed: {e}");
                    }
                    Err(_) => {
                        tracing::warn!(recipient = request.recipient, "notification timed out");
                    }
                }
            }
            tracing::info!("notification worker stopped");
        })
    }
}
