use crate::error::CoreError;
use crate::AppState;
use parley_models::ConversationId;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub conversations: usize,
    pub repaired: u64,
    pub failed: usize,
}

/// Recompute one conversation's unread counters from its read receipts.
/// Returns how many counters had drifted.
pub async fn reconcile(state: &AppState, conversation_id: ConversationId) -> Result<u64, CoreError> {
    let repaired = state.store.reconcile_unread(conversation_id).await?;
    if repaired > 0 {
        tracing::warn!(conversation_id, repaired, "unread counters drifted, repaired");
    }
    Ok(repaired)
}

/// Walk every conversation. A failing conversation is logged and skipped.
pub async fn reconcile_all(state: &AppState) -> Result<ReconcileReport, CoreError> {
    let mut report = ReconcileReport::default();
    for conversation_id in state.store.list_conversation_ids().await? {
        report.conversations += 1;
        match reconcile(state, conversation_id).await {
            Ok(repaired) => report.repaired += repaired,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(conversation_id, "reconcile failed: {e}");
            }
        }
    }
    Ok(report)
}

/// Run [`reconcile_all`] every `interval`. The first pass runs after one
/// full interval.
pub fn spawn_periodic(state: AppState, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match reconcile_all(&state).await {
                Ok(report) => tracing::info!(
                    conversations = report.conversations,
                    repaired = report.repaired,
                    failed = report.failed,
                    "unread reconcile pass finished"
                ),
                Err(e) => tracing::warn!("unread reconcile pass failed: {e}"),
            }
        }
    })
}
