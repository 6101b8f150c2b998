use crate::registry::ConnectionHandle;
use crate::AppState;
use parley_models::gateway::{OutboundEvent, UserTypingPayload};
use parley_models::presence::{PresencePayload, PresenceStatus};
use parley_models::{ConversationId, UserId};

/// Online members of the user's presence audience.
async fn online_audience(state: &AppState, user_id: UserId) -> Vec<UserId> {
    match state.relationships.presence_audience(user_id).await {
        Ok(audience) => audience
            .iter()
            .copied()
            .filter(|id| *id != user_id && state.registry.is_online(*id))
            .collect(),
        Err(e) => {
            tracing::warn!(user_id, "presence audience lookup failed: {e}");
            Vec::new()
        }
    }
}

fn presence_event(status: PresenceStatus, user_id: UserId) -> OutboundEvent {
    let payload = PresencePayload { user_id };
    match status {
        PresenceStatus::Online => OutboundEvent::UserOnline(payload),
        PresenceStatus::Offline => OutboundEvent::UserOffline(payload),
    }
}

pub async fn set_online(state: &AppState, user_id: UserId) {
    let event = presence_event(PresenceStatus::Online, user_id);
    let mut offline = Vec::new();
    for member in online_audience(state, user_id).await {
        offline.extend(state.registry.deliver(member, &event).gone_offline);
    }
    tracing::debug!(user_id, "user online");
    set_offline_many(state, offline).await;
}

pub async fn set_offline(state: &AppState, user_id: UserId) {
    set_offline_many(state, vec![user_id]).await;
}

/// Announce every user in `users` as offline. Deliveries that evict further
/// handles queue those users too, so this loops instead of recursing.
///
/// Online status is checked again before every push, so a reconnect during
/// the audience lookup stops the announcement. A reconnect landing between
/// that check and the push itself can still reach a friend as `user-online`
/// before `user-offline`; the friend's view is corrected by the next
/// presence change.
pub async fn set_offline_many(state: &AppState, mut users: Vec<UserId>) {
    while let Some(user_id) = users.pop() {
        if state.registry.is_online(user_id) {
            continue;
        }
        let event = presence_event(PresenceStatus::Offline, user_id);
        for member in online_audience(state, user_id).await {
            if state.registry.is_online(user_id) {
                tracing::debug!(user_id, "reconnected while going offline");
                break;
            }
            users.extend(state.registry.deliver(member, &event).gone_offline);
        }
        tracing::debug!(user_id, "user offline");
    }
}

/// Tell a fresh connection which of the user's friends are already online.
pub async fn send_snapshot(state: &AppState, handle: &ConnectionHandle) {
    for friend in online_audience(state, handle.user_id()).await {
        if handle
            .push(presence_event(PresenceStatus::Online, friend))
            .is_err()
        {
            break;
        }
    }
}

/// Typing indicators reach only the other participants' connections that
/// joined the conversation room. Nothing is stored and nothing is retried.
pub async fn set_typing(
    state: &AppState,
    user_id: UserId,
    conversation_id: ConversationId,
    is_typing: bool,
) {
    let participants = match state.store.participant_ids(conversation_id).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::debug!(user_id, conversation_id, "typing dropped: {e}");
            return;
        }
    };
    if !participants.contains(&user_id) {
        tracing::debug!(user_id, conversation_id, "typing from non-participant dropped");
        return;
    }

    let targets: Vec<ConnectionHandle> = state
        .registry
        .room_handles(conversation_id)
        .into_iter()
        .filter(|h| h.user_id() != user_id && participants.contains(&h.user_id()))
        .collect();
    let event = OutboundEvent::UserTyping(UserTypingPayload {
        conversation_id,
        user_id,
        is_typing,
    });
    let delivery = state.registry.deliver_to_handles(targets, &event);
    set_offline_many(state, delivery.gone_offline).await;
}
