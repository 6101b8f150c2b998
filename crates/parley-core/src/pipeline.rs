use crate::error::{CoreError, Rejection};
use crate::notify::NotificationRequest;
use crate::presence;
use crate::AppState;
use chrono::Utc;
use parley_db::messages::InsertOutcome;
use parley_models::gateway::{OutboundEvent, SendMessagePayload};
use parley_models::message::Message;
use parley_models::UserId;
use parley_util::validation::{normalize_nonce, validate_message};

/// Validate, persist and fan out one message.
///
/// Recipients with no live connection get a notification unless they muted
/// the conversation. The sender's own connections receive the stored message
/// as the acknowledgment.
pub async fn send_message(
    state: &AppState,
    sender_id: UserId,
    request: SendMessagePayload,
) -> Result<Message, CoreError> {
    let conversation_id = request.conversation_id;
    let conversation = state
        .store
        .get_conversation(conversation_id)
        .await?
        .filter(|c| c.is_participant(sender_id))
        .ok_or_else(|| Rejection::authorization("not a participant of this conversation"))?;

    for other in conversation.participant_ids() {
        if other != sender_id && state.relationships.is_blocked(sender_id, other).await? {
            return Err(Rejection::authorization("a participant blocked this conversation").into());
        }
    }

    let content = validate_message(
        &request.content,
        request.attachments.len(),
        &state.config.limits,
    )?;
    let nonce = normalize_nonce(request.nonce.as_deref())?;

    let message_id = state.store.next_id();
    let mut retried = false;
    let outcome = loop {
        let attempt = state
            .store
            .insert_message(
                message_id,
                conversation_id,
                sender_id,
                &content,
                &request.attachments,
                nonce.as_deref(),
            )
            .await;
        match attempt {
            Ok(outcome) => break outcome,
            Err(e) if e.is_transient() && !retried => {
                tracing::warn!(conversation_id, sender_id, "persist failed, retrying once: {e}");
                retried = true;
            }
            Err(e) => {
                tracing::error!(conversation_id, sender_id, "persist failed: {e}");
                return Err(Rejection::transient("message could not be stored, try again").into());
            }
        }
    };

    let message = match outcome {
        InsertOutcome::Created(message) => message,
        InsertOutcome::Duplicate(message) => {
            tracing::debug!(conversation_id, message_id = message.id, "duplicate nonce");
            let delivery = state
                .registry
                .deliver(sender_id, &OutboundEvent::NewMessage(message.clone()));
            presence::set_offline_many(state, delivery.gone_offline).await;
            return Ok(message);
        }
    };

    let event = OutboundEvent::NewMessage(message.clone());
    let now = Utc::now();
    let mut gone_offline = Vec::new();
    for participant in &conversation.participants {
        if participant.user_id == sender_id {
            continue;
        }
        let delivery = state.registry.deliver(participant.user_id, &event);
        gone_offline.extend(delivery.gone_offline);
        if delivery.delivered == 0 && !participant.is_muted_at(now) {
            state
                .notifications
                .enqueue(NotificationRequest::new_message(participant.user_id, &message));
        }
    }
    gone_offline.extend(state.registry.deliver(sender_id, &event).gone_offline);
    presence::set_offline_many(state, gone_offline).await;

    tracing::debug!(
        conversation_id,
        message_id = message.id,
        sender_id,
        "message delivered"
    );
    Ok(message)
}
