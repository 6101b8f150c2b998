use crate::auth::AuthError;
use crate::error::{CoreError, Rejection};
use crate::registry::{ConnectionHandle, ConnectionReceiver};
use crate::{pipeline, presence, receipts, signaling, AppState};
use parley_models::gateway::{
    ErrorPayload, GatewayFrame, InboundEvent, OutboundEvent, ReadyPayload,
};
use parley_models::{ConversationId, UserId};

/// An authenticated, registered connection.
pub struct Connection {
    pub handle: ConnectionHandle,
    pub receiver: ConnectionReceiver,
}

/// Authenticate a credential and register a new handle for its user.
/// Nothing is registered when authentication fails.
pub async fn connect(state: &AppState, credential: &str) -> Result<Connection, AuthError> {
    let user_id = authenticate(state, credential).await?;
    register(state, user_id).await
}

pub async fn authenticate(state: &AppState, credential: &str) -> Result<UserId, AuthError> {
    let result = state.identity.resolve_user(credential).await;
    if let Err(e) = &result {
        tracing::debug!("identify rejected: {e}");
    }
    result
}

/// Register a handle for an already authenticated user. The connection is
/// sent `ready`, then the online friends it can see.
pub async fn register(state: &AppState, user_id: UserId) -> Result<Connection, AuthError> {
    let (handle, receiver) =
        ConnectionHandle::channel(user_id, state.config.outbound_queue_size);
    handle
        .push(OutboundEvent::Ready(ReadyPayload {
            user_id,
            connection_id: handle.id().to_string(),
        }))
        .map_err(|_| AuthError::Internal("outbound queue unavailable".into()))?;

    if state.registry.register(handle.clone()) {
        presence::set_online(state, user_id).await;
    }
    presence::send_snapshot(state, &handle).await;
    tracing::info!(user_id, connection_id = %handle.id(), "connection registered");
    Ok(Connection { handle, receiver })
}

/// Remove the handle from the registry and every room. The user's last
/// handle going away announces them offline.
pub async fn disconnect(state: &AppState, handle: &ConnectionHandle) {
    let user_id = handle.user_id();
    if state.registry.unregister(handle) {
        presence::set_offline(state, user_id).await;
    }
    tracing::info!(user_id, connection_id = %handle.id(), "connection closed");
}

/// Push an `error` event to the originating connection.
pub fn reject(handle: &ConnectionHandle, event: &str, rejection: &Rejection) {
    let _ = handle.push(OutboundEvent::Error(ErrorPayload {
        event: event.to_string(),
        reason: rejection.reason,
        message: rejection.message.clone(),
    }));
}

/// Decode a raw frame and route it. Malformed payloads of known events are
/// rejected as validation errors.
pub async fn dispatch_frame(state: &AppState, handle: &ConnectionHandle, frame: GatewayFrame) {
    match InboundEvent::decode(&frame) {
        Ok(event) => dispatch(state, handle, event).await,
        Err(e) => {
            tracing::debug!(connection_id = %handle.id(), "{e}");
            reject(handle, &frame.event, &Rejection::validation(e.to_string()));
        }
    }
}

pub async fn dispatch(state: &AppState, handle: &ConnectionHandle, event: InboundEvent) {
    let name = event.name().to_string();
    if let Err(e) = route(state, handle, event).await {
        if !matches!(e, CoreError::Rejected(_)) {
            tracing::warn!(
                user_id = handle.user_id(),
                connection_id = %handle.id(),
                event = %name,
                "event failed: {e}"
            );
        }
        reject(handle, &name, &e.to_rejection());
    }
}

async fn route(
    state: &AppState,
    handle: &ConnectionHandle,
    event: InboundEvent,
) -> Result<(), CoreError> {
    let user_id = handle.user_id();
    match event {
        InboundEvent::Identify(_) => {
            return Err(Rejection::validation("connection is already identified").into());
        }
        InboundEvent::Heartbeat => {
            let _ = handle.push(OutboundEvent::HeartbeatAck);
        }
        InboundEvent::SendMessage(request) => {
            pipeline::send_message(state, user_id, request).await?;
        }
        InboundEvent::Typing(request) => {
            presence::set_typing(state, user_id, request.conversation_id, request.is_typing).await;
        }
        InboundEvent::MarkRead(request) => {
            let ack = receipts::mark_read(state, user_id, request).await?;
            let _ = handle.push(OutboundEvent::ReadAck(ack));
        }
        InboundEvent::JoinConversation(room) => {
            join(state, handle, room.conversation_id).await?;
        }
        InboundEvent::LeaveConversation(room) => {
            state.registry.leave_room(handle.id(), room.conversation_id);
        }
        InboundEvent::Signal { kind, request } => {
            signaling::relay(state, user_id, request.to_user_id, kind, request.payload).await?;
        }
        InboundEvent::Unknown(name) => {
            tracing::debug!(user_id, event = %name, "ignoring unknown event");
        }
    }
    Ok(())
}

async fn join(
    state: &AppState,
    handle: &ConnectionHandle,
    conversation_id: ConversationId,
) -> Result<(), CoreError> {
    if !state
        .store
        .is_participant(conversation_id, handle.user_id())
        .await?
    {
        return Err(Rejection::authorization("not a participant of this conversation").into());
    }
    state.registry.join_room(handle.id(), conversation_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{drain, harness, token};
    use chrono::Utc;
    use parley_db::relationships::{set_relationship, RelationshipKind};
    use parley_models::gateway::{RejectReason, UserTypingPayload};
    use parley_models::presence::PresencePayload;
    use serde_json::json;

    fn frame(event: &str, data: serde_json::Value) -> GatewayFrame {
        GatewayFrame {
            event: event.into(),
            data: Some(data),
        }
    }

    #[tokio::test]
    async fn bad_credentials_register_nothing() {
        let h = harness().await;
        assert!(connect(&h.state, "garbage").await.is_err());
        let foreign = crate::auth::create_token(1, "someone-else", 60).unwrap();
        assert_eq!(
            connect(&h.state, &foreign).await.err(),
            Some(AuthError::InvalidToken)
        );
        assert_eq!(h.state.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn connect_sends_ready_and_presence() {
        let h = harness().await;
        set_relationship(h.state.store.pool(), 1, 2, RelationshipKind::Friend, Utc::now())
            .await
            .unwrap();
        let mut friend = connect(&h.state, &token(2)).await.unwrap();
        drain(&mut friend.receiver);

        let mut first = connect(&h.state, &token(1)).await.unwrap();
        let events = drain(&mut first.receiver);
        assert!(matches!(&events[0], OutboundEvent::Ready(r) if r.user_id == 1));
        // Friend 2 was already online.
        assert_eq!(events[1], OutboundEvent::UserOnline(PresencePayload { user_id: 2 }));
        assert_eq!(
            drain(&mut friend.receiver),
            vec![OutboundEvent::UserOnline(PresencePayload { user_id: 1 })]
        );

        // A second tab is not a new online transition.
        let second = connect(&h.state, &token(1)).await.unwrap();
        assert!(drain(&mut friend.receiver).is_empty());

        disconnect(&h.state, &first.handle).await;
        assert!(drain(&mut friend.receiver).is_empty());
        disconnect(&h.state, &second.handle).await;
        assert_eq!(
            drain(&mut friend.receiver),
            vec![OutboundEvent::UserOffline(PresencePayload { user_id: 1 })]
        );
        assert!(!h.state.registry.is_online(1));
    }

    #[tokio::test]
    async fn unknown_events_are_ignored_and_malformed_ones_rejected() {
        let h = harness().await;
        let mut conn = connect(&h.state, &token(1)).await.unwrap();
        drain(&mut conn.receiver);

        dispatch_frame(&h.state, &conn.handle, frame("future-feature", json!({"x": 1}))).await;
        assert!(drain(&mut conn.receiver).is_empty());

        dispatch_frame(&h.state, &conn.handle, frame("send-message", json!({"content": 5}))).await;
        match drain(&mut conn.receiver).as_slice() {
            [OutboundEvent::Error(e)] => {
                assert_eq!(e.event, "send-message");
                assert_eq!(e.reason, RejectReason::Validation);
            }
            other => panic!("unexpected {other:?}"),
        }

        dispatch_frame(&h.state, &conn.handle, frame("heartbeat", json!(null))).await;
        assert_eq!(drain(&mut conn.receiver), vec![OutboundEvent::HeartbeatAck]);
    }

    #[tokio::test]
    async fn rooms_require_participation_and_scope_typing() {
        let h = harness().await;
        let conv = h.state.store.find_or_create_direct(1, 2).await.unwrap();
        let mut a = connect(&h.state, &token(1)).await.unwrap();
        let mut b = connect(&h.state, &token(2)).await.unwrap();
        let mut c = connect(&h.state, &token(3)).await.unwrap();
        for conn in [&mut a, &mut b, &mut c] {
            drain(&mut conn.receiver);
        }
        let room = json!({"conversationId": conv.id.to_string()});

        dispatch_frame(&h.state, &c.handle, frame("join-conversation", room.clone())).await;
        assert!(matches!(
            drain(&mut c.receiver).as_slice(),
            [OutboundEvent::Error(e)] if e.reason == RejectReason::Authorization
        ));

        let typing = json!({"conversationId": conv.id.to_string(), "isTyping": true});
        dispatch_frame(&h.state, &a.handle, frame("typing", typing.clone())).await;
        assert!(drain(&mut b.receiver).is_empty());

        dispatch_frame(&h.state, &b.handle, frame("join-conversation", room.clone())).await;
        dispatch_frame(&h.state, &a.handle, frame("typing", typing.clone())).await;
        assert_eq!(
            drain(&mut b.receiver),
            vec![OutboundEvent::UserTyping(UserTypingPayload {
                conversation_id: conv.id,
                user_id: 1,
                is_typing: true,
            })]
        );

        dispatch_frame(&h.state, &b.handle, frame("leave-conversation", room)).await;
        dispatch_frame(&h.state, &a.handle, frame("typing", typing)).await;
        assert!(drain(&mut b.receiver).is_empty());
    }

    #[tokio::test]
    async fn send_and_read_over_frames() {
        let h = harness().await;
        let conv = h.state.store.find_or_create_direct(1, 2).await.unwrap();
        let mut a = connect(&h.state, &token(1)).await.unwrap();
        let mut b = connect(&h.state, &token(2)).await.unwrap();
        drain(&mut a.receiver);
        drain(&mut b.receiver);

        dispatch_frame(
            &h.state,
            &a.handle,
            frame(
                "send-message",
                json!({"conversationId": conv.id.to_string(), "content": "hi", "nonce": "n1"}),
            ),
        )
        .await;
        let message = match drain(&mut b.receiver).as_slice() {
            [OutboundEvent::NewMessage(m)] => m.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(message.nonce.as_deref(), Some("n1"));
        assert_eq!(drain(&mut a.receiver).len(), 1);

        dispatch_frame(
            &h.state,
            &b.handle,
            frame(
                "mark-read",
                json!({"conversationId": conv.id.to_string(), "messageIds": [message.id.to_string()]}),
            ),
        )
        .await;
        assert!(matches!(
            drain(&mut b.receiver).as_slice(),
            [OutboundEvent::ReadAck(ack)] if ack.marked == 1
        ));
        assert!(matches!(
            drain(&mut a.receiver).as_slice(),
            [OutboundEvent::MessagesRead(r)] if r.message_ids == vec![message.id]
        ));

        dispatch_frame(
            &h.state,
            &a.handle,
            frame("call-offer", json!({"toUserId": "3", "payload": {}})),
        )
        .await;
        assert!(matches!(
            drain(&mut a.receiver).as_slice(),
            [OutboundEvent::Error(e)] if e.reason == RejectReason::Unreachable && e.event == "call-offer"
        ));
    }
}
