use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parley_core::auth::AuthError;
use parley_core::error::Rejection;
use parley_core::gateway::{self, Connection};
use parley_core::registry::Outbound;
use parley_models::gateway::{
    AuthErrorPayload, GatewayFrame, HelloPayload, IdentifyPayload, InboundEvent, OutboundEvent,
    RateLimitedPayload,
};
use tokio::time::{Duration, Instant};

use crate::limits::EventClass;
use crate::session::Session;
use crate::GatewayState;

const CLOSE_AUTH_FAILED: u16 = 4001;
const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
const WS_PING_INTERVAL: Duration = Duration::from_secs(20);

async fn send_event(
    sender: &mut (impl SinkExt<Message> + Unpin),
    event: &OutboundEvent,
) -> Result<(), ()> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(event = event.name(), "failed to encode event: {e}");
            return Ok(());
        }
    };
    tracing::trace!(event = event.name(), bytes = payload.len(), "server_out");
    sender
        .send(Message::Text(payload.into()))
        .await
        .map_err(|_| ())
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
) -> Result<(), ()> {
    tracing::debug!(code, reason, "server_close");
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

async fn reject_identify(sender: &mut (impl SinkExt<Message> + Unpin), reason: String) {
    tracing::debug!("identify failed: {reason}");
    let event = OutboundEvent::AuthError(AuthErrorPayload {
        reason: reason.clone(),
    });
    if send_event(sender, &event).await.is_ok() {
        let _ = send_close(sender, CLOSE_AUTH_FAILED, &reason).await;
    }
}

pub async fn handle_connection(socket: WebSocket, state: GatewayState) {
    let Some(mut guard) = state.slots.try_acquire() else {
        let (mut sender, _) = socket.split();
        let _ = send_close(
            &mut sender,
            CLOSE_TRY_AGAIN_LATER,
            "gateway is at connection capacity",
        )
        .await;
        return;
    };

    let (mut sender, mut receiver) = socket.split();

    let hello = OutboundEvent::Hello(HelloPayload {
        heartbeat_interval: state.config.heartbeat_interval.as_millis() as u64,
    });
    if send_event(&mut sender, &hello).await.is_err() {
        return;
    }

    let identified = match tokio::time::timeout(
        state.config.identify_timeout,
        wait_for_identify(&mut receiver),
    )
    .await
    {
        Ok(Identify::Payload(payload)) => gateway::authenticate(&state.app, &payload.token)
            .await
            .map_err(|e| e.to_string()),
        Ok(Identify::Invalid(reason)) => Err(reason),
        Ok(Identify::Closed) => return,
        Err(_) => Err(AuthError::Timeout.to_string()),
    };
    let user_id = match identified {
        Ok(user_id) => user_id,
        Err(reason) => {
            reject_identify(&mut sender, reason).await;
            return;
        }
    };

    if !guard.bind_user(user_id) {
        tracing::info!(user_id, "connection refused: too many concurrent connections");
        let _ = send_close(
            &mut sender,
            CLOSE_POLICY_VIOLATION,
            "too many concurrent connections for this user",
        )
        .await;
        return;
    }

    let connection = match gateway::register(&state.app, user_id).await {
        Ok(connection) => connection,
        Err(e) => {
            reject_identify(&mut sender, e.to_string()).await;
            return;
        }
    };
    let handle = connection.handle.clone();
    run_session(sender, receiver, connection, &state).await;
    gateway::disconnect(&state.app, &handle).await;
    drop(guard);
}

enum Identify {
    Payload(IdentifyPayload),
    Invalid(String),
    Closed,
}

/// Read frames until the client identifies. Heartbeats sent early are
/// tolerated; anything else is a protocol error.
async fn wait_for_identify(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Identify {
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return Identify::Closed,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<GatewayFrame>(&text) else {
            return Identify::Invalid("malformed frame".into());
        };
        match InboundEvent::decode(&frame) {
            Ok(InboundEvent::Identify(payload)) => return Identify::Payload(payload),
            Ok(InboundEvent::Heartbeat) => continue,
            Ok(other) => {
                return Identify::Invalid(format!("expected identify, got '{}'", other.name()))
            }
            Err(e) => return Identify::Invalid(e.to_string()),
        }
    }
    Identify::Closed
}

async fn run_session(
    mut sender: impl SinkExt<Message> + Unpin,
    mut receiver: impl StreamExt<Item = Result<Message, axum::Error>> + Unpin,
    mut connection: Connection,
    state: &GatewayState,
) {
    let mut session = Session::new(connection.handle.user_id(), connection.handle.id());
    let heartbeat_timeout = state.config.heartbeat_timeout;
    let mut ws_ping_interval = tokio::time::interval(WS_PING_INTERVAL);
    ws_ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let heartbeat_sleep = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_sleep);

    let (disconnect_reason, abnormal) = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.record_received();
                        let frame = match serde_json::from_str::<GatewayFrame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                gateway::reject(
                                    &connection.handle,
                                    "",
                                    &Rejection::validation(format!("malformed frame: {e}")),
                                );
                                continue;
                            }
                        };
                        tracing::trace!(
                            user_id = session.user_id,
                            event = %frame.event,
                            "client_message"
                        );

                        let class = EventClass::of(&frame.event);
                        if let Err(retry_after_ms) = state.rate_limits.check(session.user_id, class) {
                            if class.drops_silently() {
                                tracing::debug!(
                                    user_id = session.user_id,
                                    event = %frame.event,
                                    "rate limited (silent drop)"
                                );
                            } else {
                                let _ = connection.handle.push(OutboundEvent::RateLimited(
                                    RateLimitedPayload { retry_after_ms },
                                ));
                            }
                            continue;
                        }
                        if class == EventClass::Heartbeat {
                            heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                        }
                        gateway::dispatch_frame(&state.app, &connection.handle, frame).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break (
                            match frame {
                                Some(frame) => format!(
                                    "client close frame (code={}, reason={})",
                                    frame.code, frame.reason
                                ),
                                None => "client close frame (no code/reason)".to_string(),
                            },
                            false,
                        );
                    }
                    Some(Err(err)) => {
                        break (format!("websocket receive error: {err}"), true);
                    }
                    None => {
                        break ("websocket stream ended".to_string(), false);
                    }
                    _ => {}
                }
            }
            next = connection.receiver.next() => {
                match next {
                    Outbound::Event(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            break ("websocket send error".to_string(), true);
                        }
                        session.record_sent();
                    }
                    Outbound::Evicted => {
                        let _ = send_close(
                            &mut sender,
                            CLOSE_TRY_AGAIN_LATER,
                            "connection fell too far behind",
                        )
                        .await;
                        break ("evicted after outbound queue overflow".to_string(), true);
                    }
                    Outbound::Closed => {
                        break ("outbound queue closed".to_string(), false);
                    }
                }
            }
            () = &mut heartbeat_sleep => {
                let _ = send_close(&mut sender, CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout").await;
                break (
                    format!("heartbeat timeout after {}ms", heartbeat_timeout.as_millis()),
                    true,
                );
            }
            _ = ws_ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break ("websocket ping send error".to_string(), true);
                }
            }
        }
    };
    session.log_closed(&disconnect_reason, abnormal);
}
