use crate::error::{CoreError, Rejection};
use crate::presence;
use crate::AppState;
use parley_models::gateway::{OutboundEvent, SignalKind, SignalPayload};
use parley_models::UserId;

/// Forward a call-setup payload to every connection of `to_user_id`.
/// Nothing is stored and the payload is not inspected.
pub async fn relay(
    state: &AppState,
    from_user_id: UserId,
    to_user_id: UserId,
    kind: SignalKind,
    payload: serde_json::Value,
) -> Result<usize, CoreError> {
    let handles = state.registry.handles_for(to_user_id);
    if handles.is_empty() {
        return Err(Rejection::unreachable("user is not connected").into());
    }
    let event = OutboundEvent::signal(
        kind,
        SignalPayload {
            from_user_id,
            payload,
        },
    );
    let delivery = state.registry.deliver_to_handles(handles, &event);
    let delivered = delivery.delivered;
    presence::set_offline_many(state, delivery.gone_offline).await;
    if delivered == 0 {
        return Err(Rejection::unreachable("user is not connected").into());
    }
    tracing::debug!(from_user_id, to_user_id, ?kind, delivered, "signal relayed");
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{attach, drain, harness};
    use parley_models::gateway::RejectReason;
    use serde_json::json;

    #[tokio::test]
    async fn offers_reach_every_connection_of_the_callee() {
        let h = harness().await;
        let (_c1, mut rx1) = attach(&h.state, 2);
        let (_c2, mut rx2) = attach(&h.state, 2);
        let sdp = json!({"sdp": "v=0", "type": "offer"});

        let delivered = relay(&h.state, 1, 2, SignalKind::Offer, sdp.clone()).await.unwrap();
        assert_eq!(delivered, 2);
        let expected = OutboundEvent::IncomingCall(SignalPayload {
            from_user_id: 1,
            payload: sdp,
        });
        assert_eq!(drain(&mut rx1), vec![expected.clone()]);
        assert_eq!(drain(&mut rx2), vec![expected]);

        relay(&h.state, 1, 2, SignalKind::Candidate, json!("c")).await.unwrap();
        assert!(matches!(drain(&mut rx1).as_slice(), [OutboundEvent::IceCandidate(_)]));
        relay(&h.state, 1, 2, SignalKind::Reject, json!(null)).await.unwrap();
        assert!(matches!(drain(&mut rx1).as_slice(), [OutboundEvent::CallRejected(_)]));
        relay(&h.state, 1, 2, SignalKind::Answer, json!({})).await.unwrap();
        assert!(matches!(drain(&mut rx1).as_slice(), [OutboundEvent::CallAccepted(_)]));
    }

    #[tokio::test]
    async fn unreachable_callee_leaves_no_trace() {
        let h = harness().await;
        match relay(&h.state, 1, 2, SignalKind::Offer, json!({})).await {
            Err(CoreError::Rejected(r)) => assert_eq!(r.reason, RejectReason::Unreachable),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.state.registry.connection_count(), 0);
        assert!(h.state.store.list_conversation_ids().await.unwrap().is_empty());

        let (_gone, rx) = attach(&h.state, 2);
        drop(rx);
        assert!(relay(&h.state, 1, 2, SignalKind::Offer, json!({})).await.is_err());
        assert!(!h.state.registry.is_online(2));
    }
}
