use crate::error::{CoreError, Rejection};
use crate::presence;
use crate::AppState;
use parley_db::DbError;
use parley_models::gateway::{MarkReadPayload, MessagesReadPayload, OutboundEvent, ReadAckPayload};
use parley_models::UserId;

/// Record `reader_id` as having read the listed messages and reset their
/// unread counter. Other participants hear about the newly marked ids only.
pub async fn mark_read(
    state: &AppState,
    reader_id: UserId,
    request: MarkReadPayload,
) -> Result<ReadAckPayload, CoreError> {
    let conversation_id = request.conversation_id;
    let participants = state.store.participant_ids(conversation_id).await?;
    if !participants.contains(&reader_id) {
        return Err(Rejection::authorization("not a participant of this conversation").into());
    }
    if request.message_ids.is_empty() {
        return Ok(ReadAckPayload {
            conversation_id,
            marked: 0,
        });
    }

    let outcome = match state
        .store
        .mark_read(conversation_id, reader_id, &request.message_ids)
        .await
    {
        Ok(outcome) => outcome,
        // Removed between the cache lookup and the write.
        Err(CoreError::Database(DbError::NotFound)) => {
            return Err(Rejection::authorization("not a participant of this conversation").into())
        }
        Err(e) => return Err(e),
    };

    if !outcome.newly_marked.is_empty() {
        let event = OutboundEvent::MessagesRead(MessagesReadPayload {
            conversation_id,
            user_id: reader_id,
            message_ids: outcome.newly_marked.clone(),
        });
        let mut gone_offline = Vec::new();
        for &participant in participants.iter().filter(|p| **p != reader_id) {
            gone_offline.extend(state.registry.deliver(participant, &event).gone_offline);
        }
        presence::set_offline_many(state, gone_offline).await;
    }

    tracing::debug!(
        conversation_id,
        user_id = reader_id,
        marked = outcome.newly_marked.len(),
        previous_unread = outcome.previous_unread,
        "messages read"
    );
    Ok(ReadAckPayload {
        conversation_id,
        marked: outcome.newly_marked.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::send_message;
    use crate::test_support::{attach, drain, harness};
    use parley_models::gateway::{RejectReason, SendMessagePayload};

    async fn say(state: &AppState, sender: UserId, conversation_id: i64) -> i64 {
        send_message(
            state,
            sender,
            SendMessagePayload {
                conversation_id,
                content: "hi".into(),
                attachments: Vec::new(),
                nonce: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    fn read(conversation_id: i64, message_ids: Vec<i64>) -> MarkReadPayload {
        MarkReadPayload {
            conversation_id,
            message_ids,
        }
    }

    #[tokio::test]
    async fn a_says_hi_and_b_reads_it() {
        let h = harness().await;
        let conv = h.state.store.find_or_create_direct(1, 2).await.unwrap();
        let (_a, mut rx_a) = attach(&h.state, 1);
        let (_b, mut rx_b) = attach(&h.state, 2);

        let id = say(&h.state, 1, conv.id).await;
        assert!(matches!(
            drain(&mut rx_b).as_slice(),
            [OutboundEvent::NewMessage(m)] if m.id == id && m.content == "hi"
        ));
        let stored = h.state.store.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!((stored.unread_for(1), stored.unread_for(2)), (Some(0), Some(1)));
        drain(&mut rx_a);

        let ack = mark_read(&h.state, 2, read(conv.id, vec![id])).await.unwrap();
        assert_eq!(ack.marked, 1);
        let stored = h.state.store.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!((stored.unread_for(1), stored.unread_for(2)), (Some(0), Some(0)));
        assert_eq!(
            drain(&mut rx_a),
            vec![OutboundEvent::MessagesRead(MessagesReadPayload {
                conversation_id: conv.id,
                user_id: 2,
                message_ids: vec![id],
            })]
        );
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn reading_twice_changes_nothing() {
        let h = harness().await;
        let conv = h.state.store.find_or_create_direct(1, 2).await.unwrap();
        let (_a, mut rx_a) = attach(&h.state, 1);
        let first = say(&h.state, 1, conv.id).await;
        let second = say(&h.state, 1, conv.id).await;

        mark_read(&h.state, 2, read(conv.id, vec![first, second])).await.unwrap();
        drain(&mut rx_a);
        let ack = mark_read(&h.state, 2, read(conv.id, vec![first, second])).await.unwrap();
        assert_eq!(ack.marked, 0);
        assert!(drain(&mut rx_a).is_empty());

        let stored = h.state.store.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.unread_for(2), Some(0));
        let history = h
            .state
            .store
            .list_messages(conv.id, 2, Default::default())
            .await
            .unwrap();
        assert!(history.iter().all(|m| m.read_by == vec![2]));
    }

    #[tokio::test]
    async fn unread_matches_messages_never_marked() {
        let h = harness().await;
        let conv = h.state.store.create_group(1, &[2, 3]).await.unwrap();
        let mut sent = Vec::new();
        for sender in [1, 2, 1, 3, 1, 2] {
            sent.push((sender, say(&h.state, sender, conv.id).await));
            if sent.len() == 3 {
                let for_three: Vec<i64> = sent
                    .iter()
                    .filter(|(s, _)| *s != 3)
                    .map(|(_, id)| *id)
                    .collect();
                mark_read(&h.state, 3, read(conv.id, for_three)).await.unwrap();
            }
        }

        let stored = h.state.store.get_conversation(conv.id).await.unwrap().unwrap();
        // 3 read the first three messages; 1 and 2 never read anything.
        assert_eq!(stored.unread_for(3), Some(2));
        assert_eq!(stored.unread_for(1), Some(3));
        assert_eq!(stored.unread_for(2), Some(4));
        assert_eq!(h.state.store.reconcile_unread(conv.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn strangers_and_empty_requests() {
        let h = harness().await;
        let conv = h.state.store.find_or_create_direct(1, 2).await.unwrap();
        let id = say(&h.state, 1, conv.id).await;

        match mark_read(&h.state, 3, read(conv.id, vec![id])).await {
            Err(CoreError::Rejected(r)) => assert_eq!(r.reason, RejectReason::Authorization),
            other => panic!("unexpected {other:?}"),
        }

        let ack = mark_read(&h.state, 2, read(conv.id, Vec::new())).await.unwrap();
        assert_eq!(ack.marked, 0);
        let stored = h.state.store.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.unread_for(2), Some(1));
    }
}
