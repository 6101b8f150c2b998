use crate::{datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkReadOutcome {
    /// Ids that gained this reader, in request order.
    pub newly_marked: Vec<i64>,
    /// The reader's unread counter before it was reset.
    pub previous_unread: i64,
}

impl MarkReadOutcome {
    pub fn changed_anything(&self) -> bool {
        !self.newly_marked.is_empty() || self.previous_unread > 0
    }
}

pub async fn get_unread_count(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
) -> Result<Option<i64>, DbError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT unread_count FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(count,)| count))
}

/// Record `user_id` as a reader of each listed message that belongs to the
/// conversation and was not sent by them, then reset their unread counter.
/// Both happen in one transaction; repeated calls are no-ops.
pub async fn mark_read(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
    message_ids: &[i64],
    now: DateTime<Utc>,
) -> Result<MarkReadOutcome, DbError> {
    let now_text = datetime_to_db_text(now);
    let mut tx = pool.begin().await?;

    let previous: Option<(i64,)> = sqlx::query_as(
        "SELECT unread_count FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
    )
    .bind(conversation_id)
    .bind(user_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some((previous_unread,)) = previous else {
        tx.rollback().await?;
        return Err(DbError::NotFound);
    };

    let mut newly_marked = Vec::new();
    for &message_id in message_ids {
        if newly_marked.contains(&message_id) {
            continue;
        }
        let inserted = sqlx::query(
            "INSERT INTO message_reads (message_id, user_id, read_at)
             SELECT m.id, $2, $3 FROM messages m
             WHERE m.id = $1 AND m.conversation_id = $4 AND m.sender_id <> $2
             ON CONFLICT (message_id, user_id) DO NOTHING",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(&now_text)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 1 {
            newly_marked.push(message_id);
        }
    }

    if previous_unread != 0 {
        sqlx::query(
            "UPDATE conversation_members SET unread_count = 0
             WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(MarkReadOutcome {
        newly_marked,
        previous_unread,
    })
}

const UNREAD_RECOUNT: &str = "(SELECT COUNT(*) FROM messages m
      WHERE m.conversation_id = conversation_members.conversation_id
        AND m.sender_id <> conversation_members.user_id
        AND m.id > COALESCE(conversation_members.joined_after_message_id, 0)
        AND NOT EXISTS (
            SELECT 1 FROM message_reads r
            WHERE r.message_id = m.id AND r.user_id = conversation_members.user_id
        )
        AND NOT EXISTS (
            SELECT 1 FROM message_deletions d
            WHERE d.message_id = m.id AND d.user_id = conversation_members.user_id
        ))";

/// Recompute every participant's unread counter from stored read receipts,
/// skipping messages the participant hid and messages sent before they
/// joined. Returns how many counters were wrong.
pub async fn reconcile_unread(pool: &DbPool, conversation_id: i64) -> Result<u64, DbError> {
    let changed = sqlx::query(&format!(
        "UPDATE conversation_members
         SET unread_count = {UNREAD_RECOUNT}
         WHERE conversation_id = $1 AND unread_count <> {UNREAD_RECOUNT}"
    ))
    .bind(conversation_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations;
    use crate::messages::{get_message, insert_message_and_bump, NewMessage};
    use crate::test_support::memory_pool;

    async fn seed(pool: &DbPool) {
        conversations::find_or_create_direct(pool, 1, 10, 20, Utc::now())
            .await
            .unwrap();
        for (id, sender) in [(100, 10), (101, 10), (102, 20)] {
            insert_message_and_bump(
                pool,
                &NewMessage {
                    id,
                    conversation_id: 1,
                    sender_id: sender,
                    content: "x",
                    attachments: &[],
                    nonce: None,
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn mark_read_records_readers_and_resets_counter() {
        let pool = memory_pool().await;
        seed(&pool).await;
        assert_eq!(get_unread_count(&pool, 1, 20).await.unwrap(), Some(2));

        // 102 is the reader's own message and 999 does not exist.
        let outcome = mark_read(&pool, 1, 20, &[100, 101, 102, 999, 100], Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.newly_marked, vec![100, 101]);
        assert_eq!(outcome.previous_unread, 2);
        assert_eq!(get_unread_count(&pool, 1, 20).await.unwrap(), Some(0));
        assert_eq!(get_message(&pool, 100).await.unwrap().unwrap().read_by, vec![20]);
        assert!(get_message(&pool, 102).await.unwrap().unwrap().read_by.is_empty());
    }

    #[tokio::test]
    async fn mark_read_twice_is_idempotent() {
        let pool = memory_pool().await;
        seed(&pool).await;
        mark_read(&pool, 1, 20, &[100, 101], Utc::now()).await.unwrap();
        let again = mark_read(&pool, 1, 20, &[100, 101], Utc::now()).await.unwrap();
        assert!(!again.changed_anything());
        assert_eq!(get_unread_count(&pool, 1, 20).await.unwrap(), Some(0));
        assert_eq!(get_message(&pool, 101).await.unwrap().unwrap().read_by, vec![20]);
    }

    #[tokio::test]
    async fn non_participant_cannot_mark_read() {
        let pool = memory_pool().await;
        seed(&pool).await;
        let err = mark_read(&pool, 1, 30, &[100], Utc::now()).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound));
        assert!(get_message(&pool, 100).await.unwrap().unwrap().read_by.is_empty());
    }

    #[tokio::test]
    async fn reconcile_repairs_drifted_counters() {
        let pool = memory_pool().await;
        seed(&pool).await;
        mark_read(&pool, 1, 20, &[100], Utc::now()).await.unwrap();
        // Reset trusted the client: 101 is still unread by the receipts.
        assert_eq!(reconcile_unread(&pool, 1).await.unwrap(), 1);
        assert_eq!(get_unread_count(&pool, 1, 20).await.unwrap(), Some(1));
        assert_eq!(get_unread_count(&pool, 1, 10).await.unwrap(), Some(1));

        sqlx::query("UPDATE conversation_members SET unread_count = 42 WHERE user_id = 10")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(reconcile_unread(&pool, 1).await.unwrap(), 1);
        assert_eq!(get_unread_count(&pool, 1, 10).await.unwrap(), Some(1));
        assert_eq!(reconcile_unread(&pool, 1).await.unwrap(), 0);
    }

    async fn send(pool: &DbPool, conversation_id: i64, id: i64, sender_id: i64) {
        insert_message_and_bump(
            pool,
            &NewMessage {
                id,
                conversation_id,
                sender_id,
                content: "x",
                attachments: &[],
                nonce: None,
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn late_joiners_only_count_messages_after_joining() {
        let pool = memory_pool().await;
        conversations::create_group(&pool, 2, &[10, 20], Utc::now())
            .await
            .unwrap();
        for id in [200, 201, 202] {
            send(&pool, 2, id, 10).await;
        }
        assert!(conversations::add_participant(&pool, 2, 30, Utc::now())
            .await
            .unwrap());
        assert_eq!(get_unread_count(&pool, 2, 30).await.unwrap(), Some(0));

        assert_eq!(reconcile_unread(&pool, 2).await.unwrap(), 0);
        assert_eq!(get_unread_count(&pool, 2, 30).await.unwrap(), Some(0));
        assert_eq!(get_unread_count(&pool, 2, 20).await.unwrap(), Some(3));

        send(&pool, 2, 203, 10).await;
        assert_eq!(get_unread_count(&pool, 2, 30).await.unwrap(), Some(1));
        assert_eq!(reconcile_unread(&pool, 2).await.unwrap(), 0);
        assert_eq!(get_unread_count(&pool, 2, 30).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn ids_minted_before_a_join_do_not_count_for_the_joiner() {
        let pool = memory_pool().await;
        conversations::create_group(&pool, 3, &[10, 20], Utc::now())
            .await
            .unwrap();
        send(&pool, 3, 301, 10).await;
        conversations::add_participant(&pool, 3, 30, Utc::now())
            .await
            .unwrap();
        // Minted before the join but written after it.
        send(&pool, 3, 300, 20).await;
        assert_eq!(get_unread_count(&pool, 3, 30).await.unwrap(), Some(0));
        assert_eq!(reconcile_unread(&pool, 3).await.unwrap(), 0);
    }
}
