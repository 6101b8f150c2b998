use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use parley_models::attachment::MediaRef;
use parley_models::message::Message;
use sqlx::Row;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub attachments: Vec<MediaRef>,
    pub nonce: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MessageRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        let attachments_raw: String = row.try_get("attachments")?;
        let attachments = serde_json::from_str(&attachments_raw)
            .map_err(|e| sqlx::Error::Protocol(format!("invalid attachments json: {e}")))?;
        Ok(Self {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            sender_id: row.try_get("sender_id")?,
            content: row.try_get("content")?,
            attachments,
            nonce: row.try_get("nonce")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

impl MessageRow {
    pub fn into_message(self, read_by: Vec<i64>) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content: self.content,
            attachments: self.attachments,
            created_at: self.created_at,
            read_by,
            nonce: self.nonce,
        }
    }
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, content, attachments, nonce, created_at";

/// A message about to be written together with its counter updates.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub content: &'a str,
    pub attachments: &'a [MediaRef],
    pub nonce: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(Message),
    /// A message with the same (conversation, sender, nonce) already existed.
    Duplicate(Message),
}

/// Insert a message and, in the same transaction, bump every other
/// participant's unread counter, un-archive the conversation for them and
/// move `last_message_id` / `last_activity_at` forward.
///
/// Counter updates are relative (`unread_count + 1`), so concurrent writers on
/// the same conversation cannot lose increments even without outer locking.
pub async fn insert_message_and_bump(
    pool: &DbPool,
    new: &NewMessage<'_>,
) -> Result<InsertOutcome, DbError> {
    let mut tx = pool.begin().await?;

    if let Some(nonce) = new.nonce {
        let existing = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = $1 AND sender_id = $2 AND nonce = $3"
        ))
        .bind(new.conversation_id)
        .bind(new.sender_id)
        .bind(nonce)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            tx.rollback().await?;
            let read_by = get_read_by(pool, row.id).await?;
            return Ok(InsertOutcome::Duplicate(row.into_message(read_by)));
        }
    }

    let attachments_json = serde_json::to_string(new.attachments)
        .map_err(|e| DbError::Corrupt(format!("attachments not serializable: {e}")))?;
    let created_at = datetime_to_db_text(new.created_at);

    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "INSERT INTO messages (id, conversation_id, sender_id, content, attachments, nonce, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(new.id)
    .bind(new.conversation_id)
    .bind(new.sender_id)
    .bind(new.content)
    .bind(&attachments_json)
    .bind(new.nonce)
    .bind(&created_at)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE conversation_members
         SET unread_count = unread_count + 1, archived = 0
         WHERE conversation_id = $1 AND user_id <> $2
           AND $3 > COALESCE(joined_after_message_id, 0)",
    )
    .bind(new.conversation_id)
    .bind(new.sender_id)
    .bind(new.id)
    .execute(&mut *tx)
    .await?;

    let touched = sqlx::query(
        "UPDATE conversations SET last_message_id = $2, last_activity_at = $3 WHERE id = $1",
    )
    .bind(new.conversation_id)
    .bind(new.id)
    .bind(&created_at)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if touched == 0 {
        tx.rollback().await?;
        return Err(DbError::NotFound);
    }

    tx.commit().await?;
    Ok(InsertOutcome::Created(row.into_message(Vec::new())))
}

pub async fn get_message(pool: &DbPool, message_id: i64) -> Result<Option<Message>, DbError> {
    let row = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
    ))
    .bind(message_id)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => {
            let read_by = get_read_by(pool, row.id).await?;
            Ok(Some(row.into_message(read_by)))
        }
        None => Ok(None),
    }
}

pub async fn get_read_by(pool: &DbPool, message_id: i64) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM message_reads WHERE message_id = $1 ORDER BY user_id",
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// History page for one viewer, newest first. Messages the viewer deleted for
/// themselves are skipped.
pub async fn list_messages(
    pool: &DbPool,
    conversation_id: i64,
    viewer_id: i64,
    before: Option<i64>,
    limit: u32,
) -> Result<Vec<Message>, DbError> {
    let base = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m
         WHERE m.conversation_id = $1
           AND NOT EXISTS (
               SELECT 1 FROM message_deletions d WHERE d.message_id = m.id AND d.user_id = $2
           )"
    );
    let rows = if let Some(before) = before {
        sqlx::query_as::<_, MessageRow>(&format!("{base} AND m.id < $3 ORDER BY m.id DESC LIMIT $4"))
            .bind(conversation_id)
            .bind(viewer_id)
            .bind(before)
            .bind(limit as i64)
            .fetch_all(pool)
            .await?
    } else {
        sqlx::query_as::<_, MessageRow>(&format!("{base} ORDER BY m.id DESC LIMIT $3"))
            .bind(conversation_id)
            .bind(viewer_id)
            .bind(limit as i64)
            .fetch_all(pool)
            .await?
    };

    let (Some(newest), Some(oldest)) = (rows.first().map(|r| r.id), rows.last().map(|r| r.id))
    else {
        return Ok(Vec::new());
    };

    let reads: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT r.message_id, r.user_id FROM message_reads r
         INNER JOIN messages m ON m.id = r.message_id
         WHERE m.conversation_id = $1 AND m.id >= $2 AND m.id <= $3
         ORDER BY r.user_id",
    )
    .bind(conversation_id)
    .bind(oldest)
    .bind(newest)
    .fetch_all(pool)
    .await?;
    let mut read_by: HashMap<i64, Vec<i64>> = HashMap::new();
    for (message_id, user_id) in reads {
        read_by.entry(message_id).or_default().push(user_id);
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let readers = read_by.remove(&row.id).unwrap_or_default();
            row.into_message(readers)
        })
        .collect())
}

/// Hide a message from one participant. Returns `false` if it was already hidden.
/// A hidden message no longer counts as unread for that participant.
pub async fn delete_message_for(
    pool: &DbPool,
    message_id: i64,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let mut tx = pool.begin().await?;
    let inserted = sqlx::query(
        "INSERT INTO message_deletions (message_id, user_id, deleted_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (message_id, user_id) DO NOTHING",
    )
    .bind(message_id)
    .bind(user_id)
    .bind(datetime_to_db_text(now))
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if inserted == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        "UPDATE conversation_members SET unread_count = unread_count - 1
         WHERE user_id = $2 AND unread_count > 0
           AND conversation_id = (
               SELECT m.conversation_id FROM messages m WHERE m.id = $1 AND m.sender_id <> $2
           )
           AND NOT EXISTS (
               SELECT 1 FROM message_reads r WHERE r.message_id = $1 AND r.user_id = $2
           )",
    )
    .bind(message_id)
    .bind(user_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations;
    use crate::test_support::memory_pool;

    fn new_message<'a>(id: i64, conversation_id: i64, sender_id: i64, content: &'a str) -> NewMessage<'a> {
        NewMessage {
            id,
            conversation_id,
            sender_id,
            content,
            attachments: &[],
            nonce: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_bumps_counters_of_other_participants() {
        let pool = memory_pool().await;
        conversations::create_group(&pool, 1, &[10, 20, 30], Utc::now())
            .await
            .unwrap();
        conversations::set_archived(&pool, 1, 20, true).await.unwrap();

        let outcome = insert_message_and_bump(&pool, &new_message(500, 1, 10, "hello"))
            .await
            .unwrap();
        assert!(matches!(outcome, InsertOutcome::Created(_)));

        let conv = conversations::get_conversation(&pool, 1).await.unwrap().unwrap();
        assert_eq!(conv.unread_for(10), Some(0));
        assert_eq!(conv.unread_for(20), Some(1));
        assert_eq!(conv.unread_for(30), Some(1));
        assert!(!conv.participant(20).unwrap().archived);
        assert_eq!(conv.last_message_id, Some(500));
    }

    #[tokio::test]
    async fn attachments_keep_their_order() {
        let pool = memory_pool().await;
        conversations::find_or_create_direct(&pool, 1, 10, 20, Utc::now())
            .await
            .unwrap();
        let attachments = vec![
            MediaRef {
                id: "b".into(),
                url: "https://cdn/b".into(),
                content_type: Some("image/png".into()),
                size: Some(12),
            },
            MediaRef {
                id: "a".into(),
                url: "https://cdn/a".into(),
                content_type: None,
                size: None,
            },
        ];
        let mut new = new_message(2, 1, 10, "");
        new.attachments = &attachments;
        insert_message_and_bump(&pool, &new).await.unwrap();

        let stored = get_message(&pool, 2).await.unwrap().unwrap();
        assert_eq!(stored.attachments, attachments);
    }

    #[tokio::test]
    async fn duplicate_nonce_returns_existing_without_bumping() {
        let pool = memory_pool().await;
        conversations::find_or_create_direct(&pool, 1, 10, 20, Utc::now())
            .await
            .unwrap();
        let mut first = new_message(2, 1, 10, "hi");
        first.nonce = Some("n-1");
        let mut retry = new_message(3, 1, 10, "hi");
        retry.nonce = Some("n-1");

        insert_message_and_bump(&pool, &first).await.unwrap();
        let outcome = insert_message_and_bump(&pool, &retry).await.unwrap();
        match outcome {
            InsertOutcome::Duplicate(m) => assert_eq!(m.id, 2),
            other => panic!("expected duplicate, got {other:?}"),
        }
        let conv = conversations::get_conversation(&pool, 1).await.unwrap().unwrap();
        assert_eq!(conv.unread_for(20), Some(1));
        assert!(get_message(&pool, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_into_missing_conversation_leaves_nothing_behind() {
        let pool = memory_pool().await;
        let err = insert_message_and_bump(&pool, &new_message(9, 404, 10, "x")).await;
        assert!(err.is_err());
        assert!(get_message(&pool, 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn history_pages_and_hides_deleted_for_viewer() {
        let pool = memory_pool().await;
        conversations::find_or_create_direct(&pool, 1, 10, 20, Utc::now())
            .await
            .unwrap();
        for id in 1..=5 {
            insert_message_and_bump(&pool, &new_message(id, 1, 10, "m"))
                .await
                .unwrap();
        }
        assert!(delete_message_for(&pool, 4, 20, Utc::now()).await.unwrap());
        assert!(!delete_message_for(&pool, 4, 20, Utc::now()).await.unwrap());

        let page: Vec<i64> = list_messages(&pool, 1, 20, None, 3)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(page, vec![5, 3, 2]);

        let older: Vec<i64> = list_messages(&pool, 1, 20, Some(2), 10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(older, vec![1]);

        // The sender still sees the message.
        let sender_view = list_messages(&pool, 1, 10, None, 10).await.unwrap();
        assert_eq!(sender_view.len(), 5);

        // Hiding an unread message releases it from the viewer's counter.
        let conv = conversations::get_conversation(&pool, 1).await.unwrap().unwrap();
        assert_eq!(conv.unread_for(20), Some(4));
    }
}
