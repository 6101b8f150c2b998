use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use parley_models::conversation::{Conversation, ConversationKind, ParticipantState};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: i64,
    pub kind: i64,
    pub last_message_id: Option<i64>,
    pub last_activity_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ConversationRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let last_activity_raw: String = row.try_get("last_activity_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            last_message_id: row.try_get("last_message_id")?,
            last_activity_at: datetime_from_db_text(&last_activity_raw)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MemberRow {
    pub conversation_id: i64,
    pub user_id: i64,
    pub unread_count: i64,
    pub muted_until: Option<DateTime<Utc>>,
    pub archived: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MemberRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let muted_raw: Option<String> = row.try_get("muted_until")?;
        let archived: i64 = row.try_get("archived")?;
        Ok(Self {
            conversation_id: row.try_get("conversation_id")?,
            user_id: row.try_get("user_id")?,
            unread_count: row.try_get("unread_count")?,
            muted_until: muted_raw.as_deref().map(datetime_from_db_text).transpose()?,
            archived: archived != 0,
        })
    }
}

impl From<MemberRow> for ParticipantState {
    fn from(row: MemberRow) -> Self {
        ParticipantState {
            user_id: row.user_id,
            unread_count: row.unread_count.clamp(0, u32::MAX as i64) as u32,
            muted_until: row.muted_until,
            archived: row.archived,
        }
    }
}

fn assemble(row: ConversationRow, members: Vec<MemberRow>) -> Result<Conversation, DbError> {
    let kind = ConversationKind::from_i16(row.kind as i16)
        .ok_or_else(|| DbError::Corrupt(format!("conversation {} has kind {}", row.id, row.kind)))?;
    Ok(Conversation {
        id: row.id,
        kind,
        last_message_id: row.last_message_id,
        last_activity_at: row.last_activity_at,
        participants: members.into_iter().map(ParticipantState::from).collect(),
    })
}

/// Stable key for the unordered pair of a direct conversation.
pub fn direct_key(user_a: i64, user_b: i64) -> String {
    let (lo, hi) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };
    format!("{lo}:{hi}")
}

pub async fn get_conversation(
    pool: &DbPool,
    conversation_id: i64,
) -> Result<Option<Conversation>, DbError> {
    let row = sqlx::query_as::<_, ConversationRow>(
        "SELECT id, kind, last_message_id, last_activity_at
         FROM conversations WHERE id = $1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let members = get_members(pool, conversation_id).await?;
    assemble(row, members).map(Some)
}

pub async fn get_members(pool: &DbPool, conversation_id: i64) -> Result<Vec<MemberRow>, DbError> {
    let rows = sqlx::query_as::<_, MemberRow>(
        "SELECT conversation_id, user_id, unread_count, muted_until, archived
         FROM conversation_members
         WHERE conversation_id = $1
         ORDER BY user_id",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_participant_ids(pool: &DbPool, conversation_id: i64) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM conversation_members WHERE conversation_id = $1 ORDER BY user_id",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn find_direct(
    pool: &DbPool,
    user_a: i64,
    user_b: i64,
) -> Result<Option<Conversation>, DbError> {
    let id: Option<(i64,)> = sqlx::query_as("SELECT id FROM conversations WHERE direct_key = $1")
        .bind(direct_key(user_a, user_b))
        .fetch_optional(pool)
        .await?;
    match id {
        Some((id,)) => get_conversation(pool, id).await,
        None => Ok(None),
    }
}

/// Create the direct conversation between two users, or return the existing one.
/// `conversation_id` is only used when a new row is inserted.
pub async fn find_or_create_direct(
    pool: &DbPool,
    conversation_id: i64,
    user_a: i64,
    user_b: i64,
    now: DateTime<Utc>,
) -> Result<Conversation, DbError> {
    let key = direct_key(user_a, user_b);
    let now_text = datetime_to_db_text(now);
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO conversations (id, kind, direct_key, last_message_id, last_activity_at, created_at)
         VALUES ($1, $2, $3, NULL, $4, $4)
         ON CONFLICT (direct_key) DO NOTHING",
    )
    .bind(conversation_id)
    .bind(ConversationKind::Direct.as_i16() as i64)
    .bind(&key)
    .bind(&now_text)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 1 {
        for user_id in [user_a, user_b] {
            sqlx::query(
                "INSERT INTO conversation_members (conversation_id, user_id, unread_count, archived, joined_at)
                 VALUES ($1, $2, 0, 0, $3)",
            )
            .bind(conversation_id)
            .bind(user_id)
            .bind(&now_text)
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await?;

    find_direct(pool, user_a, user_b).await?.ok_or(DbError::NotFound)
}

pub async fn create_group(
    pool: &DbPool,
    conversation_id: i64,
    member_ids: &[i64],
    now: DateTime<Utc>,
) -> Result<Conversation, DbError> {
    let now_text = datetime_to_db_text(now);
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO conversations (id, kind, direct_key, last_message_id, last_activity_at, created_at)
         VALUES ($1, $2, NULL, NULL, $3, $3)",
    )
    .bind(conversation_id)
    .bind(ConversationKind::Group.as_i16() as i64)
    .bind(&now_text)
    .execute(&mut *tx)
    .await?;

    for &user_id in member_ids {
        sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id, unread_count, archived, joined_at)
             VALUES ($1, $2, 0, 0, $3)
             ON CONFLICT (conversation_id, user_id) DO NOTHING",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(&now_text)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    get_conversation(pool, conversation_id)
        .await?
        .ok_or(DbError::NotFound)
}

/// Returns `false` when the user was already a participant. The new member
/// starts with nothing unread; history before the join never counts for them.
pub async fn add_participant(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let inserted = sqlx::query(
        "INSERT INTO conversation_members
             (conversation_id, user_id, unread_count, archived, joined_at, joined_after_message_id)
         VALUES ($1, $2, 0, 0, $3, (SELECT last_message_id FROM conversations WHERE id = $1))
         ON CONFLICT (conversation_id, user_id) DO NOTHING",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(datetime_to_db_text(now))
    .execute(pool)
    .await?
    .rows_affected();
    Ok(inserted == 1)
}

pub async fn remove_participant(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
) -> Result<bool, DbError> {
    let removed = sqlx::query(
        "DELETE FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
    )
    .bind(conversation_id)
    .bind(user_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(removed == 1)
}

pub async fn set_muted_until(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
    until: Option<DateTime<Utc>>,
) -> Result<(), DbError> {
    let updated = sqlx::query(
        "UPDATE conversation_members SET muted_until = $3
         WHERE conversation_id = $1 AND user_id = $2",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(until.map(datetime_to_db_text))
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn set_archived(
    pool: &DbPool,
    conversation_id: i64,
    user_id: i64,
    archived: bool,
) -> Result<(), DbError> {
    let updated = sqlx::query(
        "UPDATE conversation_members SET archived = $3
         WHERE conversation_id = $1 AND user_id = $2",
    )
    .bind(conversation_id)
    .bind(user_id)
    .bind(archived as i64)
    .execute(pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn list_conversation_ids(pool: &DbPool) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM conversations ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Non-archived conversations of a user, most recently active first.
pub async fn list_user_conversation_ids(pool: &DbPool, user_id: i64) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT c.id FROM conversations c
         INNER JOIN conversation_members m ON m.conversation_id = c.id
         WHERE m.user_id = $1 AND m.archived = 0
         ORDER BY c.last_activity_at DESC, c.id DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
