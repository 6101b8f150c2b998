use crate::{datetime_to_db_text, DbError, DbPool};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    Friend = 1,
    Blocked = 2,
}

impl RelationshipKind {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(Self::Friend),
            2 => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// Upsert a directional relationship row. A friendship is visible from
/// either side, so a single row is enough for it.
pub async fn set_relationship(
    pool: &DbPool,
    user_id: i64,
    target_id: i64,
    kind: RelationshipKind,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO relationships (user_id, target_id, rel_type, created_at) VALUES ($1, $2, $3, $4)
         ON CONFLICT (user_id, target_id) DO UPDATE SET rel_type = $3",
    )
    .bind(user_id)
    .bind(target_id)
    .bind(kind.as_i16() as i64)
    .bind(datetime_to_db_text(now))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_relationship(
    pool: &DbPool,
    user_id: i64,
    target_id: i64,
) -> Result<Option<RelationshipKind>, DbError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT rel_type FROM relationships WHERE user_id = $1 AND target_id = $2",
    )
    .bind(user_id)
    .bind(target_id)
    .fetch_optional(pool)
    .await?;
    match row {
        None => Ok(None),
        Some((raw,)) => i16::try_from(raw)
            .ok()
            .and_then(RelationshipKind::from_i16)
            .map(Some)
            .ok_or_else(|| DbError::Corrupt(format!("unknown rel_type {raw}"))),
    }
}

pub async fn remove_relationship(
    pool: &DbPool,
    user_id: i64,
    target_id: i64,
) -> Result<bool, DbError> {
    let removed = sqlx::query("DELETE FROM relationships WHERE user_id = $1 AND target_id = $2")
        .bind(user_id)
        .bind(target_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(removed > 0)
}

/// True when either user has blocked the other.
pub async fn is_blocked_either(pool: &DbPool, a: i64, b: i64) -> Result<bool, DbError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM relationships
         WHERE rel_type = $3
           AND ((user_id = $1 AND target_id = $2) OR (user_id = $2 AND target_id = $1))
         LIMIT 1",
    )
    .bind(a)
    .bind(b)
    .bind(RelationshipKind::Blocked.as_i16() as i64)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Friends of `user_id` in either direction, ascending.
pub async fn get_friend_user_ids(pool: &DbPool, user_id: i64) -> Result<Vec<i64>, DbError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT target_id FROM relationships WHERE user_id = $1 AND rel_type = $2
         UNION
         SELECT user_id FROM relationships WHERE target_id = $1 AND rel_type = $2
         ORDER BY 1",
    )
    .bind(user_id)
    .bind(RelationshipKind::Friend.as_i16() as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
