use crate::error::CoreError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_db::messages::{InsertOutcome, NewMessage};
use parley_db::read_states::MarkReadOutcome;
use parley_db::{DbError, DbPool};
use parley_models::attachment::MediaRef;
use parley_models::conversation::{Conversation, ConversationKind};
use parley_models::message::Message;
use parley_models::{ConversationId, MessageId, UserId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Cached participant list of a conversation.
pub type ParticipantCache = moka::future::Cache<ConversationId, Arc<Vec<UserId>>>;

/// 30 second TTL, 50k conversations.
pub fn build_participant_cache() -> ParticipantCache {
    moka::future::Cache::builder()
        .max_capacity(50_000)
        .time_to_live(Duration::from_secs(30))
        .build()
}

/// Conversation and message persistence with bounded timeouts and a
/// per-conversation writer lock.
pub struct ConversationStore {
    pool: DbPool,
    timeout: Duration,
    worker_id: u16,
    locks: DashMap<ConversationId, Arc<Mutex<()>>>,
    participants: ParticipantCache,
}

impl ConversationStore {
    pub fn new(pool: DbPool, timeout: Duration, worker_id: u16) -> Self {
        Self {
            pool,
            timeout,
            worker_id,
            locks: DashMap::new(),
            participants: build_participant_cache(),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn next_id(&self) -> i64 {
        parley_util::snowflake::generate(self.worker_id)
    }

    async fn bounded<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<T, DbError>>,
    ) -> Result<T, CoreError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(CoreError::from),
            Err(_) => Err(CoreError::Timeout(what)),
        }
    }

    fn writer_lock(&self, conversation_id: ConversationId) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    pub(crate) async fn hold_writer_lock(
        &self,
        conversation_id: ConversationId,
    ) -> tokio::sync::OwnedMutexGuard<()> {
        self.writer_lock(conversation_id).lock_owned().await
    }

    /// Run `fut` while holding the writer lock of one conversation. Waiting
    /// for the lock counts against the same timeout as the call itself.
    async fn serialized<T>(
        &self,
        conversation_id: ConversationId,
        what: &'static str,
        fut: impl Future<Output = Result<T, DbError>>,
    ) -> Result<T, CoreError> {
        let lock = self.writer_lock(conversation_id);
        let result = self
            .bounded(what, async {
                let _guard = lock.lock().await;
                fut.await
            })
            .await;
        drop(lock);
        self.locks
            .remove_if(&conversation_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    pub async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, CoreError> {
        self.bounded(
            "load conversation",
            parley_db::conversations::get_conversation(&self.pool, conversation_id),
        )
        .await
    }

    pub async fn participant_ids(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Arc<Vec<UserId>>, CoreError> {
        if let Some(cached) = self.participants.get(&conversation_id).await {
            return Ok(cached);
        }
        let ids = Arc::new(
            self.bounded(
                "load participants",
                parley_db::conversations::get_participant_ids(&self.pool, conversation_id),
            )
            .await?,
        );
        self.participants.insert(conversation_id, ids.clone()).await;
        Ok(ids)
    }

    pub async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, CoreError> {
        Ok(self
            .participant_ids(conversation_id)
            .await?
            .contains(&user_id))
    }

    pub async fn find_or_create_direct(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<Conversation, CoreError> {
        if user_a == user_b {
            return Err(crate::error::Rejection::validation(
                "a direct conversation needs two different users",
            )
            .into());
        }
        let id = self.next_id();
        self.bounded(
            "create direct conversation",
            parley_db::conversations::find_or_create_direct(&self.pool, id, user_a, user_b, Utc::now()),
        )
        .await
    }

    /// The creator is always a member; duplicates are ignored.
    pub async fn create_group(
        &self,
        creator: UserId,
        members: &[UserId],
    ) -> Result<Conversation, CoreError> {
        let mut all = vec![creator];
        all.extend(members.iter().copied().filter(|m| *m != creator));
        all.sort_unstable();
        all.dedup();
        if all.len() < 2 {
            return Err(
                crate::error::Rejection::validation("a group needs at least two members").into(),
            );
        }
        let id = self.next_id();
        self.bounded(
            "create group",
            parley_db::conversations::create_group(&self.pool, id, &all, Utc::now()),
        )
        .await
    }

    async fn require_group(&self, conversation_id: ConversationId) -> Result<(), CoreError> {
        let conversation = self
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| crate::error::Rejection::validation("unknown conversation"))?;
        if conversation.kind != ConversationKind::Group {
            return Err(crate::error::Rejection::validation(
                "direct conversations have fixed membership",
            )
            .into());
        }
        Ok(())
    }

    pub async fn add_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, CoreError> {
        self.require_group(conversation_id).await?;
        let added = self
            .serialized(
                conversation_id,
                "add participant",
                parley_db::conversations::add_participant(&self.pool, conversation_id, user_id, Utc::now()),
            )
            .await?;
        self.participants.invalidate(&conversation_id).await;
        Ok(added)
    }

    pub async fn remove_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, CoreError> {
        self.require_group(conversation_id).await?;
        let removed = self
            .bounded(
                "remove participant",
                parley_db::conversations::remove_participant(&self.pool, conversation_id, user_id),
            )
            .await?;
        self.participants.invalidate(&conversation_id).await;
        Ok(removed)
    }

    /// Insert plus counter bump, serialized per conversation.
    pub async fn insert_message(
        &self,
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        attachments: &[MediaRef],
        nonce: Option<&str>,
    ) -> Result<InsertOutcome, CoreError> {
        let new = NewMessage {
            id,
            conversation_id,
            sender_id,
            content,
            attachments,
            nonce,
            created_at: Utc::now(),
        };
        self.serialized(
            conversation_id,
            "persist message",
            parley_db::messages::insert_message_and_bump(&self.pool, &new),
        )
        .await
    }

    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        message_ids: &[MessageId],
    ) -> Result<MarkReadOutcome, CoreError> {
        self.serialized(
            conversation_id,
            "mark read",
            parley_db::read_states::mark_read(
                &self.pool,
                conversation_id,
                user_id,
                message_ids,
                Utc::now(),
            ),
        )
        .await
    }

    pub async fn reconcile_unread(&self, conversation_id: ConversationId) -> Result<u64, CoreError> {
        self.serialized(
            conversation_id,
            "reconcile unread",
            parley_db::read_states::reconcile_unread(&self.pool, conversation_id),
        )
        .await
    }

    pub async fn list_conversation_ids(&self) -> Result<Vec<ConversationId>, CoreError> {
        self.bounded(
            "list conversations",
            parley_db::conversations::list_conversation_ids(&self.pool),
        )
        .await
    }

    /// Newest first; the limit is clamped to 1..=100.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
        viewer_id: UserId,
        cursor: parley_util::pagination::HistoryCursor,
    ) -> Result<Vec<Message>, CoreError> {
        self.bounded(
            "list messages",
            parley_db::messages::list_messages(
                &self.pool,
                conversation_id,
                viewer_id,
                cursor.before,
                cursor.limit(),
            ),
        )
        .await
    }

    pub async fn delete_message_for(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<bool, CoreError> {
        self.serialized(
            conversation_id,
            "delete message",
            parley_db::messages::delete_message_for(&self.pool, message_id, user_id, Utc::now()),
        )
        .await
    }

    pub async fn set_muted_until(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        self.bounded(
            "mute",
            parley_db::conversations::set_muted_until(&self.pool, conversation_id, user_id, until),
        )
        .await
    }

    pub async fn set_archived(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        archived: bool,
    ) -> Result<(), CoreError> {
        self.bounded(
            "archive",
            parley_db::conversations::set_archived(&self.pool, conversation_id, user_id, archived),
        )
        .await
    }
}
