use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_models::gateway::OutboundEvent;
use parley_models::{ConversationId, UserId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Identifies one live client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The connection's task is gone.
    Closed,
    /// The client is not draining its queue.
    Full,
}

/// Addressable endpoint for pushing events to one client connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    sender: mpsc::Sender<OutboundEvent>,
    evicted: Arc<Notify>,
}

/// The receiving half kept by the connection's own task.
pub struct ConnectionReceiver {
    pub events: mpsc::Receiver<OutboundEvent>,
    evicted: Arc<Notify>,
}

/// What a connection task should do next.
#[derive(Debug, PartialEq)]
pub enum Outbound {
    Event(OutboundEvent),
    /// The registry dropped this connection after a failed push.
    Evicted,
    /// Every handle was dropped.
    Closed,
}

impl ConnectionReceiver {
    /// Wait for the next queued event. Eviction wins over a pending backlog.
    pub async fn next(&mut self) -> Outbound {
        tokio::select! {
            biased;
            () = self.evicted.notified() => Outbound::Evicted,
            event = self.events.recv() => match event {
                Some(event) => Outbound::Event(event),
                None => Outbound::Closed,
            },
        }
    }
}

impl ConnectionHandle {
    pub fn channel(user_id: UserId, capacity: usize) -> (Self, ConnectionReceiver) {
        let (sender, events) = mpsc::channel(capacity.max(1));
        let evicted = Arc::new(Notify::new());
        let handle = Self {
            id: ConnectionId::new(),
            user_id,
            sender,
            evicted: evicted.clone(),
        };
        (handle, ConnectionReceiver { events, evicted })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Non-blocking push onto the connection's bounded queue.
    pub fn push(&self, event: OutboundEvent) -> Result<(), PushError> {
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Outcome of pushing one event to a set of handles.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Users whose last handle was evicted while delivering.
    pub gone_offline: Vec<UserId>,
}

impl Delivery {
    pub fn merge(&mut self, other: Delivery) {
        self.delivered += other.delivered;
        self.gone_offline.extend(other.gone_offline);
    }
}

/// In-memory map of who is connected where. Never persisted.
#[derive(Default)]
pub struct ConnectionRegistry {
    users: DashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
    by_id: DashMap<ConnectionId, ConnectionHandle>,
    rooms: DashMap<ConversationId, HashSet<ConnectionId>>,
    joined: DashMap<ConnectionId, HashSet<ConversationId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when this is the user's first live handle.
    pub fn register(&self, handle: ConnectionHandle) -> bool {
        let user_id = handle.user_id;
        self.by_id.insert(handle.id, handle.clone());
        let mut handles = self.users.entry(user_id).or_default();
        let went_online = handles.is_empty();
        handles.insert(handle.id, handle);
        went_online
    }

    /// Remove a handle and every room it joined. Returns `true` when that was
    /// the user's last handle. Unknown handles are ignored.
    pub fn unregister(&self, handle: &ConnectionHandle) -> bool {
        self.by_id.remove(&handle.id);
        if let Some((_, conversations)) = self.joined.remove(&handle.id) {
            for conversation_id in conversations {
                self.leave_room_entry(conversation_id, handle.id);
            }
        }
        match self.users.entry(handle.user_id) {
            Entry::Occupied(mut entry) => {
                if entry.get_mut().remove(&handle.id).is_none() {
                    return false;
                }
                if entry.get().is_empty() {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Drop a handle whose queue rejected a push and wake its task so it closes.
    pub fn evict(&self, handle: &ConnectionHandle) -> bool {
        let went_offline = self.unregister(handle);
        handle.evicted.notify_one();
        tracing::debug!(
            connection_id = %handle.id,
            user_id = handle.user_id,
            "evicted unresponsive connection"
        );
        went_offline
    }

    pub fn handles_for(&self, user_id: UserId) -> Vec<ConnectionHandle> {
        self.users
            .get(&user_id)
            .map(|handles| handles.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn handle(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        self.by_id.get(&connection_id).map(|h| h.clone())
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.users.contains_key(&user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.by_id.len()
    }

    pub fn online_user_count(&self) -> usize {
        self.users.len()
    }

    /// Push to every handle of a user, evicting handles that fail.
    pub fn deliver(&self, user_id: UserId, event: &OutboundEvent) -> Delivery {
        self.deliver_to_handles(self.handles_for(user_id), event)
    }

    pub fn deliver_to_handles(
        &self,
        handles: Vec<ConnectionHandle>,
        event: &OutboundEvent,
    ) -> Delivery {
        let mut delivery = Delivery::default();
        for handle in handles {
            match handle.push(event.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(err) => {
                    tracing::debug!(
                        connection_id = %handle.id,
                        event = event.name(),
                        ?err,
                        "push failed"
                    );
                    if self.evict(&handle) {
                        delivery.gone_offline.push(handle.user_id);
                    }
                }
            }
        }
        delivery
    }

    /// Returns `false` if the connection is not registered.
    ///
    /// `unregister` removes `by_id` before `joined`, so checking `by_id` again
    /// after both inserts either sees the removal and rolls back, or leaves
    /// entries that `unregister` will still find.
    pub fn join_room(&self, connection_id: ConnectionId, conversation_id: ConversationId) -> bool {
        if !self.by_id.contains_key(&connection_id) {
            return false;
        }
        self.joined
            .entry(connection_id)
            .or_default()
            .insert(conversation_id);
        self.rooms
            .entry(conversation_id)
            .or_default()
            .insert(connection_id);
        if self.by_id.contains_key(&connection_id) {
            return true;
        }
        if let Some(mut conversations) = self.joined.get_mut(&connection_id) {
            conversations.remove(&conversation_id);
        }
        self.joined
            .remove_if(&connection_id, |_, conversations| conversations.is_empty());
        self.leave_room_entry(conversation_id, connection_id);
        false
    }

    pub fn leave_room(&self, connection_id: ConnectionId, conversation_id: ConversationId) {
        if let Some(mut conversations) = self.joined.get_mut(&connection_id) {
            conversations.remove(&conversation_id);
        }
        self.leave_room_entry(conversation_id, connection_id);
    }

    fn leave_room_entry(&self, conversation_id: ConversationId, connection_id: ConnectionId) {
        if let Entry::Occupied(mut entry) = self.rooms.entry(conversation_id) {
            entry.get_mut().remove(&connection_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Live handles that joined a conversation room.
    pub fn room_handles(&self, conversation_id: ConversationId) -> Vec<ConnectionHandle> {
        let ids: Vec<ConnectionId> = self
            .rooms
            .get(&conversation_id)
            .map(|room| room.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.handle(id)).collect()
    }

    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<ConversationId> {
        self.joined
            .get(&connection_id)
            .map(|rooms| rooms.iter().copied().collect())
            .unwrap_or_default()
    }
}
