use dashmap::DashMap;
use parley_protocol::{
    ChatMessage, DeliveryState, GroupId, Identity, MessageId, MessageType, ServerEvent, Target,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::RelayError;
use crate::now_ms;
use crate::rooms::{RoomId, RoomRouter};
use crate::store::{DataStore, RetryPolicy, StoreError, StoredMessage};

/// Upper bound on cached tracking entries.
const MAX_TRACKED: usize = 65_536;

/// A message as submitted by its sender, before the relay assigns an id.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub target: Target,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to: Option<MessageId>,
    pub forwarded_from: Option<MessageId>,
    pub client_ref: Option<String>,
}

impl OutgoingMessage {
    pub fn text(target: Target, content: impl Into<String>) -> Self {
        Self {
            target,
            content: content.into(),
            message_type: MessageType::Text,
            reply_to: None,
            forwarded_from: None,
            client_ref: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    sender_id: Identity,
    target: Target,
    state: DeliveryState,
    deleted: bool,
    hard_deleted: bool,
}

impl Tracked {
    fn from_stored(stored: &StoredMessage) -> Self {
        Self {
            sender_id: stored.message.sender_id.clone(),
            target: stored.message.target.clone(),
            state: stored.message.delivery_state,
            deleted: stored.deleted,
            hard_deleted: false,
        }
    }

    fn is_finished(&self) -> bool {
        self.deleted || self.state == DeliveryState::Read
    }
}

/// Owns the sent -> delivered -> read lifecycle.
///
/// Each message has one entry in `tracked`; state changes and the
/// notifications they cause happen while that entry is locked, so the sender
/// observes a non-decreasing sequence. Store I/O always happens before the
/// entry is taken.
///
/// Lock order: a `tracked` entry may be held while `rooms` locks are taken,
/// never the reverse. `RoomRouter` never calls back into this type.
pub struct DeliveryCoordinator {
    store: Arc<dyn DataStore>,
    rooms: Arc<RoomRouter>,
    retry: RetryPolicy,
    tracked: DashMap<MessageId, Tracked>,
}

impl DeliveryCoordinator {
    pub fn new(store: Arc<dyn DataStore>, rooms: Arc<RoomRouter>, retry: RetryPolicy) -> Self {
        Self {
            store,
            rooms,
            retry,
            tracked: DashMap::new(),
        }
    }

    pub async fn send(
        &self,
        sender: &str,
        outgoing: OutgoingMessage,
    ) -> Result<ChatMessage, RelayError> {
        if outgoing.content.trim().is_empty() {
            return Err(RelayError::EmptyContent);
        }
        let store = &*self.store;
        match &outgoing.target {
            Target::Peer(peer) => {
                if peer == sender {
                    return Err(RelayError::InvalidRequest(
                        "cannot send a message to yourself".to_string(),
                    ));
                }
                let exists = self
                    .retry
                    .run("identity_exists", move || store.identity_exists(peer))
                    .await?;
                if !exists {
                    return Err(RelayError::NotFound(format!("user {peer}")));
                }
            }
            Target::Group(group_id) => {
                let participants = self.participants(group_id).await?;
                if !participants.iter().any(|p| p == sender) {
                    return Err(RelayError::Forbidden(format!(
                        "not a participant of group {group_id}"
                    )));
                }
            }
        }
        for reference in [&outgoing.reply_to, &outgoing.forwarded_from]
            .into_iter()
            .flatten()
        {
            self.check_visible(sender, reference).await?;
        }

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: sender.to_string(),
            target: outgoing.target,
            content: outgoing.content,
            message_type: outgoing.message_type,
            created_at_ms: now_ms(),
            delivery_state: DeliveryState::Sent,
            reply_to: outgoing.reply_to,
            forwarded_from: outgoing.forwarded_from,
        };
        let msg = &message;
        self.retry
            .run("create_message", move || store.create_message(msg))
            .await?;

        let entry = self.tracked.entry(message.id.clone()).or_insert(Tracked {
            sender_id: message.sender_id.clone(),
            target: message.target.clone(),
            state: DeliveryState::Sent,
            deleted: false,
            hard_deleted: false,
        });
        let received = ServerEvent::MessageReceived {
            message: message.clone(),
        };
        let fanout = match &message.target {
            Target::Peer(peer) => self
                .rooms
                .broadcast(&RoomId::Personal(peer.clone()), &received),
            Target::Group(group_id) => {
                self.rooms
                    .broadcast_except(&RoomId::Group(group_id.clone()), &received, sender)
            }
        };
        self.rooms.broadcast(
            &RoomId::Personal(sender.to_string()),
            &ServerEvent::MessageAck {
                message_id: message.id.clone(),
                delivery_state: DeliveryState::Sent,
                client_ref: outgoing.client_ref,
                reader_id: None,
                at_ms: message.created_at_ms,
            },
        );
        drop(entry);

        tracing::debug!(message_id = %message.id, sender, fanout, "message sent");
        self.prune_if_needed();
        Ok(message)
    }

    pub async fn mark_delivered(&self, message_id: &str, actor: &str) -> Result<(), RelayError> {
        self.advance(message_id, actor, DeliveryState::Delivered)
            .await
    }

    pub async fn mark_read(&self, message_id: &str, reader: &str) -> Result<(), RelayError> {
        self.advance(message_id, reader, DeliveryState::Read).await
    }

    async fn advance(
        &self,
        message_id: &str,
        actor: &str,
        target_state: DeliveryState,
    ) -> Result<(), RelayError> {
        let snapshot = self.tracked_or_load(message_id).await?;
        self.authorize_recipient(actor, &snapshot).await?;
        if snapshot.deleted || snapshot.state >= target_state {
            return Ok(());
        }

        let store = &*self.store;
        let effective = self
            .retry
            .run("set_delivery_state", move || {
                store.set_delivery_state(message_id, target_state)
            })
            .await?;

        let at_ms = now_ms();
        let mut entry = self
            .tracked
            .entry(message_id.to_string())
            .or_insert(snapshot);
        // A concurrent reader may already have stored `read`; that ack is
        // theirs to emit, with their reader id.
        let applied = effective.min(target_state);
        if entry.deleted || entry.state >= applied {
            return Ok(());
        }
        entry.state = applied;
        let reader_id = (applied == DeliveryState::Read).then(|| actor.to_string());
        self.rooms.broadcast(
            &RoomId::Personal(entry.sender_id.clone()),
            &ServerEvent::MessageAck {
                message_id: message_id.to_string(),
                delivery_state: applied,
                client_ref: None,
                reader_id,
                at_ms,
            },
        );
        drop(entry);

        tracing::debug!(message_id, actor, state = ?applied, "delivery state advanced");
        Ok(())
    }

    pub async fn delete(
        &self,
        message_id: &str,
        requester: &str,
        hard: bool,
    ) -> Result<(), RelayError> {
        let snapshot = self.tracked_or_load(message_id).await?;
        if snapshot.sender_id != requester {
            self.authorize_recipient(requester, &snapshot).await?;
        }
        if snapshot.hard_deleted || (snapshot.deleted && !hard) {
            return Ok(());
        }

        let store = &*self.store;
        match self
            .retry
            .run("delete_message", move || store.delete_message(message_id, hard))
            .await
        {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) if hard => {}
            Err(e) => return Err(e.into()),
        }

        let mut entry = self
            .tracked
            .entry(message_id.to_string())
            .or_insert(snapshot);
        if entry.hard_deleted || (entry.deleted && !hard) {
            return Ok(());
        }
        entry.deleted = true;
        entry.hard_deleted |= hard;
        let event = ServerEvent::MessageDeleted {
            message_id: message_id.to_string(),
            hard,
            deleted_by: requester.to_string(),
        };
        let sender_room = RoomId::Personal(entry.sender_id.clone());
        match &entry.target {
            Target::Peer(peer) => {
                self.rooms.broadcast(&sender_room, &event);
                self.rooms
                    .broadcast(&RoomId::Personal(peer.clone()), &event);
            }
            Target::Group(group_id) => {
                self.rooms.broadcast(&sender_room, &event);
                self.rooms.broadcast_except(
                    &RoomId::Group(group_id.clone()),
                    &event,
                    &entry.sender_id,
                );
            }
        }
        drop(entry);

        tracing::info!(message_id, requester, hard, "message deleted");
        Ok(())
    }

    /// Current state as the coordinator sees it.
    pub async fn state_of(&self, message_id: &str) -> Result<DeliveryState, RelayError> {
        Ok(self.tracked_or_load(message_id).await?.state)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    async fn tracked_or_load(&self, message_id: &str) -> Result<Tracked, RelayError> {
        if let Some(entry) = self.tracked.get(message_id) {
            return Ok(entry.clone());
        }
        let stored = self.load(message_id).await?;
        Ok(Tracked::from_stored(&stored))
    }

    async fn load(&self, message_id: &str) -> Result<StoredMessage, RelayError> {
        let store = &*self.store;
        self.retry
            .run("get_message", move || store.get_message(message_id))
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("message {message_id}")))
    }

    async fn participants(&self, group_id: &GroupId) -> Result<Vec<Identity>, RelayError> {
        let store = &*self.store;
        self.retry
            .run("group_participants", move || store.group_participants(group_id))
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("group {group_id}")))
    }

    /// `actor` must be an intended recipient: the peer, or a group participant
    /// other than the sender.
    async fn authorize_recipient(&self, actor: &str, tracked: &Tracked) -> Result<(), RelayError> {
        let allowed = match &tracked.target {
            Target::Peer(peer) => peer == actor,
            Target::Group(group_id) => {
                actor != tracked.sender_id
                    && (self
                        .rooms
                        .has_identity(&RoomId::Group(group_id.clone()), actor)
                        || self
                            .participants(group_id)
                            .await?
                            .iter()
                            .any(|p| p == actor))
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(RelayError::Forbidden("not a recipient of this message".to_string()))
        }
    }

    /// A referenced message must exist, not be deleted and be visible to `viewer`.
    async fn check_visible(&self, viewer: &str, message_id: &str) -> Result<(), RelayError> {
        let stored = self.load(message_id).await?;
        if stored.deleted {
            return Err(RelayError::NotFound(format!("message {message_id}")));
        }
        let tracked = Tracked::from_stored(&stored);
        if tracked.sender_id == viewer {
            return Ok(());
        }
        self.authorize_recipient(viewer, &tracked)
            .await
            .map_err(|_| RelayError::Forbidden(format!("message {message_id} is not visible")))
    }

    fn prune_if_needed(&self) {
        if self.tracked.len() > MAX_TRACKED {
            self.prune(MAX_TRACKED);
        }
    }

    /// Shrink the cache to at most `cap` entries, finished ones first. Evicted
    /// messages are reloaded from the store on their next transition.
    fn prune(&self, cap: usize) {
        self.tracked.retain(|_, t| !t.is_finished());
        let excess = self.tracked.len().saturating_sub(cap);
        if excess == 0 {
            return;
        }
        let victims: Vec<MessageId> = self
            .tracked
            .iter()
            .take(excess)
            .map(|e| e.key().clone())
            .collect();
        for id in &victims {
            self.tracked.remove(id);
        }
        tracing::debug!(evicted = victims.len(), "delivery tracking evicted");
    }
}
