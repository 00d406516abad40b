use parley_protocol::{
    CallFailureReason, ClientEvent, ConnectionId, GroupId, Identity, ServerEvent, Target,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::TokenVerifier;
use crate::calls::CallCoordinator;
use crate::config::RelayConfig;
use crate::delivery::{DeliveryCoordinator, OutgoingMessage};
use crate::error::RelayError;
use crate::presence::{Admission, ConnHandle, PresenceRegistry};
use crate::rooms::{RoomId, RoomRouter};
use crate::store::{DataStore, RetryPolicy};
use crate::typing::TypingCoordinator;

/// Shared state of a running relay: the five coordinators plus the store and
/// verifier they consult.
pub struct Relay {
    pub config: RelayConfig,
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<RoomRouter>,
    pub delivery: Arc<DeliveryCoordinator>,
    pub typing: Arc<TypingCoordinator>,
    pub calls: Arc<CallCoordinator>,
    store: Arc<dyn DataStore>,
    verifier: Arc<dyn TokenVerifier>,
    retry: RetryPolicy,
    next_conn_id: AtomicU64,
    /// Identities last announced as online. Announcements are serialized
    /// through this lock and always report the registry's current state.
    announced: StdMutex<HashSet<Identity>>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub online: usize,
    pub connections: usize,
    pub active_calls: usize,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn DataStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Arc<Self> {
        let presence = Arc::new(PresenceRegistry::new(config.max_connections));
        let rooms = Arc::new(RoomRouter::new());
        let delivery = Arc::new(DeliveryCoordinator::new(
            store.clone(),
            rooms.clone(),
            config.store_retry.clone(),
        ));
        let typing = Arc::new(TypingCoordinator::new(rooms.clone(), config.typing.ttl()));
        let calls = Arc::new(CallCoordinator::new(presence.clone(), &config.calls));
        Arc::new(Self {
            retry: config.store_retry.clone(),
            config,
            presence,
            rooms,
            delivery,
            typing,
            calls,
            store,
            verifier,
            next_conn_id: AtomicU64::new(1),
            announced: StdMutex::new(HashSet::new()),
        })
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start background maintenance (typing expiry).
    pub fn start_background(&self) -> JoinHandle<()> {
        self.typing
            .spawn_sweeper(self.config.typing.sweep_interval())
    }

    /// Admission hook, identical for fresh connections and reconnections.
    ///
    /// Store lookups happen before any in-memory state is touched.
    pub async fn admit(
        &self,
        conn_id: ConnectionId,
        token: &str,
        tx: mpsc::Sender<ServerEvent>,
    ) -> Result<ConnHandle, RelayError> {
        let identity = self.verifier.verify(token).await?;
        let store = &*self.store;
        let id = &identity;
        self.retry
            .run("register_identity", move || store.register_identity(id))
            .await?;
        let groups = self
            .retry
            .run("user_groups", move || store.user_groups(id))
            .await?;

        let handle = ConnHandle::new(conn_id, identity.clone(), tx);
        let admission = self.presence.admit(handle.clone())?;
        if admission != Admission::AlreadyAdmitted {
            self.rooms.join_personal_room(&handle);
            self.rooms.join_group_rooms(&handle, &groups);
            if self.presence.handle(conn_id).is_none() {
                // closed while joining
                self.rooms.leave_all(conn_id);
                return Err(RelayError::NotAdmitted);
            }
        }

        handle.deliver(ServerEvent::Admitted {
            identity: identity.clone(),
            connection_id: conn_id,
        });
        handle.deliver(ServerEvent::PresenceSnapshot {
            online: self.presence.snapshot(),
        });
        if admission == Admission::FirstConnection {
            self.sync_presence(&identity);
        }
        tracing::info!(conn = conn_id, identity = %identity, ?admission, groups = groups.len(), "connection admitted");
        Ok(handle)
    }

    /// Tear down everything a closed connection took part in. Each step takes
    /// and releases one component's lock.
    pub fn disconnect(&self, conn_id: ConnectionId) {
        let removal = self.presence.remove(conn_id);
        self.rooms.leave_all(conn_id);
        self.calls.on_connection_closed(conn_id);
        let Some(removal) = removal else {
            return;
        };
        if removal.last_connection {
            self.typing.clear_actor(&removal.identity);
            self.sync_presence(&removal.identity);
        }
        tracing::info!(conn = conn_id, identity = %removal.identity, last = removal.last_connection, "connection closed");
    }

    /// Announce `identity`'s presence if it differs from what was last
    /// announced. A racing admit and last-disconnect may both call this; the
    /// later call reads the final registry state, so observers converge on it.
    ///
    /// Lock order: `announced`, then presence.
    fn sync_presence(&self, identity: &str) {
        let mut announced = self
            .announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let online = self.presence.is_online(identity);
        let changed = if online {
            announced.insert(identity.to_string())
        } else {
            announced.remove(identity)
        };
        if !changed {
            return;
        }
        let event = ServerEvent::PresenceChanged {
            identity: identity.to_string(),
            online,
        };
        for handle in self.presence.all_connections() {
            if handle.identity != identity {
                handle.deliver(event.clone());
            }
        }
    }

    /// Join `handle` to `room` unless its connection has already closed.
    /// Disconnect removes from presence before leaving rooms, so checking
    /// presence after the join catches a close that raced it.
    fn join_live(&self, room: RoomId, handle: &ConnHandle) -> bool {
        self.rooms.join(room, handle);
        if self.presence.handle(handle.id).is_some() {
            return true;
        }
        self.rooms.leave_all(handle.id);
        false
    }

    /// Unknown typing targets are `NotFound`. Only consults the store when
    /// the in-memory rooms cannot answer.
    async fn check_typing_target(&self, actor: &str, context: &Target) -> Result<(), RelayError> {
        let store = &*self.store;
        match context {
            Target::Peer(peer) => {
                if self.presence.is_online(peer) {
                    return Ok(());
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
                if self
                    .rooms
                    .has_identity(&RoomId::Group(group_id.clone()), actor)
                {
                    return Ok(());
                }
                let participants = self
                    .retry
                    .run("group_participants", move || store.group_participants(group_id))
                    .await?;
                if participants.is_none() {
                    return Err(RelayError::NotFound(format!("group {group_id}")));
                }
            }
        }
        Ok(())
    }

    pub async fn handle(&self, conn: &ConnHandle, event: ClientEvent) -> Result<(), RelayError> {
        match event {
            ClientEvent::Admit { token } => {
                let identity = self.verifier.verify(&token).await?;
                if identity != conn.identity {
                    return Err(RelayError::AlreadyAdmitted(conn.identity.clone()));
                }
                conn.deliver(ServerEvent::Admitted {
                    identity,
                    connection_id: conn.id,
                });
                conn.deliver(ServerEvent::PresenceSnapshot {
                    online: self.presence.snapshot(),
                });
                Ok(())
            }
            ClientEvent::WhoIsOnline => {
                conn.deliver(ServerEvent::PresenceSnapshot {
                    online: self.presence.snapshot(),
                });
                Ok(())
            }
            ClientEvent::SendMessage {
                target,
                content,
                message_type,
                reply_to,
                forwarded_from,
                client_ref,
            } => {
                let outgoing = OutgoingMessage {
                    target,
                    content,
                    message_type,
                    reply_to,
                    forwarded_from,
                    client_ref,
                };
                self.delivery.send(&conn.identity, outgoing).await?;
                Ok(())
            }
            ClientEvent::MarkDelivered { message_id } => {
                self.delivery
                    .mark_delivered(&message_id, &conn.identity)
                    .await
            }
            ClientEvent::MarkRead { message_id } => {
                self.delivery.mark_read(&message_id, &conn.identity).await
            }
            ClientEvent::DeleteMessage { message_id, hard } => {
                self.delivery
                    .delete(&message_id, &conn.identity, hard)
                    .await
            }
            ClientEvent::Typing { context, is_typing } => {
                self.check_typing_target(&conn.identity, &context).await?;
                self.typing.set_typing(&conn.identity, context, is_typing)
            }
            ClientEvent::RefreshGroup { group_id } => {
                self.refresh_group(&conn.identity, &group_id).await
            }
            ClientEvent::CallRequest {
                callee_id,
                offer,
                kind,
            } => {
                self.calls.request_call(conn, &callee_id, offer, kind)?;
                Ok(())
            }
            ClientEvent::CallAccept { call_id, answer } => {
                self.calls.accept(conn, &call_id, answer)
            }
            ClientEvent::CallReject { call_id } => self.calls.reject(conn, &call_id),
            ClientEvent::EndCall { call_id } => self.calls.end_call(conn, &call_id),
            ClientEvent::IceCandidate { call_id, candidate } => {
                self.calls.relay_ice(conn, &call_id, candidate)
            }
            ClientEvent::CallConnected { call_id } => {
                self.calls.mark_connected(conn, &call_id)
            }
            ClientEvent::Ping { timestamp_ms } => {
                conn.deliver(ServerEvent::Pong { timestamp_ms });
                Ok(())
            }
            // the connection task closes the socket
            ClientEvent::Logout => Ok(()),
        }
    }

    /// Re-derive a group room from the store's participant list.
    pub async fn refresh_group(&self, requester: &str, group_id: &GroupId) -> Result<(), RelayError> {
        let store = &*self.store;
        let participants = self
            .retry
            .run("group_participants", move || store.group_participants(group_id))
            .await?;
        let room = RoomId::Group(group_id.clone());

        let Some(participants) = participants else {
            if !self.rooms.has_identity(&room, requester) {
                return Err(RelayError::NotFound(format!("group {group_id}")));
            }
            let removed = ServerEvent::GroupRemoved {
                group_id: group_id.clone(),
            };
            let former = self.rooms.drop_room(&room);
            for handle in &former {
                handle.deliver(removed.clone());
            }
            tracing::info!(group_id = %group_id, former = former.len(), "group room dropped");
            return Ok(());
        };

        if !participants.iter().any(|p| p == requester) && !self.rooms.has_identity(&room, requester) {
            return Err(RelayError::Forbidden(format!(
                "not a participant of group {group_id}"
            )));
        }

        let removed = ServerEvent::GroupRemoved {
            group_id: group_id.clone(),
        };
        for identity in self.rooms.member_identities(&room) {
            if participants.contains(&identity) {
                continue;
            }
            for handle in self.rooms.leave_group_room(&identity, group_id) {
                handle.deliver(removed.clone());
            }
        }
        for participant in &participants {
            for handle in self.presence.connections_for(participant) {
                self.join_live(room.clone(), &handle);
            }
        }
        self.rooms.broadcast(
            &room,
            &ServerEvent::GroupUpdated {
                group_id: group_id.clone(),
                participants,
            },
        );
        Ok(())
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            online: self.presence.online_count(),
            connections: self.presence.connection_count(),
            active_calls: self.calls.active_count(),
        }
    }
}

/// The single client event an error turns into. Unreachable call targets are
/// reported as a failed call rather than a generic error.
pub fn render_error(err: &RelayError) -> ServerEvent {
    match err {
        RelayError::RecipientUnavailable(peer) => ServerEvent::CallFailed {
            call_id: None,
            peer_id: peer.clone(),
            reason: CallFailureReason::RecipientUnavailable,
        },
        RelayError::CalleeBusy(peer) => ServerEvent::CallFailed {
            call_id: None,
            peer_id: peer.clone(),
            reason: CallFailureReason::Busy,
        },
        other => {
            let (code, message) = other.to_error_code();
            ServerEvent::Error { code, message }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{drain, relay_with_store};
    use parley_protocol::{
        CallKind, DeliveryState, ErrorCode, SessionDescription, Target,
    };

    async fn admit(
        relay: &Relay,
        token: &str,
    ) -> (ConnHandle, mpsc::Receiver<ServerEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let handle = relay
            .admit(relay.next_connection_id(), token, tx)
            .await
            .unwrap();
        let events = drain(&mut rx);
        assert!(matches!(events[0], ServerEvent::Admitted { .. }));
        assert!(matches!(events[1], ServerEvent::PresenceSnapshot { .. }));
        (handle, rx)
    }

    fn presence_changes(events: &[ServerEvent]) -> Vec<(String, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::PresenceChanged { identity, online } => {
                    Some((identity.clone(), *online))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn bad_token_is_rejected() {
        let (relay, _store) = relay_with_store().await;
        let (tx, mut rx) = mpsc::channel(8);
        let err = relay.admit(1, "tok-nobody", tx).await.unwrap_err();
        assert!(matches!(err, RelayError::Unauthenticated(_)));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(relay.presence.connection_count(), 0);
    }

    #[tokio::test]
    async fn presence_is_announced_once_per_identity() {
        let (relay, _store) = relay_with_store().await;
        let (_alice, mut ra) = admit(&relay, "tok-alice").await;
        let (bob1, _rb1) = admit(&relay, "tok-bob").await;
        let (bob2, _rb2) = admit(&relay, "tok-bob").await;
        assert_eq!(
            presence_changes(&drain(&mut ra)),
            vec![("bob".to_string(), true)]
        );

        relay.disconnect(bob1.id);
        assert!(presence_changes(&drain(&mut ra)).is_empty());
        relay.disconnect(bob2.id);
        assert_eq!(
            presence_changes(&drain(&mut ra)),
            vec![("bob".to_string(), false)]
        );
        assert_eq!(relay.presence.snapshot(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn snapshot_lists_everyone_online() {
        let (relay, _store) = relay_with_store().await;
        let (_alice, _ra) = admit(&relay, "tok-alice").await;
        let (tx, mut rx) = mpsc::channel(8);
        relay.admit(99, "tok-bob", tx).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(
            events[1],
            ServerEvent::PresenceSnapshot {
                online: vec!["alice".to_string(), "bob".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn offline_message_then_reconnect() {
        let (relay, store) = relay_with_store().await;
        let (alice, mut ra) = admit(&relay, "tok-alice").await;
        relay
            .handle(
                &alice,
                ClientEvent::SendMessage {
                    target: Target::Peer("bob".to_string()),
                    content: "hi".to_string(),
                    message_type: Default::default(),
                    reply_to: None,
                    forwarded_from: None,
                    client_ref: Some("r1".to_string()),
                },
            )
            .await
            .unwrap();
        let message_id = match drain(&mut ra).as_slice() {
            [ServerEvent::MessageAck { message_id, .. }] => message_id.clone(),
            other => panic!("unexpected events: {other:?}"),
        };

        let (_bob, _rb) = admit(&relay, "tok-bob").await;
        assert_eq!(
            presence_changes(&drain(&mut ra)),
            vec![("bob".to_string(), true)]
        );
        let stored = store.get_message(&message_id).await.unwrap().unwrap();
        assert_eq!(stored.message.delivery_state, DeliveryState::Sent);
    }

    #[tokio::test]
    async fn group_rooms_joined_on_admission() {
        let (relay, _store) = relay_with_store().await;
        let (alice, _ra) = admit(&relay, "tok-alice").await;
        let (_bob, mut rb) = admit(&relay, "tok-bob").await;
        relay
            .handle(
                &alice,
                ClientEvent::SendMessage {
                    target: Target::Group("g1".to_string()),
                    content: "hello team".to_string(),
                    message_type: Default::default(),
                    reply_to: None,
                    forwarded_from: None,
                    client_ref: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            drain(&mut rb).as_slice(),
            [ServerEvent::MessageReceived { .. }]
        ));
    }

    #[tokio::test]
    async fn refresh_group_follows_store() {
        let (relay, store) = relay_with_store().await;
        let (alice, mut ra) = admit(&relay, "tok-alice").await;
        let (_bob, mut rb) = admit(&relay, "tok-bob").await;
        let (_carol, mut rc) = admit(&relay, "tok-carol").await;
        drain(&mut ra);
        drain(&mut rb);

        store.remove_participant("g1", "bob").await.unwrap();
        store.add_participant("g1", "carol").await.unwrap();
        relay
            .handle(
                &alice,
                ClientEvent::RefreshGroup {
                    group_id: "g1".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            drain(&mut rb).as_slice(),
            [ServerEvent::GroupRemoved { .. }]
        ));
        assert!(matches!(
            drain(&mut rc).as_slice(),
            [ServerEvent::GroupUpdated { participants, .. }] if participants == &vec!["alice".to_string(), "carol".to_string()]
        ));
        let room = RoomId::Group("g1".to_string());
        assert!(!relay.rooms.has_identity(&room, "bob"));
        assert!(relay.rooms.has_identity(&room, "carol"));

        store.delete_group("g1").await.unwrap();
        relay
            .refresh_group("alice", &"g1".to_string())
            .await
            .unwrap();
        assert!(matches!(
            drain(&mut rc).as_slice(),
            [ServerEvent::GroupRemoved { .. }]
        ));
        assert_eq!(relay.rooms.members(&room).len(), 0);
    }

    #[tokio::test]
    async fn disconnect_ends_calls_and_typing() {
        let (relay, _store) = relay_with_store().await;
        let (alice, mut ra) = admit(&relay, "tok-alice").await;
        let (_bob, mut rb) = admit(&relay, "tok-bob").await;
        drain(&mut ra);

        relay
            .handle(
                &alice,
                ClientEvent::Typing {
                    context: Target::Peer("bob".to_string()),
                    is_typing: true,
                },
            )
            .await
            .unwrap();
        relay
            .handle(
                &alice,
                ClientEvent::CallRequest {
                    callee_id: "bob".to_string(),
                    offer: SessionDescription::offer("v=0"),
                    kind: CallKind::Audio,
                },
            )
            .await
            .unwrap();
        drain(&mut rb);

        relay.disconnect(alice.id);
        let events = drain(&mut rb);
        assert!(events.iter().any(|e| matches!(e, ServerEvent::CallEnded { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::TypingChanged { is_typing: false, .. }
        )));
        assert_eq!(
            presence_changes(&events),
            vec![("alice".to_string(), false)]
        );
        assert!(relay.calls.call_of("bob").is_none());
    }

    #[tokio::test]
    async fn errors_render_as_single_events() {
        let (relay, _store) = relay_with_store().await;
        let (alice, _ra) = admit(&relay, "tok-alice").await;
        let err = relay
            .handle(
                &alice,
                ClientEvent::CallRequest {
                    callee_id: "bob".to_string(),
                    offer: SessionDescription::offer("v=0"),
                    kind: CallKind::Video,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(
            render_error(&err),
            ServerEvent::CallFailed {
                call_id: None,
                peer_id: "bob".to_string(),
                reason: CallFailureReason::RecipientUnavailable,
            }
        );

        let err = relay
            .handle(
                &alice,
                ClientEvent::MarkRead {
                    message_id: "missing".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            render_error(&err),
            ServerEvent::Error {
                code: ErrorCode::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn readmit_with_other_identity_is_refused() {
        let (relay, _store) = relay_with_store().await;
        let (alice, mut ra) = admit(&relay, "tok-alice").await;
        relay
            .handle(
                &alice,
                ClientEvent::Admit {
                    token: "tok-alice".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            drain(&mut ra)[0],
            ServerEvent::Admitted { .. }
        ));
        assert!(matches!(
            relay
                .handle(
                    &alice,
                    ClientEvent::Admit {
                        token: "tok-bob".to_string()
                    }
                )
                .await,
            Err(RelayError::AlreadyAdmitted(_))
        ));
    }

    #[tokio::test]
    async fn ping_pong() {
        let (relay, _store) = relay_with_store().await;
        let (alice, mut ra) = admit(&relay, "tok-alice").await;
        relay
            .handle(&alice, ClientEvent::Ping { timestamp_ms: 42 })
            .await
            .unwrap();
        assert_eq!(
            drain(&mut ra),
            vec![ServerEvent::Pong { timestamp_ms: 42 }]
        );
        assert_eq!(relay.health().connections, 1);
    }

    #[tokio::test]
    async fn last_disconnect_racing_reconnect_leaves_identity_online() {
        let (relay, _store) = relay_with_store().await;
        let (_alice, mut ra) = admit(&relay, "tok-alice").await;
        let (bob1, _rb1) = admit(&relay, "tok-bob").await;
        drain(&mut ra);

        // bob1's disconnect removes the last connection, then a new bob
        // connection is admitted before the disconnect announces.
        let removal = relay.presence.remove(bob1.id).unwrap();
        assert!(removal.last_connection);
        relay.rooms.leave_all(bob1.id);
        let (_bob2, _rb2) = admit(&relay, "tok-bob").await;
        relay.sync_presence(&removal.identity);

        assert!(presence_changes(&drain(&mut ra)).is_empty());
        assert!(relay.presence.is_online("bob"));
    }

    #[tokio::test]
    async fn offline_announcement_is_followed_by_online() {
        let (relay, _store) = relay_with_store().await;
        let (_alice, mut ra) = admit(&relay, "tok-alice").await;
        let (bob1, _rb1) = admit(&relay, "tok-bob").await;
        drain(&mut ra);

        let removal = relay.presence.remove(bob1.id).unwrap();
        relay.rooms.leave_all(bob1.id);
        relay.sync_presence(&removal.identity);
        let (_bob2, _rb2) = admit(&relay, "tok-bob").await;
        // the stale disconnect path re-syncing must not flip bob back offline
        relay.sync_presence(&removal.identity);

        assert_eq!(
            presence_changes(&drain(&mut ra)),
            vec![("bob".to_string(), false), ("bob".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn closed_connection_is_not_joined_to_rooms() {
        let (relay, _store) = relay_with_store().await;
        let (bob, mut rb) = admit(&relay, "tok-bob").await;
        let room = RoomId::Group("g1".to_string());

        // snapshot taken by a refresh, then the connection closes
        let stale = relay.presence.connections_for("bob");
        relay.disconnect(bob.id);
        for handle in &stale {
            assert!(!relay.join_live(room.clone(), handle));
        }

        assert!(relay.rooms.rooms_of(bob.id).is_empty());
        assert!(relay.rooms.members(&room).is_empty());
        drain(&mut rb);
    }

    #[tokio::test]
    async fn typing_to_unknown_targets_is_not_found() {
        let (relay, _store) = relay_with_store().await;
        let (alice, _ra) = admit(&relay, "tok-alice").await;
        let (carol, _rc) = admit(&relay, "tok-carol").await;

        let typing = |to: Target| ClientEvent::Typing {
            context: to,
            is_typing: true,
        };
        assert!(matches!(
            relay
                .handle(&alice, typing(Target::Peer("zed".to_string())))
                .await,
            Err(RelayError::NotFound(_))
        ));
        assert!(matches!(
            relay
                .handle(&alice, typing(Target::Group("g9".to_string())))
                .await,
            Err(RelayError::NotFound(_))
        ));
        assert!(matches!(
            relay
                .handle(&carol, typing(Target::Group("g1".to_string())))
                .await,
            Err(RelayError::Forbidden(_))
        ));
        // known but offline peer
        relay
            .handle(&alice, typing(Target::Peer("bob".to_string())))
            .await
            .unwrap();
    }
}
