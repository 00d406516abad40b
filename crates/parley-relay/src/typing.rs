use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_protocol::{Identity, ServerEvent, Target};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::RelayError;
use crate::rooms::{RoomId, RoomRouter};

/// Self-expiring "is typing" signals, one per (actor, context).
///
/// A signal's notification is emitted while its entry is locked, so a
/// started/stopped pair for the same key can never be observed out of order.
///
/// Lock order: a `signals` entry may be held while `rooms` locks are taken,
/// never the reverse. `RoomRouter` never calls back into this type.
pub struct TypingCoordinator {
    rooms: Arc<RoomRouter>,
    signals: DashMap<(Identity, Target), Instant>,
    ttl: Duration,
}

impl TypingCoordinator {
    pub fn new(rooms: Arc<RoomRouter>, ttl: Duration) -> Self {
        Self {
            rooms,
            signals: DashMap::new(),
            ttl,
        }
    }

    pub fn set_typing(
        &self,
        actor: &str,
        context: Target,
        is_typing: bool,
    ) -> Result<(), RelayError> {
        match &context {
            Target::Peer(peer) if peer == actor => {
                return Err(RelayError::InvalidRequest(
                    "typing context cannot be yourself".to_string(),
                ));
            }
            Target::Group(group_id) => {
                if !self
                    .rooms
                    .has_identity(&RoomId::Group(group_id.clone()), actor)
                {
                    return Err(RelayError::Forbidden(format!(
                        "not a participant of group {group_id}"
                    )));
                }
            }
            Target::Peer(_) => {}
        }

        let key = (actor.to_string(), context);
        if is_typing {
            let expires_at = Instant::now() + self.ttl;
            let mut entry = self.signals.entry(key.clone()).or_insert(expires_at);
            *entry = expires_at;
            self.emit(&key.0, &key.1, true);
            drop(entry);
        } else if let Entry::Occupied(o) = self.signals.entry(key) {
            let (actor, context) = o.key();
            self.emit(actor, context, false);
            o.remove();
        }
        Ok(())
    }

    /// Remove every signal that expired at or before `now`. Returns how many.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(Identity, Target)> = self
            .signals
            .iter()
            .filter(|e| *e.value() <= now)
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for key in expired {
            // refreshed since the scan?
            if let Entry::Occupied(o) = self.signals.entry(key) {
                if *o.get() <= now {
                    let (actor, context) = o.key();
                    self.emit(actor, context, false);
                    o.remove();
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::trace!(removed, "expired typing signals");
        }
        removed
    }

    /// Stop every signal of `actor`, e.g. when its last connection closes.
    pub fn clear_actor(&self, actor: &str) -> usize {
        let keys: Vec<(Identity, Target)> = self
            .signals
            .iter()
            .filter(|e| e.key().0 == actor)
            .map(|e| e.key().clone())
            .collect();
        let mut cleared = 0;
        for key in keys {
            if let Entry::Occupied(o) = self.signals.entry(key) {
                let (actor, context) = o.key();
                self.emit(actor, context, false);
                o.remove();
                cleared += 1;
            }
        }
        cleared
    }

    pub fn is_typing(&self, actor: &str, context: &Target) -> bool {
        self.signals
            .contains_key(&(actor.to_string(), context.clone()))
    }

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let typing = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                typing.sweep(Instant::now());
            }
        })
    }

    /// Peer observers see the conversation keyed by the actor, not themselves.
    fn emit(&self, actor: &str, context: &Target, is_typing: bool) {
        let (room, observed) = match context {
            Target::Peer(peer) => (
                RoomId::Personal(peer.clone()),
                Target::Peer(actor.to_string()),
            ),
            Target::Group(group_id) => (RoomId::Group(group_id.clone()), context.clone()),
        };
        let event = ServerEvent::TypingChanged {
            actor_id: actor.to_string(),
            context: observed,
            is_typing,
        };
        self.rooms.broadcast_except(&room, &event, actor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{drain, handle};

    fn typing_events(events: &[ServerEvent]) -> Vec<(String, Target, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::TypingChanged {
                    actor_id,
                    context,
                    is_typing,
                } => Some((actor_id.clone(), context.clone(), *is_typing)),
                _ => None,
            })
            .collect()
    }

    fn setup() -> (Arc<RoomRouter>, Arc<TypingCoordinator>) {
        let rooms = Arc::new(RoomRouter::new());
        let typing = Arc::new(TypingCoordinator::new(
            rooms.clone(),
            Duration::from_millis(3_000),
        ));
        (rooms, typing)
    }

    #[tokio::test]
    async fn peer_context_is_rewritten_for_observer() {
        let (rooms, typing) = setup();
        let (bob, mut rx) = handle(2, "bob");
        rooms.join_personal_room(&bob);

        typing
            .set_typing("alice", Target::Peer("bob".to_string()), true)
            .unwrap();
        assert_eq!(
            typing_events(&drain(&mut rx)),
            vec![(
                "alice".to_string(),
                Target::Peer("alice".to_string()),
                true
            )]
        );
    }

    #[tokio::test]
    async fn one_signal_per_key_and_stop_only_when_present() {
        let (rooms, typing) = setup();
        let (bob, mut rx) = handle(2, "bob");
        rooms.join_personal_room(&bob);
        let ctx = Target::Peer("bob".to_string());

        typing.set_typing("alice", ctx.clone(), true).unwrap();
        typing.set_typing("alice", ctx.clone(), true).unwrap();
        assert_eq!(typing.signal_count(), 1);
        typing.set_typing("alice", ctx.clone(), false).unwrap();
        typing.set_typing("alice", ctx.clone(), false).unwrap();
        assert!(!typing.is_typing("alice", &ctx));

        let flags: Vec<bool> = typing_events(&drain(&mut rx))
            .into_iter()
            .map(|(_, _, t)| t)
            .collect();
        assert_eq!(flags, vec![true, true, false]);
    }

    #[tokio::test]
    async fn group_context_requires_membership_and_skips_actor() {
        let (rooms, typing) = setup();
        let (alice, mut ra) = handle(1, "alice");
        let (bob, mut rb) = handle(2, "bob");
        rooms.join_group_rooms(&alice, &["g1".to_string()]);
        rooms.join_group_rooms(&bob, &["g1".to_string()]);

        assert!(matches!(
            typing.set_typing("carol", Target::Group("g1".to_string()), true),
            Err(RelayError::Forbidden(_))
        ));
        typing
            .set_typing("alice", Target::Group("g1".to_string()), true)
            .unwrap();
        assert!(drain(&mut ra).is_empty());
        assert_eq!(
            typing_events(&drain(&mut rb)),
            vec![("alice".to_string(), Target::Group("g1".to_string()), true)]
        );
    }

    #[tokio::test]
    async fn self_context_is_invalid() {
        let (_rooms, typing) = setup();
        assert!(matches!(
            typing.set_typing("alice", Target::Peer("alice".to_string()), true),
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_after_ttl() {
        let (rooms, typing) = setup();
        let (bob, mut rx) = handle(2, "bob");
        rooms.join_personal_room(&bob);
        let ctx = Target::Peer("bob".to_string());
        typing.set_typing("alice", ctx.clone(), true).unwrap();
        drain(&mut rx);

        assert_eq!(typing.sweep(Instant::now() + Duration::from_millis(2_999)), 0);
        assert_eq!(typing.sweep(Instant::now() + Duration::from_millis(3_000)), 1);
        assert_eq!(
            typing_events(&drain(&mut rx)),
            vec![("alice".to_string(), Target::Peer("alice".to_string()), false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_slides_expiry() {
        let (_rooms, typing) = setup();
        let ctx = Target::Peer("bob".to_string());
        typing.set_typing("alice", ctx.clone(), true).unwrap();
        tokio::time::advance(Duration::from_millis(2_000)).await;
        typing.set_typing("alice", ctx.clone(), true).unwrap();
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(typing.sweep(Instant::now()), 0);
        assert!(typing.is_typing("alice", &ctx));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_emits_stop_within_one_interval() {
        let (rooms, typing) = setup();
        let (bob, mut rx) = handle(2, "bob");
        rooms.join_personal_room(&bob);
        let sweeper = typing.spawn_sweeper(Duration::from_millis(500));

        typing
            .set_typing("alice", Target::Peer("bob".to_string()), true)
            .unwrap();
        drain(&mut rx);
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let events = typing_events(&drain(&mut rx));
        assert_eq!(events.len(), 1);
        assert!(!events[0].2);
        sweeper.abort();
    }

    #[tokio::test]
    async fn clear_actor_stops_all_contexts() {
        let (rooms, typing) = setup();
        let (bob, mut rb) = handle(2, "bob");
        let (carol, mut rc) = handle(3, "carol");
        rooms.join_personal_room(&bob);
        rooms.join_group_rooms(&carol, &["g1".to_string()]);
        let (alice, _ra) = handle(1, "alice");
        rooms.join_group_rooms(&alice, &["g1".to_string()]);

        typing
            .set_typing("alice", Target::Peer("bob".to_string()), true)
            .unwrap();
        typing
            .set_typing("alice", Target::Group("g1".to_string()), true)
            .unwrap();
        drain(&mut rb);
        drain(&mut rc);

        assert_eq!(typing.clear_actor("alice"), 2);
        assert_eq!(typing.signal_count(), 0);
        assert_eq!(typing_events(&drain(&mut rb)).len(), 1);
        assert_eq!(typing_events(&drain(&mut rc)).len(), 1);
    }
}
