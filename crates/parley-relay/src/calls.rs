use parley_protocol::{
    CallEndReason, CallFailureReason, CallId, CallKind, ConnectionId, IceCandidate, Identity,
    ServerEvent, SessionDescription,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::config::CallConfig;
use crate::error::RelayError;
use crate::presence::{ConnHandle, PresenceRegistry};

/// Finished calls remembered for `outcome`.
const FINISHED_LOG: usize = 1_024;

/// A party's view of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Connecting,
    Active,
    Ended,
    Rejected,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Rejected | CallState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub caller_id: Identity,
    pub callee_id: Identity,
    pub state: CallState,
    pub end_reason: Option<CallEndReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ringing,
    Connecting,
    Active,
}

struct PendingIce {
    from_conn: ConnectionId,
    from_id: Identity,
    candidate: IceCandidate,
}

struct CallSession {
    caller: ConnHandle,
    callee_id: Identity,
    /// Callee connection that accepted.
    callee: Option<ConnHandle>,
    /// Callee connections that were sent `incoming_call`.
    rung: Vec<ConnHandle>,
    kind: CallKind,
    phase: Phase,
    pending_ice: VecDeque<PendingIce>,
    ring_timer: Option<AbortHandle>,
}

impl CallSession {
    fn is_party(&self, identity: &str) -> bool {
        self.caller.identity == identity || self.callee_id == identity
    }

    /// Bound connection on the other side of `conn`, if any.
    fn counterpart(&self, conn: ConnectionId) -> Option<&ConnHandle> {
        if conn == self.caller.id {
            self.callee.as_ref()
        } else if self.callee.as_ref().is_some_and(|c| c.id == conn) {
            Some(&self.caller)
        } else {
            None
        }
    }

    fn notify_rung_except(&self, conn: ConnectionId, event: &ServerEvent) {
        for handle in self.rung.iter().filter(|h| h.id != conn) {
            handle.deliver(event.clone());
        }
    }
}

#[derive(Default)]
struct CallTable {
    sessions: HashMap<CallId, CallSession>,
    by_identity: HashMap<Identity, CallId>,
    finished: VecDeque<(CallId, CallOutcome)>,
}

impl CallTable {
    fn finish(&mut self, call_id: &str, state: CallState, end_reason: Option<CallEndReason>) {
        let Some(session) = self.sessions.remove(call_id) else {
            return;
        };
        if let Some(timer) = session.ring_timer {
            timer.abort();
        }
        for identity in [&session.caller.identity, &session.callee_id] {
            if self.by_identity.get(identity).is_some_and(|id| id == call_id) {
                self.by_identity.remove(identity);
            }
        }
        tracing::info!(call_id, caller = %session.caller.identity, callee = %session.callee_id, ?state, ?end_reason, "call finished");
        if self.finished.len() >= FINISHED_LOG {
            self.finished.pop_front();
        }
        self.finished.push_back((
            call_id.to_string(),
            CallOutcome {
                caller_id: session.caller.identity,
                callee_id: session.callee_id,
                state,
                end_reason,
            },
        ));
    }
}

/// Two-party call signaling: offer/answer exchange, ICE relay and the
/// ringing/connecting/active lifecycle.
///
/// All sessions live in one table behind a std mutex. Presence lookups happen
/// before the table is locked; emission under the lock is a non-blocking
/// queue push. Control events for unknown or finished calls, or arriving in
/// the wrong phase, are ignored.
pub struct CallCoordinator {
    presence: Arc<PresenceRegistry>,
    table: StdMutex<CallTable>,
    ring_timeout: Duration,
    max_pending_ice: usize,
}

impl CallCoordinator {
    pub fn new(presence: Arc<PresenceRegistry>, config: &CallConfig) -> Self {
        Self {
            presence,
            table: StdMutex::new(CallTable::default()),
            ring_timeout: config.ring_timeout(),
            max_pending_ice: config.max_pending_ice,
        }
    }

    fn table(&self) -> MutexGuard<'_, CallTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request_call(
        self: &Arc<Self>,
        caller: &ConnHandle,
        callee_id: &str,
        offer: SessionDescription,
        kind: CallKind,
    ) -> Result<CallId, RelayError> {
        if caller.identity == callee_id {
            return Err(RelayError::InvalidRequest(
                "cannot call yourself".to_string(),
            ));
        }
        let callee_conns = self.presence.connections_for(callee_id);
        if callee_conns.is_empty() {
            return Err(RelayError::RecipientUnavailable(callee_id.to_string()));
        }

        let call_id = Uuid::new_v4().to_string();
        {
            let mut table = self.table();
            if table.by_identity.contains_key(&caller.identity) {
                return Err(RelayError::Busy("already in a call".to_string()));
            }
            if table.by_identity.contains_key(callee_id) {
                return Err(RelayError::CalleeBusy(callee_id.to_string()));
            }

            for handle in &callee_conns {
                handle.deliver(ServerEvent::IncomingCall {
                    call_id: call_id.clone(),
                    caller_id: caller.identity.clone(),
                    offer: offer.clone(),
                    kind,
                });
            }
            caller.deliver(ServerEvent::CallRinging {
                call_id: call_id.clone(),
                callee_id: callee_id.to_string(),
                kind,
            });

            let coordinator = Arc::clone(self);
            let timer_call_id = call_id.clone();
            let timeout = self.ring_timeout;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                coordinator.expire_ring(&timer_call_id);
            });

            table.sessions.insert(
                call_id.clone(),
                CallSession {
                    caller: caller.clone(),
                    callee_id: callee_id.to_string(),
                    callee: None,
                    rung: callee_conns.clone(),
                    kind,
                    phase: Phase::Ringing,
                    pending_ice: VecDeque::new(),
                    ring_timer: Some(timer.abort_handle()),
                },
            );
            table
                .by_identity
                .insert(caller.identity.clone(), call_id.clone());
            table
                .by_identity
                .insert(callee_id.to_string(), call_id.clone());
        }
        tracing::info!(call_id = %call_id, caller = %caller.identity, callee = callee_id, ?kind, rung = callee_conns.len(), "call ringing");

        // A party may have disconnected between the presence lookup and insertion.
        if self.presence.handle(caller.id).is_none() {
            self.on_connection_closed(caller.id);
        }
        for handle in &callee_conns {
            if self.presence.handle(handle.id).is_none() {
                self.on_connection_closed(handle.id);
            }
        }
        Ok(call_id)
    }

    pub fn accept(
        &self,
        conn: &ConnHandle,
        call_id: &str,
        answer: SessionDescription,
    ) -> Result<(), RelayError> {
        let mut table = self.table();
        let Some(session) = table.sessions.get_mut(call_id) else {
            return Ok(());
        };
        ensure_party(session, conn)?;
        if conn.identity != session.callee_id || session.phase != Phase::Ringing {
            return Ok(());
        }

        if let Some(timer) = session.ring_timer.take() {
            timer.abort();
        }
        session.callee = Some(conn.clone());
        session.phase = Phase::Connecting;
        session.caller.deliver(ServerEvent::CallAccepted {
            call_id: call_id.to_string(),
            answer,
        });
        session.notify_rung_except(
            conn.id,
            &ServerEvent::CallHandledElsewhere {
                call_id: call_id.to_string(),
            },
        );

        let pending = std::mem::take(&mut session.pending_ice);
        let flushed = pending.len();
        for ice in pending {
            if let Some(target) = session.counterpart(ice.from_conn) {
                target.deliver(ServerEvent::IceCandidate {
                    call_id: call_id.to_string(),
                    from_id: ice.from_id,
                    candidate: ice.candidate,
                });
            }
        }
        tracing::info!(call_id, conn = conn.id, flushed, "call accepted");
        Ok(())
    }

    pub fn reject(&self, conn: &ConnHandle, call_id: &str) -> Result<(), RelayError> {
        let mut table = self.table();
        let Some(session) = table.sessions.get(call_id) else {
            return Ok(());
        };
        ensure_party(session, conn)?;
        if conn.identity != session.callee_id || session.phase != Phase::Ringing {
            return Ok(());
        }
        session.caller.deliver(ServerEvent::CallRejected {
            call_id: call_id.to_string(),
        });
        session.notify_rung_except(
            conn.id,
            &ServerEvent::CallHandledElsewhere {
                call_id: call_id.to_string(),
            },
        );
        table.finish(call_id, CallState::Rejected, None);
        Ok(())
    }

    pub fn relay_ice(
        &self,
        conn: &ConnHandle,
        call_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), RelayError> {
        let mut table = self.table();
        let Some(session) = table.sessions.get_mut(call_id) else {
            return Ok(());
        };
        ensure_party(session, conn)?;
        match session.phase {
            Phase::Ringing => {
                if session.pending_ice.len() >= self.max_pending_ice {
                    return Err(RelayError::InvalidRequest(format!(
                        "more than {} ICE candidates queued for call {call_id}",
                        self.max_pending_ice
                    )));
                }
                session.pending_ice.push_back(PendingIce {
                    from_conn: conn.id,
                    from_id: conn.identity.clone(),
                    candidate,
                });
            }
            Phase::Connecting | Phase::Active => {
                if let Some(target) = session.counterpart(conn.id) {
                    target.deliver(ServerEvent::IceCandidate {
                        call_id: call_id.to_string(),
                        from_id: conn.identity.clone(),
                        candidate,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn mark_connected(&self, conn: &ConnHandle, call_id: &str) -> Result<(), RelayError> {
        let mut table = self.table();
        let Some(session) = table.sessions.get_mut(call_id) else {
            return Ok(());
        };
        ensure_party(session, conn)?;
        if session.phase != Phase::Connecting {
            return Ok(());
        }
        let Some(other) = session.counterpart(conn.id).cloned() else {
            return Ok(());
        };
        session.phase = Phase::Active;
        other.deliver(ServerEvent::CallActive {
            call_id: call_id.to_string(),
        });
        tracing::info!(call_id, conn = conn.id, "call active");
        Ok(())
    }

    pub fn end_call(&self, conn: &ConnHandle, call_id: &str) -> Result<(), RelayError> {
        let mut table = self.table();
        let Some(session) = table.sessions.get(call_id) else {
            return Ok(());
        };
        ensure_party(session, conn)?;
        let ended = ServerEvent::CallEnded {
            call_id: call_id.to_string(),
            reason: CallEndReason::Hangup,
        };
        if conn.identity == session.caller.identity {
            match &session.callee {
                Some(callee) => {
                    callee.deliver(ended);
                }
                None => session.notify_rung_except(conn.id, &ended),
            }
        } else {
            session.caller.deliver(ended.clone());
            if session.phase == Phase::Ringing {
                session.notify_rung_except(conn.id, &ended);
            }
        }
        table.finish(call_id, CallState::Ended, Some(CallEndReason::Hangup));
        Ok(())
    }

    /// Ring timer fired.
    pub fn expire_ring(&self, call_id: &str) {
        let mut table = self.table();
        let Some(session) = table.sessions.get_mut(call_id) else {
            return;
        };
        if session.phase != Phase::Ringing {
            return;
        }
        session.ring_timer = None;
        session.caller.deliver(ServerEvent::CallFailed {
            call_id: Some(call_id.to_string()),
            peer_id: session.callee_id.clone(),
            reason: CallFailureReason::NoAnswer,
        });
        session.notify_rung_except(
            session.caller.id,
            &ServerEvent::CallEnded {
                call_id: call_id.to_string(),
                reason: CallEndReason::NoAnswer,
            },
        );
        table.finish(call_id, CallState::Failed, Some(CallEndReason::NoAnswer));
    }

    /// End or shrink every session `conn` takes part in.
    pub fn on_connection_closed(&self, conn: ConnectionId) {
        let mut table = self.table();
        let affected: Vec<CallId> = table
            .sessions
            .iter()
            .filter(|(_, s)| {
                s.caller.id == conn
                    || s.callee.as_ref().is_some_and(|c| c.id == conn)
                    || s.rung.iter().any(|h| h.id == conn)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for call_id in affected {
            let Some(session) = table.sessions.get_mut(&call_id) else {
                continue;
            };
            let ended = ServerEvent::CallEnded {
                call_id: call_id.clone(),
                reason: CallEndReason::PeerDisconnected,
            };
            if session.caller.id == conn {
                match &session.callee {
                    Some(callee) => {
                        callee.deliver(ended);
                    }
                    None => session.notify_rung_except(conn, &ended),
                }
            } else if session.callee.as_ref().is_some_and(|c| c.id == conn) {
                session.caller.deliver(ended);
            } else {
                session.rung.retain(|h| h.id != conn);
                if session.phase != Phase::Ringing || !session.rung.is_empty() {
                    continue;
                }
                session.caller.deliver(ended);
            }
            table.finish(
                &call_id,
                CallState::Ended,
                Some(CallEndReason::PeerDisconnected),
            );
        }
    }

    /// How `identity` sees the call right now.
    pub fn state_of(&self, call_id: &str, identity: &str) -> CallState {
        let table = self.table();
        if let Some(session) = table.sessions.get(call_id) {
            if !session.is_party(identity) {
                return CallState::Idle;
            }
            return match session.phase {
                Phase::Ringing if session.caller.identity == identity => {
                    CallState::OutgoingRinging
                }
                Phase::Ringing => CallState::IncomingRinging,
                Phase::Connecting => CallState::Connecting,
                Phase::Active => CallState::Active,
            };
        }
        table
            .finished
            .iter()
            .rev()
            .find(|(id, o)| id == call_id && (o.caller_id == identity || o.callee_id == identity))
            .map(|(_, o)| o.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn outcome(&self, call_id: &str) -> Option<CallOutcome> {
        self.table()
            .finished
            .iter()
            .rev()
            .find(|(id, _)| id == call_id)
            .map(|(_, o)| o.clone())
    }

    /// Call the identity currently takes part in.
    pub fn call_of(&self, identity: &str) -> Option<CallId> {
        self.table().by_identity.get(identity).cloned()
    }

    pub fn kind_of(&self, call_id: &str) -> Option<CallKind> {
        self.table().sessions.get(call_id).map(|s| s.kind)
    }

    pub fn active_count(&self) -> usize {
        self.table().sessions.len()
    }
}

fn ensure_party(session: &CallSession, conn: &ConnHandle) -> Result<(), RelayError> {
    if session.is_party(&conn.identity) {
        Ok(())
    } else {
        Err(RelayError::Forbidden("not a party to this call".to_string()))
    }
}
