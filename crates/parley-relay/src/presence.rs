use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_protocol::{ConnectionId, Identity, ServerEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::auth::AuthError;
use crate::error::RelayError;

/// Sending half of one admitted connection.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    pub id: ConnectionId,
    pub identity: Identity,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnHandle {
    pub fn new(id: ConnectionId, identity: Identity, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self { id, identity, tx }
    }

    /// Queue an event without waiting. A full queue drops the event so one
    /// slow client cannot stall fan-out to everyone else.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(conn = self.id, identity = %self.identity, "outbound queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The identity just came online.
    FirstConnection,
    AdditionalConnection,
    /// This connection was already admitted as the same identity.
    AlreadyAdmitted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub identity: Identity,
    /// The identity has no connections left and is now offline.
    pub last_connection: bool,
}

/// Identity -> live connections.
///
/// An identity is online iff it has at least one connection. The per-identity
/// entry lock makes the first/last connection decision atomic with the
/// insert or removal that caused it.
pub struct PresenceRegistry {
    identities: DashMap<Identity, HashMap<ConnectionId, ConnHandle>>,
    owners: DashMap<ConnectionId, Identity>,
    live: AtomicUsize,
    max_connections: usize,
}

impl PresenceRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            identities: DashMap::new(),
            owners: DashMap::new(),
            live: AtomicUsize::new(0),
            max_connections,
        }
    }

    pub fn admit(&self, handle: ConnHandle) -> Result<Admission, RelayError> {
        if handle.identity.is_empty() {
            return Err(RelayError::Unauthenticated(AuthError::Missing));
        }
        if let Some(owner) = self.owners.get(&handle.id).map(|o| o.clone()) {
            return if owner == handle.identity {
                Ok(Admission::AlreadyAdmitted)
            } else {
                Err(RelayError::AlreadyAdmitted(owner))
            };
        }
        if self.live.fetch_add(1, Ordering::SeqCst) >= self.max_connections {
            self.live.fetch_sub(1, Ordering::SeqCst);
            return Err(RelayError::AtCapacity);
        }
        match self.owners.entry(handle.id) {
            Entry::Occupied(o) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return if *o.get() == handle.identity {
                    Ok(Admission::AlreadyAdmitted)
                } else {
                    Err(RelayError::AlreadyAdmitted(o.get().clone()))
                };
            }
            Entry::Vacant(v) => {
                v.insert(handle.identity.clone());
            }
        }

        let mut conns = self.identities.entry(handle.identity.clone()).or_default();
        let first = conns.is_empty();
        tracing::debug!(conn = handle.id, identity = %handle.identity, first, "connection admitted");
        conns.insert(handle.id, handle);
        Ok(if first {
            Admission::FirstConnection
        } else {
            Admission::AdditionalConnection
        })
    }

    pub fn remove(&self, conn: ConnectionId) -> Option<Removal> {
        let (_, identity) = self.owners.remove(&conn)?;
        self.live.fetch_sub(1, Ordering::SeqCst);
        let last_connection = match self.identities.entry(identity.clone()) {
            Entry::Occupied(mut o) => {
                o.get_mut().remove(&conn);
                if o.get().is_empty() {
                    o.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => true,
        };
        tracing::debug!(conn, identity = %identity, last_connection, "connection removed");
        Some(Removal {
            identity,
            last_connection,
        })
    }

    /// Live connections of `identity`, ordered by connection id.
    pub fn connections_for(&self, identity: &str) -> Vec<ConnHandle> {
        let mut handles: Vec<ConnHandle> = self
            .identities
            .get(identity)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default();
        handles.sort_by_key(|h| h.id);
        handles
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.identities
            .get(identity)
            .is_some_and(|conns| !conns.is_empty())
    }

    /// Online identities, sorted.
    pub fn snapshot(&self) -> Vec<Identity> {
        let mut online: Vec<Identity> = self.identities.iter().map(|e| e.key().clone()).collect();
        online.sort();
        online
    }

    pub fn identity_of(&self, conn: ConnectionId) -> Option<Identity> {
        self.owners.get(&conn).map(|o| o.clone())
    }

    pub fn handle(&self, conn: ConnectionId) -> Option<ConnHandle> {
        let identity = self.identity_of(conn)?;
        self.identities
            .get(&identity)
            .and_then(|conns| conns.get(&conn).cloned())
    }

    pub fn all_connections(&self) -> Vec<ConnHandle> {
        let mut handles: Vec<ConnHandle> = self
            .identities
            .iter()
            .flat_map(|e| e.value().values().cloned().collect::<Vec<_>>())
            .collect();
        handles.sort_by_key(|h| h.id);
        handles
    }

    pub fn connection_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn online_count(&self) -> usize {
        self.identities.len()
    }
}
