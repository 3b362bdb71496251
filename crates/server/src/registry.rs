//! Connection Registry.
//!
//! In-memory index from transient connection ids to candidate identities,
//! plus the single admin slot. Never authoritative for session content and
//! rebuilt purely from client registrations after a restart.

use std::collections::BTreeMap;

use vigil_session::{ConnectionId, Identity};
use vigil_wire::Seq;

/// Outcome of binding a connection to an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// First connection for this identity.
    New,
    /// Same connection registering again (heartbeat).
    Unchanged,
    /// A newer connection took over from `previous`.
    Superseded { previous: ConnectionId },
    /// A newer connection already owns the identity; nothing was bound.
    Stale { current: ConnectionId },
}

impl Binding {
    pub fn is_bound(&self) -> bool {
        !matches!(self, Self::Stale { .. })
    }
}

/// What a closed connection held.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Closed {
    /// Identity whose current connection this was.
    pub identity: Option<Identity>,
    pub was_admin: bool,
}

#[derive(Debug, Clone, Default)]
struct ConnState {
    identity: Option<Identity>,
    acked_seq: Seq,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: ConnectionId,
    connections: BTreeMap<ConnectionId, ConnState>,
    by_identity: BTreeMap<Identity, ConnectionId>,
    admin: Option<ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a transport connection; ids are strictly increasing.
    pub fn open(&mut self) -> ConnectionId {
        self.next_id += 1;
        let id = self.next_id;
        self.connections.insert(id, ConnState::default());
        id
    }

    pub fn is_open(&self, conn: ConnectionId) -> bool {
        self.connections.contains_key(&conn)
    }

    /// Retire a connection and whatever it held.
    pub fn close(&mut self, conn: ConnectionId) -> Closed {
        let mut closed = Closed::default();
        if let Some(state) = self.connections.remove(&conn)
            && let Some(identity) = state.identity
            && self.by_identity.get(&identity) == Some(&conn)
        {
            self.by_identity.remove(&identity);
            closed.identity = Some(identity);
        }
        if self.admin == Some(conn) {
            self.admin = None;
            closed.was_admin = true;
        }
        closed
    }

    /// Bind `conn` to `identity` unless a newer connection owns it.
    pub fn bind(&mut self, conn: ConnectionId, identity: &str) -> Binding {
        let binding = match self.by_identity.get(identity).copied() {
            Some(current) if current == conn => return Binding::Unchanged,
            Some(current) if current > conn => return Binding::Stale { current },
            Some(previous) => {
                if let Some(state) = self.connections.get_mut(&previous) {
                    state.identity = None;
                }
                Binding::Superseded { previous }
            }
            None => Binding::New,
        };

        // A connection serves one identity at a time.
        if let Some(state) = self.connections.get_mut(&conn) {
            if let Some(old) = state.identity.replace(identity.to_string())
                && self.by_identity.get(&old) == Some(&conn)
            {
                self.by_identity.remove(&old);
            }
        }
        self.by_identity.insert(identity.to_string(), conn);
        binding
    }

    /// Drop `conn`'s binding, keeping the connection open.
    pub fn unbind(&mut self, conn: ConnectionId) {
        if let Some(state) = self.connections.get_mut(&conn)
            && let Some(identity) = state.identity.take()
            && self.by_identity.get(&identity) == Some(&conn)
        {
            self.by_identity.remove(&identity);
        }
    }

    /// Drop every identity binding (full reset).
    pub fn unbind_all(&mut self) {
        for state in self.connections.values_mut() {
            state.identity = None;
            state.acked_seq = 0;
        }
        self.by_identity.clear();
    }

    pub fn identity_of(&self, conn: ConnectionId) -> Option<&Identity> {
        self.connections.get(&conn)?.identity.as_ref()
    }

    pub fn connection_of(&self, identity: &str) -> Option<ConnectionId> {
        self.by_identity.get(identity).copied()
    }

    pub fn acked_seq(&self, conn: ConnectionId) -> Seq {
        self.connections.get(&conn).map_or(0, |s| s.acked_seq)
    }

    /// Record an applied update seq; false if it is not newer.
    pub fn advance_seq(&mut self, conn: ConnectionId, seq: Seq) -> bool {
        match self.connections.get_mut(&conn) {
            Some(state) if seq > state.acked_seq => {
                state.acked_seq = seq;
                true
            }
            _ => false,
        }
    }

    /// Occupy the admin slot; returns the displaced holder.
    pub fn set_admin(&mut self, conn: ConnectionId) -> Option<ConnectionId> {
        self.admin.replace(conn).filter(|previous| *previous != conn)
    }

    pub fn admin(&self) -> Option<ConnectionId> {
        self.admin
    }

    pub fn is_admin(&self, conn: ConnectionId) -> bool {
        self.admin == Some(conn)
    }

    /// Connections currently bound to a candidate identity.
    pub fn candidate_connections(&self) -> Vec<ConnectionId> {
        self.by_identity
            .values()
            .copied()
            .filter(|conn| !self.is_admin(*conn))
            .collect()
    }

    /// Every open connection.
    pub fn all_connections(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }
}
