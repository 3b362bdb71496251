//! In-process harness wiring candidate clients and an admin to one
//! coordinator without a network.

#![allow(dead_code)]

use std::collections::BTreeMap;

use vigil_client::{ClientConfig, Event, SessionClient};
use vigil_server::gate::SharedSecretGate;
use vigil_server::validation::Disposition;
use vigil_server::{Coordinator, Outbound, ServerConfig};
use vigil_session::{ConnectionId, Language, Millis, Profile, RoundSchedule, Session};
use vigil_store::SessionStore;
use vigil_wire::client_envelope::Body as ClientBody;
use vigil_wire::{AdminLogin, ServerEnvelope};

pub const T0: Millis = 1_700_000_000_000;
pub const SECRET: &str = "proctor";
pub const ROUND_SECS: i64 = 1200;

pub fn schedule() -> RoundSchedule {
    RoundSchedule::new(vec![ROUND_SECS; 3]).unwrap()
}

pub fn new_client() -> SessionClient {
    SessionClient::new(ClientConfig::default(), schedule())
}

fn coordinator(store: SessionStore) -> Coordinator {
    let config = ServerConfig {
        schedule: schedule(),
        ..Default::default()
    };
    Coordinator::new(config, store, Box::new(SharedSecretGate::new(SECRET)))
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub now: Millis,
    clients: BTreeMap<ConnectionId, SessionClient>,
    pub admin: Option<ConnectionId>,
    pub admin_inbox: Vec<ServerEnvelope>,
    pub events: Vec<(ConnectionId, Event)>,
    pub dispositions: Vec<(ConnectionId, Disposition)>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(SessionStore::in_memory())
    }

    pub fn with_store(store: SessionStore) -> Self {
        Self {
            coordinator: coordinator(store),
            now: T0,
            clients: BTreeMap::new(),
            admin: None,
            admin_inbox: Vec::new(),
            events: Vec::new(),
            dispositions: Vec::new(),
        }
    }

    /// Swap in a fresh coordinator over `store`. Each client gets a new
    /// transport-level connection but is not told about it, so it keeps
    /// sending on what it believes is its old session. Returns old to new
    /// connection ids.
    pub fn restart(&mut self, store: SessionStore) -> BTreeMap<ConnectionId, ConnectionId> {
        self.coordinator = coordinator(store);
        self.admin = None;
        let mut moved = BTreeMap::new();
        for (old, client) in std::mem::take(&mut self.clients) {
            let conn = self.coordinator.connect();
            moved.insert(old, conn);
            self.clients.insert(conn, client);
        }
        moved
    }

    /// Connect `client` and run the protocol until quiet.
    pub fn join(&mut self, mut client: SessionClient) -> ConnectionId {
        let conn = self.coordinator.connect();
        client.on_connect(self.now);
        self.clients.insert(conn, client);
        self.pump();
        conn
    }

    /// Register a fresh candidate on a new connection.
    pub fn candidate(&mut self, identity: &str) -> ConnectionId {
        let mut client = new_client();
        client.register(identity, Profile::default(), Language::Python, self.now);
        self.join(client)
    }

    pub fn client(&self, conn: ConnectionId) -> &SessionClient {
        &self.clients[&conn]
    }

    /// Stored record for `identity`.
    pub fn stored(&self, identity: &str) -> Session {
        self.coordinator.session(identity).unwrap().clone()
    }

    /// Act on one client, then deliver whatever it queued.
    pub fn with_client<R>(
        &mut self,
        conn: ConnectionId,
        act: impl FnOnce(&mut SessionClient, Millis) -> R,
    ) -> R {
        let now = self.now;
        let result = act(self.clients.get_mut(&conn).unwrap(), now);
        self.pump();
        result
    }

    pub fn leave(&mut self, conn: ConnectionId) -> SessionClient {
        let mut client = self.clients.remove(&conn).unwrap();
        client.on_disconnect();
        let out = self.coordinator.disconnect(conn, self.now);
        self.deliver(out);
        client
    }

    pub fn login(&mut self) -> ConnectionId {
        let conn = self.coordinator.connect();
        self.admin = Some(conn);
        let disposition = self.send_as(
            conn,
            ClientBody::AdminLogin(AdminLogin {
                credential: SECRET.into(),
            }),
        );
        assert_eq!(disposition, Disposition::Answered);
        conn
    }

    pub fn admin_send(&mut self, body: ClientBody) -> Disposition {
        let admin = self.admin.unwrap();
        self.send_as(admin, body)
    }

    pub fn send_as(&mut self, conn: ConnectionId, body: ClientBody) -> Disposition {
        let handled = self.coordinator.handle(conn, body.into(), self.now);
        self.dispositions.push((conn, handled.disposition.clone()));
        self.deliver(handled.outbound);
        self.pump();
        handled.disposition
    }

    /// Move the clock, run the global tick, and poll every client.
    pub fn advance(&mut self, ms: u64) {
        self.now += ms;
        let out = self.coordinator.tick(self.now);
        self.deliver(out);
        let now = self.now;
        for client in self.clients.values_mut() {
            client.poll(now);
        }
        self.pump();
    }

    pub fn pump(&mut self) {
        loop {
            let mut queued = Vec::new();
            for (conn, client) in &mut self.clients {
                for envelope in client.take_outbox() {
                    queued.push((*conn, envelope));
                }
            }
            if queued.is_empty() {
                break;
            }
            for (conn, envelope) in queued {
                let handled = self.coordinator.handle(conn, envelope, self.now);
                self.dispositions.push((conn, handled.disposition));
                self.deliver(handled.outbound);
            }
        }
    }

    fn deliver(&mut self, outbound: Vec<Outbound>) {
        for Outbound { to, envelope } in outbound {
            if Some(to) == self.admin {
                self.admin_inbox.push(envelope);
            } else if let Some(client) = self.clients.get_mut(&to) {
                let event = client.handle(envelope, self.now);
                self.events.push((to, event));
            }
        }
    }

    pub fn saw(&self, conn: ConnectionId, event: &Event) -> bool {
        self.events.iter().any(|(to, e)| *to == conn && e == event)
    }

    pub fn count(&self, conn: ConnectionId, disposition: &Disposition) -> usize {
        self.dispositions
            .iter()
            .filter(|(from, d)| *from == conn && d == disposition)
            .count()
    }
}
