//! The coordinator task.
//!
//! One tokio task owns the [`Coordinator`]; connection tasks talk to it
//! over a bounded command channel. Outbound envelopes go to per-connection
//! unbounded channels drained by each connection's writer.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use vigil_server::{Coordinator, Outbound};
use vigil_session::{ConnectionId, Millis};
use vigil_store::Durability;
use vigil_wire::{ClientEnvelope, ServerEnvelope};

/// Global tick period.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

const COMMAND_CAPACITY: usize = 1024;

pub type Outbox = mpsc::UnboundedSender<ServerEnvelope>;

enum Command {
    Connect {
        outbox: Outbox,
        reply: oneshot::Sender<ConnectionId>,
    },
    Inbound {
        conn: ConnectionId,
        envelope: ClientEnvelope,
    },
    Disconnect {
        conn: ConnectionId,
    },
    Shutdown {
        reply: oneshot::Sender<Durability>,
    },
}

/// Cloneable handle to the coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// Register a new connection; `None` once the task has stopped.
    pub async fn connect(&self, outbox: Outbox) -> Option<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Connect { outbox, reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn inbound(&self, conn: ConnectionId, envelope: ClientEnvelope) {
        if self
            .tx
            .send(Command::Inbound { conn, envelope })
            .await
            .is_err()
        {
            debug!(conn, "coordinator stopped, inbound message dropped");
        }
    }

    pub async fn disconnect(&self, conn: ConnectionId) {
        let _ = self.tx.send(Command::Disconnect { conn }).await;
    }

    /// Stop the task after a final store flush.
    pub async fn shutdown(&self) -> Option<Durability> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Shutdown { reply }).await.ok()?;
        rx.await.ok()
    }
}

fn now_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Millis)
}

/// Spawn the coordinator task. The join handle yields the coordinator
/// back once the task stops.
pub fn spawn(coordinator: Coordinator, tick: Duration) -> (CoordinatorHandle, JoinHandle<Coordinator>) {
    let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
    let task = tokio::spawn(run(coordinator, rx, tick));
    (CoordinatorHandle { tx }, task)
}

async fn run(
    mut coordinator: Coordinator,
    mut rx: mpsc::Receiver<Command>,
    tick: Duration,
) -> Coordinator {
    let mut outboxes: BTreeMap<ConnectionId, Outbox> = BTreeMap::new();
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Connect { outbox, reply }) => {
                    let conn = coordinator.connect();
                    outboxes.insert(conn, outbox);
                    if reply.send(conn).is_err() {
                        // Caller went away before learning its id.
                        outboxes.remove(&conn);
                        dispatch(&outboxes, coordinator.disconnect(conn, now_millis()));
                    }
                }
                Some(Command::Inbound { conn, envelope }) => {
                    let handled = coordinator.handle(conn, envelope, now_millis());
                    dispatch(&outboxes, handled.outbound);
                }
                Some(Command::Disconnect { conn }) => {
                    outboxes.remove(&conn);
                    dispatch(&outboxes, coordinator.disconnect(conn, now_millis()));
                }
                Some(Command::Shutdown { reply }) => {
                    let _ = reply.send(coordinator.shutdown());
                    break;
                }
                None => {
                    coordinator.shutdown();
                    break;
                }
            },
            _ = ticker.tick() => {
                dispatch(&outboxes, coordinator.tick(now_millis()));
            }
        }
    }

    info!(connections = outboxes.len(), "coordinator task stopped");
    coordinator
}

fn dispatch(outboxes: &BTreeMap<ConnectionId, Outbox>, outbound: Vec<Outbound>) {
    for Outbound { to, envelope } in outbound {
        match outboxes.get(&to) {
            Some(outbox) if outbox.send(envelope).is_ok() => {}
            _ => debug!(conn = to, "no writer for outbound envelope"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_server::ServerConfig;
    use vigil_server::gate::SharedSecretGate;
    use vigil_session::{Language, Profile, Session};
    use vigil_store::SessionStore;
    use vigil_wire::client_envelope::Body as ClientBody;
    use vigil_wire::server_envelope::Body as ServerBody;
    use vigil_wire::{AdminBroadcast, AdminLogin, RegisterProto};

    fn coordinator(store: SessionStore) -> Coordinator {
        Coordinator::new(
            ServerConfig::default(),
            store,
            Box::new(SharedSecretGate::new("secret")),
        )
    }

    fn register(identity: &str) -> ClientEnvelope {
        let session = Session::new(identity, Profile::default(), Language::C);
        ClientBody::Register(RegisterProto {
            snapshot: Some((&session).into()),
            base_revision: 0,
            seq: 0,
            epoch: 0,
        })
        .into()
    }

    #[tokio::test]
    async fn test_register_round_trip_through_task() {
        let (handle, task) = spawn(coordinator(SessionStore::in_memory()), TICK_INTERVAL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = handle.connect(tx).await.unwrap();

        handle.inbound(conn, register("R1")).await;
        let reply = rx.recv().await.unwrap();
        match reply.body {
            Some(ServerBody::SessionState(state)) => {
                assert_eq!(state.session.unwrap().identity, "R1");
            }
            other => panic!("unexpected {other:?}"),
        }

        handle.disconnect(conn).await;
        assert!(handle.shutdown().await.unwrap().is_healthy());
        let coordinator = task.await.unwrap();
        assert!(coordinator.session("R1").is_some());
    }

    #[tokio::test]
    async fn test_broadcast_fans_out_to_writers() {
        let (handle, task) = spawn(coordinator(SessionStore::in_memory()), TICK_INTERVAL);

        let (admin_tx, mut admin_rx) = mpsc::unbounded_channel();
        let admin = handle.connect(admin_tx).await.unwrap();
        handle
            .inbound(
                admin,
                ClientBody::AdminLogin(AdminLogin {
                    credential: "secret".into(),
                })
                .into(),
            )
            .await;
        assert!(matches!(
            admin_rx.recv().await.unwrap().body,
            Some(ServerBody::AdminLoginResult(result)) if result.granted
        ));

        let mut candidates = Vec::new();
        for identity in ["R1", "R2"] {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let conn = handle.connect(tx).await.unwrap();
            handle.inbound(conn, register(identity)).await;
            assert!(rx.recv().await.is_some());
            candidates.push(rx);
        }

        handle
            .inbound(
                admin,
                ClientBody::AdminBroadcast(AdminBroadcast {
                    message: "pencils down".into(),
                })
                .into(),
            )
            .await;
        for rx in &mut candidates {
            loop {
                let envelope = rx.recv().await.unwrap();
                if let Some(ServerBody::Broadcast(broadcast)) = envelope.body {
                    assert_eq!(broadcast.message, "pencils down");
                    break;
                }
            }
        }

        handle.shutdown().await;
        task.await.unwrap();
    }

    /// Sessions written through the task survive a restart on redb.
    #[tokio::test]
    async fn test_sessions_persist_across_restart() {
        let dir = tempfile::tempdir().unwrap();

        let store = SessionStore::open_dir(dir.path()).unwrap();
        let (handle, task) = spawn(coordinator(store), TICK_INTERVAL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = handle.connect(tx).await.unwrap();
        handle.inbound(conn, register("R42")).await;
        rx.recv().await.unwrap();
        handle.shutdown().await;
        drop(task.await.unwrap());

        let store = SessionStore::open_dir(dir.path()).unwrap();
        assert!(store.get("R42").is_some());
    }
}
