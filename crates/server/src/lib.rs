//! Vigil Session Coordinator
//!
//! The coordinator mediates between candidate clients, the admin, and the
//! Session Store. It owns:
//! - The Connection Registry (connection ids, identity bindings, admin slot)
//! - The synchronization protocol (register, heartbeat, update, resync)
//! - The Admin Command Router (per-session commands and global commands)
//! - The global tick (round timers, liveness, store retry)
//!
//! # Architecture
//!
//! The coordinator is sans-I/O. The transport hands it decoded envelopes
//! together with the connection they arrived on and the current time; it
//! returns the envelopes to send and to whom. Session content is changed
//! only by submitting intents to the session reducer and committing the
//! result to the store.
//!
//! # Reconciliation
//!
//! A register whose `base_revision` is behind the stored revision is stale:
//! it is not merged, and the client receives the authoritative session
//! with `resync` set. Everything else a client proposes is translated into
//! candidate intents, so a client can never undo an admin action.

#![deny(unsafe_code)]

pub mod admin;
pub mod gate;
pub mod registry;
pub mod validation;

use std::collections::BTreeMap;

use tracing::{debug, info, warn};
use vigil_session::{
    ConnectionId, ContestConfig, Context, Identity, Intent, LifecycleState, MAX_STRIKES, Millis,
    Reduction, RoundSchedule, Session, admit, candidate_intents, reduce, reduce_all,
};
use vigil_store::{Durability, SessionStore};
use vigil_wire::client_envelope::Body as ClientBody;
use vigil_wire::server_envelope::Body as ServerBody;
use vigil_wire::{
    AdminCommandProto, AdminLogin, AdminLoginResult, AdminSessionView, AdminSetStatus,
    AllSessions, BroadcastProto, ClientEnvelope, CommandReceived, CommandRejected, RegisterProto,
    ResetProto, ServerEnvelope, SessionUpdate, UpdateProto, global_status_from_i32,
};

use admin::{CommandError, command_intents, resolve_target};
use gate::AdminGate;
use registry::{Binding, ConnectionRegistry};
use validation::{Disposition, validate_register, validate_update};

// ============================================================================
// Configuration
// ============================================================================

/// Liveness grace window in milliseconds.
pub const HEARTBEAT_GRACE_MS: u64 = 15_000;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub schedule: RoundSchedule,
    pub max_strikes: u32,
    /// A candidate silent for longer than this shows as offline.
    pub heartbeat_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            schedule: RoundSchedule::default(),
            max_strikes: MAX_STRIKES,
            heartbeat_grace_ms: HEARTBEAT_GRACE_MS,
        }
    }
}

// ============================================================================
// Output
// ============================================================================

/// One envelope addressed to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: ConnectionId,
    pub envelope: ServerEnvelope,
}

impl Outbound {
    fn new(to: ConnectionId, body: ServerBody) -> Self {
        Self {
            to,
            envelope: body.into(),
        }
    }
}

/// Result of handling one inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Handled {
    pub disposition: Disposition,
    pub outbound: Vec<Outbound>,
}

impl Handled {
    fn new(disposition: Disposition, outbound: Vec<Outbound>) -> Self {
        Self {
            disposition,
            outbound,
        }
    }

    fn dropped(disposition: Disposition) -> Self {
        Self::new(disposition, Vec::new())
    }
}

fn context<'a>(
    schedule: &'a RoundSchedule,
    config: &ServerConfig,
    contest: &ContestConfig,
    now: Millis,
) -> Context<'a> {
    Context {
        now,
        schedule,
        max_strikes: config.max_strikes,
        timers_running: contest.timers_running(),
    }
}

fn body_kind(body: &ClientBody) -> &'static str {
    match body {
        ClientBody::Register(_) => "register",
        ClientBody::Heartbeat(_) => "heartbeat",
        ClientBody::Update(_) => "update",
        ClientBody::StatusRequest(_) => "status_request",
        ClientBody::AdminLogin(_) => "admin_login",
        ClientBody::AdminCommand(_) => "admin_command",
        ClientBody::AdminSetStatus(_) => "admin_set_status",
        ClientBody::AdminBroadcast(_) => "admin_broadcast",
        ClientBody::AdminRefresh(_) => "admin_refresh",
        ClientBody::AdminReset(_) => "admin_reset",
    }
}

fn is_online(session: &Session, now: Millis, grace_ms: u64) -> bool {
    session.last_seen_at > 0 && now.saturating_sub(session.last_seen_at) <= grace_ms
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct Coordinator {
    config: ServerConfig,
    /// Configured schedule with persisted round overrides applied.
    schedule: RoundSchedule,
    store: SessionStore,
    registry: ConnectionRegistry,
    gate: Box<dyn AdminGate>,
    /// Last liveness reported to the admin, per identity.
    online: BTreeMap<Identity, bool>,
}

impl Coordinator {
    pub fn new(config: ServerConfig, store: SessionStore, gate: Box<dyn AdminGate>) -> Self {
        let schedule = store
            .config()
            .round_overrides_secs
            .iter()
            .fold(config.schedule.clone(), |schedule, (round, secs)| {
                schedule.with_override(*round, *secs)
            });
        info!(
            rounds = schedule.max_round(),
            sessions = store.len(),
            "coordinator ready"
        );
        Self {
            config,
            schedule,
            store,
            registry: ConnectionRegistry::new(),
            gate,
            online: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn schedule(&self) -> &RoundSchedule {
        &self.schedule
    }

    pub fn session(&self, identity: &str) -> Option<&Session> {
        self.store.get(identity)
    }

    pub fn contest(&self) -> &ContestConfig {
        self.store.config()
    }

    pub fn durability(&self) -> Durability {
        self.store.durability()
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    /// Accept a new transport connection.
    pub fn connect(&mut self) -> ConnectionId {
        let conn = self.registry.open();
        debug!(conn, "connection opened");
        conn
    }

    /// Retire a connection. Pending session state is untouched.
    pub fn disconnect(&mut self, conn: ConnectionId, now: Millis) -> Vec<Outbound> {
        let closed = self.registry.close(conn);
        if closed.was_admin {
            info!(conn, "admin disconnected, slot released");
        }
        let mut out = Vec::new();
        if let Some(identity) = closed.identity {
            debug!(conn, identity = %identity, "candidate disconnected");
            out.extend(self.admin_update(&identity, now));
        }
        out
    }

    /// Final store flush before shutdown.
    pub fn shutdown(&mut self) -> Durability {
        let durability = self.store.flush();
        if !durability.is_healthy() {
            warn!(?durability, "shutting down with unwritten session changes");
        }
        durability
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Handle one decoded envelope from `conn`.
    pub fn handle(&mut self, conn: ConnectionId, envelope: ClientEnvelope, now: Millis) -> Handled {
        if !self.registry.is_open(conn) {
            return Handled::dropped(Disposition::DroppedUnknownConnection);
        }
        let Some(body) = envelope.body else {
            warn!(conn, "empty envelope dropped");
            return Handled::dropped(Disposition::DroppedEmpty);
        };

        let kind = body_kind(&body);
        let admin_only = !matches!(
            body,
            ClientBody::Register(_)
                | ClientBody::Heartbeat(_)
                | ClientBody::Update(_)
                | ClientBody::StatusRequest(_)
                | ClientBody::AdminLogin(_)
        );
        if admin_only && !self.registry.is_admin(conn) {
            warn!(conn, kind, "admin message without admin slot dropped");
            return Handled::dropped(Disposition::DroppedNotAdmin);
        }

        let handled = match body {
            ClientBody::Register(msg) => self.on_register(conn, msg, now, false),
            ClientBody::Heartbeat(msg) => self.on_register(conn, msg, now, true),
            ClientBody::Update(msg) => self.on_update(conn, msg, now),
            ClientBody::StatusRequest(_) => Handled::new(
                Disposition::Answered,
                vec![Outbound {
                    to: conn,
                    envelope: ServerEnvelope::contest_status(self.store.config()),
                }],
            ),
            ClientBody::AdminLogin(login) => self.on_admin_login(conn, login, now),
            ClientBody::AdminCommand(cmd) => self.on_admin_command(conn, cmd, now),
            ClientBody::AdminSetStatus(msg) => self.on_set_status(conn, msg, now),
            ClientBody::AdminBroadcast(msg) => {
                let recipients = self.registry.candidate_connections();
                info!(recipients = recipients.len(), "admin broadcast");
                let out = recipients
                    .into_iter()
                    .map(|to| {
                        Outbound::new(
                            to,
                            ServerBody::Broadcast(BroadcastProto {
                                message: msg.message.clone(),
                                sent_at: now,
                            }),
                        )
                    })
                    .collect();
                Handled::new(Disposition::Answered, out)
            }
            ClientBody::AdminRefresh(_) => {
                Handled::new(Disposition::Answered, self.admin_snapshot(conn, now))
            }
            ClientBody::AdminReset(_) => self.on_reset(conn, now),
        };

        match &handled.disposition {
            Disposition::DroppedStaleConnection => {
                info!(conn, kind, "write from superseded connection discarded");
            }
            Disposition::DroppedDuplicateSeq { seq, acked } => {
                debug!(conn, seq, acked, "duplicate update ignored");
            }
            d if d.is_dropped() => warn!(conn, kind, disposition = ?d, "message dropped"),
            _ => {}
        }
        handled
    }

    fn on_register(
        &mut self,
        conn: ConnectionId,
        msg: RegisterProto,
        now: Millis,
        heartbeat: bool,
    ) -> Handled {
        let reg = match validate_register(msg) {
            Ok(reg) => reg,
            Err(d) => return Handled::dropped(d),
        };
        let identity = reg.snapshot.identity.clone();
        let epoch = self.store.config().epoch;

        if reg.epoch != 0 && reg.epoch != epoch {
            self.registry.unbind(conn);
            info!(conn, identity = %identity, client_epoch = reg.epoch, epoch, "snapshot from a previous contest, resetting client");
            return Handled::new(
                Disposition::Answered,
                vec![Outbound::new(conn, ServerBody::Reset(ResetProto { epoch }))],
            );
        }

        let binding = self.registry.bind(conn, &identity);
        match binding {
            Binding::Stale { .. } => return Handled::dropped(Disposition::DroppedStaleConnection),
            Binding::Superseded { previous } => {
                info!(identity = %identity, previous, conn, "connection superseded");
            }
            Binding::New | Binding::Unchanged => {}
        }

        let ctx = context(&self.schedule, &self.config, self.store.config(), now);
        let disposition = match self.store.get(&identity) {
            None => {
                let session = admit(&reg.snapshot, &ctx);
                self.store.commit(session);
                info!(identity = %identity, conn, "session created");
                Disposition::Applied
            }
            Some(stored) if reg.base_revision < stored.revision => {
                debug!(
                    identity = %identity,
                    base = reg.base_revision,
                    revision = stored.revision,
                    "stale snapshot, sending resync"
                );
                Disposition::Resync
            }
            Some(stored) => {
                let stored = stored.clone();
                let plan = candidate_intents(&stored, &stored.diff(&reg.snapshot));
                for field in &plan.ignored {
                    debug!(identity = %identity, ?field, "candidate field ignored");
                }
                let batch = reduce_all(&stored, &plan.intents, &ctx);
                for (intent, rejection) in &batch.rejected {
                    debug!(identity = %identity, intent = intent.name(), %rejection, "intent rejected");
                }
                if batch.changed {
                    self.store.commit(batch.session);
                    Disposition::Applied
                } else {
                    Disposition::Unchanged
                }
            }
        };

        self.store.touch(&identity, conn, now);
        self.online.insert(identity.clone(), true);
        if disposition != Disposition::Resync {
            self.registry.advance_seq(conn, reg.seq);
        }

        let mut out = Vec::new();
        let Some(session) = self.store.get(&identity) else {
            return Handled::new(disposition, out);
        };
        let resync = disposition == Disposition::Resync;
        let reply = !heartbeat
            || disposition != Disposition::Unchanged
            || binding != Binding::Unchanged
            || reg.base_revision != session.revision;
        if reply {
            out.push(Outbound {
                to: conn,
                envelope: ServerEnvelope::session_state(
                    session,
                    self.registry.acked_seq(conn),
                    resync,
                ),
            });
        }
        if disposition == Disposition::Applied || binding != Binding::Unchanged {
            out.extend(self.admin_update(&identity, now));
        }
        Handled::new(disposition, out)
    }

    fn on_update(&mut self, conn: ConnectionId, msg: UpdateProto, now: Millis) -> Handled {
        let update = match validate_update(msg, conn, &self.registry) {
            Ok(update) => update,
            Err(d @ Disposition::DroppedDuplicateSeq { .. }) => {
                // Re-ack so the client can drop the patch.
                let out = self.push_state(conn, false).into_iter().collect();
                return Handled::new(d, out);
            }
            Err(d) => return Handled::dropped(d),
        };
        let Some(stored) = self.store.get(&update.identity).cloned() else {
            return Handled::dropped(Disposition::DroppedUnknownIdentity);
        };

        let mut patch = update.patch;
        if update.base_revision < stored.revision && patch.violation_count.take().is_some() {
            debug!(
                identity = %update.identity,
                base = update.base_revision,
                revision = stored.revision,
                "absolute strike count from an older revision ignored"
            );
        }

        let ctx = context(&self.schedule, &self.config, self.store.config(), now);
        let plan = candidate_intents(&stored, &patch);
        for field in &plan.ignored {
            debug!(identity = %update.identity, ?field, "candidate field ignored");
        }
        let batch = reduce_all(&stored, &plan.intents, &ctx);
        for (intent, rejection) in &batch.rejected {
            debug!(identity = %update.identity, intent = intent.name(), %rejection, "intent rejected");
        }

        let disposition = if batch.changed {
            self.store.commit(batch.session);
            Disposition::Applied
        } else {
            Disposition::Unchanged
        };
        self.store.touch(&update.identity, conn, now);
        self.online.insert(update.identity.clone(), true);
        self.registry.advance_seq(conn, update.seq);

        let mut out: Vec<Outbound> = self.push_state(conn, false).into_iter().collect();
        if disposition == Disposition::Applied {
            out.extend(self.admin_update(&update.identity, now));
        }
        Handled::new(disposition, out)
    }

    fn on_admin_login(&mut self, conn: ConnectionId, login: AdminLogin, now: Millis) -> Handled {
        if !self.gate.authorize(&login.credential) {
            warn!(conn, "admin login refused");
            return Handled::new(
                Disposition::Rejected {
                    reason: "invalid credential".into(),
                },
                vec![Outbound::new(
                    conn,
                    ServerBody::AdminLoginResult(AdminLoginResult { granted: false }),
                )],
            );
        }

        match self.registry.set_admin(conn) {
            Some(previous) => info!(conn, previous, "admin slot taken over"),
            None => info!(conn, "admin logged in"),
        }
        let mut out = vec![Outbound::new(
            conn,
            ServerBody::AdminLoginResult(AdminLoginResult { granted: true }),
        )];
        out.extend(self.admin_snapshot(conn, now));
        Handled::new(Disposition::Answered, out)
    }

    fn plan_command(
        &self,
        cmd: &AdminCommandProto,
        now: Millis,
    ) -> Result<(Identity, vigil_session::Batch), CommandError> {
        let identity = resolve_target(cmd.target.as_ref(), &self.registry, &self.store)?;
        let kind = cmd.kind.as_ref().ok_or(CommandError::MissingKind)?;
        let stored = self
            .store
            .get(&identity)
            .ok_or_else(|| CommandError::UnknownTarget(identity.clone()))?;
        let intents = command_intents(kind, stored)?;

        let ctx = context(&self.schedule, &self.config, self.store.config(), now);
        let batch = reduce_all(stored, &intents, &ctx);
        // Commands apply atomically.
        if let Some((_, rejection)) = batch.rejected.first() {
            return Err(CommandError::Rejected(rejection.clone()));
        }
        Ok((identity, batch))
    }

    fn on_admin_command(
        &mut self,
        conn: ConnectionId,
        cmd: AdminCommandProto,
        now: Millis,
    ) -> Handled {
        let command = cmd.kind.as_ref().map_or("unknown", |k| k.name());

        let (identity, batch) = match self.plan_command(&cmd, now) {
            Ok(planned) => planned,
            Err(error) => {
                info!(command, %error, "admin command rejected");
                let session = resolve_target(cmd.target.as_ref(), &self.registry, &self.store)
                    .ok()
                    .and_then(|identity| self.store.get(&identity))
                    .map(Into::into);
                return Handled::new(
                    Disposition::Rejected {
                        reason: error.to_string(),
                    },
                    vec![Outbound::new(
                        conn,
                        ServerBody::CommandRejected(CommandRejected {
                            command: command.to_string(),
                            reason: error.to_string(),
                            session,
                        }),
                    )],
                );
            }
        };

        let disposition = if batch.changed {
            let committed = self.store.commit(batch.session);
            info!(identity = %identity, command, revision = committed.revision, "admin command applied");
            Disposition::Applied
        } else {
            debug!(identity = %identity, command, "admin command changed nothing");
            Disposition::Unchanged
        };

        let mut out = Vec::new();
        if let (Some(target), Some(session)) = (
            self.registry.connection_of(&identity),
            self.store.get(&identity),
        ) {
            out.push(Outbound::new(
                target,
                ServerBody::CommandReceived(CommandReceived {
                    command: command.to_string(),
                    session: Some(session.into()),
                }),
            ));
        }
        out.extend(self.admin_update(&identity, now));
        Handled::new(disposition, out)
    }

    fn on_set_status(&mut self, conn: ConnectionId, msg: AdminSetStatus, now: Millis) -> Handled {
        let status = match global_status_from_i32(msg.status) {
            Ok(status) => status,
            Err(e) => {
                return Handled::dropped(Disposition::DroppedMalformed {
                    reason: e.to_string(),
                });
            }
        };

        let mut config = self.store.config().clone();
        let change = config.set_status(status, now);
        if !change.changed {
            return Handled::new(
                Disposition::Unchanged,
                vec![Outbound {
                    to: conn,
                    envelope: ServerEnvelope::contest_status(self.store.config()),
                }],
            );
        }
        self.store.set_config(config);
        info!(status = status.as_str(), "contest status changed");

        let mut out = Vec::new();
        if let Some(shift) = change.resume_shift_ms.filter(|shift| *shift > 0) {
            let armed: Vec<Identity> = self
                .store
                .all()
                .filter(|s| s.round_started_at.is_some())
                .map(|s| s.identity.clone())
                .collect();
            info!(shift_ms = shift, sessions = armed.len(), "resuming timers");
            for identity in armed {
                let ctx = context(&self.schedule, &self.config, self.store.config(), now);
                let reduction = match self.store.get(&identity) {
                    Some(stored) => reduce(stored, &Intent::ShiftRoundStart { by_ms: shift }, &ctx),
                    None => continue,
                };
                if let Reduction::Changed(next) = reduction {
                    self.store.commit(next);
                    out.extend(self.push_identity_state(&identity));
                    out.extend(self.admin_update(&identity, now));
                }
            }
        }

        let status_push = ServerEnvelope::contest_status(self.store.config());
        out.extend(
            self.registry
                .all_connections()
                .into_iter()
                .map(|to| Outbound {
                    to,
                    envelope: status_push.clone(),
                }),
        );
        Handled::new(Disposition::Applied, out)
    }

    fn on_reset(&mut self, conn: ConnectionId, now: Millis) -> Handled {
        let candidates = self.registry.candidate_connections();
        self.store.clear();
        let mut config = self.store.config().clone();
        config.epoch += 1;
        config.updated_at = now;
        let epoch = config.epoch;
        self.store.set_config(config);
        self.registry.unbind_all();
        self.online.clear();
        warn!(epoch, notified = candidates.len(), "contest reset, all sessions cleared");

        let mut out: Vec<Outbound> = candidates
            .into_iter()
            .map(|to| Outbound::new(to, ServerBody::Reset(ResetProto { epoch })))
            .collect();
        out.extend(self.admin_snapshot(conn, now));
        Handled::new(Disposition::Applied, out)
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    /// Global periodic evaluation: round timers, liveness, store retry.
    pub fn tick(&mut self, now: Millis) -> Vec<Outbound> {
        let mut out = Vec::new();

        if !self.store.durability().is_healthy() {
            self.store.flush();
        }

        if self.store.config().timers_running() {
            let active: Vec<Identity> = self
                .store
                .all()
                .filter(|s| s.lifecycle == LifecycleState::Active)
                .map(|s| s.identity.clone())
                .collect();
            for identity in active {
                let ctx = context(&self.schedule, &self.config, self.store.config(), now);
                let Some(stored) = self.store.get(&identity) else {
                    continue;
                };
                let round = stored.current_round;
                if let Reduction::Changed(next) = reduce(stored, &Intent::Tick, &ctx) {
                    if next.current_round != round || next.lifecycle != LifecycleState::Active {
                        info!(
                            identity = %identity,
                            round = next.current_round,
                            lifecycle = %next.lifecycle,
                            "round timer expired"
                        );
                    }
                    self.store.commit(next);
                    out.extend(self.push_identity_state(&identity));
                    out.extend(self.admin_update(&identity, now));
                }
            }
        }

        let grace = self.config.heartbeat_grace_ms;
        let flips: Vec<(Identity, bool)> = self
            .store
            .all()
            .filter_map(|s| {
                let online = is_online(s, now, grace);
                let reported = self.online.get(&s.identity).copied().unwrap_or(false);
                (online != reported).then(|| (s.identity.clone(), online))
            })
            .collect();
        for (identity, online) in flips {
            debug!(identity = %identity, online, "liveness changed");
            self.online.insert(identity.clone(), online);
            out.extend(self.admin_update(&identity, now));
        }

        out
    }

    // ------------------------------------------------------------------------
    // Outbound helpers
    // ------------------------------------------------------------------------

    fn view(&self, session: &Session, now: Millis) -> AdminSessionView {
        AdminSessionView {
            session: Some(session.into()),
            connected: self.registry.connection_of(&session.identity).is_some(),
            online: is_online(session, now, self.config.heartbeat_grace_ms),
        }
    }

    /// Push one session's current view to the admin, if any.
    fn admin_update(&self, identity: &str, now: Millis) -> Option<Outbound> {
        let admin = self.registry.admin()?;
        let session = self.store.get(identity)?;
        Some(Outbound::new(
            admin,
            ServerBody::SessionUpdate(SessionUpdate {
                view: Some(self.view(session, now)),
            }),
        ))
    }

    /// Full dashboard state for an admin connection.
    fn admin_snapshot(&self, conn: ConnectionId, now: Millis) -> Vec<Outbound> {
        let sessions = self.store.all().map(|s| self.view(s, now)).collect();
        vec![
            Outbound::new(conn, ServerBody::AllSessions(AllSessions { sessions })),
            Outbound {
                to: conn,
                envelope: ServerEnvelope::contest_status(self.store.config()),
            },
        ]
    }

    /// Authoritative state for whatever identity `conn` serves.
    fn push_state(&self, conn: ConnectionId, resync: bool) -> Option<Outbound> {
        let identity = self.registry.identity_of(conn)?;
        let session = self.store.get(identity)?;
        Some(Outbound {
            to: conn,
            envelope: ServerEnvelope::session_state(session, self.registry.acked_seq(conn), resync),
        })
    }

    /// Authoritative state to `identity`'s live connection, if any.
    fn push_identity_state(&self, identity: &str) -> Option<Outbound> {
        let conn = self.registry.connection_of(identity)?;
        self.push_state(conn, false)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use gate::SharedSecretGate;
    use vigil_session::{GlobalStatus, Language, Profile};
    use vigil_store::MemoryBackend;
    use vigil_wire::{GlobalStatusProto, SessionProto, admin_command_proto};

    const T0: Millis = 1_700_000_000_000;
    const SECRET: &str = "proctor";

    fn coordinator() -> Coordinator {
        let config = ServerConfig {
            schedule: RoundSchedule::new(vec![1200, 1200, 1200]).unwrap(),
            ..Default::default()
        };
        Coordinator::new(
            config,
            SessionStore::in_memory(),
            Box::new(SharedSecretGate::new(SECRET)),
        )
    }

    fn snapshot(identity: &str) -> Session {
        Session::new(identity, Profile::default(), Language::Python)
    }

    fn register(session: &Session, base_revision: u64, seq: u64) -> ClientEnvelope {
        ClientBody::Register(RegisterProto {
            snapshot: Some(SessionProto::from(session)),
            base_revision,
            seq,
            epoch: 1,
        })
        .into()
    }

    fn login(c: &mut Coordinator, now: Millis) -> ConnectionId {
        let admin = c.connect();
        let handled = c.handle(
            admin,
            ClientBody::AdminLogin(AdminLogin {
                credential: SECRET.into(),
            })
            .into(),
            now,
        );
        assert_eq!(handled.disposition, Disposition::Answered);
        admin
    }

    fn command(identity: &str, kind: admin_command_proto::Kind) -> ClientEnvelope {
        ClientBody::AdminCommand(AdminCommandProto {
            target: Some(admin_command_proto::Target::Identity(identity.into())),
            kind: Some(kind),
        })
        .into()
    }

    #[test]
    fn test_first_register_creates_session() {
        let mut c = coordinator();
        let conn = c.connect();
        let handled = c.handle(conn, register(&snapshot("R1"), 0, 0), T0);
        assert_eq!(handled.disposition, Disposition::Applied);

        let stored = c.session("R1").unwrap();
        assert_eq!(stored.lifecycle, LifecycleState::Instructions);
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.connection_id, Some(conn));
        assert_eq!(handled.outbound.len(), 1);
        assert_eq!(handled.outbound[0].to, conn);
    }

    /// Registering the same snapshot twice leaves the record unchanged.
    #[test]
    fn test_register_is_idempotent() {
        let mut c = coordinator();
        let conn = c.connect();
        let s = snapshot("R1");
        c.handle(conn, register(&s, 0, 0), T0);
        let first = c.session("R1").unwrap().clone();

        let mut local = first.clone();
        local.connection_id = None;
        let handled = c.handle(conn, register(&local, first.revision, 0), T0 + 10);
        assert_eq!(handled.disposition, Disposition::Unchanged);
        let second = c.session("R1").unwrap();
        assert!(first.same_content(second));
        assert_eq!(second.revision, first.revision);
    }

    #[test]
    fn test_non_admin_cannot_command() {
        let mut c = coordinator();
        let conn = c.connect();
        c.handle(conn, register(&snapshot("R1"), 0, 0), T0);
        let handled = c.handle(
            conn,
            command("R1", admin_command_proto::Kind::Unlock(vigil_wire::Unlock {})),
            T0,
        );
        assert_eq!(handled.disposition, Disposition::DroppedNotAdmin);
        assert!(handled.outbound.is_empty());
    }

    #[test]
    fn test_wrong_credential_refused() {
        let mut c = coordinator();
        let conn = c.connect();
        let handled = c.handle(
            conn,
            ClientBody::AdminLogin(AdminLogin {
                credential: "guess".into(),
            })
            .into(),
            T0,
        );
        assert!(matches!(handled.disposition, Disposition::Rejected { .. }));
        assert!(c.registry().admin().is_none());
    }

    #[test]
    fn test_admin_command_reaches_target_and_admin() {
        let mut c = coordinator();
        let candidate = c.connect();
        c.handle(candidate, register(&snapshot("R1"), 0, 0), T0);
        let admin = login(&mut c, T0);

        let handled = c.handle(
            admin,
            command(
                "R1",
                admin_command_proto::Kind::ForceTerminate(vigil_wire::ForceTerminate {}),
            ),
            T0 + 1,
        );
        assert_eq!(handled.disposition, Disposition::Applied);
        let to: Vec<ConnectionId> = handled.outbound.iter().map(|o| o.to).collect();
        assert_eq!(to, vec![candidate, admin]);
        assert_eq!(c.session("R1").unwrap().violation_count, 99);
    }

    #[test]
    fn test_command_for_offline_candidate_still_reaches_admin() {
        let mut c = coordinator();
        let candidate = c.connect();
        c.handle(candidate, register(&snapshot("R1"), 0, 0), T0);
        c.disconnect(candidate, T0 + 1);
        let admin = login(&mut c, T0 + 2);

        let handled = c.handle(
            admin,
            ClientBody::AdminCommand(AdminCommandProto {
                target: Some(admin_command_proto::Target::ConnectionId(candidate)),
                kind: Some(admin_command_proto::Kind::ForceSubmit(
                    vigil_wire::ForceSubmit {},
                )),
            })
            .into(),
            T0 + 3,
        );
        assert_eq!(handled.disposition, Disposition::Applied);
        assert_eq!(handled.outbound.len(), 1);
        assert_eq!(handled.outbound[0].to, admin);
        assert_eq!(
            c.session("R1").unwrap().lifecycle,
            LifecycleState::Submitted
        );
    }

    #[test]
    fn test_rejected_command_reported() {
        let mut c = coordinator();
        let candidate = c.connect();
        c.handle(candidate, register(&snapshot("R1"), 0, 0), T0);
        let admin = login(&mut c, T0);

        let handled = c.handle(
            admin,
            command("R1", admin_command_proto::Kind::Unlock(vigil_wire::Unlock {})),
            T0,
        );
        assert!(matches!(handled.disposition, Disposition::Rejected { .. }));
        assert!(matches!(
            handled.outbound[0].envelope.body,
            Some(ServerBody::CommandRejected(_))
        ));
    }

    #[test]
    fn test_tick_arms_active_sessions_only_while_running() {
        let mut c = coordinator();
        let conn = c.connect();
        let mut s = snapshot("R1");
        s.lifecycle = LifecycleState::Active;
        c.handle(conn, register(&s, 0, 0), T0);
        assert!(c.session("R1").unwrap().round_started_at.is_none());

        let admin = login(&mut c, T0);
        c.handle(
            admin,
            ClientBody::AdminSetStatus(AdminSetStatus {
                status: GlobalStatusProto::Paused as i32,
            })
            .into(),
            T0,
        );
        c.tick(T0 + 1_000);
        assert!(c.session("R1").unwrap().round_started_at.is_none());

        c.handle(
            admin,
            ClientBody::AdminSetStatus(AdminSetStatus {
                status: GlobalStatusProto::Active as i32,
            })
            .into(),
            T0 + 2_000,
        );
        let out = c.tick(T0 + 3_000);
        assert_eq!(c.session("R1").unwrap().round_started_at, Some(T0 + 3_000));
        assert!(out.iter().any(|o| o.to == conn));
    }

    #[test]
    fn test_liveness_flip_reported_to_admin() {
        let mut c = coordinator();
        let conn = c.connect();
        c.handle(conn, register(&snapshot("R1"), 0, 0), T0);
        let admin = login(&mut c, T0);

        assert!(c.tick(T0 + 1_000).is_empty());
        let out = c.tick(T0 + HEARTBEAT_GRACE_MS + 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, admin);
        match &out[0].envelope.body {
            Some(ServerBody::SessionUpdate(update)) => {
                let view = update.view.as_ref().unwrap();
                assert!(!view.online);
                assert!(view.connected);
            }
            other => panic!("unexpected {other:?}"),
        }
        // Liveness never changes lifecycle.
        assert_eq!(
            c.session("R1").unwrap().lifecycle,
            LifecycleState::Instructions
        );
    }

    #[test]
    fn test_degraded_store_keeps_serving() {
        let backend = MemoryBackend::new();
        let store = SessionStore::open(Box::new(backend.clone())).unwrap();
        let mut c = Coordinator::new(
            ServerConfig::default(),
            store,
            Box::new(SharedSecretGate::new(SECRET)),
        );
        backend.set_failing(true);

        let conn = c.connect();
        let handled = c.handle(conn, register(&snapshot("R1"), 0, 0), T0);
        assert_eq!(handled.disposition, Disposition::Applied);
        assert!(c.session("R1").is_some());
        assert!(!c.durability().is_healthy());

        backend.set_failing(false);
        c.tick(T0 + 1_000);
        assert!(c.durability().is_healthy());
        assert_eq!(backend.session_count(), 1);
    }

    #[test]
    fn test_status_request_answers_current_status() {
        let mut c = coordinator();
        let conn = c.connect();
        let handled = c.handle(conn, ClientBody::StatusRequest(Default::default()).into(), T0);
        match &handled.outbound[0].envelope.body {
            Some(ServerBody::ContestStatus(status)) => {
                assert_eq!(
                    global_status_from_i32(status.status).unwrap(),
                    GlobalStatus::Active
                );
                assert_eq!(status.epoch, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_connection_dropped() {
        let mut c = coordinator();
        let handled = c.handle(99, register(&snapshot("R1"), 0, 0), T0);
        assert_eq!(handled.disposition, Disposition::DroppedUnknownConnection);
        assert!(c.session("R1").is_none());
    }

    #[test]
    fn test_persisted_round_override_applies() {
        let mut store = SessionStore::in_memory();
        let mut config = store.config().clone();
        config.round_overrides_secs.insert(2, 90);
        store.set_config(config);
        let c = Coordinator::new(
            ServerConfig::default(),
            store,
            Box::new(SharedSecretGate::new(SECRET)),
        );
        assert_eq!(c.schedule().duration_secs(2), 90);
        assert_eq!(c.schedule().duration_secs(1), 1800);
    }
}
