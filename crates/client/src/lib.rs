//! Vigil Candidate Client
//!
//! Sans-I/O client side of the synchronization protocol. The embedding
//! application feeds it connection events, environment signals, server
//! envelopes, and the current time; it queues envelopes to send in an
//! outbox drained with [`SessionClient::take_outbox`].
//!
//! # Local state
//!
//! The client keeps a cached copy of its session and applies candidate
//! intents to it optimistically through the same reducer the coordinator
//! uses. Every local change is sent as a patch with a sequence number and
//! kept as pending until the coordinator acknowledges it.
//!
//! # Reconciliation
//!
//! Authoritative state from the coordinator always replaces the cached
//! session. Pending patches not yet acknowledged are then re-applied on
//! top. After a resync the rebased difference is sent again as one patch.

#![deny(unsafe_code)]

use vigil_session::{
    Context, GlobalStatus, Identity, Intent, Language, LifecycleState, Millis, ProctorMonitor,
    ProctorSignal, Profile, QuestionId, Reduction, RoundSchedule, ScoringOracle, Session,
    SessionPatch, Verdict, candidate_intents, reduce, reduce_all,
};
use vigil_wire::client_envelope::Body as ClientBody;
use vigil_wire::server_envelope::Body as ServerBody;
use vigil_wire::{
    ClientEnvelope, RegisterProto, Revision, Seq, ServerEnvelope, SessionProto, StatusRequest,
    UpdateProto, global_status_from_i32,
};

/// Heartbeat period in milliseconds.
pub const HEARTBEAT_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub heartbeat_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
        }
    }
}

/// What survives a page reload on the candidate's machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached {
    pub session: Session,
    pub base_revision: Revision,
    pub epoch: u64,
}

/// What a server envelope meant to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Authoritative session adopted.
    Synced { revision: Revision, resync: bool },
    /// An admin command was applied to this session.
    Command { command: String },
    Status(GlobalStatus),
    Broadcast { message: String, sent_at: Millis },
    /// Contest was reset; local session discarded.
    Reset { epoch: u64 },
    /// Not addressed to a candidate, or unreadable.
    Ignored,
}

pub struct SessionClient {
    config: ClientConfig,
    schedule: RoundSchedule,
    session: Option<Session>,
    base_revision: Revision,
    epoch: u64,
    seq: Seq,
    pending: Vec<(Seq, SessionPatch)>,
    monitor: ProctorMonitor,
    status: GlobalStatus,
    status_since: Millis,
    connected: bool,
    last_heartbeat_at: Option<Millis>,
    outbox: Vec<ClientEnvelope>,
}

impl SessionClient {
    pub fn new(config: ClientConfig, schedule: RoundSchedule) -> Self {
        Self {
            config,
            schedule,
            session: None,
            base_revision: 0,
            epoch: 0,
            seq: 0,
            pending: Vec::new(),
            monitor: ProctorMonitor::new(),
            status: GlobalStatus::Active,
            status_since: 0,
            connected: false,
            last_heartbeat_at: None,
            outbox: Vec::new(),
        }
    }

    /// Resume from a locally cached session.
    pub fn from_cache(config: ClientConfig, schedule: RoundSchedule, cached: Cached) -> Self {
        let mut client = Self::new(config, schedule);
        client.session = Some(cached.session);
        client.base_revision = cached.base_revision;
        client.epoch = cached.epoch;
        client
    }

    pub fn cached(&self) -> Option<Cached> {
        self.session.as_ref().map(|session| Cached {
            session: session.clone(),
            base_revision: self.base_revision,
            epoch: self.epoch,
        })
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn status(&self) -> GlobalStatus {
        self.status
    }

    pub fn base_revision(&self) -> Revision {
        self.base_revision
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Local changes not yet acknowledged.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn monitor(&self) -> &ProctorMonitor {
        &self.monitor
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn take_outbox(&mut self) -> Vec<ClientEnvelope> {
        std::mem::take(&mut self.outbox)
    }

    fn context(&self, now: Millis) -> Context<'_> {
        Context::new(now, &self.schedule).with_timers(self.status == GlobalStatus::Active)
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Complete the registration form and start a fresh local session.
    pub fn register(
        &mut self,
        identity: impl Into<Identity>,
        profile: Profile,
        language: Language,
        now: Millis,
    ) {
        let mut session = Session::new(identity, profile, language);
        if let Reduction::Changed(next) =
            reduce(&session, &Intent::CompleteRegistration, &self.context(now))
        {
            session = next;
        }
        self.session = Some(session);
        self.base_revision = 0;
        self.pending.clear();
        if self.connected {
            self.send_register(false);
        }
    }

    /// Transport connected: register the cached session and ask for status.
    pub fn on_connect(&mut self, now: Millis) {
        self.connected = true;
        self.last_heartbeat_at = Some(now);
        self.send_register(false);
        self.outbox
            .push(ClientBody::StatusRequest(StatusRequest {}).into());
    }

    pub fn on_disconnect(&mut self) {
        self.connected = false;
    }

    /// Periodic work: local timer evaluation and the heartbeat.
    pub fn poll(&mut self, now: Millis) {
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.lifecycle == LifecycleState::Active)
        {
            self.apply(Intent::Tick, now);
        }
        let due = self
            .last_heartbeat_at
            .is_none_or(|at| now.saturating_sub(at) >= self.config.heartbeat_interval_ms);
        if self.connected && due {
            self.send_register(true);
            self.last_heartbeat_at = Some(now);
        }
    }

    fn register_proto(&self) -> Option<RegisterProto> {
        let session = self.session.as_ref()?;
        Some(RegisterProto {
            snapshot: Some(SessionProto::from(session)),
            base_revision: self.base_revision,
            seq: self.seq,
            epoch: self.epoch,
        })
    }

    fn send_register(&mut self, heartbeat: bool) {
        let Some(msg) = self.register_proto() else {
            return;
        };
        let body = if heartbeat {
            ClientBody::Heartbeat(msg)
        } else {
            ClientBody::Register(msg)
        };
        self.outbox.push(body.into());
    }

    fn send_update(&mut self, patch: SessionPatch) {
        let Some(identity) = self.session.as_ref().map(|s| s.identity.clone()) else {
            return;
        };
        self.seq += 1;
        if self.connected {
            self.outbox.push(
                ClientBody::Update(UpdateProto {
                    identity,
                    patch: Some((&patch).into()),
                    base_revision: self.base_revision,
                    seq: self.seq,
                })
                .into(),
            );
        }
        self.pending.push((self.seq, patch));
    }

    // ------------------------------------------------------------------------
    // Local intents
    // ------------------------------------------------------------------------

    /// Apply a candidate intent locally and queue the resulting patch.
    ///
    /// Admin intents are never applied on the client.
    pub fn apply(&mut self, intent: Intent, now: Millis) -> Reduction {
        if intent.is_admin() {
            return Reduction::Unchanged;
        }
        let Some(current) = self.session.as_ref() else {
            return Reduction::Unchanged;
        };
        let reduction = reduce(current, &intent, &self.context(now));
        if let Reduction::Changed(next) = &reduction {
            let patch = current.candidate_diff(next);
            self.session = Some(next.clone());
            self.send_update(patch);
        }
        reduction
    }

    /// Feed an environment signal through the proctoring monitor.
    pub fn on_signal(&mut self, signal: ProctorSignal, now: Millis) -> Option<Reduction> {
        let lifecycle = self.session.as_ref()?.lifecycle;
        let intent = self.monitor.observe(signal, lifecycle)?;
        Some(self.apply(intent, now))
    }

    /// Run code against the oracle and record the submission.
    pub fn run_code(
        &mut self,
        question: impl Into<QuestionId>,
        code: &str,
        expected_fix: &str,
        oracle: &dyn ScoringOracle,
        now: Millis,
    ) -> Verdict {
        let verdict = oracle.evaluate(code, expected_fix);
        self.apply(
            Intent::RecordSubmission {
                question: question.into(),
                code: Some(code.to_string()),
                score: Some(verdict.score),
            },
            now,
        );
        verdict
    }

    /// Whole seconds left in the current round; frozen while suspended.
    pub fn remaining_secs(&self, now: Millis) -> Option<u64> {
        let session = self.session.as_ref()?;
        let started = session.round_started_at?;
        let at = if self.status == GlobalStatus::Active {
            now
        } else {
            self.status_since.max(started).min(now)
        };
        Some(
            self.schedule
                .remaining_secs(session.current_round, started, at),
        )
    }

    // ------------------------------------------------------------------------
    // Server envelopes
    // ------------------------------------------------------------------------

    pub fn handle(&mut self, envelope: ServerEnvelope, now: Millis) -> Event {
        let Some(body) = envelope.body else {
            return Event::Ignored;
        };
        match body {
            ServerBody::SessionState(state) => {
                let Some(server) = self.own_session(state.session) else {
                    return Event::Ignored;
                };
                self.pending.retain(|(seq, _)| *seq > state.acked_seq);
                let revision = server.revision;
                self.adopt(server, now, state.resync);
                Event::Synced {
                    revision,
                    resync: state.resync,
                }
            }
            ServerBody::CommandReceived(received) => {
                let Some(server) = self.own_session(received.session) else {
                    return Event::Ignored;
                };
                self.adopt(server, now, false);
                Event::Command {
                    command: received.command,
                }
            }
            ServerBody::ContestStatus(contest) => {
                let Ok(status) = global_status_from_i32(contest.status) else {
                    return Event::Ignored;
                };
                self.status = status;
                self.status_since = contest.updated_at;
                if self.session.is_none() || self.epoch == 0 {
                    self.epoch = contest.epoch;
                }
                Event::Status(status)
            }
            ServerBody::Broadcast(broadcast) => Event::Broadcast {
                message: broadcast.message,
                sent_at: broadcast.sent_at,
            },
            ServerBody::Reset(reset) => {
                self.session = None;
                self.pending.clear();
                self.base_revision = 0;
                self.epoch = reset.epoch;
                self.monitor = ProctorMonitor::new();
                Event::Reset { epoch: reset.epoch }
            }
            ServerBody::AllSessions(_)
            | ServerBody::SessionUpdate(_)
            | ServerBody::CommandRejected(_)
            | ServerBody::AdminLoginResult(_) => Event::Ignored,
        }
    }

    fn own_session(&self, proto: Option<SessionProto>) -> Option<Session> {
        let server = Session::try_from(proto?).ok()?;
        match &self.session {
            Some(local) if local.identity != server.identity => None,
            _ => Some(server),
        }
    }

    /// Replace the cached session with `server` and re-apply pending
    /// patches on top. With `resend`, the rebased difference becomes a
    /// single new patch.
    fn adopt(&mut self, server: Session, now: Millis, resend: bool) {
        self.base_revision = server.revision;
        let ctx = self.context(now);
        let mut local = server.clone();
        for (_, patch) in &self.pending {
            let plan = candidate_intents(&local, patch);
            local = reduce_all(&local, &plan.intents, &ctx).session;
        }

        if resend && !self.pending.is_empty() {
            self.pending.clear();
            let patch = server.candidate_diff(&local);
            self.session = Some(local);
            if !patch.is_empty() {
                self.send_update(patch);
            }
        } else {
            self.session = Some(local);
        }
    }
}
