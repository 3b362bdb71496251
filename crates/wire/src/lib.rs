//! Vigil Wire Protocol Types
//!
//! This crate defines the Protobuf messages exchanged between candidate
//! clients, the admin dashboard and the coordinator, plus the records the
//! Session Store persists. Clients, the coordinator and the store MUST all
//! depend on this crate so there is exactly one schema.
//!
//! # Message Categories
//!
//! - **Client → Server** ([`ClientEnvelope`]): register, heartbeat, update,
//!   status request, admin login and admin commands
//! - **Server → Client** ([`ServerEnvelope`]): authoritative session state,
//!   routed commands, status pushes, broadcasts, admin views, reset
//! - **Persisted records**: [`StoredRecord`] wrapping an encoded
//!   [`SessionProto`] or [`ConfigProto`]
//!
//! Every frame on the transport is exactly one encoded envelope.

#![deny(unsafe_code)]

use std::collections::BTreeMap;

use prost::Message;
use vigil_session::{
    ContestConfig, GlobalStatus, Language, LifecycleState, Profile, Session, SessionPatch,
};

// ============================================================================
// Type Aliases (matching session crate)
// ============================================================================

pub use vigil_session::{ConnectionId, Identity, Millis};

/// Per-connection client sequence number for updates.
pub type Seq = u64;

/// Server-assigned content revision of a session.
pub type Revision = u64;

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LifecycleProto {
    Unspecified = 0,
    Registering = 1,
    Instructions = 2,
    Active = 3,
    Submitted = 4,
    Terminated = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LanguageProto {
    Unspecified = 0,
    C = 1,
    Java = 2,
    Python = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum GlobalStatusProto {
    Unspecified = 0,
    Active = 1,
    Paused = 2,
    Ended = 3,
}

// ============================================================================
// Session Records
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct ProfileProto {
    #[prost(string, tag = "1")]
    pub full_name: String,

    #[prost(string, tag = "2")]
    pub college: String,

    #[prost(string, tag = "3")]
    pub department: String,

    #[prost(string, tag = "4")]
    pub year: String,

    #[prost(string, tag = "5")]
    pub email: String,
}

/// Full session snapshot.
///
/// Used both on the wire and as the persisted record payload.
#[derive(Clone, PartialEq, Message)]
pub struct SessionProto {
    /// Roll number; merge key for every update.
    #[prost(string, tag = "1")]
    pub identity: String,

    #[prost(message, optional, tag = "2")]
    pub profile: Option<ProfileProto>,

    #[prost(enumeration = "LanguageProto", tag = "3")]
    pub language: i32,

    #[prost(enumeration = "LifecycleProto", tag = "4")]
    pub lifecycle: i32,

    #[prost(uint32, tag = "5")]
    pub current_round: u32,

    /// Absent means "arm on next tick".
    #[prost(uint64, optional, tag = "6")]
    pub round_started_at: Option<Millis>,

    #[prost(uint32, tag = "7")]
    pub violation_count: u32,

    #[prost(btree_map = "string, int64", tag = "8")]
    pub scores: BTreeMap<String, i64>,

    #[prost(btree_map = "string, string", tag = "9")]
    pub code: BTreeMap<String, String>,

    #[prost(uint64, optional, tag = "10")]
    pub submitted_at: Option<Millis>,

    /// Server-derived; ignored when sent by a client.
    #[prost(uint64, optional, tag = "11")]
    pub connection_id: Option<ConnectionId>,

    /// Server-derived; ignored when sent by a client.
    #[prost(uint64, tag = "12")]
    pub last_seen_at: Millis,

    #[prost(uint64, tag = "13")]
    pub revision: Revision,
}

/// Wrapper giving `round_started_at` a third state ("clear") in patches.
#[derive(Clone, PartialEq, Message)]
pub struct InstantProto {
    #[prost(uint64, optional, tag = "1")]
    pub at: Option<Millis>,
}

/// Partial session fields. Absent fields are left alone.
#[derive(Clone, PartialEq, Message)]
pub struct SessionPatchProto {
    #[prost(message, optional, tag = "1")]
    pub profile: Option<ProfileProto>,

    #[prost(enumeration = "LifecycleProto", optional, tag = "2")]
    pub lifecycle: Option<i32>,

    #[prost(uint32, optional, tag = "3")]
    pub current_round: Option<u32>,

    #[prost(message, optional, tag = "4")]
    pub round_started_at: Option<InstantProto>,

    #[prost(uint32, optional, tag = "5")]
    pub violation_count: Option<u32>,

    #[prost(btree_map = "string, int64", tag = "6")]
    pub scores: BTreeMap<String, i64>,

    #[prost(btree_map = "string, string", tag = "7")]
    pub code: BTreeMap<String, String>,

    /// Strikes added since the sender's base revision.
    #[prost(uint32, tag = "8")]
    pub violations_added: u32,
}

// ============================================================================
// Client → Server
// ============================================================================

/// Full-snapshot registration. Sent on every connect and as the heartbeat.
#[derive(Clone, PartialEq, Message)]
pub struct RegisterProto {
    #[prost(message, optional, tag = "1")]
    pub snapshot: Option<SessionProto>,

    /// Last revision the client adopted from the server (0 = never).
    #[prost(uint64, tag = "2")]
    pub base_revision: Revision,

    /// Highest update seq the client has issued.
    #[prost(uint64, tag = "3")]
    pub seq: Seq,

    /// Contest epoch the snapshot belongs to (0 = unknown).
    #[prost(uint64, tag = "4")]
    pub epoch: u64,
}

/// Partial update from a candidate.
#[derive(Clone, PartialEq, Message)]
pub struct UpdateProto {
    #[prost(string, tag = "1")]
    pub identity: String,

    #[prost(message, optional, tag = "2")]
    pub patch: Option<SessionPatchProto>,

    /// Revision the patch was computed against. Absolute counters in a
    /// patch older than the stored record are not applied.
    #[prost(uint64, tag = "3")]
    pub base_revision: Revision,

    #[prost(uint64, tag = "4")]
    pub seq: Seq,
}

#[derive(Clone, PartialEq, Message)]
pub struct StatusRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct AdminLogin {
    /// Opaque credential checked by the admin gate.
    #[prost(string, tag = "1")]
    pub credential: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ForceTerminate {}

#[derive(Clone, PartialEq, Message)]
pub struct Unlock {}

#[derive(Clone, PartialEq, Message)]
pub struct ForceSubmit {}

#[derive(Clone, PartialEq, Message)]
pub struct AddTime {
    /// Signed minutes; positive extends the round.
    #[prost(sint64, tag = "1")]
    pub minutes: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct SetRound {
    #[prost(uint32, tag = "1")]
    pub round: u32,
}

/// Admin mutation of one session.
#[derive(Clone, PartialEq, Message)]
pub struct AdminCommandProto {
    #[prost(oneof = "admin_command_proto::Target", tags = "1, 2")]
    pub target: Option<admin_command_proto::Target>,

    #[prost(oneof = "admin_command_proto::Kind", tags = "3, 4, 5, 6, 7, 8, 9")]
    pub kind: Option<admin_command_proto::Kind>,
}

pub mod admin_command_proto {
    use super::*;

    /// Connection-scope id from the admin's view, or the identity itself.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Target {
        #[prost(uint64, tag = "1")]
        ConnectionId(u64),
        #[prost(string, tag = "2")]
        Identity(String),
    }

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "3")]
        ForceTerminate(ForceTerminate),
        #[prost(message, tag = "4")]
        Unlock(Unlock),
        #[prost(message, tag = "5")]
        ForceSubmit(ForceSubmit),
        #[prost(message, tag = "6")]
        AddTime(AddTime),
        #[prost(message, tag = "7")]
        SetRound(SetRound),
        #[prost(message, tag = "8")]
        EditProfile(ProfileProto),
        #[prost(message, tag = "9")]
        ForceUpdate(SessionPatchProto),
    }

    impl Kind {
        pub fn name(&self) -> &'static str {
            match self {
                Self::ForceTerminate(_) => "force_terminate",
                Self::Unlock(_) => "unlock",
                Self::ForceSubmit(_) => "force_submit",
                Self::AddTime(_) => "add_time",
                Self::SetRound(_) => "set_round",
                Self::EditProfile(_) => "edit_profile",
                Self::ForceUpdate(_) => "force_update",
            }
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct AdminSetStatus {
    #[prost(enumeration = "GlobalStatusProto", tag = "1")]
    pub status: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct AdminBroadcast {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AdminRefresh {}

#[derive(Clone, PartialEq, Message)]
pub struct AdminReset {}

#[derive(Clone, PartialEq, Message)]
pub struct ClientEnvelope {
    #[prost(oneof = "client_envelope::Body", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10")]
    pub body: Option<client_envelope::Body>,
}

pub mod client_envelope {
    use super::*;

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Register(RegisterProto),
        #[prost(message, tag = "2")]
        Heartbeat(RegisterProto),
        #[prost(message, tag = "3")]
        Update(UpdateProto),
        #[prost(message, tag = "4")]
        StatusRequest(StatusRequest),
        #[prost(message, tag = "5")]
        AdminLogin(AdminLogin),
        #[prost(message, tag = "6")]
        AdminCommand(AdminCommandProto),
        #[prost(message, tag = "7")]
        AdminSetStatus(AdminSetStatus),
        #[prost(message, tag = "8")]
        AdminBroadcast(AdminBroadcast),
        #[prost(message, tag = "9")]
        AdminRefresh(AdminRefresh),
        #[prost(message, tag = "10")]
        AdminReset(AdminReset),
    }
}

impl From<client_envelope::Body> for ClientEnvelope {
    fn from(body: client_envelope::Body) -> Self {
        Self { body: Some(body) }
    }
}

// ============================================================================
// Server → Client
// ============================================================================

/// Authoritative session state for the owning candidate.
#[derive(Clone, PartialEq, Message)]
pub struct SessionState {
    #[prost(message, optional, tag = "1")]
    pub session: Option<SessionProto>,

    /// Highest update seq applied from this connection.
    #[prost(uint64, tag = "2")]
    pub acked_seq: Seq,

    /// The client's snapshot was stale and was not merged.
    #[prost(bool, tag = "3")]
    pub resync: bool,
}

/// Admin command routed to the target candidate.
#[derive(Clone, PartialEq, Message)]
pub struct CommandReceived {
    #[prost(string, tag = "1")]
    pub command: String,

    #[prost(message, optional, tag = "2")]
    pub session: Option<SessionProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ContestStatus {
    #[prost(enumeration = "GlobalStatusProto", tag = "1")]
    pub status: i32,

    #[prost(uint64, tag = "2")]
    pub epoch: u64,

    #[prost(uint64, tag = "3")]
    pub updated_at: Millis,
}

#[derive(Clone, PartialEq, Message)]
pub struct BroadcastProto {
    #[prost(string, tag = "1")]
    pub message: String,

    #[prost(uint64, tag = "2")]
    pub sent_at: Millis,
}

/// One session as shown on the admin dashboard.
#[derive(Clone, PartialEq, Message)]
pub struct AdminSessionView {
    #[prost(message, optional, tag = "1")]
    pub session: Option<SessionProto>,

    /// A live connection is bound to the identity.
    #[prost(bool, tag = "2")]
    pub connected: bool,

    /// Last message received within the grace window.
    #[prost(bool, tag = "3")]
    pub online: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct AllSessions {
    #[prost(message, repeated, tag = "1")]
    pub sessions: Vec<AdminSessionView>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SessionUpdate {
    #[prost(message, optional, tag = "1")]
    pub view: Option<AdminSessionView>,
}

/// Contest was reset; discard all local state.
#[derive(Clone, PartialEq, Message)]
pub struct ResetProto {
    #[prost(uint64, tag = "1")]
    pub epoch: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct CommandRejected {
    #[prost(string, tag = "1")]
    pub command: String,

    #[prost(string, tag = "2")]
    pub reason: String,

    #[prost(message, optional, tag = "3")]
    pub session: Option<SessionProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AdminLoginResult {
    #[prost(bool, tag = "1")]
    pub granted: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServerEnvelope {
    #[prost(oneof = "server_envelope::Body", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9")]
    pub body: Option<server_envelope::Body>,
}

pub mod server_envelope {
    use super::*;

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        SessionState(SessionState),
        #[prost(message, tag = "2")]
        CommandReceived(CommandReceived),
        #[prost(message, tag = "3")]
        ContestStatus(ContestStatus),
        #[prost(message, tag = "4")]
        Broadcast(BroadcastProto),
        #[prost(message, tag = "5")]
        AllSessions(AllSessions),
        #[prost(message, tag = "6")]
        SessionUpdate(SessionUpdate),
        #[prost(message, tag = "7")]
        Reset(ResetProto),
        #[prost(message, tag = "8")]
        CommandRejected(CommandRejected),
        #[prost(message, tag = "9")]
        AdminLoginResult(AdminLoginResult),
    }
}

impl From<server_envelope::Body> for ServerEnvelope {
    fn from(body: server_envelope::Body) -> Self {
        Self { body: Some(body) }
    }
}

// ============================================================================
// Persisted Records
// ============================================================================

/// Contest configuration record.
#[derive(Clone, PartialEq, Message)]
pub struct ConfigProto {
    #[prost(enumeration = "GlobalStatusProto", tag = "1")]
    pub status: i32,

    #[prost(uint64, tag = "2")]
    pub epoch: u64,

    #[prost(uint64, optional, tag = "3")]
    pub suspended_at: Option<Millis>,

    #[prost(btree_map = "uint32, uint64", tag = "4")]
    pub round_overrides_secs: BTreeMap<u32, u64>,

    #[prost(uint64, tag = "5")]
    pub updated_at: Millis,
}

/// Checksummed record envelope written by the Session Store.
#[derive(Clone, PartialEq, Message)]
pub struct StoredRecord {
    /// Record format version (starts at 1).
    #[prost(uint32, tag = "1")]
    pub format_version: u32,

    /// Encoded `SessionProto` or `ConfigProto`.
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,

    /// SHA-256 of `payload`.
    #[prost(bytes = "vec", tag = "3")]
    pub checksum: Vec<u8>,
}

// ============================================================================
// Conversion Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown {field} value {value}")]
    UnknownEnum { field: &'static str, value: i32 },
    #[error("missing required field {0}")]
    Missing(&'static str),
    #[error("empty identity")]
    EmptyIdentity,
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<LifecycleState> for LifecycleProto {
    fn from(state: LifecycleState) -> Self {
        match state {
            LifecycleState::Registering => Self::Registering,
            LifecycleState::Instructions => Self::Instructions,
            LifecycleState::Active => Self::Active,
            LifecycleState::Submitted => Self::Submitted,
            LifecycleState::Terminated => Self::Terminated,
        }
    }
}

fn lifecycle_from_i32(value: i32) -> Result<LifecycleState, WireError> {
    let unknown = WireError::UnknownEnum {
        field: "lifecycle",
        value,
    };
    match LifecycleProto::try_from(value).map_err(|_| unknown.clone())? {
        LifecycleProto::Registering => Ok(LifecycleState::Registering),
        LifecycleProto::Instructions => Ok(LifecycleState::Instructions),
        LifecycleProto::Active => Ok(LifecycleState::Active),
        LifecycleProto::Submitted => Ok(LifecycleState::Submitted),
        LifecycleProto::Terminated => Ok(LifecycleState::Terminated),
        LifecycleProto::Unspecified => Err(unknown),
    }
}

impl From<Language> for LanguageProto {
    fn from(language: Language) -> Self {
        match language {
            Language::C => Self::C,
            Language::Java => Self::Java,
            Language::Python => Self::Python,
        }
    }
}

fn language_from_i32(value: i32) -> Result<Language, WireError> {
    match LanguageProto::try_from(value) {
        Ok(LanguageProto::C) => Ok(Language::C),
        Ok(LanguageProto::Java) => Ok(Language::Java),
        Ok(LanguageProto::Python) => Ok(Language::Python),
        _ => Err(WireError::UnknownEnum {
            field: "language",
            value,
        }),
    }
}

impl From<GlobalStatus> for GlobalStatusProto {
    fn from(status: GlobalStatus) -> Self {
        match status {
            GlobalStatus::Active => Self::Active,
            GlobalStatus::Paused => Self::Paused,
            GlobalStatus::Ended => Self::Ended,
        }
    }
}

/// Decode a raw `GlobalStatusProto` field.
pub fn global_status_from_i32(value: i32) -> Result<GlobalStatus, WireError> {
    match GlobalStatusProto::try_from(value) {
        Ok(GlobalStatusProto::Active) => Ok(GlobalStatus::Active),
        Ok(GlobalStatusProto::Paused) => Ok(GlobalStatus::Paused),
        Ok(GlobalStatusProto::Ended) => Ok(GlobalStatus::Ended),
        _ => Err(WireError::UnknownEnum {
            field: "status",
            value,
        }),
    }
}

impl From<&Profile> for ProfileProto {
    fn from(p: &Profile) -> Self {
        Self {
            full_name: p.full_name.clone(),
            college: p.college.clone(),
            department: p.department.clone(),
            year: p.year.clone(),
            email: p.email.clone(),
        }
    }
}

impl From<ProfileProto> for Profile {
    fn from(p: ProfileProto) -> Self {
        Self {
            full_name: p.full_name,
            college: p.college,
            department: p.department,
            year: p.year,
            email: p.email,
        }
    }
}

impl From<&Session> for SessionProto {
    fn from(s: &Session) -> Self {
        Self {
            identity: s.identity.clone(),
            profile: Some((&s.profile).into()),
            language: LanguageProto::from(s.language) as i32,
            lifecycle: LifecycleProto::from(s.lifecycle) as i32,
            current_round: s.current_round,
            round_started_at: s.round_started_at,
            violation_count: s.violation_count,
            scores: s.scores.clone(),
            code: s.code.clone(),
            submitted_at: s.submitted_at,
            connection_id: s.connection_id,
            last_seen_at: s.last_seen_at,
            revision: s.revision,
        }
    }
}

impl TryFrom<SessionProto> for Session {
    type Error = WireError;

    fn try_from(p: SessionProto) -> Result<Self, Self::Error> {
        if p.identity.trim().is_empty() {
            return Err(WireError::EmptyIdentity);
        }
        Ok(Self {
            identity: p.identity,
            profile: p.profile.map(Into::into).unwrap_or_default(),
            language: language_from_i32(p.language)?,
            lifecycle: lifecycle_from_i32(p.lifecycle)?,
            current_round: p.current_round,
            round_started_at: p.round_started_at,
            violation_count: p.violation_count,
            scores: p.scores,
            code: p.code,
            submitted_at: p.submitted_at,
            connection_id: p.connection_id,
            last_seen_at: p.last_seen_at,
            revision: p.revision,
        })
    }
}

impl From<&SessionPatch> for SessionPatchProto {
    fn from(p: &SessionPatch) -> Self {
        Self {
            profile: p.profile.as_ref().map(Into::into),
            lifecycle: p.lifecycle.map(|l| LifecycleProto::from(l) as i32),
            current_round: p.current_round,
            round_started_at: p.round_started_at.map(|at| InstantProto { at }),
            violation_count: p.violation_count,
            scores: p.scores.clone(),
            code: p.code.clone(),
            violations_added: p.violations_added,
        }
    }
}

impl TryFrom<SessionPatchProto> for SessionPatch {
    type Error = WireError;

    fn try_from(p: SessionPatchProto) -> Result<Self, Self::Error> {
        Ok(Self {
            profile: p.profile.map(Into::into),
            lifecycle: p.lifecycle.map(lifecycle_from_i32).transpose()?,
            current_round: p.current_round,
            round_started_at: p.round_started_at.map(|instant| instant.at),
            violation_count: p.violation_count,
            violations_added: p.violations_added,
            scores: p.scores,
            code: p.code,
        })
    }
}

impl From<&ContestConfig> for ConfigProto {
    fn from(c: &ContestConfig) -> Self {
        Self {
            status: GlobalStatusProto::from(c.status) as i32,
            epoch: c.epoch,
            suspended_at: c.suspended_at,
            round_overrides_secs: c.round_overrides_secs.clone(),
            updated_at: c.updated_at,
        }
    }
}

impl TryFrom<ConfigProto> for ContestConfig {
    type Error = WireError;

    fn try_from(c: ConfigProto) -> Result<Self, Self::Error> {
        Ok(Self {
            status: global_status_from_i32(c.status)?,
            epoch: c.epoch,
            suspended_at: c.suspended_at,
            round_overrides_secs: c.round_overrides_secs,
            updated_at: c.updated_at,
        })
    }
}

impl From<&ContestConfig> for ContestStatus {
    fn from(c: &ContestConfig) -> Self {
        Self {
            status: GlobalStatusProto::from(c.status) as i32,
            epoch: c.epoch,
            updated_at: c.updated_at,
        }
    }
}

impl ServerEnvelope {
    pub fn session_state(session: &Session, acked_seq: Seq, resync: bool) -> Self {
        server_envelope::Body::SessionState(SessionState {
            session: Some(session.into()),
            acked_seq,
            resync,
        })
        .into()
    }

    pub fn contest_status(config: &ContestConfig) -> Self {
        server_envelope::Body::ContestStatus(config.into()).into()
    }
}

// ============================================================================
// Frame Helpers
// ============================================================================

/// Decode one inbound transport frame.
pub fn decode_client(frame: &[u8]) -> Result<ClientEnvelope, prost::DecodeError> {
    ClientEnvelope::decode(frame)
}

/// Decode one outbound transport frame.
pub fn decode_server(frame: &[u8]) -> Result<ServerEnvelope, prost::DecodeError> {
    ServerEnvelope::decode(frame)
}

// ============================================================================
// Tests
// ============================================================================
