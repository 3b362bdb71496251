//! Inbound message validation for the coordinator.
//!
//! Rules:
//! - Message from a connection that is not open: DROP
//! - Missing or undecodable snapshot/patch: DROP + WARN
//! - Update for an identity not bound to the sending connection: DROP
//!   (INFO when a newer connection owns it, WARN when nobody does)
//! - Update seq not above the last acked seq: DROP, re-ack
//! - Admin message from a connection without the admin slot: DROP + WARN

use vigil_session::{Identity, Session, SessionPatch};
use vigil_wire::{RegisterProto, Seq, UpdateProto};

use crate::registry::ConnectionRegistry;

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Content changed and was committed.
    Applied,
    /// Accepted; nothing changed.
    Unchanged,
    /// Snapshot was behind the stored revision; client told to resync.
    Resync,
    /// Answered without touching any session.
    Answered,
    /// Rejected admin command, reported back to the admin.
    Rejected { reason: String },
    /// Dropped: connection is not open.
    DroppedUnknownConnection,
    /// Dropped: message could not be interpreted.
    DroppedMalformed { reason: String },
    /// Dropped: a newer connection owns the identity.
    DroppedStaleConnection,
    /// Dropped: identity was never registered.
    DroppedUnknownIdentity,
    /// Dropped: update seq already applied.
    DroppedDuplicateSeq { seq: Seq, acked: Seq },
    /// Dropped: admin message without the admin slot.
    DroppedNotAdmin,
    /// Dropped: empty envelope.
    DroppedEmpty,
}

impl Disposition {
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            Self::Applied | Self::Unchanged | Self::Resync | Self::Answered
        )
    }

    pub fn is_dropped(&self) -> bool {
        !self.is_accepted() && !matches!(self, Self::Rejected { .. })
    }
}

/// A decoded register or heartbeat.
#[derive(Debug, Clone)]
pub struct Registration {
    pub snapshot: Session,
    pub base_revision: u64,
    pub seq: Seq,
    pub epoch: u64,
}

/// Decode a register/heartbeat payload.
pub fn validate_register(msg: RegisterProto) -> Result<Registration, Disposition> {
    let proto = msg.snapshot.ok_or_else(|| Disposition::DroppedMalformed {
        reason: "register without snapshot".into(),
    })?;
    let snapshot = Session::try_from(proto).map_err(|e| Disposition::DroppedMalformed {
        reason: e.to_string(),
    })?;
    Ok(Registration {
        snapshot,
        base_revision: msg.base_revision,
        seq: msg.seq,
        epoch: msg.epoch,
    })
}

/// A decoded candidate update.
#[derive(Debug, Clone)]
pub struct Update {
    pub identity: Identity,
    pub patch: SessionPatch,
    pub base_revision: u64,
    pub seq: Seq,
}

/// Decode an update and check it comes from the identity's current
/// connection with a fresh seq.
///
/// # Arguments
/// * `msg` - The update as received
/// * `conn` - Connection it arrived on (bound by the coordinator, not the message)
/// * `registry` - Current connection bindings
pub fn validate_update(
    msg: UpdateProto,
    conn: vigil_session::ConnectionId,
    registry: &ConnectionRegistry,
) -> Result<Update, Disposition> {
    let proto = msg.patch.ok_or_else(|| Disposition::DroppedMalformed {
        reason: "update without patch".into(),
    })?;
    let patch = SessionPatch::try_from(proto).map_err(|e| Disposition::DroppedMalformed {
        reason: e.to_string(),
    })?;

    match registry.identity_of(conn) {
        Some(bound) if *bound == msg.identity => {}
        _ => {
            return Err(match registry.connection_of(&msg.identity) {
                Some(_) => Disposition::DroppedStaleConnection,
                None => Disposition::DroppedUnknownIdentity,
            });
        }
    }

    let acked = registry.acked_seq(conn);
    if msg.seq <= acked {
        return Err(Disposition::DroppedDuplicateSeq {
            seq: msg.seq,
            acked,
        });
    }

    Ok(Update {
        identity: msg.identity,
        patch,
        base_revision: msg.base_revision,
        seq: msg.seq,
    })
}
