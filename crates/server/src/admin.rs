//! Admin Command Router helpers.
//!
//! Resolves the admin's connection-scope target to an identity and maps a
//! command to session intents. Application and fan-out happen in the
//! coordinator.

use vigil_session::{Identity, Intent, Rejection, Session, SessionPatch, admin_intents};
use vigil_store::SessionStore;
use vigil_wire::admin_command_proto::{Kind, Target};
use vigil_wire::WireError;

use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command has no target")]
    MissingTarget,
    #[error("command has no kind")]
    MissingKind,
    #[error("unknown target {0}")]
    UnknownTarget(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] WireError),
    #[error("{0}")]
    Rejected(#[from] Rejection),
}

/// Resolve a command target to the identity whose record is mutated.
///
/// A connection id is looked up in the live registry first, then among
/// the last connection each session was seen on, so commands issued from a
/// slightly old admin view still land on the right record.
pub fn resolve_target(
    target: Option<&Target>,
    registry: &ConnectionRegistry,
    store: &SessionStore,
) -> Result<Identity, CommandError> {
    match target.ok_or(CommandError::MissingTarget)? {
        Target::ConnectionId(conn) => registry
            .identity_of(*conn)
            .cloned()
            .or_else(|| store.find_by_connection(*conn).map(|s| s.identity.clone()))
            .ok_or_else(|| CommandError::UnknownTarget(format!("connection {conn}"))),
        Target::Identity(identity) if store.contains(identity) => Ok(identity.clone()),
        Target::Identity(identity) => Err(CommandError::UnknownTarget(identity.clone())),
    }
}

/// Intents implementing `kind` against `current`.
pub fn command_intents(kind: &Kind, current: &Session) -> Result<Vec<Intent>, CommandError> {
    Ok(match kind {
        Kind::ForceTerminate(_) => vec![Intent::Disqualify],
        Kind::Unlock(_) => vec![Intent::Unlock],
        Kind::ForceSubmit(_) => vec![Intent::ForceSubmit],
        Kind::AddTime(add) => vec![Intent::AddTime {
            minutes: add.minutes,
        }],
        Kind::SetRound(set) => vec![Intent::SetRound { round: set.round }],
        Kind::EditProfile(profile) => vec![Intent::EditProfile(profile.clone().into())],
        Kind::ForceUpdate(patch) => {
            let patch = SessionPatch::try_from(patch.clone())?;
            admin_intents(current, &patch)?
        }
    })
}
