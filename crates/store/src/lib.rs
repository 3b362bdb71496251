//! Vigil Session Store
//!
//! The Session Store is the single source of truth for session content. It
//! is a service object with an explicit lifecycle: opened at startup
//! (loading every record from its [`Backend`]), handed to the coordinator,
//! flushed at shutdown.
//!
//! # Durability
//!
//! Accepted changes land in memory first and are then written through.
//! A failed write never loses the in-memory state: the record is marked
//! dirty, the store reports [`Durability::Degraded`], and [`SessionStore::flush`]
//! retries on every call until the backend accepts the writes again.
//!
//! # Revisions
//!
//! [`SessionStore::commit`] bumps `revision` whenever session content
//! changes. Server-derived fields (`connection_id`, `last_seen_at`) never
//! bump it and are only persisted alongside content changes.

#![deny(unsafe_code)]

pub mod backend;
pub mod record;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::{info, warn};
use vigil_session::{ConnectionId, ContestConfig, Identity, Millis, Session};
use vigil_wire::WireError;

pub use backend::{Backend, MemoryBackend, RedbBackend};

/// Database file name inside the data directory.
pub const DB_FILE_NAME: &str = "vigil.redb";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid record: {0}")]
    Wire(#[from] WireError),

    #[error("record checksum mismatch")]
    ChecksumMismatch,

    #[error("unsupported record format version {0}")]
    UnsupportedVersion(u32),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Session Store
// ============================================================================

/// Durability condition for operational monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Healthy,
    /// Writes are failing; `pending` records wait for retry.
    Degraded { pending: usize },
}

impl Durability {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Result of committing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    /// Content changed and the revision was bumped.
    pub changed: bool,
    pub revision: u64,
}

pub struct SessionStore {
    backend: Box<dyn Backend>,
    sessions: BTreeMap<Identity, Session>,
    config: ContestConfig,
    dirty: BTreeSet<Identity>,
    config_dirty: bool,
    clear_pending: bool,
    degraded: bool,
}

impl SessionStore {
    /// Load every record from `backend`.
    ///
    /// Backend failures here are fatal. Individual records that fail
    /// verification are skipped.
    pub fn open(backend: Box<dyn Backend>) -> Result<Self, StoreError> {
        let mut sessions = BTreeMap::new();
        for (key, bytes) in backend.load_sessions()? {
            match record::decode_session(&bytes) {
                Ok(mut session) if session.identity == key => {
                    // Connection ids restart with the process.
                    session.connection_id = None;
                    sessions.insert(key, session);
                }
                Ok(session) => {
                    warn!(key = %key, identity = %session.identity, "session record key mismatch, skipping");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "unreadable session record, skipping");
                }
            }
        }

        let config = match backend.load_config()? {
            Some(bytes) => record::decode_config(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "unreadable contest config, using defaults");
                ContestConfig::default()
            }),
            None => ContestConfig::default(),
        };

        info!(
            sessions = sessions.len(),
            status = config.status.as_str(),
            epoch = config.epoch,
            "session store loaded"
        );

        Ok(Self {
            backend,
            sessions,
            config,
            dirty: BTreeSet::new(),
            config_dirty: false,
            clear_pending: false,
            degraded: false,
        })
    }

    /// Open the redb database in `data_dir`.
    pub fn open_dir(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", data_dir.display())))?;
        let backend = RedbBackend::open(data_dir.join(DB_FILE_NAME))?;
        Self::open(Box::new(backend))
    }

    /// Empty store over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryBackend::new()),
            sessions: BTreeMap::new(),
            config: ContestConfig::default(),
            dirty: BTreeSet::new(),
            config_dirty: false,
            clear_pending: false,
            degraded: false,
        }
    }

    pub fn get(&self, identity: &str) -> Option<&Session> {
        self.sessions.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    /// All sessions, ordered by identity.
    pub fn all(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session whose last recorded connection is `conn`.
    pub fn find_by_connection(&self, conn: ConnectionId) -> Option<&Session> {
        self.sessions
            .values()
            .find(|s| s.connection_id == Some(conn))
    }

    /// Store `session`, bumping its revision if content changed.
    pub fn commit(&mut self, mut session: Session) -> Committed {
        let identity = session.identity.clone();
        let previous = self.sessions.get(&identity);

        if let Some(previous) = previous
            && previous.same_content(&session)
        {
            let revision = previous.revision;
            session.revision = revision;
            self.sessions.insert(identity, session);
            return Committed {
                changed: false,
                revision,
            };
        }

        let revision = previous.map_or(0, |p| p.revision) + 1;
        session.revision = revision;
        self.sessions.insert(identity.clone(), session);
        self.persist(&identity);
        Committed {
            changed: true,
            revision,
        }
    }

    /// Record liveness without a content write.
    pub fn touch(&mut self, identity: &str, conn: ConnectionId, now: Millis) -> bool {
        match self.sessions.get_mut(identity) {
            Some(session) => {
                session.connection_id = Some(conn);
                session.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    /// Drop every session (administrative full reset).
    pub fn clear(&mut self) {
        let dropped = self.sessions.len();
        self.sessions.clear();
        self.dirty.clear();
        match self.backend.clear_sessions() {
            Ok(()) => self.clear_pending = false,
            Err(e) => {
                self.clear_pending = true;
                self.enter_degraded(&e);
            }
        }
        info!(dropped, "session store cleared");
    }

    pub fn config(&self) -> &ContestConfig {
        &self.config
    }

    /// Replace the contest config and write it through.
    pub fn set_config(&mut self, config: ContestConfig) {
        self.config = config;
        match self.backend.put_config(&record::encode_config(&self.config)) {
            Ok(()) => self.config_dirty = false,
            Err(e) => {
                self.config_dirty = true;
                self.enter_degraded(&e);
            }
        }
    }

    /// Retry every pending write.
    pub fn flush(&mut self) -> Durability {
        if !self.degraded {
            return Durability::Healthy;
        }

        if self.clear_pending {
            match self.backend.clear_sessions() {
                Ok(()) => self.clear_pending = false,
                Err(_) => return self.durability(),
            }
        }

        if self.config_dirty {
            match self.backend.put_config(&record::encode_config(&self.config)) {
                Ok(()) => self.config_dirty = false,
                Err(_) => return self.durability(),
            }
        }

        let pending: Vec<Identity> = self.dirty.iter().cloned().collect();
        for identity in pending {
            let Some(session) = self.sessions.get(&identity) else {
                self.dirty.remove(&identity);
                continue;
            };
            match self
                .backend
                .put_session(&identity, &record::encode_session(session))
            {
                Ok(()) => {
                    self.dirty.remove(&identity);
                }
                Err(_) => return self.durability(),
            }
        }

        self.degraded = false;
        info!("durability restored");
        Durability::Healthy
    }

    pub fn durability(&self) -> Durability {
        if self.degraded {
            Durability::Degraded {
                pending: self.dirty.len()
                    + usize::from(self.config_dirty)
                    + usize::from(self.clear_pending),
            }
        } else {
            Durability::Healthy
        }
    }

    fn persist(&mut self, identity: &str) {
        let Some(session) = self.sessions.get(identity) else {
            return;
        };
        if self.degraded {
            // Keep write order: earlier failures go first on flush.
            self.dirty.insert(identity.to_string());
            return;
        }
        match self
            .backend
            .put_session(identity, &record::encode_session(session))
        {
            Ok(()) => {
                self.dirty.remove(identity);
            }
            Err(e) => {
                self.dirty.insert(identity.to_string());
                self.enter_degraded(&e);
            }
        }
    }

    fn enter_degraded(&mut self, error: &StoreError) {
        if !self.degraded {
            warn!(error = %error, "durable store unavailable, serving from memory");
        }
        self.degraded = true;
    }
}

// ============================================================================
// Tests
// ============================================================================
