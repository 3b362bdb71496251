//! Storage backends.
//!
//! Backends move opaque record bytes; encoding and verification live in
//! [`crate::record`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use redb::{Database, ReadableTable, TableDefinition};

use crate::StoreError;

const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const META_CONFIG: &str = "contest_config";

/// Keyed persistence for session and config records.
pub trait Backend: Send {
    /// Insert or replace the record for `identity`.
    fn put_session(&mut self, identity: &str, record: &[u8]) -> Result<(), StoreError>;

    /// Full scan of all session records.
    fn load_sessions(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Remove every session record.
    fn clear_sessions(&mut self) -> Result<(), StoreError>;

    fn put_config(&mut self, record: &[u8]) -> Result<(), StoreError>;

    fn load_config(&self) -> Result<Option<Vec<u8>>, StoreError>;
}

// ============================================================================
// redb
// ============================================================================

/// Single-file redb database.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }
}

impl Backend for RedbBackend {
    fn put_session(&mut self, identity: &str, record: &[u8]) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            table.insert(identity, record)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            records.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(records)
    }

    fn clear_sessions(&mut self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        write_txn.delete_table(SESSIONS_TABLE)?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn put_config(&mut self, record: &[u8]) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(META_CONFIG, record)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_config(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        Ok(table.get(META_CONFIG)?.map(|value| value.value().to_vec()))
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    sessions: BTreeMap<String, Vec<u8>>,
    config: Option<Vec<u8>>,
    failing: bool,
    writes: u64,
}

/// Process-local backend. Cloned handles share the same contents, so a
/// caller can keep one to inspect or break the backend a store owns.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every subsequent operation fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Successful writes so far.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Place raw bytes under `identity`, bypassing the codec.
    pub fn insert_raw(&self, identity: &str, bytes: Vec<u8>) {
        self.lock().sessions.insert(identity.to_string(), bytes);
    }

    fn check(inner: &MemoryInner) -> Result<(), StoreError> {
        if inner.failing {
            Err(StoreError::Unavailable("memory backend set to fail".into()))
        } else {
            Ok(())
        }
    }
}

impl Backend for MemoryBackend {
    fn put_session(&mut self, identity: &str, record: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check(&inner)?;
        inner.sessions.insert(identity.to_string(), record.to_vec());
        inner.writes += 1;
        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let inner = self.lock();
        Self::check(&inner)?;
        Ok(inner
            .sessions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear_sessions(&mut self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check(&inner)?;
        inner.sessions.clear();
        inner.writes += 1;
        Ok(())
    }

    fn put_config(&mut self, record: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check(&inner)?;
        inner.config = Some(record.to_vec());
        inner.writes += 1;
        Ok(())
    }

    fn load_config(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.lock();
        Self::check(&inner)?;
        Ok(inner.config.clone())
    }
}
