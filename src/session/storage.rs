//! Durable Session Storage
//!
//! Key-value persistence mirroring the in-memory session so a restart can
//! resume without re-authenticating. Two entries are kept: the access token
//! and the principal (JSON). They are written, read and removed together.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use super::types::{Principal, Session};

/// Key for the access token entry
pub const TOKEN_KEY: &str = "sentinel.access_token";

/// Key for the principal entry
pub const PRINCIPAL_KEY: &str = "sentinel.principal";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value persistence backend
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store (tests, ephemeral sessions)
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

// ============================================================================
// File store
// ============================================================================

/// JSON file holding a flat string map
pub struct FileStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    /// Store at the default location (`<data_local_dir>/sentinel/session.json`)
    pub fn open_default() -> Self {
        Self::new(default_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(data) if data.trim().is_empty() => Ok(HashMap::new()),
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write-then-rename so a crash never leaves a half-written file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load for mutation; an unreadable file is replaced rather than blocking writes
    fn load_for_update(&self) -> Result<HashMap<String, String>, StorageError> {
        match self.load() {
            Ok(entries) => Ok(entries),
            Err(StorageError::Serialization(e)) => {
                warn!("Session file {} is corrupt, resetting: {}", self.path.display(), e);
                Ok(HashMap::new())
            }
            Err(e) => Err(e),
        }
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.read();
        Ok(self.load()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.write();
        let mut entries = self.load_for_update()?;
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.write();
        let mut entries = self.load_for_update()?;
        entries.remove(key);
        self.save(&entries)
    }
}

/// Default session file location
pub fn default_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sentinel")
        .join("session.json")
}

// ============================================================================
// Session mirror
// ============================================================================

/// What was found in durable storage
#[derive(Debug)]
pub enum StoredSession {
    /// Neither entry present
    Absent,
    /// Both entries present and well-formed
    Valid(Session),
    /// Partial, unparseable or unreadable data
    Corrupt(String),
}

/// Read the token and principal entries together
pub fn read_session(store: &dyn SessionStore) -> StoredSession {
    let token = match store.get(TOKEN_KEY) {
        Ok(v) => v,
        Err(e) => return StoredSession::Corrupt(format!("token unreadable: {}", e)),
    };
    let principal = match store.get(PRINCIPAL_KEY) {
        Ok(v) => v,
        Err(e) => return StoredSession::Corrupt(format!("principal unreadable: {}", e)),
    };

    match (token, principal) {
        (None, None) => StoredSession::Absent,
        (Some(_), None) | (None, Some(_)) => StoredSession::Corrupt("partial session entry".into()),
        (Some(token), Some(raw)) => {
            if token.trim().is_empty() {
                return StoredSession::Corrupt("empty access token".into());
            }
            match serde_json::from_str::<Principal>(&raw) {
                Ok(principal) if principal.is_well_formed() => {
                    StoredSession::Valid(Session::new(token, principal))
                }
                Ok(_) => StoredSession::Corrupt("principal email malformed".into()),
                Err(e) => StoredSession::Corrupt(format!("principal unparseable: {}", e)),
            }
        }
    }
}

/// Write both entries; a half-written pair is rolled back
pub fn write_session(store: &dyn SessionStore, session: &Session) -> Result<(), StorageError> {
    let principal = serde_json::to_string(&session.principal)?;

    store.set(TOKEN_KEY, &session.access_token)?;
    if let Err(e) = store.set(PRINCIPAL_KEY, &principal) {
        let _ = store.remove(TOKEN_KEY);
        return Err(e);
    }

    debug!("Persisted session for {}", session.principal.email);
    Ok(())
}

/// Remove both entries, attempting each even if the other fails
pub fn clear_session(store: &dyn SessionStore) -> Result<(), StorageError> {
    let token = store.remove(TOKEN_KEY);
    let principal = store.remove(PRINCIPAL_KEY);
    token.and(principal)
}
