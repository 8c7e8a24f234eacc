//! Durable storage for the credential pair.
//!
//! Defines the [`CredentialStore`] trait plus two implementations:
//! - [`MemoryCredentialStore`]: process-local, for tests and embedding
//! - [`FileCredentialStore`]: a JSON file holding the pair under the fixed
//!   keys `access_token` and `refresh_token`

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// The two credentials that make up a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    /// Short-lived bearer credential.
    #[serde(rename = "access_token")]
    pub access: String,
    /// Long-lived credential used only to mint new access credentials.
    #[serde(rename = "refresh_token")]
    pub refresh: String,
}

impl CredentialPair {
    /// Creates a pair.
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }
}

/// Errors from reading or writing stored credentials.
#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    /// The backing file could not be read or written.
    #[error("credential file {path}: {source}")]
    Io {
        /// File that was accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The stored data is not a credential pair.
    #[error("credential file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Storage for the process-wide credential pair.
///
/// Only the session layer writes through this trait, and only under its
/// single-flight refresh discipline.
pub trait CredentialStore: Send + Sync + 'static {
    /// Returns the stored pair, or `None` when logged out.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError`] if storage cannot be read.
    fn load(&self) -> Result<Option<CredentialPair>, CredentialStoreError>;

    /// Replace both credentials.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError`] if storage cannot be written.
    fn save(&self, pair: &CredentialPair) -> Result<(), CredentialStoreError>;

    /// Destroy both credentials.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError`] if storage cannot be cleared.
    fn clear(&self) -> Result<(), CredentialStoreError>;
}

/// Keeps credentials in memory only.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    pair: Mutex<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    /// Creates an empty (logged-out) store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store already holding `pair`.
    #[must_use]
    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: Mutex::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<CredentialPair>, CredentialStoreError> {
        Ok(self.pair.lock().clone())
    }

    fn save(&self, pair: &CredentialPair) -> Result<(), CredentialStoreError> {
        *self.pair.lock() = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialStoreError> {
        *self.pair.lock() = None;
        Ok(())
    }
}

/// Persists credentials as a small JSON file.
///
/// A missing file means "logged out". Writes go through a sibling temp file
/// and a rename so a crash never leaves a half-written pair.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Creates a store backed by `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CredentialStoreError {
        CredentialStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<CredentialPair>, CredentialStoreError> {
        let _guard = self.lock.lock();
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn save(&self, pair: &CredentialPair) -> Result<(), CredentialStoreError> {
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(pair)?;
        std::fs::write(&tmp, bytes).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    fn clear(&self) -> Result<(), CredentialStoreError> {
        let _guard = self.lock.lock();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}
