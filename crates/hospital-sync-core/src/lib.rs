//! Hospital Sync Core
//!
//! Offline-first replication for the hospital management desktop app. Every
//! signed-in role gets its own SQLite store holding only the collections it is
//! authorized for; replication channels keep those collections in step with
//! the remote authority while the UI reads and writes locally.
//!
//! # Architecture
//!
//! ```text
//!     UI reads/writes
//!           │
//!     ┌─────▼──────┐     local change      ┌──────────────────────┐
//!     │ LocalStore │ ────────────────────► │ ReplicationChannel   │ ─── push ──►  remote
//!     │ (per role) │ ◄──── apply_pull ──── │ (one per collection) │ ◄── pull ───  authority
//!     └────────────┘                       └──────────▲───────────┘
//!                                                     │ start/stop/pause/resume
//!                                              ┌──────┴──────┐
//!                                              │ SyncManager │ ◄── context switch
//!                                              └──────▲──────┘
//!                                                     │ bind / unbind
//!                                              ┌──────┴──────┐
//!                                              │ SyncSession │ ◄── sign-in, sign-out
//!                                              └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`db`]: SQLite layer (collections, documents, checkpoints)
//! - [`models`]: Roles, collections, contexts, documents and entity types
//! - [`store`]: Per-role local store and collection provisioning
//! - [`sync`]: Wire protocol, transports, channels, manager and session
//! - [`config`]: TOML configuration

pub mod config;
pub mod db;
pub mod models;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use config::{ConfigError, SyncConfig};
pub use db::Database;
pub use models::{Checkpoint, CollectionName, Document, Role, StoredDocument, SyncContext};
pub use store::{LocalStore, StoreError, StoreLocation};
pub use sync::{
    HttpRemote, Identity, InMemoryRemote, RemoteSource, ReplicationChannel, SyncError, SyncManager,
    SyncSession, SyncStatus,
};

// UniFFI setup - using proc macros
uniffi::setup_scaffolding!();

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

// =========================================================================
// FFI Error Type
// =========================================================================

#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum HospitalSyncError {
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Sync error: {0}")]
    SyncError(String),

    #[error("Not signed in")]
    NotSignedIn,
}

impl From<db::DbError> for HospitalSyncError {
    fn from(e: db::DbError) -> Self {
        HospitalSyncError::StorageError(e.to_string())
    }
}

impl From<models::SchemaError> for HospitalSyncError {
    fn from(e: models::SchemaError) -> Self {
        HospitalSyncError::InvalidInput(e.to_string())
    }
}

impl From<serde_json::Error> for HospitalSyncError {
    fn from(e: serde_json::Error) -> Self {
        HospitalSyncError::InvalidInput(e.to_string())
    }
}

impl From<StoreError> for HospitalSyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Schema(e) => e.into(),
            other => HospitalSyncError::StorageError(other.to_string()),
        }
    }
}

impl From<ConfigError> for HospitalSyncError {
    fn from(e: ConfigError) -> Self {
        HospitalSyncError::ConfigError(e.to_string())
    }
}

impl From<SyncError> for HospitalSyncError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Store(e) => e.into(),
            SyncError::Schema(e) => e.into(),
            SyncError::NotBound => HospitalSyncError::NotSignedIn,
            other => HospitalSyncError::SyncError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for HospitalSyncError {
    fn from(e: std::io::Error) -> Self {
        HospitalSyncError::SyncError(format!("Runtime unavailable: {}", e))
    }
}

// =========================================================================
// Factory Functions (exported to FFI)
// =========================================================================

/// Open the sync core with a TOML config file. Without a path, defaults apply
/// and role stores live in the platform data directory.
#[uniffi::export]
pub fn open_sync_core(config_path: Option<String>) -> Result<Arc<HospitalSyncCore>, HospitalSyncError> {
    let config = match config_path {
        Some(path) => SyncConfig::load(Path::new(&path))?,
        None => {
            let config = SyncConfig::default();
            config.validate()?;
            config
        }
    };
    HospitalSyncCore::with_config(config)
}

/// Open the sync core from an inline TOML document.
#[uniffi::export]
pub fn open_sync_core_from_toml(toml: String) -> Result<Arc<HospitalSyncCore>, HospitalSyncError> {
    HospitalSyncCore::with_config(SyncConfig::from_toml_str(&toml)?)
}

// =========================================================================
// Main API Object
// =========================================================================

/// Blocking facade over the async session for the desktop shell.
#[derive(uniffi::Object)]
pub struct HospitalSyncCore {
    runtime: tokio::runtime::Runtime,
    session: SyncSession,
}

impl HospitalSyncCore {
    fn with_config(config: SyncConfig) -> Result<Arc<Self>, HospitalSyncError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("hospital-sync")
            .build()?;
        Ok(Arc::new(Self {
            runtime,
            session: SyncSession::with_http(config),
        }))
    }

    fn bound_store(&self) -> Result<LocalStore, HospitalSyncError> {
        self.session.store().ok_or(HospitalSyncError::NotSignedIn)
    }
}

#[uniffi::export]
impl HospitalSyncCore {
    // =========================================================================
    // Session Lifecycle
    // =========================================================================

    /// Sign in (or switch identity). Local data is usable when this returns.
    pub fn sign_in(&self, role: String, token: String) -> Result<(), HospitalSyncError> {
        let role: Role = role.parse()?;
        self.runtime.block_on(self.session.bind(Identity::new(role, token)))?;
        Ok(())
    }

    /// Stop replication. With `purge`, the role's store file is deleted.
    pub fn sign_out(&self, purge: bool) -> Result<(), HospitalSyncError> {
        self.runtime.block_on(self.session.sign_out(purge))?;
        Ok(())
    }

    /// Replicate the collections of a new screen context. Returns `false` if
    /// another switch was still running.
    pub fn switch_context(&self, context: String) -> Result<bool, HospitalSyncError> {
        let context: SyncContext = context.parse()?;
        Ok(self.runtime.block_on(self.session.switch_context(context))?)
    }

    pub fn pause_sync(&self) -> Result<u32, HospitalSyncError> {
        Ok(self.runtime.block_on(self.session.pause())? as u32)
    }

    pub fn resume_sync(&self) -> Result<u32, HospitalSyncError> {
        Ok(self.runtime.block_on(self.session.resume())? as u32)
    }

    pub fn status(&self) -> FfiSyncStatus {
        self.session.status().into()
    }

    /// Unacknowledged local changes per live collection.
    pub fn pending_changes(&self) -> Result<Vec<FfiPendingCount>, HospitalSyncError> {
        let pending = self.runtime.block_on(self.session.pending_changes())?;
        Ok(pending
            .into_iter()
            .map(|(collection, count)| FfiPendingCount {
                collection: collection.to_string(),
                count,
            })
            .collect())
    }

    // =========================================================================
    // Document Operations
    // =========================================================================

    /// Get a document as JSON. Tombstones read as absent.
    pub fn get_document(
        &self,
        collection: String,
        id: String,
    ) -> Result<Option<FfiDocument>, HospitalSyncError> {
        let collection: CollectionName = collection.parse()?;
        let stored = self.bound_store()?.get(collection, &id)?;
        stored
            .filter(|s| !s.is_deleted())
            .map(FfiDocument::try_from)
            .transpose()
    }

    pub fn list_documents(&self, collection: String) -> Result<Vec<FfiDocument>, HospitalSyncError> {
        let collection: CollectionName = collection.parse()?;
        let docs = self.bound_store()?.list(collection, false)?;
        docs.into_iter().map(FfiDocument::try_from).collect()
    }

    /// Create or update a document from a JSON object. Objects without an
    /// `id` are created under a fresh local id.
    pub fn put_document(&self, collection: String, json: String) -> Result<FfiDocument, HospitalSyncError> {
        let collection: CollectionName = collection.parse()?;
        let store = self.bound_store()?;
        let id = match serde_json::from_str::<Value>(&json)? {
            Value::Object(fields) if !fields.contains_key("id") => {
                store.insert_local(collection, fields)?.id
            }
            value => {
                let document = Document::from_value(value)?;
                store.write(collection, &document)?;
                document.id
            }
        };
        let stored = store
            .get(collection, &id)?
            .ok_or_else(|| HospitalSyncError::StorageError(format!("{} {} vanished", collection, id)))?;
        FfiDocument::try_from(stored)
    }

    pub fn delete_document(&self, collection: String, id: String) -> Result<bool, HospitalSyncError> {
        let collection: CollectionName = collection.parse()?;
        Ok(self.bound_store()?.delete(collection, &id)?)
    }

    /// Documents the remote rejected with a conflict.
    pub fn list_conflicts(&self, collection: String) -> Result<Vec<FfiDocument>, HospitalSyncError> {
        let collection: CollectionName = collection.parse()?;
        let docs = self.bound_store()?.conflicts(collection)?;
        docs.into_iter().map(FfiDocument::try_from).collect()
    }
}

// =========================================================================
// FFI Types
// =========================================================================

/// FFI-safe session status.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSyncStatus {
    pub is_ready: bool,
    pub is_syncing: bool,
    pub error: Option<String>,
    pub current_context: Option<String>,
    pub role: Option<String>,
    pub last_sync_error: Option<String>,
}

impl From<SyncStatus> for FfiSyncStatus {
    fn from(status: SyncStatus) -> Self {
        Self {
            is_ready: status.is_ready,
            is_syncing: status.is_syncing,
            error: status.error,
            current_context: status.current_context.map(|c| c.to_string()),
            role: status.role.map(|r| r.to_string()),
            last_sync_error: status.last_sync_error,
        }
    }
}

/// FFI-safe pending change count.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPendingCount {
    pub collection: String,
    pub count: u64,
}

/// FFI-safe document with its replication metadata.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiDocument {
    pub collection: String,
    pub id: String,
    /// Domain fields as a JSON object.
    pub json: String,
    pub updated_at: Option<String>,
    pub pending: bool,
    pub conflict_reason: Option<String>,
}

impl TryFrom<StoredDocument> for FfiDocument {
    type Error = HospitalSyncError;

    fn try_from(stored: StoredDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            collection: stored.collection.to_string(),
            json: stored.document.fields_json()?,
            id: stored.document.id,
            updated_at: stored.document.updated_at,
            pending: stored.dirty,
            conflict_reason: stored.conflict.map(|c| c.reason),
        })
    }
}
