//! Local Store: the role's replica, shared by the UI and every replication channel.
//!
//! All reads are served from SQLite and never wait on the network. UI writes
//! are validated against the collection's entity type before anything is
//! stored, marked dirty, and announced on the local change stream so the
//! owning channel can push without waiting for its next poll.

mod provision;

pub use provision::*;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::db::{CheckpointKey, Database, DbError, LocalEdits, PullApplication};
use crate::models::{
    validate_document, Checkpoint, CollectionName, Document, Entity, Role, SchemaError, StoredDocument,
};

const LOCAL_CHANGE_CAPACITY: usize = 256;

/// Store and provisioning errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Pulled {collection} document {id} is invalid: {source}")]
    InvalidPulled {
        collection: CollectionName,
        id: String,
        #[source]
        source: SchemaError,
    },

    #[error("Collection {collection} is not provisioned for role {role}")]
    CollectionNotProvisioned { role: Role, collection: CollectionName },

    #[error("Collection {collection} is stored at schema version {stored}, newer than supported version {supported}")]
    SchemaDowngrade {
        collection: CollectionName,
        stored: u32,
        supported: u32,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(e: PoisonError<T>) -> Self {
        StoreError::LockPoisoned(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A UI write, announced to the channel replicating that collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub collection: CollectionName,
    pub id: String,
}

/// Outcome of applying a pulled batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullReport {
    pub application: PullApplication,
}

impl PullReport {
    pub fn written(&self) -> usize {
        match self.application {
            PullApplication::Applied { written, .. } => written,
            PullApplication::Stale => 0,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.application == PullApplication::Stale
    }
}

struct StoreInner {
    role: Role,
    db: Mutex<Database>,
    collections: Vec<CollectionName>,
    path: Option<PathBuf>,
    changes: broadcast::Sender<LocalChange>,
}

/// Cheaply cloneable handle to one role's local replica.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("role", &self.inner.role)
            .field("collections", &self.inner.collections)
            .field("path", &self.inner.path)
            .finish()
    }
}

impl LocalStore {
    pub(crate) fn from_parts(
        role: Role,
        db: Database,
        collections: Vec<CollectionName>,
        path: Option<PathBuf>,
    ) -> Self {
        let (changes, _) = broadcast::channel(LOCAL_CHANGE_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                role,
                db: Mutex::new(db),
                collections,
                path,
                changes,
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Collections materialized in this store.
    pub fn collections(&self) -> &[CollectionName] {
        &self.inner.collections
    }

    pub fn has_collection(&self, collection: CollectionName) -> bool {
        self.inner.collections.contains(&collection)
    }

    /// Backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    fn db(&self) -> StoreResult<MutexGuard<'_, Database>> {
        Ok(self.inner.db.lock()?)
    }

    fn ensure(&self, collection: CollectionName) -> StoreResult<()> {
        if self.has_collection(collection) {
            Ok(())
        } else {
            Err(StoreError::CollectionNotProvisioned {
                role: self.inner.role,
                collection,
            })
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, collection: CollectionName, id: &str) -> StoreResult<Option<StoredDocument>> {
        self.ensure(collection)?;
        Ok(self.db()?.get_document(collection.as_str(), id)?)
    }

    pub fn list(&self, collection: CollectionName, include_deleted: bool) -> StoreResult<Vec<StoredDocument>> {
        self.ensure(collection)?;
        Ok(self.db()?.list_documents(collection.as_str(), include_deleted)?)
    }

    pub fn count(&self, collection: CollectionName) -> StoreResult<u64> {
        self.ensure(collection)?;
        Ok(self.db()?.count_documents(collection.as_str())?)
    }

    /// Typed read. Tombstoned documents read as absent.
    pub fn get_entity<T: Entity>(&self, id: &str) -> StoreResult<Option<T>> {
        let stored = match self.get(T::COLLECTION, id)? {
            Some(stored) if !stored.is_deleted() => stored,
            _ => return Ok(None),
        };
        let entity = stored.document.to_entity().map_err(|e| SchemaError::Invalid {
            collection: T::COLLECTION,
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(entity))
    }

    // =========================================================================
    // UI writes
    // =========================================================================

    /// Create or update a document. Returns its new local revision.
    pub fn write(&self, collection: CollectionName, document: &Document) -> StoreResult<i64> {
        self.ensure(collection)?;
        validate_document(collection, document)?;

        let local_rev = self.db()?.write_local_document(collection.as_str(), document)?;
        debug!(collection = %collection, id = %document.id, local_rev, "local write");
        self.announce(collection, &document.id);
        Ok(local_rev)
    }

    /// Create a document under a fresh local id.
    pub fn insert_local(&self, collection: CollectionName, fields: Map<String, Value>) -> StoreResult<Document> {
        let document = Document::new_local(fields);
        self.write(collection, &document)?;
        Ok(document)
    }

    /// Typed write.
    pub fn write_entity<T: Entity>(&self, id: &str, entity: &T) -> StoreResult<i64> {
        let document = Document::from_entity(id, entity)?;
        self.write(T::COLLECTION, &document)
    }

    /// Tombstone a document locally. Returns `false` if it does not exist.
    pub fn delete(&self, collection: CollectionName, id: &str) -> StoreResult<bool> {
        self.ensure(collection)?;
        let deleted = self.db()?.mark_deleted_local(collection.as_str(), id)?;
        if deleted.is_some() {
            self.announce(collection, id);
        }
        Ok(deleted.is_some())
    }

    fn announce(&self, collection: CollectionName, id: &str) {
        // No receivers simply means no channel is live for this store.
        let _ = self.inner.changes.send(LocalChange {
            collection,
            id: id.to_string(),
        });
    }

    /// Stream of UI writes.
    pub fn subscribe_local_changes(&self) -> broadcast::Receiver<LocalChange> {
        self.inner.changes.subscribe()
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Documents with unacknowledged local changes, conflicts included.
    pub fn pending_count(&self, collection: CollectionName) -> StoreResult<u64> {
        self.ensure(collection)?;
        Ok(self.db()?.count_pending(collection.as_str())?)
    }

    pub fn conflicts(&self, collection: CollectionName) -> StoreResult<Vec<StoredDocument>> {
        self.ensure(collection)?;
        Ok(self.db()?.list_conflicts(collection.as_str())?)
    }

    /// Time of the last pull that wrote to this collection.
    pub fn last_pulled_at(&self, collection: CollectionName) -> StoreResult<Option<String>> {
        self.ensure(collection)?;
        Ok(self.db()?.get_sync_state(&last_pull_key(collection))?)
    }

    // =========================================================================
    // Replication
    // =========================================================================

    pub fn checkpoint(&self, replication_id: &str) -> StoreResult<Option<Checkpoint>> {
        Ok(self.db()?.get_checkpoint(replication_id)?)
    }

    /// Apply a pulled batch for one collection together with its checkpoint.
    ///
    /// Every document is validated first; one invalid document rejects the whole
    /// batch and leaves the checkpoint where it was. Unpushed local edits survive
    /// the pull unless the collection never pushes.
    pub fn apply_pull(
        &self,
        collection: CollectionName,
        replication_id: &str,
        context: &str,
        documents: Vec<Document>,
        checkpoint: &Checkpoint,
    ) -> StoreResult<PullReport> {
        self.ensure(collection)?;

        for doc in &documents {
            validate_document(collection, doc).map_err(|source| StoreError::InvalidPulled {
                collection,
                id: doc.id.clone(),
                source,
            })?;
        }

        let key = CheckpointKey {
            replication_id,
            collection: collection.as_str(),
            context,
        };
        let local_edits = if collection.is_read_only() {
            LocalEdits::Overwrite
        } else {
            LocalEdits::Keep
        };

        let mut db = self.db()?;
        let application = db.apply_pulled_batch(key, &documents, checkpoint, local_edits)?;
        if let PullApplication::Applied { written, .. } = application {
            if written > 0 {
                db.set_sync_state(&last_pull_key(collection), &chrono::Utc::now().to_rfc3339())?;
            }
        }

        Ok(PullReport { application })
    }

    /// Next batch of documents to push.
    pub fn pending_batch(&self, collection: CollectionName, limit: usize) -> StoreResult<Vec<StoredDocument>> {
        self.ensure(collection)?;
        Ok(self.db()?.pending_documents(collection.as_str(), limit)?)
    }

    /// Record that the remote accepted a pushed revision.
    pub fn acknowledge(&self, collection: CollectionName, id: &str, local_rev: i64) -> StoreResult<bool> {
        Ok(self.db()?.acknowledge_document(collection.as_str(), id, local_rev)?)
    }

    pub fn mark_conflicted(
        &self,
        collection: CollectionName,
        id: &str,
        reason: &str,
        server_rev: Option<&str>,
    ) -> StoreResult<bool> {
        Ok(self
            .db()?
            .mark_conflicted(collection.as_str(), id, reason, server_rev)?)
    }
}

fn last_pull_key(collection: CollectionName) -> String {
    format!("last_pull:{}", collection)
}
