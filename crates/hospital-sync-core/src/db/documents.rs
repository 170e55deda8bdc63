//! Document storage: pulled state, local edits and push bookkeeping.

use super::checkpoints::{load_checkpoint, store_checkpoint, CheckpointKey};
use super::{Database, DbError, DbResult};
use crate::models::{compare_timestamps, Checkpoint, CollectionName, ConflictRecord, Document, StoredDocument};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::cmp::Ordering;

const DOCUMENT_COLUMNS: &str = "collection, id, body, updated_at, deleted, dirty, local_rev, \
     conflict_reason, server_rev, local_modified_at";

/// Result of applying one pulled batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullApplication {
    /// The batch's checkpoint was not ahead of the stored one; nothing was written.
    Stale,
    Applied {
        written: usize,
        /// Documents older than the copy already held, or with an unpushed local edit.
        skipped: usize,
    },
}

/// How a pulled batch treats documents carrying an unpushed local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEdits {
    /// Leave them for the next push.
    Keep,
    /// The server copy wins; for collections whose edits never leave the device.
    Overwrite,
}

/// Database row representation of a document.
struct DocumentRow {
    collection: String,
    id: String,
    body: String,
    updated_at: Option<String>,
    deleted: bool,
    dirty: bool,
    local_rev: i64,
    conflict_reason: Option<String>,
    server_rev: Option<String>,
    local_modified_at: Option<String>,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            collection: row.get(0)?,
            id: row.get(1)?,
            body: row.get(2)?,
            updated_at: row.get(3)?,
            deleted: row.get(4)?,
            dirty: row.get(5)?,
            local_rev: row.get(6)?,
            conflict_reason: row.get(7)?,
            server_rev: row.get(8)?,
            local_modified_at: row.get(9)?,
        })
    }
}

impl TryFrom<DocumentRow> for StoredDocument {
    type Error = DbError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let collection: CollectionName = row
            .collection
            .parse()
            .map_err(|_| DbError::Constraint(format!("unknown collection '{}'", row.collection)))?;
        let fields: Map<String, Value> = serde_json::from_str(&row.body)?;

        Ok(StoredDocument {
            collection,
            document: Document {
                id: row.id,
                updated_at: row.updated_at,
                deleted: row.deleted,
                fields,
            },
            dirty: row.dirty,
            local_rev: row.local_rev,
            conflict: row.conflict_reason.map(|reason| ConflictRecord {
                reason,
                server_rev: row.server_rev,
            }),
            local_modified_at: row.local_modified_at,
        })
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn query_documents(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> DbResult<Vec<StoredDocument>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, DocumentRow::from_row)?;

    let mut documents = Vec::new();
    for row in rows {
        documents.push(StoredDocument::try_from(row?)?);
    }
    Ok(documents)
}

/// Write a document received from the remote. Overwrites acknowledged state and
/// clears conflict state. Returns false when the held copy carries a newer
/// server timestamp, or a local edit that has not been pushed yet.
fn upsert_pulled(
    conn: &Connection,
    collection: &str,
    document: &Document,
    local_edits: LocalEdits,
) -> DbResult<bool> {
    let held: Option<(Option<String>, bool, bool)> = conn
        .query_row(
            "SELECT updated_at, dirty, conflict_reason IS NOT NULL FROM documents WHERE collection = ? AND id = ?",
            params![collection, document.id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    if let Some((held_updated_at, dirty, conflicted)) = held {
        // Still queued for push; the next push settles it either way.
        if local_edits == LocalEdits::Keep && dirty && !conflicted {
            return Ok(false);
        }
        if let (Some(held), Some(incoming)) = (held_updated_at.as_ref(), document.updated_at.as_ref()) {
            if compare_timestamps(incoming, held) == Ordering::Less {
                return Ok(false);
            }
        }
    }

    conn.execute(
        "INSERT INTO documents (collection, id, body, updated_at, deleted, dirty)
         VALUES (?, ?, ?, ?, ?, 0)
         ON CONFLICT(collection, id) DO UPDATE SET
            body = excluded.body,
            updated_at = excluded.updated_at,
            deleted = excluded.deleted,
            dirty = 0,
            conflict_reason = NULL,
            server_rev = NULL",
        params![
            collection,
            document.id,
            document.fields_json()?,
            document.updated_at,
            document.deleted,
        ],
    )?;
    Ok(true)
}

impl Database {
    /// Get a document by id, tombstones included.
    pub fn get_document(&self, collection: &str, id: &str) -> DbResult<Option<StoredDocument>> {
        let sql = format!("SELECT {} FROM documents WHERE collection = ? AND id = ?", DOCUMENT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![collection, id], DocumentRow::from_row)
            .optional()?;

        row.map(StoredDocument::try_from).transpose()
    }

    /// List documents of a collection ordered by id.
    pub fn list_documents(&self, collection: &str, include_deleted: bool) -> DbResult<Vec<StoredDocument>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE collection = ? AND (deleted = 0 OR ?) ORDER BY id",
            DOCUMENT_COLUMNS
        );
        query_documents(&self.conn, &sql, params![collection, include_deleted])
    }

    /// Count documents that are visible (not tombstoned).
    pub fn count_documents(&self, collection: &str) -> DbResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ? AND deleted = 0",
            [collection],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Record a local edit. Returns the new local revision.
    pub fn write_local_document(&self, collection: &str, document: &Document) -> DbResult<i64> {
        let local_rev: i64 = self.conn.query_row(
            "INSERT INTO documents (collection, id, body, updated_at, deleted, dirty, local_rev, local_modified_at)
             VALUES (?1, ?2, ?3, NULL, ?4, 1, 1, ?5)
             ON CONFLICT(collection, id) DO UPDATE SET
                body = excluded.body,
                deleted = excluded.deleted,
                dirty = 1,
                local_rev = documents.local_rev + 1,
                local_modified_at = excluded.local_modified_at
             RETURNING local_rev",
            params![collection, document.id, document.fields_json()?, document.deleted, now()],
            |row| row.get(0),
        )?;
        Ok(local_rev)
    }

    /// Tombstone a document locally. Returns the new local revision, or `None`
    /// when the document does not exist.
    pub fn mark_deleted_local(&self, collection: &str, id: &str) -> DbResult<Option<i64>> {
        self.conn
            .query_row(
                "UPDATE documents SET deleted = 1, dirty = 1, local_rev = local_rev + 1, local_modified_at = ?
                 WHERE collection = ? AND id = ?
                 RETURNING local_rev",
                params![now(), collection, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Dirty, non-conflicted documents in the order they were modified.
    pub fn pending_documents(&self, collection: &str, limit: usize) -> DbResult<Vec<StoredDocument>> {
        let sql = format!(
            "SELECT {} FROM documents
             WHERE collection = ? AND dirty = 1 AND conflict_reason IS NULL
             ORDER BY local_modified_at, rowid
             LIMIT ?",
            DOCUMENT_COLUMNS
        );
        query_documents(&self.conn, &sql, params![collection, limit as i64])
    }

    /// Number of documents carrying unacknowledged local changes, conflicts included.
    pub fn count_pending(&self, collection: &str) -> DbResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ? AND dirty = 1",
            [collection],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Clear the dirty flag after the remote accepted a push, unless the
    /// document was edited again since that push was built.
    pub fn acknowledge_document(&self, collection: &str, id: &str, local_rev: i64) -> DbResult<bool> {
        let updated = self.conn.execute(
            "UPDATE documents SET dirty = 0
             WHERE collection = ? AND id = ? AND local_rev = ? AND dirty = 1",
            params![collection, id, local_rev],
        )?;
        Ok(updated > 0)
    }

    /// Record a conflict reported by the remote. Only dirty documents can conflict.
    pub fn mark_conflicted(
        &self,
        collection: &str,
        id: &str,
        reason: &str,
        server_rev: Option<&str>,
    ) -> DbResult<bool> {
        let updated = self.conn.execute(
            "UPDATE documents SET conflict_reason = ?, server_rev = ?
             WHERE collection = ? AND id = ? AND dirty = 1",
            params![reason, server_rev, collection, id],
        )?;
        Ok(updated > 0)
    }

    /// Documents with an unresolved conflict.
    pub fn list_conflicts(&self, collection: &str) -> DbResult<Vec<StoredDocument>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE collection = ? AND conflict_reason IS NOT NULL ORDER BY id",
            DOCUMENT_COLUMNS
        );
        query_documents(&self.conn, &sql, [collection])
    }

    /// Apply one pulled batch and advance the checkpoint atomically.
    ///
    /// A batch whose checkpoint is not ahead of the stored one is ignored.
    pub fn apply_pulled_batch(
        &mut self,
        key: CheckpointKey<'_>,
        documents: &[Document],
        checkpoint: &Checkpoint,
        local_edits: LocalEdits,
    ) -> DbResult<PullApplication> {
        let tx = self.conn.transaction()?;

        let stored = load_checkpoint(&tx, key.replication_id)?.unwrap_or_default();
        if !checkpoint.is_ahead_of(&stored) && !documents.is_empty() {
            return Ok(PullApplication::Stale);
        }

        let mut written = 0;
        let mut skipped = 0;
        for document in documents {
            if upsert_pulled(&tx, key.collection, document, local_edits)? {
                written += 1;
            } else {
                skipped += 1;
            }
        }

        if checkpoint.is_ahead_of(&stored) {
            store_checkpoint(&tx, key, checkpoint)?;
        }

        tx.commit()?;
        Ok(PullApplication::Applied { written, skipped })
    }
}
