//! Pull checkpoints, keyed by replication identifier.

use super::{Database, DbError, DbResult};
use crate::models::{Checkpoint, RecordId};
use rusqlite::{params, Connection, OptionalExtension};

/// Where a checkpoint belongs.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointKey<'a> {
    pub replication_id: &'a str,
    pub collection: &'a str,
    pub context: &'a str,
}

/// Database row representation of a checkpoint.
struct CheckpointRow {
    updated_at: String,
    checkpoint_id: String,
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = DbError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        let id: RecordId = serde_json::from_str(&row.checkpoint_id)?;
        Ok(Checkpoint {
            updated_at: row.updated_at,
            id,
        })
    }
}

pub(crate) fn load_checkpoint(conn: &Connection, replication_id: &str) -> DbResult<Option<Checkpoint>> {
    let row = conn
        .query_row(
            "SELECT updated_at, checkpoint_id FROM checkpoints WHERE replication_id = ?",
            [replication_id],
            |row| {
                Ok(CheckpointRow {
                    updated_at: row.get(0)?,
                    checkpoint_id: row.get(1)?,
                })
            },
        )
        .optional()?;

    row.map(Checkpoint::try_from).transpose()
}

/// Persist a checkpoint. Returns `false` when it equals the stored one.
pub(crate) fn store_checkpoint(conn: &Connection, key: CheckpointKey<'_>, checkpoint: &Checkpoint) -> DbResult<bool> {
    if let Some(stored) = load_checkpoint(conn, key.replication_id)? {
        if checkpoint < &stored {
            return Err(DbError::CheckpointRegression {
                replication_id: key.replication_id.to_string(),
                stored: stored.to_string(),
                incoming: checkpoint.to_string(),
            });
        }
        if *checkpoint == stored {
            return Ok(false);
        }
    }

    conn.execute(
        "INSERT OR REPLACE INTO checkpoints (replication_id, collection, context, updated_at, checkpoint_id, saved_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![
            key.replication_id,
            key.collection,
            key.context,
            checkpoint.updated_at,
            serde_json::to_string(&checkpoint.id)?,
        ],
    )?;
    Ok(true)
}

impl Database {
    /// Checkpoint for a replication identifier, if anything was ever pulled.
    pub fn get_checkpoint(&self, replication_id: &str) -> DbResult<Option<Checkpoint>> {
        load_checkpoint(&self.conn, replication_id)
    }

    /// Save a checkpoint; refuses to move it backwards.
    pub fn save_checkpoint(&self, key: CheckpointKey<'_>, checkpoint: &Checkpoint) -> DbResult<bool> {
        store_checkpoint(&self.conn, key, checkpoint)
    }

    /// Forget every checkpoint of a collection, across contexts.
    pub fn clear_checkpoints(&self, collection: &str) -> DbResult<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM checkpoints WHERE collection = ?", [collection])?;
        Ok(removed)
    }
}
