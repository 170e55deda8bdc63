//! SQLite schema definition.

/// Complete database schema for one role's local replica.
pub const SCHEMA: &str = r#"
-- Enable foreign keys
PRAGMA foreign_keys = ON;

-- ============================================================================
-- Collection Registry
-- ============================================================================

-- Collections provisioned for the role that owns this file
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    schema_version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- ============================================================================
-- Documents
-- ============================================================================

CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
    id TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '{}',             -- JSON object of domain fields
    updated_at TEXT,                             -- server-assigned, NULL until first pull/ack
    deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1)),
    dirty INTEGER NOT NULL DEFAULT 0 CHECK (dirty IN (0, 1)),
    local_rev INTEGER NOT NULL DEFAULT 0,        -- bumped on every local write
    conflict_reason TEXT,                        -- set when the remote reported a conflict
    server_rev TEXT,
    local_modified_at TEXT,
    PRIMARY KEY (collection, id)
);

-- Conflicts only make sense on documents that still carry local changes
CREATE TRIGGER IF NOT EXISTS documents_check_conflict BEFORE UPDATE OF conflict_reason ON documents
WHEN new.conflict_reason IS NOT NULL AND new.dirty = 0
BEGIN
    SELECT RAISE(ABORT, 'Conflicts require a dirty document');
END;

CREATE INDEX IF NOT EXISTS idx_documents_pending ON documents(collection, dirty, local_modified_at);
CREATE INDEX IF NOT EXISTS idx_documents_updated ON documents(collection, updated_at);

-- ============================================================================
-- Pull Checkpoints
-- ============================================================================

CREATE TABLE IF NOT EXISTS checkpoints (
    replication_id TEXT PRIMARY KEY,
    collection TEXT NOT NULL,
    context TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    checkpoint_id TEXT NOT NULL,                 -- JSON number or string
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_collection ON checkpoints(collection);

-- ============================================================================
-- Sync State
-- ============================================================================

CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_valid() {
        let conn = Connection::open_in_memory().unwrap();
        let result = conn.execute_batch(SCHEMA);
        assert!(result.is_ok(), "Schema should be valid SQL: {:?}", result);
    }

    #[test]
    fn test_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        assert!(conn.execute_batch(SCHEMA).is_ok());
    }

    #[test]
    fn test_document_requires_registered_collection() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        let result = conn.execute(
            "INSERT INTO documents (collection, id) VALUES ('patients', '1')",
            [],
        );
        assert!(result.is_err());

        conn.execute("INSERT INTO collections (name) VALUES ('patients')", [])
            .unwrap();
        let result = conn.execute(
            "INSERT INTO documents (collection, id) VALUES ('patients', '1')",
            [],
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_conflict_requires_dirty() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute("INSERT INTO collections (name) VALUES ('patients')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO documents (collection, id, dirty) VALUES ('patients', '1', 0)",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "UPDATE documents SET conflict_reason = 'stale_version' WHERE id = '1'",
            [],
        );
        assert!(result.is_err());

        conn.execute("UPDATE documents SET dirty = 1 WHERE id = '1'", [])
            .unwrap();
        let result = conn.execute(
            "UPDATE documents SET conflict_reason = 'stale_version' WHERE id = '1'",
            [],
        );
        assert!(result.is_ok());
    }
}
