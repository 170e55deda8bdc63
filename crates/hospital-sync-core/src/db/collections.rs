//! Collection registry: which collections exist in this file and at which schema version.

use super::{Database, DbResult};
use rusqlite::{params, OptionalExtension};

/// A registered collection row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredCollection {
    pub name: String,
    pub schema_version: u32,
}

/// What happened when a collection was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Unchanged,
    Upgraded { from: u32 },
    /// The file was written by a newer build; nothing was changed.
    Downgrade { stored: u32 },
}

impl Database {
    /// Register a collection, or bump its schema version.
    ///
    /// An upgrade wipes the collection's checkpoints so the next pull starts
    /// from the beginning and rewrites every document in the new shape.
    pub fn register_collection(&self, name: &str, schema_version: u32) -> DbResult<Registration> {
        let stored = self.collection_version(name)?;

        let outcome = match stored {
            None => {
                self.conn.execute(
                    "INSERT INTO collections (name, schema_version) VALUES (?, ?)",
                    params![name, schema_version],
                )?;
                Registration::Created
            }
            Some(v) if v == schema_version => Registration::Unchanged,
            Some(v) if v > schema_version => Registration::Downgrade { stored: v },
            Some(v) => {
                self.conn.execute(
                    "UPDATE collections SET schema_version = ?, updated_at = datetime('now') WHERE name = ?",
                    params![schema_version, name],
                )?;
                self.clear_checkpoints(name)?;
                Registration::Upgraded { from: v }
            }
        };

        Ok(outcome)
    }

    /// Stored schema version of a collection.
    pub fn collection_version(&self, name: &str) -> DbResult<Option<u32>> {
        self.conn
            .query_row(
                "SELECT schema_version FROM collections WHERE name = ?",
                [name],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// All registered collections, by name.
    pub fn registered_collections(&self) -> DbResult<Vec<RegisteredCollection>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, schema_version FROM collections ORDER BY name")?;

        let rows = stmt.query_map([], |row| {
            Ok(RegisteredCollection {
                name: row.get(0)?,
                schema_version: row.get(1)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Drop a collection together with its documents and checkpoints.
    pub fn drop_collection(&self, name: &str) -> DbResult<bool> {
        self.clear_checkpoints(name)?;
        let removed = self
            .conn
            .execute("DELETE FROM collections WHERE name = ?", [name])?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_register_new_collection() {
        let db = setup_db();
        let outcome = db.register_collection("patients", 2).unwrap();
        assert_eq!(outcome, Registration::Created);
        assert_eq!(db.collection_version("patients").unwrap(), Some(2));
    }

    #[test]
    fn test_register_twice_is_unchanged() {
        let db = setup_db();
        db.register_collection("beds", 0).unwrap();
        let outcome = db.register_collection("beds", 0).unwrap();
        assert_eq!(outcome, Registration::Unchanged);
        assert_eq!(db.registered_collections().unwrap().len(), 1);
    }

    #[test]
    fn test_upgrade_and_downgrade() {
        let db = setup_db();
        db.register_collection("patients", 1).unwrap();

        let outcome = db.register_collection("patients", 2).unwrap();
        assert_eq!(outcome, Registration::Upgraded { from: 1 });

        let outcome = db.register_collection("patients", 1).unwrap();
        assert_eq!(outcome, Registration::Downgrade { stored: 2 });
        assert_eq!(db.collection_version("patients").unwrap(), Some(2));
    }

    #[test]
    fn test_drop_collection() {
        let db = setup_db();
        db.register_collection("vitals", 0).unwrap();
        assert!(db.drop_collection("vitals").unwrap());
        assert!(!db.drop_collection("vitals").unwrap());
        assert!(db.registered_collections().unwrap().is_empty());
    }
}
