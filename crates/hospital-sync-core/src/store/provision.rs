//! Collection Provisioner: materialize exactly a role's authorized collections.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::{LocalStore, StoreError, StoreResult};
use crate::db::{Database, Registration};
use crate::models::{CollectionName, Role};

/// Where a role's store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// One `hospital_<role>.sqlite3` file per role inside this directory.
    Directory(PathBuf),
    InMemory,
}

impl StoreLocation {
    /// File backing the given role's store.
    pub fn path_for(&self, role: Role) -> Option<PathBuf> {
        match self {
            StoreLocation::Directory(dir) => Some(store_file(dir, role)),
            StoreLocation::InMemory => None,
        }
    }
}

fn store_file(dir: &Path, role: Role) -> PathBuf {
    dir.join(format!("hospital_{}.sqlite3", role.as_str()))
}

impl LocalStore {
    /// Open (or create) the store for a role and register its collections.
    ///
    /// Collections left over from an older role mapping are dropped, so the
    /// store holds the role's authorized list and nothing else.
    pub fn open(role: Role, location: &StoreLocation) -> StoreResult<LocalStore> {
        let path = location.path_for(role);
        let db = match &path {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                Database::open(path)?
            }
            None => Database::open_in_memory()?,
        };

        let collections = provision_collections(&db, role)?;
        db.set_sync_state("role", role.as_str())?;

        info!(role = %role, collections = collections.len(), path = ?path, "local store ready");
        Ok(LocalStore::from_parts(role, db, collections, path))
    }

    /// Remove a role's store file. Returns `false` when there was nothing to remove.
    pub fn destroy(role: Role, dir: &Path) -> StoreResult<bool> {
        let path = store_file(dir, role);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;

        for suffix in ["-wal", "-shm", "-journal"] {
            let mut sidecar = path.clone().into_os_string();
            sidecar.push(suffix);
            let sidecar = PathBuf::from(sidecar);
            if sidecar.exists() {
                fs::remove_file(sidecar)?;
            }
        }

        info!(role = %role, path = %path.display(), "local store destroyed");
        Ok(true)
    }
}

fn provision_collections(db: &Database, role: Role) -> StoreResult<Vec<CollectionName>> {
    let authorized = role.collections();

    for registered in db.registered_collections()? {
        let keep = registered
            .name
            .parse::<CollectionName>()
            .map(|c| authorized.contains(&c))
            .unwrap_or(false);
        if !keep {
            warn!(role = %role, collection = %registered.name, "dropping collection not authorized for role");
            db.drop_collection(&registered.name)?;
        }
    }

    for &collection in authorized {
        let supported = collection.schema_version();
        match db.register_collection(collection.as_str(), supported)? {
            Registration::Created | Registration::Unchanged => {}
            Registration::Upgraded { from } => {
                info!(
                    role = %role,
                    collection = %collection,
                    from,
                    to = supported,
                    "collection schema upgraded; checkpoints cleared"
                );
            }
            Registration::Downgrade { stored } => {
                return Err(StoreError::SchemaDowngrade {
                    collection,
                    stored,
                    supported,
                });
            }
        }
    }

    Ok(authorized.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CheckpointKey;
    use crate::models::Checkpoint;
    use proptest::prelude::*;

    #[test]
    fn test_path_is_scoped_by_role() {
        let location = StoreLocation::Directory(PathBuf::from("/data"));
        assert_eq!(
            location.path_for(Role::LabTechnician),
            Some(PathBuf::from("/data/hospital_lab_technician.sqlite3"))
        );
        assert_eq!(StoreLocation::InMemory.path_for(Role::Admin), None);
    }

    #[test]
    fn test_unauthorized_leftovers_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_file(dir.path(), Role::Nurse);
        {
            let db = Database::open(&path).unwrap();
            db.register_collection("users", 0).unwrap();
        }

        let store = LocalStore::open(Role::Nurse, &StoreLocation::Directory(dir.path().to_path_buf())).unwrap();
        assert!(!store.has_collection(CollectionName::Users));

        let db = Database::open(&path).unwrap();
        let names: Vec<String> = db
            .registered_collections()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert!(!names.contains(&"users".to_string()));
    }

    #[test]
    fn test_schema_upgrade_clears_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_file(dir.path(), Role::Receptionist);
        {
            let db = Database::open(&path).unwrap();
            db.register_collection("patients", 1).unwrap();
            db.save_checkpoint(
                CheckpointKey {
                    replication_id: "rep",
                    collection: "patients",
                    context: "dashboard",
                },
                &Checkpoint::new("2024-01-01T00:00:00Z", 5),
            )
            .unwrap();
        }

        let store = LocalStore::open(
            Role::Receptionist,
            &StoreLocation::Directory(dir.path().to_path_buf()),
        )
        .unwrap();
        assert_eq!(store.checkpoint("rep").unwrap(), None);
    }

    #[test]
    fn test_newer_stored_schema_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_file(dir.path(), Role::Receptionist);
        {
            let db = Database::open(&path).unwrap();
            db.register_collection("patients", 99).unwrap();
        }

        let result = LocalStore::open(
            Role::Receptionist,
            &StoreLocation::Directory(dir.path().to_path_buf()),
        );
        assert!(matches!(
            result,
            Err(StoreError::SchemaDowngrade {
                collection: CollectionName::Patients,
                stored: 99,
                ..
            })
        ));
    }

    #[test]
    fn test_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let location = StoreLocation::Directory(dir.path().to_path_buf());
        drop(LocalStore::open(Role::Doctor, &location).unwrap());

        assert!(LocalStore::destroy(Role::Doctor, dir.path()).unwrap());
        assert!(!location.path_for(Role::Doctor).unwrap().exists());
        assert!(!LocalStore::destroy(Role::Doctor, dir.path()).unwrap());
    }

    fn any_role() -> impl Strategy<Value = Role> {
        prop::sample::select(Role::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_store_holds_exactly_the_authorized_collections(role in any_role()) {
            let store = LocalStore::open(role, &StoreLocation::InMemory).unwrap();

            for collection in CollectionName::ALL {
                let authorized = role.collections().contains(&collection);
                prop_assert_eq!(store.has_collection(collection), authorized);
                prop_assert_eq!(store.list(collection, true).is_ok(), authorized);
            }
        }
    }
}
