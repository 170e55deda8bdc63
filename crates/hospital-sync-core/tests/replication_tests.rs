//! End-to-end replication tests against in-process authorities.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use hospital_sync_core::models::{Checkpoint, CollectionName, Document, Role, SyncContext};
use hospital_sync_core::store::{LocalStore, StoreLocation};
use hospital_sync_core::sync::{
    replication_id, ChannelSettings, ChannelTarget, Identity, InMemoryRemote, PullRequest, PullResponse,
    PushRequest, PushResponse, RemoteError, RemoteSource, ReplicationChannel, SyncManager, SyncSession,
};
use hospital_sync_core::SyncConfig;

const BASE_URL: &str = "http://localhost:3000";

fn patient(first: &str) -> Value {
    json!({"first_name": first, "last_name": "Doe"})
}

fn fields(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn patients_target(role: Role, context: SyncContext) -> ChannelTarget {
    ChannelTarget {
        collection: CollectionName::Patients,
        context,
        context_collections: vec![CollectionName::Patients],
        replication_id: replication_id(BASE_URL, role, CollectionName::Patients, context),
    }
}

fn spawn_patients(store: &LocalStore, remote: Arc<dyn RemoteSource>) -> ReplicationChannel {
    ReplicationChannel::spawn(
        patients_target(store.role(), SyncContext::PatientSearch),
        store.clone(),
        remote,
        ChannelSettings::default(),
    )
}

/// Serves two fixed pages: beginning -> #10 (more to come) -> #42.
#[derive(Default)]
struct PagedAuthority {
    requests: Mutex<Vec<PullRequest>>,
}

impl PagedAuthority {
    fn requests(&self) -> Vec<PullRequest> {
        self.requests.lock().unwrap().clone()
    }
}

fn page(checkpoint: Checkpoint, has_more: bool) -> PullResponse {
    let doc = json!({
        "id": checkpoint.id,
        "first_name": "Patient",
        "last_name": checkpoint.id.to_string(),
        "updated_at": checkpoint.updated_at,
    });
    PullResponse {
        checkpoint: Some(checkpoint),
        documents: HashMap::from([("patients".to_string(), vec![doc])]),
        has_more,
    }
}

#[async_trait]
impl RemoteSource for PagedAuthority {
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, RemoteError> {
        self.requests.lock().unwrap().push(request.clone());

        let first = Checkpoint::new("2024-01-01T00:00:00Z", 10);
        let response = if request.checkpoint.is_beginning() {
            page(first, true)
        } else if request.checkpoint == first {
            page(Checkpoint::new("2024-01-02T00:00:00Z", 42), false)
        } else {
            PullResponse {
                checkpoint: None,
                documents: HashMap::new(),
                has_more: false,
            }
        };
        Ok(response)
    }

    async fn push(&self, request: &PushRequest) -> Result<PushResponse, RemoteError> {
        let mut response = PushResponse::empty("ok");
        response.written = request.changes.iter().map(|d| d.id.clone()).collect();
        Ok(response)
    }
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_from_persisted_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let location = StoreLocation::Directory(dir.path().to_path_buf());
    let expected = Checkpoint::new("2024-01-02T00:00:00Z", 42);

    let store = LocalStore::open(Role::Receptionist, &location).unwrap();
    let authority = Arc::new(PagedAuthority::default());
    let channel = spawn_patients(&store, authority.clone());
    channel.await_initial_replication().await.unwrap();

    let rid = channel.replication_id().to_string();
    assert_eq!(authority.requests().len(), 2);
    assert_eq!(store.checkpoint(&rid).unwrap(), Some(expected.clone()));
    assert_eq!(store.count(CollectionName::Patients).unwrap(), 2);

    // Crash: no orderly shutdown
    drop(channel);
    drop(store);

    let store = LocalStore::open(Role::Receptionist, &location).unwrap();
    let authority = Arc::new(PagedAuthority::default());
    let channel = spawn_patients(&store, authority.clone());
    channel.await_initial_replication().await.unwrap();

    let requests = authority.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].checkpoint, expected);
    assert_eq!(store.checkpoint(&rid).unwrap(), Some(expected));
    assert_eq!(store.count(CollectionName::Patients).unwrap(), 2);
    channel.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_conflict_then_authoritative_pull() {
    let store = LocalStore::open(Role::Receptionist, &StoreLocation::InMemory).unwrap();
    store
        .write(CollectionName::Patients, &Document::new("7", fields(patient("Local"))))
        .unwrap();

    let remote = InMemoryRemote::new();
    remote.inject_conflict("patients", "7", "stale_version", Some("rev-3"));
    let channel = spawn_patients(&store, Arc::new(remote.clone()));
    channel.await_initial_replication().await.unwrap();

    let local = store.get(CollectionName::Patients, "7").unwrap().unwrap();
    assert!(local.dirty);
    let conflict = local.conflict.unwrap();
    assert_eq!(conflict.reason, "stale_version");
    assert_eq!(conflict.server_rev.as_deref(), Some("rev-3"));

    // The server's newer copy arrives on the next poll
    remote.upsert("patients", 7, patient("Server"));
    tokio::time::sleep(Duration::from_secs(16)).await;

    let local = store.get(CollectionName::Patients, "7").unwrap().unwrap();
    assert!(!local.dirty);
    assert!(local.conflict.is_none());
    assert_eq!(local.document.field("first_name"), Some(&json!("Server")));
    // Conflicted documents are never re-pushed
    assert_eq!(remote.push_calls(), 1);
    channel.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_read_only_collection_never_reaches_network() {
    let store = LocalStore::open(Role::Doctor, &StoreLocation::InMemory).unwrap();
    let appointment = json!({
        "patient_id": 1,
        "doctor_id": 2,
        "scheduled_at": "2024-03-01T09:00:00Z",
        "status": "scheduled",
    });
    store
        .write(CollectionName::Appointments, &Document::new("a-1", fields(appointment)))
        .unwrap();

    let remote = InMemoryRemote::new();
    let mut manager = SyncManager::new(store.clone(), Arc::new(remote.clone()), ChannelSettings::default(), BASE_URL);
    manager.start_sync(SyncContext::Appointments).await.unwrap();

    // Another local edit while live, then a few poll cycles
    store
        .write(
            CollectionName::Appointments,
            &Document::new(
                "a-2",
                fields(json!({
                    "patient_id": 1,
                    "doctor_id": 2,
                    "scheduled_at": "2024-03-02T09:00:00Z",
                    "status": "scheduled",
                })),
            ),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(remote.push_calls(), 0);
    assert!(remote.pull_calls() > 2);
    assert_eq!(store.pending_count(CollectionName::Appointments).unwrap(), 2);
    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_receptionist_context_narrowing() {
    let remote = InMemoryRemote::new();
    remote.upsert("patients", 1, patient("Ada"));
    let session = SyncSession::new(SyncConfig::in_memory(), Arc::new(remote.clone()));

    session.bind(Identity::new(Role::Receptionist, "token")).await.unwrap();
    session.settled().await;
    assert_eq!(
        session.active_collections().await,
        vec![
            CollectionName::Patients,
            CollectionName::Appointments,
            CollectionName::Admissions,
            CollectionName::DashboardStats,
        ]
    );

    let before = remote.pull_calls();
    assert!(session.switch_context(SyncContext::PatientSearch).await.unwrap());
    assert_eq!(session.active_collections().await, vec![CollectionName::Patients]);

    let log = remote.pull_log();
    let narrowed = &log[before];
    assert_eq!(narrowed.context, "patient_search");
    assert_eq!(narrowed.collections, vec!["patients"]);

    // Already-synced data survives the switch
    let store = session.store().unwrap();
    assert_eq!(store.count(CollectionName::Patients).unwrap(), 1);
    session.unbind().await;
}

#[tokio::test(start_paused = true)]
async fn test_has_more_drains_before_settling() {
    let remote = InMemoryRemote::new();
    for id in 1..=5 {
        remote.upsert("patients", id, patient(&format!("P{}", id)));
    }
    let config = SyncConfig {
        pull_batch_size: 2,
        ..SyncConfig::in_memory()
    };
    let session = SyncSession::new(config, Arc::new(remote.clone()));

    session.bind(Identity::new(Role::Receptionist, "token")).await.unwrap();
    session.settled().await;

    let store = session.store().unwrap();
    assert_eq!(store.count(CollectionName::Patients).unwrap(), 5);

    // The first channel walks 2 + 2 + 1 before the next one starts
    let log = remote.pull_log();
    let walked: Vec<String> = log.iter().take(3).map(|r| r.checkpoint.id.to_string()).collect();
    assert_eq!(walked, vec!["0", "2", "4"]);
    assert!(log.iter().all(|r| r.batch_size == 2));
    session.unbind().await;
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_during_pull_leaves_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..SyncConfig::default()
    };
    let remote = InMemoryRemote::new();
    remote.upsert("patients", 1, patient("Ada"));
    remote.hold_pulls();

    let session = SyncSession::new(config, Arc::new(remote.clone()));
    session.bind(Identity::new(Role::Receptionist, "token")).await.unwrap();
    remote.wait_for_pull_calls(1).await;

    session.sign_out(false).await.unwrap();
    remote.release_pulls();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let location = StoreLocation::Directory(dir.path().to_path_buf());
    let store = LocalStore::open(Role::Receptionist, &location).unwrap();
    let rid = replication_id(BASE_URL, Role::Receptionist, CollectionName::Patients, SyncContext::Dashboard);
    assert_eq!(store.count(CollectionName::Patients).unwrap(), 0);
    assert_eq!(store.checkpoint(&rid).unwrap(), None);
    assert_eq!(remote.pull_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pause_resume_preserves_queue_and_checkpoint() {
    let store = LocalStore::open(Role::Receptionist, &StoreLocation::InMemory).unwrap();
    let remote = InMemoryRemote::new();
    remote.upsert("patients", 1, patient("Ada"));
    let channel = spawn_patients(&store, Arc::new(remote.clone()));
    channel.await_initial_replication().await.unwrap();
    let checkpoint = store.checkpoint(channel.replication_id()).unwrap();

    assert!(channel.pause());
    let pulls = remote.pull_calls();
    let local = store.insert_local(CollectionName::Patients, fields(patient("Offline"))).unwrap();
    remote.upsert("patients", 2, patient("Remote"));
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(remote.pull_calls(), pulls);
    assert_eq!(remote.push_calls(), 0);
    assert_eq!(store.pending_count(CollectionName::Patients).unwrap(), 1);
    assert_eq!(store.checkpoint(channel.replication_id()).unwrap(), checkpoint);

    assert!(channel.resume());
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(store.pending_count(CollectionName::Patients).unwrap(), 0);
    assert!(remote.document("patients", &local.id).is_some());
    assert!(store.get(CollectionName::Patients, "2").unwrap().is_some());
    channel.shutdown().await;
}

#[test]
fn test_every_role_gets_its_own_file_with_exact_collections() {
    let dir = tempfile::tempdir().unwrap();
    let location = StoreLocation::Directory(dir.path().to_path_buf());

    for role in Role::ALL {
        let store = LocalStore::open(role, &location).unwrap();
        assert_eq!(store.collections(), role.collections());
        assert!(dir.path().join(format!("hospital_{}.sqlite3", role.as_str())).exists());
    }
}
