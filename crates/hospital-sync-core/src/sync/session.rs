//! Sync session: binds the store and manager to the signed-in identity.
//!
//! The session is an explicit object owned by the application shell; nothing
//! here is process-global, so tests can run several sessions side by side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::manager::{StartReport, SyncManager};
use super::remote::{HttpConnector, Identity, RemoteConnector};
use super::SyncError;
use crate::config::SyncConfig;
use crate::models::{CollectionName, Role, SyncContext};
use crate::store::{LocalStore, StoreLocation};

/// Status exposed to the UI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
    /// Local data can be read and written.
    pub is_ready: bool,
    pub is_syncing: bool,
    /// Fatal session error (store could not be opened).
    pub error: Option<String>,
    pub current_context: Option<SyncContext>,
    pub role: Option<Role>,
    /// Most recent replication error; replication keeps retrying.
    pub last_sync_error: Option<String>,
}

struct Bound {
    identity: Identity,
    generation: u64,
    manager: SyncManager,
    forwarder: JoinHandle<()>,
}

impl Bound {
    async fn teardown(mut self) {
        self.forwarder.abort();
        self.manager.stop_all().await;
    }
}

#[derive(Clone)]
struct Binding {
    identity: Identity,
    store: LocalStore,
}

struct SessionInner {
    config: SyncConfig,
    connector: Arc<dyn RemoteConnector>,
    status: watch::Sender<SyncStatus>,
    switching: AtomicBool,
    /// Bumped whenever the binding is replaced or dropped; interrupts
    /// context starts begun under an older binding.
    generation: watch::Sender<u64>,
    /// Readable without waiting on a context start.
    current: watch::Sender<Option<Binding>>,
    bound: Mutex<Option<Bound>>,
}

/// Clears the switching flag however the switch ends.
struct SwitchGuard<'a>(&'a AtomicBool);

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Lifecycle coordinator for one signed-in identity at a time.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

impl SyncSession {
    pub fn new(config: SyncConfig, connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                connector,
                status: watch::Sender::new(SyncStatus::default()),
                switching: AtomicBool::new(false),
                generation: watch::Sender::new(0),
                current: watch::Sender::new(None),
                bound: Mutex::new(None),
            }),
        }
    }

    /// Session talking to the configured HTTP endpoints.
    pub fn with_http(config: SyncConfig) -> Self {
        let connector = HttpConnector::new(config.base_url.clone(), config.request_timeout());
        Self::new(config, Arc::new(connector))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Bind to an identity (sign-in or identity change).
    ///
    /// Returns once the local store is usable; the initial context's
    /// replication continues in the background. Binding the identity that is
    /// already bound does nothing.
    pub async fn bind(&self, identity: Identity) -> Result<(), SyncError> {
        if self.inner.current.borrow().as_ref().is_some_and(|b| b.identity == identity) {
            return Ok(());
        }
        let generation = self.supersede();
        self.inner.current.send_replace(None);
        let mut bound = self.inner.bound.lock().await;

        if let Some(previous) = bound.take() {
            info!(role = %previous.identity.role, "identity changed; stopping replication");
            previous.teardown().await;
        }

        let role = identity.role;
        let opened = LocalStore::open(role, &self.inner.config.store_location())
            .map_err(SyncError::from)
            .and_then(|store| {
                let remote = self.inner.connector.connect(&identity)?;
                Ok((store, remote))
            });
        let (store, remote) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                error!(role = %role, error = %e, "local store unavailable");
                self.inner.status.send_replace(SyncStatus {
                    error: Some(e.to_string()),
                    role: Some(role),
                    ..SyncStatus::default()
                });
                return Err(e);
            }
        };

        let manager = SyncManager::new(
            store.clone(),
            remote,
            self.inner.config.channel_settings(),
            self.inner.config.base_url.clone(),
        );
        let forwarder = self.forward_errors(&manager);

        // Offline-first: whatever is on disk is usable right away.
        self.inner.status.send_replace(SyncStatus {
            is_ready: true,
            is_syncing: true,
            role: Some(role),
            ..SyncStatus::default()
        });
        info!(role = %role, "session bound");

        self.inner.current.send_replace(Some(Binding {
            identity: identity.clone(),
            store,
        }));
        *bound = Some(Bound {
            identity,
            generation,
            manager,
            forwarder,
        });
        drop(bound);

        let session = self.clone();
        tokio::spawn(async move {
            session.start_initial_context(generation, role.initial_context()).await;
        });
        Ok(())
    }

    fn forward_errors(&self, manager: &SyncManager) -> JoinHandle<()> {
        let mut errors = manager.subscribe_errors();
        let status = self.inner.status.clone();
        tokio::spawn(async move {
            loop {
                match errors.recv().await {
                    Ok(e) => {
                        status.send_modify(|s| s.last_sync_error = Some(e.to_string()));
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Invalidate the current binding's in-flight work. Returns the new generation.
    fn supersede(&self) -> u64 {
        let mut next = 0;
        self.inner.generation.send_modify(|generation| {
            *generation += 1;
            next = *generation;
        });
        next
    }

    async fn superseded(&self, generation: u64) {
        let mut rx = self.inner.generation.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|current| *current != generation).await;
    }

    async fn start_initial_context(&self, generation: u64, context: SyncContext) {
        if self.inner.switching.swap(true, Ordering::SeqCst) {
            warn!(context = %context, "context switch already in progress; skipping initial sync");
            return;
        }
        let _guard = SwitchGuard(&self.inner.switching);

        let mut bound = self.inner.bound.lock().await;
        let Some(current) = bound.as_mut().filter(|b| b.generation == generation) else {
            return;
        };
        tokio::select! {
            biased;
            _ = self.superseded(generation) => {
                info!(context = %context, "initial sync interrupted by session change");
            }
            result = current.manager.start_sync(context) => match result {
                Ok(report) => self.context_active(context, &report),
                Err(e) => self.switch_failed(context, &e),
            },
        }
    }

    fn context_active(&self, context: SyncContext, report: &StartReport) {
        self.inner.status.send_modify(|s| {
            s.is_syncing = false;
            s.current_context = Some(context);
        });
        info!(
            context = %context,
            synced = report.synced.len(),
            failed = report.failed.len(),
            "context active"
        );
    }

    fn switch_failed(&self, context: SyncContext, e: &SyncError) {
        warn!(context = %context, error = %e, "context switch failed");
        self.inner.status.send_modify(|s| {
            s.is_syncing = false;
            s.last_sync_error = Some(e.to_string());
        });
    }

    /// Switch the live context. Returns `Ok(false)` when another switch is
    /// still in flight, or when the session was unbound before this one
    /// finished.
    pub async fn switch_context(&self, context: SyncContext) -> Result<bool, SyncError> {
        if self.inner.switching.swap(true, Ordering::SeqCst) {
            warn!(context = %context, "context switch already in progress; ignoring");
            return Ok(false);
        }
        let _guard = SwitchGuard(&self.inner.switching);

        let mut bound = self.inner.bound.lock().await;
        let current = bound.as_mut().ok_or(SyncError::NotBound)?;

        let role = current.identity.role;
        if context.collections_for(role).is_none() {
            return Err(SyncError::UnsupportedContext { role, context });
        }
        let generation = current.generation;

        self.inner.status.send_modify(|s| s.is_syncing = true);
        tokio::select! {
            biased;
            _ = self.superseded(generation) => {
                info!(context = %context, "context switch interrupted by session change");
                Ok(false)
            }
            result = current.manager.start_sync(context) => match result {
                Ok(report) => {
                    self.context_active(context, &report);
                    Ok(true)
                }
                Err(e) => {
                    self.switch_failed(context, &e);
                    Err(e)
                }
            },
        }
    }

    /// Pause every live channel.
    pub async fn pause(&self) -> Result<usize, SyncError> {
        let bound = self.inner.bound.lock().await;
        let current = bound.as_ref().ok_or(SyncError::NotBound)?;
        Ok(current.manager.pause_all())
    }

    /// Resume every paused channel.
    pub async fn resume(&self) -> Result<usize, SyncError> {
        let bound = self.inner.bound.lock().await;
        let current = bound.as_ref().ok_or(SyncError::NotBound)?;
        Ok(current.manager.resume_all())
    }

    /// Stop replication and release the identity. The store stays on disk so
    /// the same role resumes from its checkpoints.
    pub async fn unbind(&self) -> Option<Role> {
        self.supersede();
        self.inner.current.send_replace(None);
        let previous = self.inner.bound.lock().await.take();
        self.inner.status.send_replace(SyncStatus::default());

        let previous = previous?;
        let role = previous.identity.role;
        previous.teardown().await;
        info!(role = %role, "session unbound");
        Some(role)
    }

    /// Unbind, and with `purge` also delete the role's store file.
    pub async fn sign_out(&self, purge: bool) -> Result<(), SyncError> {
        let Some(role) = self.unbind().await else {
            return Ok(());
        };
        if purge {
            if let StoreLocation::Directory(dir) = self.inner.config.store_location() {
                LocalStore::destroy(role, &dir)?;
            }
        }
        Ok(())
    }

    /// The bound role's store.
    pub fn store(&self) -> Option<LocalStore> {
        self.inner.current.borrow().as_ref().map(|b| b.store.clone())
    }

    pub async fn active_collections(&self) -> Vec<CollectionName> {
        self.inner
            .bound
            .lock()
            .await
            .as_ref()
            .map(|b| b.manager.active_collections())
            .unwrap_or_default()
    }

    /// Unacknowledged local changes per live collection.
    pub async fn pending_changes(&self) -> Result<Vec<(CollectionName, u64)>, SyncError> {
        let bound = self.inner.bound.lock().await;
        let current = bound.as_ref().ok_or(SyncError::NotBound)?;
        Ok(current.manager.pending_changes()?.into_iter().collect())
    }

    /// Resolve once no context switch is running.
    pub async fn settled(&self) -> SyncStatus {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(|s| !s.is_syncing).await {
            Ok(status) => SyncStatus::clone(&status),
            Err(_) => self.status(),
        };
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::InMemoryRemote;
    use serde_json::json;
    use std::time::Duration;

    fn session(remote: &InMemoryRemote) -> SyncSession {
        SyncSession::new(SyncConfig::in_memory(), Arc::new(remote.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_is_ready_before_initial_sync_finishes() {
        let remote = InMemoryRemote::new();
        remote.hold_pulls();
        let session = session(&remote);

        session.bind(Identity::new(Role::Receptionist, "t")).await.unwrap();
        let status = session.status();
        assert!(status.is_ready);
        assert!(status.is_syncing);
        assert_eq!(status.current_context, None);

        remote.release_pulls();
        let status = session.settled().await;
        assert!(!status.is_syncing);
        assert_eq!(status.current_context, Some(SyncContext::Dashboard));
        assert_eq!(session.active_collections().await.len(), 4);
        session.unbind().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbind_interrupts_initial_sync() {
        let remote = InMemoryRemote::new();
        remote.upsert("patients", 1, json!({"first_name": "A", "last_name": "B"}));
        remote.hold_pulls();
        let session = session(&remote);
        session.bind(Identity::new(Role::Receptionist, "t")).await.unwrap();
        let store = session.store().unwrap();
        remote.wait_for_pull_calls(1).await;

        let started = tokio::time::Instant::now();
        assert_eq!(session.unbind().await, Some(Role::Receptionist));
        // Did not sit out the request timeout
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(session.store().is_none());

        remote.release_pulls();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.count(CollectionName::Patients).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_context() {
        let remote = InMemoryRemote::new();
        let session = session(&remote);
        session.bind(Identity::new(Role::Receptionist, "t")).await.unwrap();
        session.settled().await;

        assert!(session.switch_context(SyncContext::PatientSearch).await.unwrap());
        assert_eq!(session.status().current_context, Some(SyncContext::PatientSearch));
        assert_eq!(session.active_collections().await, vec![CollectionName::Patients]);

        let result = session.switch_context(SyncContext::Inventory).await;
        assert!(matches!(result, Err(SyncError::UnsupportedContext { .. })));
        assert_eq!(session.status().current_context, Some(SyncContext::PatientSearch));
        session.unbind().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_while_switching_is_ignored() {
        let remote = InMemoryRemote::new();
        remote.hold_pulls();
        let session = session(&remote);
        session.bind(Identity::new(Role::Receptionist, "t")).await.unwrap();
        remote.wait_for_pull_calls(1).await;

        // Initial sync is still in flight
        assert!(!session.switch_context(SyncContext::PatientSearch).await.unwrap());

        remote.release_pulls();
        session.settled().await;
        assert_eq!(session.status().current_context, Some(SyncContext::Dashboard));
        session.unbind().await;
    }

    #[tokio::test]
    async fn test_switch_requires_binding() {
        let session = session(&InMemoryRemote::new());
        let result = session.switch_context(SyncContext::Dashboard).await;
        assert!(matches!(result, Err(SyncError::NotBound)));
        assert!(matches!(session.pause().await, Err(SyncError::NotBound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebinding_same_identity_is_noop() {
        let remote = InMemoryRemote::new();
        let session = session(&remote);
        let identity = Identity::new(Role::Nurse, "t");

        session.bind(identity.clone()).await.unwrap();
        session.settled().await;
        let store = session.store().unwrap();
        store
            .insert_local(
                CollectionName::Patients,
                json!({"first_name": "A", "last_name": "B"}).as_object().cloned().unwrap(),
            )
            .unwrap();
        session.pause().await.unwrap();

        session.bind(identity).await.unwrap();
        // Same in-memory store, so the local write is still there
        let again = session.store().unwrap();
        assert_eq!(again.count(CollectionName::Patients).unwrap(), 1);
        session.unbind().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_change_replaces_store() {
        let remote = InMemoryRemote::new();
        let session = session(&remote);

        session.bind(Identity::new(Role::Nurse, "t")).await.unwrap();
        session.settled().await;
        session.bind(Identity::new(Role::Pharmacist, "t2")).await.unwrap();
        let status = session.settled().await;

        assert_eq!(status.role, Some(Role::Pharmacist));
        let store = session.store().unwrap();
        assert_eq!(store.role(), Role::Pharmacist);
        assert_eq!(
            session.active_collections().await,
            vec![CollectionName::DashboardStats, CollectionName::Prescriptions]
        );
        session.unbind().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_is_fatal_to_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let config = SyncConfig {
            data_dir: Some(blocker.join("nested")),
            ..SyncConfig::default()
        };
        let session = SyncSession::new(config, Arc::new(InMemoryRemote::new()));

        let result = session.bind(Identity::new(Role::Admin, "t")).await;
        assert!(result.is_err());
        let status = session.status();
        assert!(!status.is_ready);
        assert!(!status.is_syncing);
        assert!(status.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_errors_surface_in_status() {
        let remote = InMemoryRemote::new();
        remote.fail_pulls(1);
        let session = session(&remote);

        session.bind(Identity::new(Role::Pharmacist, "t")).await.unwrap();
        let mut rx = session.subscribe();
        let status = rx
            .wait_for(|s| s.last_sync_error.is_some())
            .await
            .map(|s| SyncStatus::clone(&s))
            .unwrap();
        assert!(status.is_ready);
        assert!(status.last_sync_error.unwrap().contains("prescriptions"));
        session.unbind().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_with_purge_removes_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..SyncConfig::default()
        };
        let session = SyncSession::new(config, Arc::new(InMemoryRemote::new()));
        session.bind(Identity::new(Role::Doctor, "t")).await.unwrap();
        session.settled().await;
        let path = dir.path().join("hospital_doctor.sqlite3");
        assert!(path.exists());

        session.sign_out(false).await.unwrap();
        assert!(path.exists());
        assert_eq!(session.status(), SyncStatus::default());

        session.bind(Identity::new(Role::Doctor, "t")).await.unwrap();
        session.settled().await;
        session.sign_out(true).await.unwrap();
        assert!(!path.exists());
    }
}
