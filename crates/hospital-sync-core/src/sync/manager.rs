//! Sync Manager: the set of live channels for one role, driven as a unit.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::channel::{replication_id, ChannelSettings, ChannelStatus, ChannelTarget, ReplicationChannel, ReplicationError};
use super::remote::RemoteSource;
use super::SyncError;
use crate::models::{CollectionName, SyncContext};
use crate::store::{LocalStore, StoreResult};

const ERROR_FAN_IN_CAPACITY: usize = 128;

/// What `start_sync` achieved for each collection of the context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartReport {
    pub synced: Vec<CollectionName>,
    pub failed: Vec<(CollectionName, ReplicationError)>,
    /// Collections named by the context but absent from the store.
    pub skipped: Vec<CollectionName>,
}

pub struct SyncManager {
    store: LocalStore,
    remote: Arc<dyn RemoteSource>,
    settings: ChannelSettings,
    base_url: String,
    channels: BTreeMap<CollectionName, ReplicationChannel>,
    listeners: Vec<JoinHandle<()>>,
    current_context: Option<SyncContext>,
    errors: broadcast::Sender<ReplicationError>,
}

impl SyncManager {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteSource>,
        settings: ChannelSettings,
        base_url: impl Into<String>,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_FAN_IN_CAPACITY);
        Self {
            store,
            remote,
            settings,
            base_url: base_url.into(),
            channels: BTreeMap::new(),
            listeners: Vec::new(),
            current_context: None,
            errors,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Replace every live channel with the channels of `context`.
    ///
    /// Resolves once each collection finished its initial replication or
    /// failed it; one collection failing does not hold up the others.
    pub async fn start_sync(&mut self, context: SyncContext) -> Result<StartReport, SyncError> {
        let role = self.store.role();
        let collections = context
            .collections_for(role)
            .ok_or(SyncError::UnsupportedContext { role, context })?;

        self.stop_all().await;
        Ok(self.start_collections(context, collections).await)
    }

    pub(crate) async fn start_collections(
        &mut self,
        context: SyncContext,
        collections: &[CollectionName],
    ) -> StartReport {
        let role = self.store.role();
        self.current_context = Some(context);
        let mut report = StartReport::default();

        for &collection in collections {
            if !self.store.has_collection(collection) {
                warn!(
                    role = %role,
                    context = %context,
                    collection = %collection,
                    "collection not provisioned for role; skipping"
                );
                report.skipped.push(collection);
                continue;
            }

            let target = ChannelTarget {
                collection,
                context,
                context_collections: collections.to_vec(),
                replication_id: replication_id(&self.base_url, role, collection, context),
            };
            let channel = ReplicationChannel::spawn(
                target,
                self.store.clone(),
                Arc::clone(&self.remote),
                self.settings.clone(),
            );
            self.listen(&channel);

            // Registered before waiting so an abandoned start still gets stopped.
            let channel = self.channels.entry(collection).or_insert(channel);
            match channel.await_initial_replication().await {
                Ok(()) => report.synced.push(collection),
                Err(e) => {
                    warn!(context = %context, collection = %collection, error = %e, "initial replication failed");
                    report.failed.push((collection, e));
                }
            }
        }

        info!(
            role = %role,
            context = %context,
            synced = report.synced.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "context sync started"
        );
        report
    }

    /// Forward a channel's errors into the log and the manager's fan-in stream.
    fn listen(&mut self, channel: &ReplicationChannel) {
        let mut errors = channel.subscribe_errors();
        let mut active = channel.subscribe_active();
        let fan_in = self.errors.clone();
        let collection = channel.collection();
        let context = channel.context();

        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = errors.recv() => match received {
                        Ok(e) => {
                            error!(collection = %collection, context = %context, error = %e, "replication channel error");
                            // Nobody listening is fine.
                            let _ = fan_in.send(e);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(collection = %collection, skipped, "replication errors dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = active.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let in_flight = *active.borrow_and_update();
                        debug!(collection = %collection, in_flight, "replication activity");
                    }
                }
            }
        });
        self.listeners.push(listener);
    }

    /// Cancel every channel and drop all listeners. Safe to call repeatedly.
    pub async fn stop_all(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        self.current_context = None;

        if self.channels.is_empty() {
            return;
        }
        let channels = std::mem::take(&mut self.channels);
        for channel in channels.values() {
            channel.cancel();
        }
        let stopped = channels.len();
        for channel in channels.into_values() {
            channel.shutdown().await;
        }
        info!(role = %self.store.role(), channels = stopped, "replication stopped");
    }

    /// Pause every live channel. Returns how many changed state.
    pub fn pause_all(&self) -> usize {
        self.channels.values().filter(|channel| channel.pause()).count()
    }

    /// Resume every paused channel; canceled channels are skipped.
    pub fn resume_all(&self) -> usize {
        self.channels
            .values()
            .filter(|channel| !channel.is_canceled())
            .filter(|channel| channel.resume())
            .count()
    }

    pub fn current_context(&self) -> Option<SyncContext> {
        self.current_context
    }

    pub fn active_collections(&self) -> Vec<CollectionName> {
        self.channels.keys().copied().collect()
    }

    pub fn channel(&self, collection: CollectionName) -> Option<&ReplicationChannel> {
        self.channels.get(&collection)
    }

    pub fn statuses(&self) -> Vec<ChannelStatus> {
        self.channels.values().map(ReplicationChannel::status).collect()
    }

    /// Unacknowledged local changes per live collection.
    pub fn pending_changes(&self) -> StoreResult<BTreeMap<CollectionName, u64>> {
        self.channels
            .keys()
            .map(|&collection| Ok((collection, self.store.pending_count(collection)?)))
            .collect()
    }

    /// Errors from every channel, for the lifetime of the manager.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ReplicationError> {
        self.errors.subscribe()
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}
