//! Replication Channel: one collection kept in step with the remote.
//!
//! Each channel runs a task that loops over push-then-pull cycles:
//!
//! ```text
//!   created ──► active ◄──► paused
//!                 │            │
//!                 └──► canceled ◄┘
//! ```
//!
//! A cycle pushes dirty documents in batches, then pulls until the remote
//! reports `hasMore = false`. Between cycles the task sleeps for the poll
//! interval (or the retry delay after an error) and wakes early on a local
//! write to its collection or on a state change. Every remote call is raced
//! against the state: pausing or canceling abandons the call and nothing it
//! returns is applied.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::protocol::{PullRequest, PushRequest};
use super::remote::{RemoteError, RemoteSource};
use super::retry::RetryPolicy;
use crate::models::{CollectionName, Document, Role, SyncContext};
use crate::store::{LocalChange, LocalStore, StoreError};

const ERROR_CAPACITY: usize = 64;

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Created,
    Active,
    Paused,
    Canceled,
}

/// Errors surfaced on a channel's error stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicationError {
    #[error("Pull failed for {collection}: {source}")]
    Pull {
        collection: CollectionName,
        #[source]
        source: RemoteError,
    },

    #[error("Push failed for {collection}: {source}")]
    Push {
        collection: CollectionName,
        #[source]
        source: RemoteError,
    },

    #[error("Local store error for {collection}: {message}")]
    Store {
        collection: CollectionName,
        message: String,
    },

    #[error("Replication of {collection} was canceled")]
    Canceled { collection: CollectionName },
}

impl ReplicationError {
    pub fn collection(&self) -> CollectionName {
        match self {
            ReplicationError::Pull { collection, .. }
            | ReplicationError::Push { collection, .. }
            | ReplicationError::Store { collection, .. }
            | ReplicationError::Canceled { collection } => *collection,
        }
    }
}

/// Tunables shared by every channel of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    pub pull_batch_size: usize,
    pub push_batch_size: usize,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            pull_batch_size: 100,
            push_batch_size: 50,
            poll_interval: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// What a channel replicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub collection: CollectionName,
    pub context: SyncContext,
    /// Every collection of the context, sent with each pull.
    pub context_collections: Vec<CollectionName>,
    /// Checkpoint key.
    pub replication_id: String,
}

/// Checkpoint key for one (endpoint, role, collection, context).
pub fn replication_id(base_url: &str, role: Role, collection: CollectionName, context: SyncContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(base_url.trim_end_matches('/').as_bytes());
    hasher.update(b"|");
    hasher.update(role.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(collection.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(context.as_str().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Point-in-time view of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    pub collection: CollectionName,
    pub context: SyncContext,
    pub state: ChannelState,
    /// A request is in flight.
    pub active: bool,
    pub initial_replication_done: bool,
    pub last_error: Option<ReplicationError>,
}

struct Shared {
    state: watch::Sender<ChannelState>,
    active: watch::Sender<bool>,
    initial: watch::Sender<Option<Result<(), ReplicationError>>>,
    last_error: watch::Sender<Option<ReplicationError>>,
    errors: broadcast::Sender<ReplicationError>,
}

/// Handle to a running replication task.
pub struct ReplicationChannel {
    target: ChannelTarget,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl ReplicationChannel {
    /// Spawn the replication task and activate it.
    pub fn spawn(
        target: ChannelTarget,
        store: LocalStore,
        remote: Arc<dyn RemoteSource>,
        settings: ChannelSettings,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        let shared = Arc::new(Shared {
            state: watch::Sender::new(ChannelState::Created),
            active: watch::Sender::new(false),
            initial: watch::Sender::new(None),
            last_error: watch::Sender::new(None),
            errors,
        });

        let worker = Worker {
            collection: target.collection,
            context: target.context,
            replication_id: target.replication_id.clone(),
            context_collections: target
                .context_collections
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
            state_rx: shared.state.subscribe(),
            local_rx: store.subscribe_local_changes(),
            store,
            remote,
            settings,
            shared: Arc::clone(&shared),
            failures: 0,
        };

        let span = tracing::info_span!(
            "replication",
            collection = %target.collection,
            context = %target.context,
        );
        let task = tokio::spawn(worker.run().instrument(span));

        shared.state.send_replace(ChannelState::Active);

        Self {
            target,
            shared,
            task: Some(task),
        }
    }

    pub fn collection(&self) -> CollectionName {
        self.target.collection
    }

    pub fn context(&self) -> SyncContext {
        self.target.context
    }

    pub fn replication_id(&self) -> &str {
        &self.target.replication_id
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == ChannelState::Canceled
    }

    /// Suspend pull and push. Returns `false` if the channel was not active.
    pub fn pause(&self) -> bool {
        self.shared.state.send_if_modified(|state| match state {
            ChannelState::Created | ChannelState::Active => {
                *state = ChannelState::Paused;
                true
            }
            _ => false,
        })
    }

    /// Resume a paused channel. A canceled channel stays canceled.
    pub fn resume(&self) -> bool {
        self.shared.state.send_if_modified(|state| {
            if *state == ChannelState::Paused {
                *state = ChannelState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Move to the terminal state. Any in-flight request is abandoned.
    pub fn cancel(&self) {
        self.shared.state.send_if_modified(|state| {
            if *state == ChannelState::Canceled {
                false
            } else {
                *state = ChannelState::Canceled;
                true
            }
        });
    }

    /// Cancel and wait for the task to exit. After this returns the channel
    /// no longer touches the store.
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(collection = %self.target.collection, error = %e, "replication task ended abnormally");
            }
        }
    }

    /// Resolves after the first settled pull drain, the first pull error, or
    /// cancellation, whichever comes first.
    pub async fn await_initial_replication(&self) -> Result<(), ReplicationError> {
        let mut rx = self.shared.initial.subscribe();
        loop {
            let outcome = rx.borrow_and_update().clone();
            if let Some(outcome) = outcome {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(ReplicationError::Canceled {
                    collection: self.target.collection,
                });
            }
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// `true` while a request is in flight.
    pub fn subscribe_active(&self) -> watch::Receiver<bool> {
        self.shared.active.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ReplicationError> {
        self.shared.errors.subscribe()
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            collection: self.target.collection,
            context: self.target.context,
            state: self.state(),
            active: *self.shared.active.borrow(),
            initial_replication_done: self.shared.initial.borrow().is_some(),
            last_error: self.shared.last_error.borrow().clone(),
        }
    }
}

impl Drop for ReplicationChannel {
    fn drop(&mut self) {
        self.cancel();
    }
}

// =========================================================================
// Worker
// =========================================================================

enum Step<T> {
    Done(T),
    /// The channel left the active state while the step was running.
    Interrupted,
}

enum CycleOutcome {
    Settled,
    Failed,
    Interrupted,
}

#[derive(Debug, Default)]
struct PullSummary {
    batches: usize,
    written: usize,
}

#[derive(Debug, Default)]
struct PushSummary {
    written: usize,
    conflicts: usize,
    forbidden: bool,
}

/// Resolves once the state is anything but active.
async fn left_active(state_rx: &mut watch::Receiver<ChannelState>) {
    loop {
        let state = *state_rx.borrow_and_update();
        if state != ChannelState::Active {
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Run a remote call bounded by the request timeout, abandoning it if the
/// channel leaves the active state.
async fn guarded<T, F>(
    state_rx: &mut watch::Receiver<ChannelState>,
    timeout: Duration,
    call: F,
) -> Step<Result<T, RemoteError>>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    tokio::select! {
        biased;
        _ = left_active(state_rx) => Step::Interrupted,
        result = tokio::time::timeout(timeout, call) => {
            Step::Done(result.unwrap_or(Err(RemoteError::Timeout(timeout))))
        }
    }
}

struct Worker {
    collection: CollectionName,
    context: SyncContext,
    replication_id: String,
    context_collections: Vec<String>,
    store: LocalStore,
    remote: Arc<dyn RemoteSource>,
    settings: ChannelSettings,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ChannelState>,
    local_rx: broadcast::Receiver<LocalChange>,
    failures: u32,
}

impl Worker {
    async fn run(mut self) {
        debug!(replication_id = %self.replication_id, "replication task started");

        while self.wait_until_active().await {
            let delay = match self.cycle().await {
                CycleOutcome::Interrupted => continue,
                CycleOutcome::Settled => {
                    self.failures = 0;
                    self.settings.poll_interval
                }
                CycleOutcome::Failed => {
                    self.failures += 1;
                    match self.settings.retry.delay_for(self.failures) {
                        Some(delay) => delay,
                        None => {
                            warn!(
                                attempts = self.failures - 1,
                                "retry attempts exhausted; falling back to poll interval"
                            );
                            self.failures = 0;
                            self.settings.poll_interval
                        }
                    }
                }
            };

            if !self.idle(delay).await {
                break;
            }
        }

        self.shared.active.send_replace(false);
        self.report_initial(Err(ReplicationError::Canceled {
            collection: self.collection,
        }));
        debug!("replication task stopped");
    }

    /// Wait for the active state. Returns `false` once canceled.
    async fn wait_until_active(&mut self) -> bool {
        loop {
            let state = *self.state_rx.borrow_and_update();
            match state {
                ChannelState::Active => return true,
                ChannelState::Canceled => return false,
                ChannelState::Created | ChannelState::Paused => {}
            }
            if self.state_rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Sleep between cycles. Returns `false` once canceled.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    let state = *self.state_rx.borrow_and_update();
                    match state {
                        ChannelState::Canceled => return false,
                        ChannelState::Paused => return true,
                        ChannelState::Created | ChannelState::Active => {}
                    }
                }
                change = self.local_rx.recv() => match change {
                    Ok(change) if change.collection == self.collection && !self.collection.is_read_only() => {
                        debug!(id = %change.id, "local change; pushing early");
                        return true;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => return true,
                    Err(RecvError::Closed) => {
                        (&mut sleep).await;
                        return true;
                    }
                },
                _ = &mut sleep => return true,
            }
        }
    }

    fn is_active(&self) -> bool {
        *self.state_rx.borrow() == ChannelState::Active
    }

    fn store_error(&self, e: StoreError) -> ReplicationError {
        ReplicationError::Store {
            collection: self.collection,
            message: e.to_string(),
        }
    }

    fn pull_decode_error(&self, message: String) -> ReplicationError {
        ReplicationError::Pull {
            collection: self.collection,
            source: RemoteError::Decode(message),
        }
    }

    fn report_initial(&self, outcome: Result<(), ReplicationError>) {
        self.shared.initial.send_if_modified(|initial| {
            if initial.is_some() {
                return false;
            }
            *initial = Some(outcome);
            true
        });
    }

    fn emit(&self, error: ReplicationError) {
        warn!(error = %error, failures = self.failures, "replication error");
        self.shared.last_error.send_replace(Some(error.clone()));
        // Nobody listening is fine.
        let _ = self.shared.errors.send(error);
    }

    async fn cycle(&mut self) -> CycleOutcome {
        // One push covers every write queued so far.
        while self.local_rx.try_recv().is_ok() {}

        let push_failed = match self.push_pending().await {
            Ok(Step::Interrupted) => return CycleOutcome::Interrupted,
            Ok(Step::Done(summary)) => {
                if summary.written > 0 || summary.conflicts > 0 {
                    info!(
                        written = summary.written,
                        conflicts = summary.conflicts,
                        "pushed local changes"
                    );
                }
                if summary.forbidden {
                    info!("push forbidden by remote; nothing accepted");
                }
                false
            }
            Err(e) => {
                self.emit(e);
                true
            }
        };

        match self.pull_until_settled().await {
            Ok(Step::Interrupted) => CycleOutcome::Interrupted,
            Ok(Step::Done(summary)) => {
                if summary.written > 0 {
                    info!(
                        batches = summary.batches,
                        written = summary.written,
                        "pulled remote changes"
                    );
                }
                self.report_initial(Ok(()));
                if push_failed {
                    CycleOutcome::Failed
                } else {
                    self.shared.last_error.send_replace(None);
                    CycleOutcome::Settled
                }
            }
            Err(e) => {
                self.report_initial(Err(e.clone()));
                self.emit(e);
                CycleOutcome::Failed
            }
        }
    }

    async fn pull_until_settled(&mut self) -> Result<Step<PullSummary>, ReplicationError> {
        let mut summary = PullSummary::default();

        loop {
            let checkpoint = self
                .store
                .checkpoint(&self.replication_id)
                .map_err(|e| self.store_error(e))?
                .unwrap_or_default();

            let request = PullRequest {
                checkpoint: checkpoint.clone(),
                context: self.context.as_str().to_string(),
                collections: self.context_collections.clone(),
                batch_size: self.settings.pull_batch_size,
            };

            let remote = Arc::clone(&self.remote);
            self.shared.active.send_replace(true);
            let step = guarded(&mut self.state_rx, self.settings.request_timeout, remote.pull(&request)).await;
            self.shared.active.send_replace(false);

            let mut response = match step {
                Step::Interrupted => return Ok(Step::Interrupted),
                Step::Done(result) => result.map_err(|source| ReplicationError::Pull {
                    collection: self.collection,
                    source,
                })?,
            };
            if !self.is_active() {
                return Ok(Step::Interrupted);
            }
            summary.batches += 1;

            let values = response.take_documents(self.collection.as_str());
            let next = match response.checkpoint.clone() {
                Some(next) => next,
                None if values.is_empty() => checkpoint.clone(),
                None => {
                    return Err(self.pull_decode_error(format!(
                        "{} documents without a checkpoint",
                        values.len()
                    )))
                }
            };
            let documents = values
                .into_iter()
                .map(Document::from_value)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| self.pull_decode_error(e.to_string()))?;

            let report = self
                .store
                .apply_pull(
                    self.collection,
                    &self.replication_id,
                    self.context.as_str(),
                    documents,
                    &next,
                )
                .map_err(|e| self.store_error(e))?;
            summary.written += report.written();

            if report.is_stale() {
                warn!(checkpoint = %next, "dropping pull response behind stored checkpoint");
            }

            if !response.has_more {
                break;
            }
            if report.is_stale() || !next.is_ahead_of(&checkpoint) {
                warn!(checkpoint = %next, "remote reported more data without advancing; settling");
                break;
            }
        }

        Ok(Step::Done(summary))
    }

    async fn push_pending(&mut self) -> Result<Step<PushSummary>, ReplicationError> {
        let mut summary = PushSummary::default();

        // Read-only collections never reach the network.
        if self.collection.is_read_only() {
            return Ok(Step::Done(summary));
        }

        loop {
            let batch = self
                .store
                .pending_batch(self.collection, self.settings.push_batch_size)
                .map_err(|e| self.store_error(e))?;
            if batch.is_empty() {
                break;
            }

            let batch_len = batch.len();
            let stamped_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            let revisions: HashMap<String, i64> = batch
                .iter()
                .map(|stored| (stored.id().to_string(), stored.local_rev))
                .collect();
            let changes = batch
                .into_iter()
                .map(|stored| {
                    let mut document = stored.document;
                    document.updated_at = Some(stamped_at.clone());
                    document
                })
                .collect();
            let request = PushRequest {
                collection: self.collection.as_str().to_string(),
                changes,
            };

            let remote = Arc::clone(&self.remote);
            self.shared.active.send_replace(true);
            let step = guarded(&mut self.state_rx, self.settings.request_timeout, remote.push(&request)).await;
            self.shared.active.send_replace(false);

            let response = match step {
                Step::Interrupted => return Ok(Step::Interrupted),
                Step::Done(Err(RemoteError::Forbidden)) => {
                    summary.forbidden = true;
                    break;
                }
                Step::Done(result) => result.map_err(|source| ReplicationError::Push {
                    collection: self.collection,
                    source,
                })?,
            };
            if !self.is_active() {
                return Ok(Step::Interrupted);
            }

            let mut progressed = 0;
            for id in &response.written {
                let Some(&local_rev) = revisions.get(id) else {
                    continue;
                };
                if self
                    .store
                    .acknowledge(self.collection, id, local_rev)
                    .map_err(|e| self.store_error(e))?
                {
                    summary.written += 1;
                }
                progressed += 1;
            }
            for conflict in &response.conflicts {
                if !revisions.contains_key(&conflict.id) {
                    continue;
                }
                warn!(
                    id = %conflict.id,
                    reason = %conflict.reason,
                    server_rev = ?conflict.server_rev,
                    "push conflict; waiting for the server copy"
                );
                if self
                    .store
                    .mark_conflicted(
                        self.collection,
                        &conflict.id,
                        &conflict.reason,
                        conflict.server_rev.as_deref(),
                    )
                    .map_err(|e| self.store_error(e))?
                {
                    summary.conflicts += 1;
                }
                progressed += 1;
            }

            if batch_len < self.settings.push_batch_size || progressed == 0 {
                break;
            }
        }

        Ok(Step::Done(summary))
    }
}
