//! In-process remote authority speaking the pull/push contract.
//!
//! Used by tests and by `sync-probe --offline`. Timestamps come from a
//! logical clock, so ordering is deterministic regardless of wall time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value};
use tokio::sync::watch;

use super::protocol::{PullRequest, PullResponse, PushConflict, PushRequest, PushResponse};
use super::remote::{Identity, RemoteConnector, RemoteError, RemoteSource};
use crate::models::{Checkpoint, RecordId};

/// 2024-01-01T00:00:00Z
const CLOCK_EPOCH: i64 = 1_704_067_200;

#[derive(Debug, Clone)]
struct Record {
    id: RecordId,
    fields: Map<String, Value>,
    updated_at: String,
    deleted: bool,
}

impl Record {
    fn position(&self) -> Checkpoint {
        Checkpoint {
            updated_at: self.updated_at.clone(),
            id: self.id.clone(),
        }
    }

    fn to_json(&self) -> Value {
        let mut body = self.fields.clone();
        body.insert("id".into(), serde_json::to_value(&self.id).unwrap_or(Value::Null));
        body.insert("updated_at".into(), Value::String(self.updated_at.clone()));
        if self.deleted {
            body.insert("_deleted".into(), Value::Bool(true));
        }
        Value::Object(body)
    }
}

#[derive(Default)]
struct Authority {
    clock: i64,
    /// collection -> id -> record
    records: HashMap<String, BTreeMap<String, Record>>,
    forbidden: HashSet<String>,
    conflicts: HashMap<(String, String), PushConflict>,
    failing_pulls: u32,
    failing_pushes: u32,
    pull_log: Vec<PullRequest>,
    push_log: Vec<PushRequest>,
}

impl Authority {
    fn tick(&mut self) -> String {
        self.clock += 1;
        DateTime::from_timestamp(CLOCK_EPOCH + self.clock, 0)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| format!("{}", self.clock))
    }

    fn put(&mut self, collection: &str, id: RecordId, fields: Map<String, Value>, deleted: bool) -> Checkpoint {
        let updated_at = self.tick();
        let record = Record {
            id: id.clone(),
            fields,
            updated_at,
            deleted,
        };
        let position = record.position();
        self.records
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record);
        position
    }
}

/// A remote authority held in memory.
#[derive(Clone)]
pub struct InMemoryRemote {
    authority: Arc<Mutex<Authority>>,
    gate: Arc<watch::Sender<bool>>,
    pull_calls: Arc<watch::Sender<usize>>,
    push_calls: Arc<AtomicUsize>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            authority: Arc::new(Mutex::new(Authority::default())),
            gate: Arc::new(watch::Sender::new(true)),
            pull_calls: Arc::new(watch::Sender::new(0)),
            push_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn authority(&self) -> MutexGuard<'_, Authority> {
        // A panic while holding the lock only happens inside a failing test.
        self.authority.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a server document. Returns its position in pull order.
    pub fn upsert(&self, collection: &str, id: impl Into<RecordId>, fields: Value) -> Checkpoint {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.authority().put(collection, id.into(), fields, false)
    }

    /// Tombstone a server document.
    pub fn delete(&self, collection: &str, id: impl Into<RecordId>) -> Checkpoint {
        let id = id.into();
        let mut authority = self.authority();
        let fields = authority
            .records
            .get(collection)
            .and_then(|records| records.get(&id.to_string()))
            .map(|record| record.fields.clone())
            .unwrap_or_default();
        authority.put(collection, id, fields, true)
    }

    /// Current server copy, in wire form.
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.authority()
            .records
            .get(collection)
            .and_then(|records| records.get(id))
            .map(Record::to_json)
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.authority()
            .records
            .get(collection)
            .map_or(0, |records| records.values().filter(|r| !r.deleted).count())
    }

    /// Reject the next push of `id` with a conflict.
    pub fn inject_conflict(&self, collection: &str, id: &str, reason: &str, server_rev: Option<&str>) {
        self.authority().conflicts.insert(
            (collection.to_string(), id.to_string()),
            PushConflict {
                id: id.to_string(),
                status: Some("conflict".into()),
                reason: reason.to_string(),
                server_rev: server_rev.map(str::to_string),
            },
        );
    }

    /// Answer pushes to `collection` with HTTP 403.
    pub fn forbid_push(&self, collection: &str) {
        self.authority().forbidden.insert(collection.to_string());
    }

    /// Fail the next `count` pulls with HTTP 500.
    pub fn fail_pulls(&self, count: u32) {
        self.authority().failing_pulls = count;
    }

    /// Fail the next `count` pushes with HTTP 500.
    pub fn fail_pushes(&self, count: u32) {
        self.authority().failing_pushes = count;
    }

    /// Park every pull until [`release_pulls`](Self::release_pulls).
    pub fn hold_pulls(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_pulls(&self) {
        self.gate.send_replace(true);
    }

    pub fn pull_calls(&self) -> usize {
        *self.pull_calls.borrow()
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Resolve once at least `count` pulls have been received.
    pub async fn wait_for_pull_calls(&self, count: usize) {
        let mut rx = self.pull_calls.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|calls| *calls >= count).await;
    }

    pub fn pull_log(&self) -> Vec<PullRequest> {
        self.authority().pull_log.clone()
    }

    pub fn push_log(&self) -> Vec<PushRequest> {
        self.authority().push_log.clone()
    }

    fn answer_pull(&self, request: &PullRequest) -> Result<PullResponse, RemoteError> {
        let mut authority = self.authority();
        authority.pull_log.push(request.clone());

        if authority.failing_pulls > 0 {
            authority.failing_pulls -= 1;
            return Err(RemoteError::Status {
                status: 500,
                body: "pull unavailable".into(),
            });
        }

        let mut candidates: Vec<(&str, &Record)> = request
            .collections
            .iter()
            .filter_map(|name| authority.records.get(name).map(|records| (name.as_str(), records)))
            .flat_map(|(name, records)| records.values().map(move |record| (name, record)))
            .filter(|(_, record)| record.position().is_ahead_of(&request.checkpoint))
            .collect();
        candidates.sort_by(|a, b| a.1.position().cmp(&b.1.position()));

        let batch_size = request.batch_size.max(1);
        let has_more = candidates.len() > batch_size;
        candidates.truncate(batch_size);

        let mut documents: HashMap<String, Vec<Value>> = HashMap::new();
        for (name, record) in &candidates {
            documents
                .entry(name.to_string())
                .or_default()
                .push(record.to_json());
        }

        Ok(PullResponse {
            checkpoint: candidates.last().map(|(_, record)| record.position()),
            documents,
            has_more,
        })
    }

    fn answer_push(&self, request: &PushRequest) -> Result<PushResponse, RemoteError> {
        let mut authority = self.authority();
        authority.push_log.push(request.clone());

        if authority.forbidden.contains(&request.collection) {
            return Err(RemoteError::Forbidden);
        }
        if authority.failing_pushes > 0 {
            authority.failing_pushes -= 1;
            return Err(RemoteError::Status {
                status: 500,
                body: "push unavailable".into(),
            });
        }

        let mut response = PushResponse::empty("ok");
        for change in &request.changes {
            let key = (request.collection.clone(), change.id.clone());
            if let Some(conflict) = authority.conflicts.remove(&key) {
                response.conflicts.push(conflict);
                continue;
            }
            authority.put(
                &request.collection,
                RecordId::from_document_id(&change.id),
                change.fields.clone(),
                change.deleted,
            );
            response.written.push(change.id.clone());
        }
        Ok(response)
    }
}

#[async_trait]
impl RemoteSource for InMemoryRemote {
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, RemoteError> {
        self.pull_calls.send_modify(|calls| *calls += 1);

        let mut gate = self.gate.subscribe();
        // The sender lives as long as `self`.
        let _ = gate.wait_for(|open| *open).await;

        self.answer_pull(request)
    }

    async fn push(&self, request: &PushRequest) -> Result<PushResponse, RemoteError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.answer_push(request)
    }
}

impl RemoteConnector for InMemoryRemote {
    fn connect(&self, _identity: &Identity) -> Result<Arc<dyn RemoteSource>, RemoteError> {
        Ok(Arc::new(self.clone()))
    }
}
