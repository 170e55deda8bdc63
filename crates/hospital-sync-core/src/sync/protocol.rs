//! Wire types for the pull and push endpoints.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{deserialize_record_id, deserialize_record_ids, Checkpoint, Document};

/// Body of `POST {base}/api/sync/{role}/pull`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub checkpoint: Checkpoint,
    pub context: String,
    pub collections: Vec<String>,
    #[serde(rename = "batchSize")]
    pub batch_size: usize,
}

/// Response of the pull endpoint.
///
/// Documents stay as raw JSON until the channel has picked out its own
/// collection, so a malformed entry elsewhere cannot fail the whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Absent when the remote had nothing past the request checkpoint.
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub documents: HashMap<String, Vec<Value>>,
    #[serde(rename = "hasMore", default)]
    pub has_more: bool,
}

impl PullResponse {
    /// Raw documents for one collection.
    pub fn take_documents(&mut self, collection: &str) -> Vec<Value> {
        self.documents.remove(collection).unwrap_or_default()
    }
}

/// Body of `POST {base}/api/sync/{role}/push`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub collection: String,
    pub changes: Vec<Document>,
}

/// A write the remote refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConflict {
    #[serde(deserialize_with = "deserialize_record_id")]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub server_rev: Option<String>,
}

/// Response of the push endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, deserialize_with = "deserialize_record_ids")]
    pub written: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<PushConflict>,
}

impl PushResponse {
    /// Nothing accepted, nothing rejected.
    pub fn empty(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            success: true,
            written: Vec::new(),
            conflicts: Vec::new(),
        }
    }
}
