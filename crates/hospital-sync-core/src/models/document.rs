//! Schema-less documents as they travel over the wire and sit in the store.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::{CollectionName, RecordId};

/// Model-level errors: parsing of names and schema validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Unknown context: {input}{}", suggestion_hint(.suggestion))]
    UnknownContext {
        input: String,
        suggestion: Option<String>,
    },

    #[error("Document is not a JSON object")]
    NotAnObject,

    #[error("Document is missing an id")]
    MissingId,

    #[error("Malformed document: {0}")]
    Malformed(String),

    #[error("Invalid {collection} document {id}: {reason}")]
    Invalid {
        collection: CollectionName,
        id: String,
        reason: String,
    },
}

fn suggestion_hint(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{}'?)", s))
        .unwrap_or_default()
}

/// A single document: stable id, domain fields, server timestamp and tombstone flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(deserialize_with = "deserialize_record_id")]
    pub id: String,
    /// Assigned by the remote authority; `None` for documents never seen by it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            updated_at: None,
            deleted: false,
            fields,
        }
    }

    /// A document created offline; the id is a fresh UUID until the remote assigns its own.
    pub fn new_local(fields: Map<String, Value>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), fields)
    }

    /// Build a document from an arbitrary JSON value (must be an object with an id).
    pub fn from_value(value: Value) -> Result<Self, SchemaError> {
        if !value.is_object() {
            return Err(SchemaError::NotAnObject);
        }
        if value.get("id").map_or(true, Value::is_null) {
            return Err(SchemaError::MissingId);
        }
        serde_json::from_value(value).map_err(|e| SchemaError::Malformed(e.to_string()))
    }

    /// Build a document from a typed entity.
    pub fn from_entity<T: Serialize>(id: impl Into<String>, entity: &T) -> Result<Self, SchemaError> {
        match serde_json::to_value(entity) {
            Ok(Value::Object(fields)) => Ok(Self::new(id, fields)),
            Ok(_) => Err(SchemaError::NotAnObject),
            Err(e) => Err(SchemaError::Malformed(e.to_string())),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Deserialize the domain fields into an entity type.
    pub fn to_entity<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }

    /// Domain fields only, serialized for storage.
    pub fn fields_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.fields)
    }
}

/// Conflict reported by the remote for a pushed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub reason: String,
    pub server_rev: Option<String>,
}

/// A document plus the local replication metadata kept next to it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub collection: CollectionName,
    pub document: Document,
    /// Modified locally and not yet acknowledged by the remote.
    pub dirty: bool,
    /// Incremented on every local write.
    pub local_rev: i64,
    pub conflict: Option<ConflictRecord>,
    pub local_modified_at: Option<String>,
}

impl StoredDocument {
    pub fn id(&self) -> &str {
        &self.document.id
    }

    pub fn is_deleted(&self) -> bool {
        self.document.deleted
    }

    pub fn is_conflicted(&self) -> bool {
        self.conflict.is_some()
    }
}

/// Accepts either a JSON number or string id and normalizes it to a string.
pub fn deserialize_record_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RecordId::deserialize(deserializer).map(|id| id.to_string())
}

/// List form of [`deserialize_record_id`].
pub fn deserialize_record_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<RecordId>::deserialize(deserializer)
        .map(|ids| ids.into_iter().map(|id| id.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_id_normalized() {
        let doc: Document = serde_json::from_value(json!({
            "id": 42,
            "first_name": "Ada",
            "updated_at": "2024-01-02T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(doc.id, "42");
        assert!(!doc.deleted);
        assert_eq!(doc.field("first_name"), Some(&json!("Ada")));
        assert!(!doc.fields.contains_key("id"));
        assert!(!doc.fields.contains_key("updated_at"));
    }

    #[test]
    fn test_tombstone_flag() {
        let doc: Document = serde_json::from_value(json!({"id": "7", "_deleted": true})).unwrap();
        assert!(doc.deleted);
        assert!(doc.fields.is_empty());
    }

    #[test]
    fn test_serializes_flat() {
        let mut fields = Map::new();
        fields.insert("name".into(), json!("Ward A"));
        let mut doc = Document::new("3", fields);
        doc.updated_at = Some("2024-01-01T00:00:00Z".into());

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            value,
            json!({"id": "3", "name": "Ward A", "updated_at": "2024-01-01T00:00:00Z", "_deleted": false})
        );
    }

    #[test]
    fn test_from_value_requires_object_and_id() {
        assert_eq!(Document::from_value(json!([1, 2])), Err(SchemaError::NotAnObject));
        assert_eq!(Document::from_value(json!({"name": "x"})), Err(SchemaError::MissingId));
        assert!(Document::from_value(json!({"id": 1})).is_ok());
    }

    #[test]
    fn test_new_local_uses_uuid() {
        let doc = Document::new_local(Map::new());
        assert_eq!(doc.id.len(), 36);
        assert!(doc.updated_at.is_none());
    }

    #[test]
    fn test_unknown_context_message() {
        let err = SchemaError::UnknownContext {
            input: "dashbord".into(),
            suggestion: Some("dashboard".into()),
        };
        assert_eq!(
            err.to_string(),
            "Unknown context: dashbord (did you mean 'dashboard'?)"
        );
    }
}
