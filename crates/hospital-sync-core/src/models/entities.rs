//! Typed entity schemas, one per collection.
//!
//! The wire stays schema-less JSON; these structs are the application
//! boundary. A document is valid for a collection when its fields
//! deserialize into the collection's entity. Unknown fields are kept.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CollectionName, Document, RecordId, SchemaError};

/// A typed view of one collection's documents.
pub trait Entity: Serialize + DeserializeOwned {
    const COLLECTION: CollectionName;
}

macro_rules! entity {
    ($ty:ident => $collection:ident) => {
        impl Entity for $ty {
            const COLLECTION: CollectionName = CollectionName::$collection;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub email: String,
    pub role: String,
    pub department_id: Option<RecordId>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<String>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub blood_group: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub patient_id: RecordId,
    pub doctor_id: RecordId,
    pub scheduled_at: String,
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bed {
    pub bed_number: String,
    pub ward: Option<String>,
    pub department_id: Option<RecordId>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    pub patient_id: RecordId,
    pub bed_id: Option<RecordId>,
    pub status: String,
    pub admitted_at: Option<String>,
    pub discharged_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabDefinition {
    pub name: String,
    pub code: Option<String>,
    pub price: Option<f64>,
    pub normal_range: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Department {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supply {
    pub name: String,
    pub quantity: i64,
    pub unit: Option<String>,
    pub reorder_level: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    pub name: String,
    pub dosage_form: Option<String>,
    pub strength: Option<String>,
    pub stock: Option<i64>,
}

/// Server-computed aggregates; any metric keys are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub scope: Option<String>,
    #[serde(flatten)]
    pub metrics: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabRequest {
    pub patient_id: RecordId,
    pub lab_definition_id: RecordId,
    pub requested_by: Option<RecordId>,
    pub status: String,
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prescription {
    pub patient_id: RecordId,
    pub doctor_id: Option<RecordId>,
    pub medication_id: Option<RecordId>,
    pub dosage: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicalRecord {
    pub patient_id: RecordId,
    pub doctor_id: Option<RecordId>,
    pub diagnosis: String,
    pub notes: Option<String>,
    pub recorded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vital {
    pub patient_id: RecordId,
    pub temperature: Option<f64>,
    pub pulse: Option<i64>,
    pub blood_pressure: Option<String>,
    pub recorded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispensation {
    pub prescription_id: RecordId,
    pub quantity: i64,
    pub dispensed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplyUsage {
    pub supply_id: RecordId,
    pub quantity: i64,
    pub used_by: Option<RecordId>,
    pub used_at: Option<String>,
}

entity!(User => Users);
entity!(Patient => Patients);
entity!(Appointment => Appointments);
entity!(Bed => Beds);
entity!(Admission => Admissions);
entity!(LabDefinition => LabDefinitions);
entity!(Department => Departments);
entity!(Supply => Supplies);
entity!(Medication => Medications);
entity!(DashboardStats => DashboardStats);
entity!(LabRequest => LabRequests);
entity!(Prescription => Prescriptions);
entity!(MedicalRecord => MedicalRecords);
entity!(Vital => Vitals);
entity!(Dispensation => Dispensations);
entity!(SupplyUsage => SupplyUsages);

fn check<T: Entity>(document: &Document) -> Result<(), SchemaError> {
    document
        .to_entity::<T>()
        .map(|_| ())
        .map_err(|e| SchemaError::Invalid {
            collection: T::COLLECTION,
            id: document.id.clone(),
            reason: e.to_string(),
        })
}

/// Validate a document against its collection's entity schema.
///
/// Tombstones are not validated: a deletion may carry nothing but its id.
pub fn validate_document(collection: CollectionName, document: &Document) -> Result<(), SchemaError> {
    if document.id.trim().is_empty() {
        return Err(SchemaError::MissingId);
    }
    if document.deleted {
        return Ok(());
    }

    match collection {
        CollectionName::Users => check::<User>(document),
        CollectionName::Patients => check::<Patient>(document),
        CollectionName::Appointments => check::<Appointment>(document),
        CollectionName::Beds => check::<Bed>(document),
        CollectionName::Admissions => check::<Admission>(document),
        CollectionName::LabDefinitions => check::<LabDefinition>(document),
        CollectionName::Departments => check::<Department>(document),
        CollectionName::Supplies => check::<Supply>(document),
        CollectionName::Medications => check::<Medication>(document),
        CollectionName::DashboardStats => check::<DashboardStats>(document),
        CollectionName::LabRequests => check::<LabRequest>(document),
        CollectionName::Prescriptions => check::<Prescription>(document),
        CollectionName::MedicalRecords => check::<MedicalRecord>(document),
        CollectionName::Vitals => check::<Vital>(document),
        CollectionName::Dispensations => check::<Dispensation>(document),
        CollectionName::SupplyUsages => check::<SupplyUsage>(document),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_valid_patient() {
        let patient = doc(json!({
            "id": 1,
            "first_name": "Ada",
            "last_name": "Lovelace",
            "ward_note": "extra fields are kept"
        }));
        assert!(validate_document(CollectionName::Patients, &patient).is_ok());

        let typed: Patient = patient.to_entity().unwrap();
        assert_eq!(typed.last_name, "Lovelace");
        assert!(typed.phone.is_none());
    }

    #[test]
    fn test_missing_required_field() {
        let patient = doc(json!({"id": 1, "first_name": "Ada"}));
        let err = validate_document(CollectionName::Patients, &patient).unwrap_err();
        match err {
            SchemaError::Invalid { collection, id, reason } => {
                assert_eq!(collection, CollectionName::Patients);
                assert_eq!(id, "1");
                assert!(reason.contains("last_name"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_type() {
        let supply = doc(json!({"id": "s1", "name": "Gauze", "quantity": "lots"}));
        assert!(validate_document(CollectionName::Supplies, &supply).is_err());
    }

    #[test]
    fn test_tombstone_skips_validation() {
        let tombstone = doc(json!({"id": 9, "_deleted": true}));
        assert!(validate_document(CollectionName::Appointments, &tombstone).is_ok());
    }

    #[test]
    fn test_dashboard_stats_accepts_any_metrics() {
        let stats = doc(json!({"id": "today", "total_patients": 12, "beds_free": 3}));
        assert!(validate_document(CollectionName::DashboardStats, &stats).is_ok());
    }

    #[test]
    fn test_foreign_keys_accept_numbers_and_strings() {
        let appointment = doc(json!({
            "id": 5,
            "patient_id": 10,
            "doctor_id": "doc-2",
            "scheduled_at": "2024-03-01T09:00:00Z",
            "status": "scheduled"
        }));
        let typed: Appointment = appointment.to_entity().unwrap();
        assert_eq!(typed.patient_id, RecordId::Int(10));
        assert_eq!(typed.doctor_id, RecordId::Text("doc-2".into()));
    }

    #[test]
    fn test_from_entity_round_trip() {
        let department = Department {
            name: "Cardiology".into(),
            description: None,
        };
        let document = Document::from_entity("d1", &department).unwrap();
        assert!(validate_document(CollectionName::Departments, &document).is_ok());
        assert_eq!(document.to_entity::<Department>().unwrap(), department);
    }
}
