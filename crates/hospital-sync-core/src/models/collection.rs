//! Collection names, schema versions and the read-only set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::SchemaError;

/// A named set of documents of one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionName {
    Users,
    Patients,
    Appointments,
    Beds,
    Admissions,
    LabDefinitions,
    Departments,
    Supplies,
    Medications,
    DashboardStats,
    LabRequests,
    Prescriptions,
    MedicalRecords,
    Vitals,
    Dispensations,
    SupplyUsages,
}

/// Workflow-derived collections. Local writes to these never reach the network;
/// they change only through explicit workflow actions on the remote API.
pub const READ_ONLY_COLLECTIONS: [CollectionName; 8] = [
    CollectionName::Appointments,
    CollectionName::Admissions,
    CollectionName::LabRequests,
    CollectionName::Prescriptions,
    CollectionName::MedicalRecords,
    CollectionName::Vitals,
    CollectionName::Dispensations,
    CollectionName::SupplyUsages,
];

impl CollectionName {
    pub const ALL: [CollectionName; 16] = [
        CollectionName::Users,
        CollectionName::Patients,
        CollectionName::Appointments,
        CollectionName::Beds,
        CollectionName::Admissions,
        CollectionName::LabDefinitions,
        CollectionName::Departments,
        CollectionName::Supplies,
        CollectionName::Medications,
        CollectionName::DashboardStats,
        CollectionName::LabRequests,
        CollectionName::Prescriptions,
        CollectionName::MedicalRecords,
        CollectionName::Vitals,
        CollectionName::Dispensations,
        CollectionName::SupplyUsages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionName::Users => "users",
            CollectionName::Patients => "patients",
            CollectionName::Appointments => "appointments",
            CollectionName::Beds => "beds",
            CollectionName::Admissions => "admissions",
            CollectionName::LabDefinitions => "lab_definitions",
            CollectionName::Departments => "departments",
            CollectionName::Supplies => "supplies",
            CollectionName::Medications => "medications",
            CollectionName::DashboardStats => "dashboard_stats",
            CollectionName::LabRequests => "lab_requests",
            CollectionName::Prescriptions => "prescriptions",
            CollectionName::MedicalRecords => "medical_records",
            CollectionName::Vitals => "vitals",
            CollectionName::Dispensations => "dispensations",
            CollectionName::SupplyUsages => "supply_usages",
        }
    }

    /// Push is unconditionally suppressed for these collections.
    pub fn is_read_only(&self) -> bool {
        READ_ONLY_COLLECTIONS.contains(self)
    }

    /// Version of the entity schema stored for this collection.
    ///
    /// Bumping a version makes the provisioner drop the collection's
    /// checkpoints so the data is pulled again under the new schema.
    pub fn schema_version(&self) -> u32 {
        match self {
            CollectionName::Patients => 2,
            CollectionName::Appointments => 1,
            CollectionName::DashboardStats => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionName {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| SchemaError::UnknownCollection(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_set() {
        let read_only: Vec<_> = CollectionName::ALL
            .iter()
            .filter(|c| c.is_read_only())
            .collect();
        assert_eq!(read_only.len(), 8);
        assert!(CollectionName::Appointments.is_read_only());
        assert!(CollectionName::SupplyUsages.is_read_only());
        assert!(!CollectionName::Patients.is_read_only());
        assert!(!CollectionName::Beds.is_read_only());
    }

    #[test]
    fn test_parse_round_trip() {
        for name in CollectionName::ALL {
            assert_eq!(name.as_str().parse::<CollectionName>().unwrap(), name);
        }
        assert!("wards".parse::<CollectionName>().is_err());
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&CollectionName::LabDefinitions).unwrap();
        assert_eq!(json, "\"lab_definitions\"");
    }
}
