//! Roles and their authorized collections.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{CollectionName, SchemaError, SyncContext};

/// Identity class of the signed-in user.
///
/// Decides which collections may exist in the local store and which
/// contexts the UI may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Receptionist,
    Doctor,
    Pharmacist,
    LabTechnician,
    Nurse,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Admin,
        Role::Receptionist,
        Role::Doctor,
        Role::Pharmacist,
        Role::LabTechnician,
        Role::Nurse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Receptionist => "receptionist",
            Role::Doctor => "doctor",
            Role::Pharmacist => "pharmacist",
            Role::LabTechnician => "lab_technician",
            Role::Nurse => "nurse",
        }
    }

    /// Collections this role is authorized to hold locally.
    pub fn collections(&self) -> &'static [CollectionName] {
        use CollectionName::*;
        match self {
            Role::Admin => &[
                Users,
                Departments,
                Beds,
                Supplies,
                Medications,
                LabDefinitions,
                DashboardStats,
                Patients,
                Appointments,
                Admissions,
            ],
            Role::Receptionist => &[
                Users,
                Patients,
                Appointments,
                Admissions,
                Beds,
                Departments,
                DashboardStats,
            ],
            Role::Doctor => &[
                Patients,
                Appointments,
                Admissions,
                MedicalRecords,
                Prescriptions,
                LabRequests,
                Vitals,
                LabDefinitions,
                Medications,
                DashboardStats,
            ],
            Role::Pharmacist => &[
                Patients,
                Prescriptions,
                Medications,
                Dispensations,
                Supplies,
                SupplyUsages,
                DashboardStats,
            ],
            Role::LabTechnician => &[
                Patients,
                LabRequests,
                LabDefinitions,
                Supplies,
                SupplyUsages,
                DashboardStats,
            ],
            Role::Nurse => &[
                Patients,
                Admissions,
                Beds,
                Vitals,
                Medications,
                Supplies,
                SupplyUsages,
                DashboardStats,
            ],
        }
    }

    /// Whether `collection` belongs to this role's authorized list.
    pub fn holds(&self, collection: CollectionName) -> bool {
        self.collections().contains(&collection)
    }

    /// Contexts the UI may request for this role.
    pub fn contexts(&self) -> Vec<SyncContext> {
        SyncContext::ALL
            .iter()
            .copied()
            .filter(|context| context.collections_for(*self).is_some())
            .collect()
    }

    /// Context activated right after sign-in.
    pub fn initial_context(&self) -> SyncContext {
        SyncContext::Dashboard
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "admin" => Ok(Role::Admin),
            "receptionist" => Ok(Role::Receptionist),
            "doctor" => Ok(Role::Doctor),
            "pharmacist" => Ok(Role::Pharmacist),
            "lab_technician" | "labtechnician" => Ok(Role::LabTechnician),
            "nurse" => Ok(Role::Nurse),
            _ => Err(SchemaError::UnknownRole(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role_variants() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("Lab-Technician".parse::<Role>().unwrap(), Role::LabTechnician);
        assert_eq!("labtechnician".parse::<Role>().unwrap(), Role::LabTechnician);
        assert!("janitor".parse::<Role>().is_err());
    }

    #[test]
    fn test_round_trip_as_str() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }

    #[test]
    fn test_collections_have_no_duplicates() {
        for role in Role::ALL {
            let mut names: Vec<_> = role.collections().to_vec();
            names.sort();
            names.dedup();
            assert_eq!(names.len(), role.collections().len(), "{role}");
        }
    }

    #[test]
    fn test_every_role_has_dashboard() {
        for role in Role::ALL {
            assert!(role.contexts().contains(&role.initial_context()));
        }
    }

    #[test]
    fn test_receptionist_cannot_hold_prescriptions() {
        assert!(Role::Receptionist.holds(CollectionName::Patients));
        assert!(!Role::Receptionist.holds(CollectionName::Prescriptions));
    }
}
