//! UI contexts and the per-role context resolution table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{CollectionName, Role, SchemaError};

/// Minimum Jaro-Winkler similarity for a "did you mean" hint.
const SUGGESTION_THRESHOLD: f64 = 0.8;

/// A named bundle of collections that must be live-synced for one area of the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncContext {
    Dashboard,
    PatientSearch,
    Appointments,
    BedManagement,
    PatientChart,
    UserManagement,
    Inventory,
    LabCatalog,
    Prescriptions,
    LabRequests,
    Vitals,
}

impl SyncContext {
    pub const ALL: [SyncContext; 11] = [
        SyncContext::Dashboard,
        SyncContext::PatientSearch,
        SyncContext::Appointments,
        SyncContext::BedManagement,
        SyncContext::PatientChart,
        SyncContext::UserManagement,
        SyncContext::Inventory,
        SyncContext::LabCatalog,
        SyncContext::Prescriptions,
        SyncContext::LabRequests,
        SyncContext::Vitals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncContext::Dashboard => "dashboard",
            SyncContext::PatientSearch => "patient_search",
            SyncContext::Appointments => "appointments",
            SyncContext::BedManagement => "bed_management",
            SyncContext::PatientChart => "patient_chart",
            SyncContext::UserManagement => "user_management",
            SyncContext::Inventory => "inventory",
            SyncContext::LabCatalog => "lab_catalog",
            SyncContext::Prescriptions => "prescriptions",
            SyncContext::LabRequests => "lab_requests",
            SyncContext::Vitals => "vitals",
        }
    }

    /// Collections that are live in this context for `role`.
    ///
    /// `None` means the role does not support the context at all.
    pub fn collections_for(&self, role: Role) -> Option<&'static [CollectionName]> {
        use CollectionName::*;
        let collections: &'static [CollectionName] = match (role, self) {
            (Role::Admin, SyncContext::Dashboard) => &[DashboardStats, Users, Departments],
            (Role::Admin, SyncContext::UserManagement) => &[Users, Departments],
            (Role::Admin, SyncContext::BedManagement) => &[Beds, Admissions, Departments],
            (Role::Admin, SyncContext::Inventory) => &[Supplies, Medications],
            (Role::Admin, SyncContext::LabCatalog) => &[LabDefinitions],

            (Role::Receptionist, SyncContext::Dashboard) => {
                &[Patients, Appointments, Admissions, DashboardStats]
            }
            (Role::Receptionist, SyncContext::PatientSearch) => &[Patients],
            (Role::Receptionist, SyncContext::Appointments) => {
                &[Appointments, Patients, Users, Departments]
            }
            (Role::Receptionist, SyncContext::BedManagement) => &[Beds, Admissions, Departments],

            (Role::Doctor, SyncContext::Dashboard) => &[Appointments, Admissions, DashboardStats],
            (Role::Doctor, SyncContext::PatientSearch) => &[Patients],
            (Role::Doctor, SyncContext::Appointments) => &[Appointments, Patients],
            (Role::Doctor, SyncContext::PatientChart) => {
                &[Patients, MedicalRecords, Prescriptions, LabRequests, Vitals]
            }

            (Role::Pharmacist, SyncContext::Dashboard) => &[Prescriptions, DashboardStats],
            (Role::Pharmacist, SyncContext::Prescriptions) => {
                &[Prescriptions, Patients, Medications]
            }
            (Role::Pharmacist, SyncContext::Inventory) => {
                &[Medications, Supplies, Dispensations, SupplyUsages]
            }

            (Role::LabTechnician, SyncContext::Dashboard) => &[LabRequests, DashboardStats],
            (Role::LabTechnician, SyncContext::LabRequests) => {
                &[LabRequests, Patients, LabDefinitions]
            }
            (Role::LabTechnician, SyncContext::Inventory) => &[Supplies, SupplyUsages],

            (Role::Nurse, SyncContext::Dashboard) => &[Admissions, Vitals, DashboardStats],
            (Role::Nurse, SyncContext::PatientSearch) => &[Patients],
            (Role::Nurse, SyncContext::BedManagement) => &[Beds, Admissions],
            (Role::Nurse, SyncContext::Vitals) => &[Vitals, Patients, Admissions],
            (Role::Nurse, SyncContext::Inventory) => &[Supplies, Medications, SupplyUsages],

            _ => return None,
        };
        Some(collections)
    }

    /// Closest known context name, for error messages.
    pub fn suggest(input: &str) -> Option<SyncContext> {
        let input = input.trim().to_lowercase();
        SyncContext::ALL
            .iter()
            .map(|context| (*context, strsim::jaro_winkler(&input, context.as_str())))
            .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(context, _)| context)
    }
}

impl fmt::Display for SyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncContext {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        SyncContext::ALL
            .iter()
            .copied()
            .find(|context| context.as_str() == normalized)
            .ok_or_else(|| SchemaError::UnknownContext {
                input: s.to_string(),
                suggestion: SyncContext::suggest(&normalized).map(|c| c.as_str().to_string()),
            })
    }
}
