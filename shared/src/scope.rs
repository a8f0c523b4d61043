//! Ownership scoping.
//!
//! Every query over a role-scoped entity is narrowed by the requester before
//! any client input is looked at. Two kinds of rejection come out of here:
//!
//! - role gates (a doctor calling a patient operation) are `Forbidden`, since
//!   the requester is known and the operation is simply not theirs;
//! - ownership misses are `NotFound`: the scoped query returns nothing, so an
//!   out-of-scope entity is indistinguishable from an absent one.

use serde::Serialize;

use crate::error::ApiError;
use crate::types::{HealthRecord, Profile, Role, User};

/// Reference to a user known to hold the patient role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PatientRef(String);

/// Reference to a user known to hold the doctor role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DoctorRef(String);

impl PatientRef {
    pub fn from_user(user: &User) -> Option<Self> {
        (user.role == Role::Patient).then(|| Self(user.id.clone()))
    }

    /// Rehydrate a reference that was validated when it was written.
    pub(crate) fn from_stored(user_id: impl Into<String>) -> Self {
        Self(user_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl DoctorRef {
    pub fn from_user(user: &User) -> Option<Self> {
        (user.role == Role::Doctor).then(|| Self(user.id.clone()))
    }

    pub(crate) fn from_stored(user_id: impl Into<String>) -> Self {
        Self(user_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The verified identity behind a request.
#[derive(Debug, Clone)]
pub struct Requester {
    user: User,
}

impl Requester {
    pub fn new(user: User) -> Result<Self, ApiError> {
        if !user.is_active {
            tracing::warn!("Inactive user {} attempted access", user.id);
            return Err(ApiError::Unauthenticated);
        }
        Ok(Self { user })
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn id(&self) -> &str {
        &self.user.id
    }

    pub fn role(&self) -> Role {
        self.user.role
    }

    /// Role gate for patient-only operations.
    pub fn patient(&self) -> Result<PatientRef, ApiError> {
        PatientRef::from_user(&self.user).ok_or_else(|| {
            tracing::warn!("User {} ({}) denied patient operation", self.id(), self.role().as_str());
            ApiError::forbidden("You do not have permission to perform this action")
        })
    }

    /// Role gate for doctor-only operations.
    pub fn doctor(&self) -> Result<DoctorRef, ApiError> {
        DoctorRef::from_user(&self.user).ok_or_else(|| {
            tracing::warn!("User {} ({}) denied doctor operation", self.id(), self.role().as_str());
            ApiError::forbidden("You do not have permission to perform this action")
        })
    }
}

/// The visible subset of health records for one requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordScope {
    Patient(PatientRef),
    Doctor(DoctorRef),
}

impl RecordScope {
    pub fn admits(&self, record: &HealthRecord) -> bool {
        match self {
            RecordScope::Patient(patient) => record.patient == *patient,
            RecordScope::Doctor(doctor) => record.doctor == *doctor,
        }
    }
}

impl From<PatientRef> for RecordScope {
    fn from(patient: PatientRef) -> Self {
        RecordScope::Patient(patient)
    }
}

impl From<DoctorRef> for RecordScope {
    fn from(doctor: DoctorRef) -> Self {
        RecordScope::Doctor(doctor)
    }
}

/// `NoProfileSet`: creation is only open to users without a profile.
pub fn require_no_profile(profile: Option<&Profile>) -> Result<(), ApiError> {
    match profile {
        None => Ok(()),
        Some(_) => Err(ApiError::forbidden("Profile already exists for this user")),
    }
}

/// `IsProfileSet`: updates need an existing profile.
pub fn require_profile(profile: Option<Profile>) -> Result<Profile, ApiError> {
    profile.ok_or_else(|| ApiError::forbidden("Create a profile before updating it"))
}

/// Turn an empty scoped lookup into the uniform not-found answer.
pub fn found<T>(entity: Option<T>, what: &str) -> Result<T, ApiError> {
    entity.ok_or_else(|| ApiError::not_found(format!("{} not found", what)))
}
