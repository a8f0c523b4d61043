//! Profile lifecycle: at most one profile per user, of the variant fixed by
//! the user's role.

use chrono::NaiveDate;

use crate::error::{ApiError, StoreError};
use crate::http::parse_body;
use crate::scope::{require_no_profile, require_profile, Requester};
use crate::store::Store;
use crate::types::{
    timestamp, DoctorProfile, DoctorProfileRequest, PatientProfile, PatientProfileRequest,
    Profile, Role, UserSummary,
};

#[derive(Debug)]
pub enum ProfileRequest {
    Patient(PatientProfileRequest),
    Doctor(DoctorProfileRequest),
}

impl ProfileRequest {
    /// The body shape is chosen by the requester's role, never by the client.
    pub fn parse(role: Role, body: &[u8]) -> Result<Self, ApiError> {
        Ok(match role {
            Role::Patient => ProfileRequest::Patient(parse_body(body)?),
            Role::Doctor => ProfileRequest::Doctor(parse_body(body)?),
        })
    }
}

fn validate_date_of_birth(value: Option<String>) -> Result<Option<String>, ApiError> {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(date) => NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map(|parsed| Some(parsed.format("%Y-%m-%d").to_string()))
            .map_err(|_| {
                ApiError::validation(format!(
                    "Date has wrong format: {}. Use YYYY-MM-DD",
                    date
                ))
            }),
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::validation(format!("{} is required", field)))
}

fn non_blank(value: String, field: &str) -> Result<String, ApiError> {
    required(Some(value), field)
}

fn address(value: Option<String>) -> Option<String> {
    value.map(|a| a.trim().to_string()).filter(|a| !a.is_empty())
}

fn role_mismatch() -> ApiError {
    ApiError::forbidden("Profile type does not match your role")
}

pub async fn create_profile<S: Store>(
    store: &S,
    requester: &Requester,
    request: ProfileRequest,
) -> Result<Profile, ApiError> {
    require_no_profile(store.get_profile(requester.id()).await?.as_ref())?;

    let now = timestamp();
    let profile = match (requester.role(), request) {
        (Role::Patient, ProfileRequest::Patient(fields)) => Profile::Patient(PatientProfile {
            date_of_birth: validate_date_of_birth(fields.date_of_birth)?,
            gender: fields.gender.unwrap_or_default(),
            address: address(fields.address),
            created_at: now.clone(),
            updated_at: now,
        }),
        (Role::Doctor, ProfileRequest::Doctor(fields)) => Profile::Doctor(DoctorProfile {
            specialization: required(fields.specialization, "specialization")?,
            license_number: required(fields.license_number, "license_number")?,
            years_of_experience: fields.years_of_experience.unwrap_or(0),
            created_at: now.clone(),
            updated_at: now,
        }),
        _ => return Err(role_mismatch()),
    };

    store
        .insert_profile(requester.id(), &profile)
        .await
        .map_err(|e| match e {
            // Lost a race with a concurrent create.
            StoreError::Conflict(_) => ApiError::forbidden("Profile already exists for this user"),
            other => other.into(),
        })?;

    tracing::info!("Created {} profile for {}", requester.role().as_str(), requester.id());
    Ok(profile)
}

/// Partial update of the requester's own profile.
pub async fn update_profile<S: Store>(
    store: &S,
    requester: &Requester,
    request: ProfileRequest,
) -> Result<Profile, ApiError> {
    let existing = require_profile(store.get_profile(requester.id()).await?)?;

    let now = timestamp();
    let profile = match (existing, request) {
        (Profile::Patient(mut profile), ProfileRequest::Patient(fields)) => {
            if fields.date_of_birth.is_some() {
                profile.date_of_birth = validate_date_of_birth(fields.date_of_birth)?;
            }
            if let Some(gender) = fields.gender {
                profile.gender = gender;
            }
            if fields.address.is_some() {
                profile.address = address(fields.address);
            }
            profile.updated_at = now;
            Profile::Patient(profile)
        }
        (Profile::Doctor(mut profile), ProfileRequest::Doctor(fields)) => {
            if let Some(specialization) = fields.specialization {
                profile.specialization = non_blank(specialization, "specialization")?;
            }
            if let Some(license_number) = fields.license_number {
                profile.license_number = non_blank(license_number, "license_number")?;
            }
            if let Some(years) = fields.years_of_experience {
                profile.years_of_experience = years;
            }
            profile.updated_at = now;
            Profile::Doctor(profile)
        }
        _ => return Err(role_mismatch()),
    };

    store
        .replace_profile(requester.id(), &profile)
        .await
        .map_err(|e| match e {
            StoreError::NotFound(_) => ApiError::forbidden("Create a profile before updating it"),
            other => other.into(),
        })?;

    Ok(profile)
}

pub async fn current_user<S: Store>(store: &S, requester: &Requester) -> Result<UserSummary, ApiError> {
    let profile = store.get_profile(requester.id()).await?;
    Ok(UserSummary::new(requester.user(), profile))
}

/// Doctors with a completed profile. Patients only.
pub async fn list_doctors<S: Store>(
    store: &S,
    requester: &Requester,
) -> Result<Vec<UserSummary>, ApiError> {
    requester.patient()?;
    let doctors = store.list_doctors_with_profile().await?;
    Ok(doctors
        .into_iter()
        .filter(|(user, _)| user.role == Role::Doctor)
        .map(|(user, profile)| UserSummary::new(&user, Some(Profile::Doctor(profile))))
        .collect())
}
