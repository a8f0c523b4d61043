use serde::{Deserialize, Serialize};

use crate::scope::{DoctorRef, PatientRef};

/// RFC 3339 timestamp with fixed microsecond precision, so stored values sort
/// lexicographically in creation order.
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ========== USER ==========
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Doctor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "patient" => Some(Role::Patient),
            "doctor" => Some(Role::Doctor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub is_staff: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: Option<String>,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
    pub expires_in: i32,
}

// ========== PROFILE ==========
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    #[default]
    Other,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "male" => Some(Gender::Male),
            "female" => Some(Gender::Female),
            "other" => Some(Gender::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatientProfile {
    pub date_of_birth: Option<String>,
    pub gender: Gender,
    pub address: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoctorProfile {
    pub specialization: String,
    pub license_number: String,
    pub years_of_experience: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// A user's profile. Which variant a user may hold is fixed by their role;
/// a user without a profile is `Option::<Profile>::None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Profile {
    Patient(PatientProfile),
    Doctor(DoctorProfile),
}

impl Profile {
    pub fn role(&self) -> Role {
        match self {
            Profile::Patient(_) => Role::Patient,
            Profile::Doctor(_) => Role::Doctor,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PatientProfileRequest {
    pub date_of_birth: Option<String>,
    pub gender: Option<Gender>,
    pub address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DoctorProfileRequest {
    pub specialization: Option<String>,
    pub license_number: Option<String>,
    pub years_of_experience: Option<u32>,
}

/// Public view of a user with the profile matching their role.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub role: Role,
    pub profile: Option<Profile>,
}

impl UserSummary {
    pub fn new(user: &User, profile: Option<Profile>) -> Self {
        Self {
            id: user.id.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            email: user.email.clone(),
            role: user.role,
            profile,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthenticatedUser {
    #[serde(flatten)]
    pub user: UserSummary,
    pub tokens: TokenPair,
}

// ========== HEALTH RECORD ==========
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Consultation,
    LabResult,
    Prescription,
    Imaging,
    Procedure,
    #[default]
    General,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Consultation => "consultation",
            RecordType::LabResult => "lab_result",
            RecordType::Prescription => "prescription",
            RecordType::Imaging => "imaging",
            RecordType::Procedure => "procedure",
            RecordType::General => "general",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "consultation" => Some(RecordType::Consultation),
            "lab_result" => Some(RecordType::LabResult),
            "prescription" => Some(RecordType::Prescription),
            "imaging" => Some(RecordType::Imaging),
            "procedure" => Some(RecordType::Procedure),
            "general" => Some(RecordType::General),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    #[serde(rename = "id")]
    pub record_id: String,
    pub patient: PatientRef,
    pub doctor: DoctorRef,
    pub record_type: RecordType,
    pub description: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecordFile {
    #[serde(rename = "id")]
    pub file_id: String,
    #[serde(skip_serializing)]
    pub record_id: String,
    #[serde(skip_serializing)]
    pub key: String,
    #[serde(rename = "file")]
    pub url: String,
    pub file_name: String,
    pub content_type: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoctorAnnotation {
    #[serde(rename = "id")]
    pub annotation_id: String,
    #[serde(rename = "record")]
    pub record_id: String,
    pub note: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A file attachment sent inline with a record write.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadFile {
    pub file_name: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub file_data: String, // base64 encoded
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CreateRecordRequest {
    pub doctor: String,
    #[serde(default)]
    pub record_type: RecordType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<UploadFile>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateRecordRequest {
    pub doctor: Option<String>,
    pub record_type: Option<RecordType>,
    pub description: Option<String>,
    #[serde(default)]
    pub files: Vec<UploadFile>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAnnotationRequest {
    pub record: String,
    pub note: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateAnnotationRequest {
    pub note: Option<String>,
}

/// Read model of the record aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecordView {
    pub id: String,
    pub patient: UserSummary,
    pub doctor: UserSummary,
    pub record_type: RecordType,
    pub description: String,
    pub files: Vec<HealthRecordFile>,
    pub annotations: Vec<DoctorAnnotation>,
    pub created_at: String,
    pub updated_at: String,
}

// ========== NOTIFICATION ==========
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    PatientAssigned,
    RecordAnnotated,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::PatientAssigned => "patient_assigned",
            NotificationType::RecordAnnotated => "record_annotated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "patient_assigned" => Some(NotificationType::PatientAssigned),
            "record_annotated" => Some(NotificationType::RecordAnnotated),
            _ => None,
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            NotificationType::PatientAssigned => "Patient Assigned",
            NotificationType::RecordAnnotated => "Record Annotated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    #[serde(rename = "id")]
    pub notification_id: String,
    pub recipient_id: String,
    pub record_id: String,
    pub notification_type: NotificationType,
    pub message: String,
    pub is_read: bool,
    pub read_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationView {
    pub id: String,
    pub record: HealthRecordView,
    pub notification_type: NotificationType,
    pub message: String,
    pub is_read: bool,
    pub read_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct BulkUpdateResponse {
    pub updated: usize,
}
