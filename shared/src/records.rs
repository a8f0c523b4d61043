//! Health record aggregate: a record, its files and its annotations.
//!
//! Patients own and mutate records; the assigned doctor reads them and
//! annotates. Every lookup goes through a [`RecordScope`] built from the
//! requester, so out-of-scope ids behave exactly like unknown ids.

use std::collections::HashMap;

use crate::blobs::{decode_uploads, file_key, BlobStore, DecodedUpload};
use crate::error::ApiError;
use crate::notifications;
use crate::scope::{found, DoctorRef, RecordScope, Requester};
use crate::store::Store;
use crate::tasks::TaskQueue;
use crate::types::{
    new_id, timestamp, CreateAnnotationRequest, CreateRecordRequest, DoctorAnnotation,
    HealthRecord, HealthRecordFile, HealthRecordView, Profile, UpdateAnnotationRequest,
    UpdateRecordRequest, User, UserSummary,
};

// ---- read model ----

/// Builds record views, loading each participant once.
pub(crate) struct ViewBuilder<'a, S> {
    store: &'a S,
    summaries: HashMap<String, UserSummary>,
}

impl<'a, S: Store> ViewBuilder<'a, S> {
    pub(crate) fn new(store: &'a S) -> Self {
        Self {
            store,
            summaries: HashMap::new(),
        }
    }

    async fn summary(&mut self, user_id: &str) -> Result<UserSummary, ApiError> {
        if let Some(summary) = self.summaries.get(user_id) {
            return Ok(summary.clone());
        }
        let user = self.store.get_user(user_id).await?.ok_or_else(|| {
            ApiError::Internal(format!("record participant {} has no user row", user_id))
        })?;
        let profile = self.store.get_profile(user_id).await?;
        let summary = UserSummary::new(&user, profile);
        self.summaries.insert(user_id.to_string(), summary.clone());
        Ok(summary)
    }

    pub(crate) async fn view(&mut self, record: HealthRecord) -> Result<HealthRecordView, ApiError> {
        let patient = self.summary(record.patient.as_str()).await?;
        let doctor = self.summary(record.doctor.as_str()).await?;
        let files = self.store.list_files(&record.record_id).await?;
        let annotations = self.store.list_annotations(&record.record_id).await?;
        Ok(HealthRecordView {
            id: record.record_id,
            patient,
            doctor,
            record_type: record.record_type,
            description: record.description,
            files,
            annotations,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    async fn views(&mut self, records: Vec<HealthRecord>) -> Result<Vec<HealthRecordView>, ApiError> {
        let mut views = Vec::with_capacity(records.len());
        for record in records {
            views.push(self.view(record).await?);
        }
        Ok(views)
    }
}

// ---- file handling ----

/// Upload every file for `record_id`. On failure the blobs uploaded so far
/// are removed before the error is returned.
async fn upload_files<B: BlobStore>(
    blobs: &B,
    record_id: &str,
    uploads: Vec<DecodedUpload>,
) -> Result<Vec<HealthRecordFile>, ApiError> {
    let mut files = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let file_id = new_id();
        let key = file_key(record_id, &file_id, &upload.file_name);
        match blobs.put(&key, upload.bytes, &upload.content_type).await {
            Ok(stored) => files.push(HealthRecordFile {
                file_id,
                record_id: record_id.to_string(),
                key: stored.key,
                url: stored.url,
                file_name: upload.file_name,
                content_type: upload.content_type,
                created_at: timestamp(),
            }),
            Err(e) => {
                tracing::error!("Upload for record {} failed: {}", record_id, e);
                discard_blobs(blobs, &files).await;
                return Err(e.into());
            }
        }
    }
    Ok(files)
}

/// Best-effort blob removal; failures are logged and left for cleanup.
async fn discard_blobs<B: BlobStore>(blobs: &B, files: &[HealthRecordFile]) {
    for file in files {
        if let Err(e) = blobs.delete(&file.key).await {
            tracing::warn!("Failed to remove blob {}: {}", file.key, e);
        }
    }
}

/// The doctor a patient picked must be an existing doctor-role user with a
/// completed profile, i.e. someone the doctor directory offers.
async fn resolve_doctor<S: Store>(store: &S, doctor_id: &str) -> Result<(DoctorRef, User), ApiError> {
    let user = store.get_user(doctor_id).await?;
    let (doctor, user) = user
        .and_then(|user| DoctorRef::from_user(&user).map(|doctor| (doctor, user)))
        .ok_or_else(|| {
            ApiError::validation(format!(
                "Invalid doctor \"{}\": no doctor with this id",
                doctor_id
            ))
        })?;

    match store.get_profile(doctor.as_str()).await? {
        Some(Profile::Doctor(_)) => Ok((doctor, user)),
        _ => Err(ApiError::validation(format!(
            "Invalid doctor \"{}\": doctor has not completed a profile",
            doctor_id
        ))),
    }
}

/// Record actions need the acting patient's profile in place.
async fn require_patient_profile<S: Store>(store: &S, requester: &Requester) -> Result<(), ApiError> {
    match store.get_profile(requester.id()).await? {
        Some(_) => Ok(()),
        None => Err(ApiError::forbidden(
            "Complete your profile before managing health records",
        )),
    }
}

// ---- patient operations ----

pub async fn list_patient_records<S: Store>(
    store: &S,
    requester: &Requester,
) -> Result<Vec<HealthRecordView>, ApiError> {
    let scope = RecordScope::from(requester.patient()?);
    let records = store.list_records(&scope).await?;
    ViewBuilder::new(store).views(records).await
}

/// Create a record with its files. Blobs go up first, then the record and all
/// file rows commit together; nothing is left behind if either step fails.
/// The doctor is notified once the write has committed.
pub async fn create_record<S: Store, B: BlobStore, Q: TaskQueue>(
    store: &S,
    blobs: &B,
    queue: &Q,
    requester: &Requester,
    request: CreateRecordRequest,
) -> Result<HealthRecordView, ApiError> {
    let patient = requester.patient()?;
    require_patient_profile(store, requester).await?;
    let (doctor, _) = resolve_doctor(store, &request.doctor).await?;
    let uploads = decode_uploads(&request.files)?;

    let now = timestamp();
    let record = HealthRecord {
        record_id: new_id(),
        patient,
        doctor,
        record_type: request.record_type,
        description: request.description,
        created_at: now.clone(),
        updated_at: now,
    };

    let files = upload_files(blobs, &record.record_id, uploads).await?;
    if let Err(e) = store.insert_record(&record, &files).await {
        tracing::error!("Failed to store record {}: {}", record.record_id, e);
        discard_blobs(blobs, &files).await;
        return Err(e.into());
    }
    tracing::info!(
        "Patient {} created record {} with {} file(s)",
        requester.id(),
        record.record_id,
        files.len()
    );

    if let Err(e) = notifications::on_record_created(store, queue, &record, requester.user()).await {
        tracing::error!("Record {} committed but notification failed: {}", record.record_id, e);
    }

    ViewBuilder::new(store).view(record).await
}

pub async fn retrieve_patient_record<S: Store>(
    store: &S,
    requester: &Requester,
    record_id: &str,
) -> Result<HealthRecordView, ApiError> {
    let scope = RecordScope::from(requester.patient()?);
    let record = found(store.find_record(&scope, record_id).await?, "Health record")?;
    ViewBuilder::new(store).view(record).await
}

/// Partial update. Files in the request are appended; existing files are
/// only removed through [`delete_patient_file`].
pub async fn update_patient_record<S: Store, B: BlobStore>(
    store: &S,
    blobs: &B,
    requester: &Requester,
    record_id: &str,
    request: UpdateRecordRequest,
) -> Result<HealthRecordView, ApiError> {
    let scope = RecordScope::from(requester.patient()?);
    let mut record = found(store.find_record(&scope, record_id).await?, "Health record")?;

    if let Some(doctor_id) = request.doctor.as_deref() {
        record.doctor = resolve_doctor(store, doctor_id).await?.0;
    }
    if let Some(record_type) = request.record_type {
        record.record_type = record_type;
    }
    if let Some(description) = request.description {
        record.description = description;
    }
    record.updated_at = timestamp();

    let uploads = decode_uploads(&request.files)?;
    let new_files = upload_files(blobs, &record.record_id, uploads).await?;
    if let Err(e) = store.update_record(&record, &new_files).await {
        tracing::error!("Failed to update record {}: {}", record.record_id, e);
        discard_blobs(blobs, &new_files).await;
        return Err(e.into());
    }

    ViewBuilder::new(store).view(record).await
}

/// Delete a record and everything hanging off it.
pub async fn delete_patient_record<S: Store, B: BlobStore>(
    store: &S,
    blobs: &B,
    requester: &Requester,
    record_id: &str,
) -> Result<(), ApiError> {
    let scope = RecordScope::from(requester.patient()?);
    let record = found(store.find_record(&scope, record_id).await?, "Health record")?;
    let files = store.delete_record(&record.record_id).await?;
    discard_blobs(blobs, &files).await;
    tracing::info!("Patient {} deleted record {}", requester.id(), record.record_id);
    Ok(())
}

pub async fn delete_patient_file<S: Store, B: BlobStore>(
    store: &S,
    blobs: &B,
    requester: &Requester,
    file_id: &str,
) -> Result<(), ApiError> {
    let patient = requester.patient()?;
    let file = found(store.find_file(&patient, file_id).await?, "File")?;
    store.delete_file(&file).await?;
    discard_blobs(blobs, std::slice::from_ref(&file)).await;
    tracing::info!("Patient {} deleted file {}", requester.id(), file.file_id);
    Ok(())
}

// ---- doctor operations ----

pub async fn list_doctor_records<S: Store>(
    store: &S,
    requester: &Requester,
) -> Result<Vec<HealthRecordView>, ApiError> {
    let scope = RecordScope::from(requester.doctor()?);
    let records = store.list_records(&scope).await?;
    ViewBuilder::new(store).views(records).await
}

pub async fn retrieve_doctor_record<S: Store>(
    store: &S,
    requester: &Requester,
    record_id: &str,
) -> Result<HealthRecordView, ApiError> {
    let scope = RecordScope::from(requester.doctor()?);
    let record = found(store.find_record(&scope, record_id).await?, "Health record")?;
    ViewBuilder::new(store).view(record).await
}

fn validate_note(note: &str) -> Result<(), ApiError> {
    if note.trim().is_empty() {
        return Err(ApiError::validation("Note may not be blank"));
    }
    Ok(())
}

/// Annotate an assigned record. A record outside the doctor's scope is not a
/// valid choice, so it is reported as a validation error.
pub async fn create_annotation<S: Store, Q: TaskQueue>(
    store: &S,
    queue: &Q,
    requester: &Requester,
    request: CreateAnnotationRequest,
) -> Result<DoctorAnnotation, ApiError> {
    let scope = RecordScope::from(requester.doctor()?);
    validate_note(&request.note)?;
    let record = store
        .find_record(&scope, &request.record)
        .await?
        .ok_or_else(|| {
            ApiError::validation(format!(
                "Invalid record \"{}\": no assigned record with this id",
                request.record
            ))
        })?;

    let now = timestamp();
    let annotation = DoctorAnnotation {
        annotation_id: new_id(),
        record_id: record.record_id.clone(),
        note: request.note,
        created_at: now.clone(),
        updated_at: now,
    };
    store.insert_annotation(&annotation).await?;
    tracing::info!(
        "Doctor {} annotated record {}",
        requester.id(),
        record.record_id
    );

    if let Err(e) =
        notifications::on_annotation_created(store, queue, &record, requester.user()).await
    {
        tracing::error!(
            "Annotation {} committed but notification failed: {}",
            annotation.annotation_id,
            e
        );
    }

    Ok(annotation)
}

pub async fn update_annotation<S: Store>(
    store: &S,
    requester: &Requester,
    annotation_id: &str,
    request: UpdateAnnotationRequest,
) -> Result<DoctorAnnotation, ApiError> {
    let doctor = requester.doctor()?;
    let mut annotation = found(store.find_annotation(&doctor, annotation_id).await?, "Annotation")?;

    if let Some(note) = request.note {
        validate_note(&note)?;
        annotation.note = note;
    }
    annotation.updated_at = timestamp();
    store.update_annotation(&annotation).await?;
    Ok(annotation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::MemoryBlobStore;
    use crate::store::MemoryStore;
    use crate::tasks::MemoryTaskQueue;
    use crate::types::{DoctorProfile, Gender, PatientProfile, Role, UploadFile};
    use base64::Engine;

    struct Fixture {
        store: MemoryStore,
        blobs: MemoryBlobStore,
        queue: MemoryTaskQueue,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                blobs: MemoryBlobStore::new(),
                queue: MemoryTaskQueue::new(),
            }
        }

        /// A user who has completed their profile.
        async fn user(&self, id: &str, role: Role) -> Requester {
            let requester = self.user_without_profile(id, role).await;
            let now = timestamp();
            let profile = match role {
                Role::Patient => Profile::Patient(PatientProfile {
                    date_of_birth: None,
                    gender: Gender::default(),
                    address: None,
                    created_at: now.clone(),
                    updated_at: now,
                }),
                Role::Doctor => Profile::Doctor(DoctorProfile {
                    specialization: "General practice".to_string(),
                    license_number: format!("LIC-{}", id),
                    years_of_experience: 5,
                    created_at: now.clone(),
                    updated_at: now,
                }),
            };
            self.store.insert_profile(id, &profile).await.unwrap();
            requester
        }

        async fn user_without_profile(&self, id: &str, role: Role) -> Requester {
            let user = User {
                id: id.to_string(),
                email: format!("{}@test.com", id),
                first_name: "Test".to_string(),
                last_name: id.to_string(),
                phone_number: None,
                role,
                is_active: true,
                is_staff: false,
                created_at: timestamp(),
                updated_at: timestamp(),
            };
            self.store.insert_user(&user).await.unwrap();
            Requester::new(user).unwrap()
        }

        async fn create(
            &self,
            patient: &Requester,
            doctor: &str,
            files: Vec<UploadFile>,
        ) -> Result<HealthRecordView, ApiError> {
            create_record(
                &self.store,
                &self.blobs,
                &self.queue,
                patient,
                CreateRecordRequest {
                    doctor: doctor.to_string(),
                    record_type: Default::default(),
                    description: "Checkup".to_string(),
                    files,
                },
            )
            .await
        }
    }

    fn upload(name: &str) -> UploadFile {
        UploadFile {
            file_name: name.to_string(),
            content_type: "application/pdf".to_string(),
            file_data: base64::engine::general_purpose::STANDARD.encode(name.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_create_record_with_files_notifies_doctor() {
        let fx = Fixture::new();
        let patient = fx.user("p1", Role::Patient).await;
        fx.user("d1", Role::Doctor).await;

        let view = fx
            .create(&patient, "d1", vec![upload("a.pdf"), upload("b.pdf")])
            .await
            .unwrap();
        assert_eq!(view.patient.id, "p1");
        assert_eq!(view.doctor.id, "d1");
        assert_eq!(view.files.len(), 2);
        assert_eq!(fx.blobs.object_count(), 2);
        assert_eq!(fx.store.notification_count(), 1);
        assert_eq!(fx.queue.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_persists_nothing() {
        let fx = Fixture::new();
        let patient = fx.user("p1", Role::Patient).await;
        fx.user("d1", Role::Doctor).await;
        fx.blobs.fail_puts_after(Some(1));

        let err = fx
            .create(&patient, "d1", vec![upload("a.pdf"), upload("b.pdf")])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Internal(_)));
        assert_eq!(fx.store.record_count(), 0);
        assert_eq!(fx.store.file_count(), 0);
        assert_eq!(fx.blobs.object_count(), 0);
        assert_eq!(fx.store.notification_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_store_write_removes_uploaded_blobs() {
        let fx = Fixture::new();
        let patient = fx.user("p1", Role::Patient).await;
        fx.user("d1", Role::Doctor).await;
        fx.store.fail_record_writes(true);

        assert!(fx.create(&patient, "d1", vec![upload("a.pdf")]).await.is_err());
        assert_eq!(fx.store.record_count(), 0);
        assert_eq!(fx.blobs.object_count(), 0);
        assert!(fx.queue.pending().is_empty());
    }

    #[tokio::test]
    async fn test_doctor_reference_must_be_a_doctor() {
        let fx = Fixture::new();
        let patient = fx.user("p1", Role::Patient).await;
        fx.user("p2", Role::Patient).await;

        for doctor in ["p2", "missing"] {
            let err = fx.create(&patient, doctor, vec![]).await.unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)));
        }
        assert_eq!(fx.store.record_count(), 0);
    }

    #[tokio::test]
    async fn test_cross_owner_access_is_not_found() {
        let fx = Fixture::new();
        let owner = fx.user("p1", Role::Patient).await;
        let other = fx.user("p2", Role::Patient).await;
        let other_doctor = fx.user("d2", Role::Doctor).await;
        fx.user("d1", Role::Doctor).await;
        let view = fx.create(&owner, "d1", vec![upload("a.pdf")]).await.unwrap();

        let err = retrieve_patient_record(&fx.store, &other, &view.id).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        let err = retrieve_doctor_record(&fx.store, &other_doctor, &view.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        let err = delete_patient_file(&fx.store, &fx.blobs, &other, &view.files[0].file_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert!(list_patient_records(&fx.store, &other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_role_gates_are_forbidden() {
        let fx = Fixture::new();
        let doctor = fx.user("d1", Role::Doctor).await;
        let patient = fx.user("p1", Role::Patient).await;

        let err = fx.create(&doctor, "d1", vec![]).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        let err = list_doctor_records(&fx.store, &patient).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_update_appends_files_and_switches_doctor() {
        let fx = Fixture::new();
        let patient = fx.user("p1", Role::Patient).await;
        fx.user("d1", Role::Doctor).await;
        fx.user("d2", Role::Doctor).await;
        let view = fx.create(&patient, "d1", vec![upload("a.pdf")]).await.unwrap();

        let updated = update_patient_record(
            &fx.store,
            &fx.blobs,
            &patient,
            &view.id,
            UpdateRecordRequest {
                doctor: Some("d2".to_string()),
                description: Some("Follow-up".to_string()),
                files: vec![upload("b.pdf")],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.doctor.id, "d2");
        assert_eq!(updated.description, "Follow-up");
        assert_eq!(updated.files.len(), 2);
        // updates do not notify
        assert_eq!(fx.store.notification_count(), 1);
    }

    #[tokio::test]
    async fn test_file_delete_removes_row_and_blob() {
        let fx = Fixture::new();
        let patient = fx.user("p1", Role::Patient).await;
        fx.user("d1", Role::Doctor).await;
        let view = fx.create(&patient, "d1", vec![upload("a.pdf")]).await.unwrap();
        let file = &view.files[0];

        delete_patient_file(&fx.store, &fx.blobs, &patient, &file.file_id)
            .await
            .unwrap();
        assert_eq!(fx.store.file_count(), 0);
        assert!(!fx.blobs.contains(&file.key));
    }

    #[tokio::test]
    async fn test_record_delete_cascades() {
        let fx = Fixture::new();
        let patient = fx.user("p1", Role::Patient).await;
        let doctor = fx.user("d1", Role::Doctor).await;
        let view = fx.create(&patient, "d1", vec![upload("a.pdf")]).await.unwrap();
        create_annotation(
            &fx.store,
            &fx.queue,
            &doctor,
            CreateAnnotationRequest {
                record: view.id.clone(),
                note: "Looks fine".to_string(),
            },
        )
        .await
        .unwrap();

        delete_patient_record(&fx.store, &fx.blobs, &patient, &view.id)
            .await
            .unwrap();
        assert_eq!(fx.store.record_count(), 0);
        assert_eq!(fx.store.file_count(), 0);
        assert_eq!(fx.store.annotation_count(), 0);
        assert_eq!(fx.store.notification_count(), 0);
        assert_eq!(fx.blobs.object_count(), 0);
    }

    #[tokio::test]
    async fn test_annotating_unassigned_record_is_validation_error() {
        let fx = Fixture::new();
        let patient = fx.user("p1", Role::Patient).await;
        fx.user("d1", Role::Doctor).await;
        let stranger = fx.user("d2", Role::Doctor).await;
        let view = fx.create(&patient, "d1", vec![]).await.unwrap();

        let err = create_annotation(
            &fx.store,
            &fx.queue,
            &stranger,
            CreateAnnotationRequest {
                record: view.id,
                note: "Not mine".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(fx.store.annotation_count(), 0);
    }

    #[tokio::test]
    async fn test_annotation_update_is_scoped_to_record_doctor() {
        let fx = Fixture::new();
        let patient = fx.user("p1", Role::Patient).await;
        let doctor = fx.user("d1", Role::Doctor).await;
        let stranger = fx.user("d2", Role::Doctor).await;
        let view = fx.create(&patient, "d1", vec![]).await.unwrap();
        let annotation = create_annotation(
            &fx.store,
            &fx.queue,
            &doctor,
            CreateAnnotationRequest {
                record: view.id,
                note: "First".to_string(),
            },
        )
        .await
        .unwrap();

        let edit = || UpdateAnnotationRequest {
            note: Some("Revised".to_string()),
        };
        let err = update_annotation(&fx.store, &stranger, &annotation.annotation_id, edit())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        let updated = update_annotation(&fx.store, &doctor, &annotation.annotation_id, edit())
            .await
            .unwrap();
        assert_eq!(updated.note, "Revised");
    }

    #[tokio::test]
    async fn test_patient_needs_a_profile_to_create_records() {
        let fx = Fixture::new();
        let patient = fx.user_without_profile("p1", Role::Patient).await;
        fx.user("d1", Role::Doctor).await;

        let err = fx.create(&patient, "d1", vec![upload("a.pdf")]).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        assert_eq!(fx.store.record_count(), 0);
        assert_eq!(fx.blobs.object_count(), 0);
    }

    #[tokio::test]
    async fn test_doctor_without_profile_cannot_be_assigned() {
        let fx = Fixture::new();
        let patient = fx.user("p1", Role::Patient).await;
        fx.user("d1", Role::Doctor).await;
        fx.user_without_profile("d2", Role::Doctor).await;

        let err = fx.create(&patient, "d2", vec![]).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(fx.store.record_count(), 0);

        let view = fx.create(&patient, "d1", vec![]).await.unwrap();
        let err = update_patient_record(
            &fx.store,
            &fx.blobs,
            &patient,
            &view.id,
            UpdateRecordRequest {
                doctor: Some("d2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        let kept = retrieve_patient_record(&fx.store, &patient, &view.id).await.unwrap();
        assert_eq!(kept.doctor.id, "d1");
    }

    #[tokio::test]
    async fn test_record_delete_succeeds_when_blob_removal_fails() {
        let fx = Fixture::new();
        let patient = fx.user("p1", Role::Patient).await;
        fx.user("d1", Role::Doctor).await;
        let view = fx
            .create(&patient, "d1", vec![upload("a.pdf"), upload("b.pdf")])
            .await
            .unwrap();
        fx.blobs.fail_deletes(true);

        delete_patient_file(&fx.store, &fx.blobs, &patient, &view.files[0].file_id)
            .await
            .unwrap();
        delete_patient_record(&fx.store, &fx.blobs, &patient, &view.id)
            .await
            .unwrap();
        assert_eq!(fx.store.record_count(), 0);
        assert_eq!(fx.store.file_count(), 0);
        // blobs stay behind for later cleanup
        assert_eq!(fx.blobs.object_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_notification_write_keeps_the_record() {
        let fx = Fixture::new();
        let patient = fx.user("p1", Role::Patient).await;
        let doctor = fx.user("d1", Role::Doctor).await;
        fx.store.fail_notification_writes(true);

        let view = fx.create(&patient, "d1", vec![upload("a.pdf")]).await.unwrap();
        let annotation = create_annotation(
            &fx.store,
            &fx.queue,
            &doctor,
            CreateAnnotationRequest {
                record: view.id.clone(),
                note: "Reviewed".to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(fx.store.record_count(), 1);
        assert_eq!(fx.store.file_count(), 1);
        assert_eq!(annotation.record_id, view.id);
        assert_eq!(fx.store.notification_count(), 0);
        assert!(fx.queue.pending().is_empty());

        fx.store.fail_notification_writes(false);
        fx.create(&patient, "d1", vec![]).await.unwrap();
        assert_eq!(fx.store.notification_count(), 1);
    }
}
