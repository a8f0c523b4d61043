//! Persistence seam.
//!
//! Raw lookups (`get_*`) are for system use: the notification pipeline and
//! delivery worker. Request handlers go through the scoped `find_*` /
//! `list_*` methods, which only ever return entities inside the requester's
//! scope.

pub mod dynamo;
pub mod memory;

use std::future::Future;

use crate::error::StoreError;
use crate::scope::{DoctorRef, PatientRef, RecordScope};
use crate::types::{
    DoctorAnnotation, DoctorProfile, HealthRecord, HealthRecordFile, Notification, Profile, User,
};

pub use dynamo::DynamoStore;
pub use memory::MemoryStore;

pub trait Store: Send + Sync {
    // ---- users ----

    /// Insert a user. Fails with `Conflict` if the email is taken.
    fn insert_user(&self, user: &User) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_user(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<User>, StoreError>> + Send;

    fn find_user_by_email(
        &self,
        email: &str,
    ) -> impl Future<Output = Result<Option<User>, StoreError>> + Send;

    // ---- profiles ----

    /// Insert a profile. Fails with `Conflict` if the user already has one.
    fn insert_profile(
        &self,
        user_id: &str,
        profile: &Profile,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_profile(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<Profile>, StoreError>> + Send;

    /// Overwrite an existing profile. Fails with `NotFound` if there is none.
    fn replace_profile(
        &self,
        user_id: &str,
        profile: &Profile,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn list_doctors_with_profile(
        &self,
    ) -> impl Future<Output = Result<Vec<(User, DoctorProfile)>, StoreError>> + Send;

    // ---- health records ----

    /// Write a record and its files in one transaction.
    fn insert_record(
        &self,
        record: &HealthRecord,
        files: &[HealthRecordFile],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Overwrite a record's fields and append files in one transaction.
    fn update_record(
        &self,
        record: &HealthRecord,
        new_files: &[HealthRecordFile],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_record(
        &self,
        record_id: &str,
    ) -> impl Future<Output = Result<Option<HealthRecord>, StoreError>> + Send;

    /// Records visible in `scope`, newest first.
    fn list_records(
        &self,
        scope: &RecordScope,
    ) -> impl Future<Output = Result<Vec<HealthRecord>, StoreError>> + Send;

    /// Delete a record together with its files, annotations and
    /// notifications. Returns the removed file rows so blobs can be dropped.
    fn delete_record(
        &self,
        record_id: &str,
    ) -> impl Future<Output = Result<Vec<HealthRecordFile>, StoreError>> + Send;

    fn list_files(
        &self,
        record_id: &str,
    ) -> impl Future<Output = Result<Vec<HealthRecordFile>, StoreError>> + Send;

    fn get_file(
        &self,
        file_id: &str,
    ) -> impl Future<Output = Result<Option<HealthRecordFile>, StoreError>> + Send;

    fn delete_file(
        &self,
        file: &HealthRecordFile,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn insert_annotation(
        &self,
        annotation: &DoctorAnnotation,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Annotations of a record, oldest first.
    fn list_annotations(
        &self,
        record_id: &str,
    ) -> impl Future<Output = Result<Vec<DoctorAnnotation>, StoreError>> + Send;

    fn get_annotation(
        &self,
        annotation_id: &str,
    ) -> impl Future<Output = Result<Option<DoctorAnnotation>, StoreError>> + Send;

    fn update_annotation(
        &self,
        annotation: &DoctorAnnotation,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    // ---- notifications ----

    fn insert_notification(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_notification(
        &self,
        notification_id: &str,
    ) -> impl Future<Output = Result<Option<Notification>, StoreError>> + Send;

    /// Notifications addressed to `recipient_id`, newest first.
    fn list_notifications(
        &self,
        recipient_id: &str,
    ) -> impl Future<Output = Result<Vec<Notification>, StoreError>> + Send;

    /// Flip one unread notification of `recipient_id` to read. A notification
    /// that is already read keeps its `read_at`. Returns the current state, or
    /// `None` when the notification is not the recipient's.
    fn mark_notification_read(
        &self,
        recipient_id: &str,
        notification_id: &str,
        read_at: &str,
    ) -> impl Future<Output = Result<Option<Notification>, StoreError>> + Send;

    /// Mark every unread notification of `recipient_id` read. Returns how many
    /// changed.
    fn mark_all_notifications_read(
        &self,
        recipient_id: &str,
        read_at: &str,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    fn delete_all_notifications(
        &self,
        recipient_id: &str,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    // ---- scoped lookups ----

    fn find_record(
        &self,
        scope: &RecordScope,
        record_id: &str,
    ) -> impl Future<Output = Result<Option<HealthRecord>, StoreError>> + Send {
        async move {
            Ok(self
                .get_record(record_id)
                .await?
                .filter(|record| scope.admits(record)))
        }
    }

    /// A file, only if its record belongs to `patient`.
    fn find_file(
        &self,
        patient: &PatientRef,
        file_id: &str,
    ) -> impl Future<Output = Result<Option<HealthRecordFile>, StoreError>> + Send {
        async move {
            let Some(file) = self.get_file(file_id).await? else {
                return Ok(None);
            };
            let scope = RecordScope::Patient(patient.clone());
            Ok(self
                .find_record(&scope, &file.record_id)
                .await?
                .map(|_| file))
        }
    }

    /// An annotation, only if its record is assigned to `doctor`.
    fn find_annotation(
        &self,
        doctor: &DoctorRef,
        annotation_id: &str,
    ) -> impl Future<Output = Result<Option<DoctorAnnotation>, StoreError>> + Send {
        async move {
            let Some(annotation) = self.get_annotation(annotation_id).await? else {
                return Ok(None);
            };
            let scope = RecordScope::Doctor(doctor.clone());
            Ok(self
                .find_record(&scope, &annotation.record_id)
                .await?
                .map(|_| annotation))
        }
    }

    fn find_notification(
        &self,
        recipient_id: &str,
        notification_id: &str,
    ) -> impl Future<Output = Result<Option<Notification>, StoreError>> + Send {
        async move {
            Ok(self
                .get_notification(notification_id)
                .await?
                .filter(|n| n.recipient_id == recipient_id))
        }
    }
}
