use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::scope::RecordScope;
use crate::store::Store;
use crate::types::{
    DoctorAnnotation, DoctorProfile, HealthRecord, HealthRecordFile, Notification, Profile, User,
};

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    emails: HashMap<String, String>,
    profiles: HashMap<String, Profile>,
    // Vecs keep insertion order, which breaks created_at ties.
    records: Vec<HealthRecord>,
    files: Vec<HealthRecordFile>,
    annotations: Vec<DoctorAnnotation>,
    notifications: Vec<Notification>,
}

/// In-process store used for local development and tests. Each operation runs
/// under one lock, so multi-row writes are atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_record_writes: AtomicBool,
    fail_notification_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every record write fail until switched off again.
    pub fn fail_record_writes(&self, fail: bool) {
        self.fail_record_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every notification insert fail until switched off again.
    pub fn fail_notification_writes(&self, fail: bool) {
        self.fail_notification_writes.store(fail, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn file_count(&self) -> usize {
        self.lock().files.len()
    }

    pub fn annotation_count(&self) -> usize {
        self.lock().annotations.len()
    }

    pub fn notification_count(&self) -> usize {
        self.lock().notifications.len()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A panic while holding the lock cannot leave a half-applied write.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_record_writes(&self) -> Result<(), StoreError> {
        if self.fail_record_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("record write rejected".to_string()));
        }
        Ok(())
    }
}

fn newest_first<'a, T: Clone + 'a>(
    items: impl DoubleEndedIterator<Item = &'a T>,
    created_at: impl Fn(&T) -> &str,
) -> Vec<T> {
    let mut out: Vec<T> = items.rev().cloned().collect();
    out.sort_by(|a, b| created_at(b).cmp(created_at(a)));
    out
}

impl Store for MemoryStore {
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let mut tables = self.lock();
        let email = user.email.to_lowercase();
        if tables.emails.contains_key(&email) {
            return Err(StoreError::Conflict(
                "A user with this email already exists".to_string(),
            ));
        }
        if tables.users.contains_key(&user.id) {
            return Err(StoreError::Conflict("User already exists".to_string()));
        }
        tables.emails.insert(email, user.id.clone());
        tables.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.lock().users.get(user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let tables = self.lock();
        Ok(tables
            .emails
            .get(&email.to_lowercase())
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    async fn insert_profile(&self, user_id: &str, profile: &Profile) -> Result<(), StoreError> {
        let mut tables = self.lock();
        if tables.profiles.contains_key(user_id) {
            return Err(StoreError::Conflict(
                "Profile already exists for this user".to_string(),
            ));
        }
        tables.profiles.insert(user_id.to_string(), profile.clone());
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError> {
        Ok(self.lock().profiles.get(user_id).cloned())
    }

    async fn replace_profile(&self, user_id: &str, profile: &Profile) -> Result<(), StoreError> {
        let mut tables = self.lock();
        match tables.profiles.get_mut(user_id) {
            Some(existing) => {
                *existing = profile.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound("profile".to_string())),
        }
    }

    async fn list_doctors_with_profile(&self) -> Result<Vec<(User, DoctorProfile)>, StoreError> {
        let tables = self.lock();
        let mut doctors: Vec<(User, DoctorProfile)> = tables
            .profiles
            .iter()
            .filter_map(|(user_id, profile)| match profile {
                Profile::Doctor(doctor) => tables
                    .users
                    .get(user_id)
                    .map(|user| (user.clone(), doctor.clone())),
                Profile::Patient(_) => None,
            })
            .collect();
        doctors.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at));
        Ok(doctors)
    }

    async fn insert_record(
        &self,
        record: &HealthRecord,
        files: &[HealthRecordFile],
    ) -> Result<(), StoreError> {
        self.check_record_writes()?;
        let mut tables = self.lock();
        if tables.records.iter().any(|r| r.record_id == record.record_id) {
            return Err(StoreError::Conflict("Health record already exists".to_string()));
        }
        tables.records.push(record.clone());
        tables.files.extend(files.iter().cloned());
        Ok(())
    }

    async fn update_record(
        &self,
        record: &HealthRecord,
        new_files: &[HealthRecordFile],
    ) -> Result<(), StoreError> {
        self.check_record_writes()?;
        let mut tables = self.lock();
        let existing = tables
            .records
            .iter_mut()
            .find(|r| r.record_id == record.record_id)
            .ok_or_else(|| StoreError::NotFound("health record".to_string()))?;
        *existing = record.clone();
        tables.files.extend(new_files.iter().cloned());
        Ok(())
    }

    async fn get_record(&self, record_id: &str) -> Result<Option<HealthRecord>, StoreError> {
        Ok(self
            .lock()
            .records
            .iter()
            .find(|r| r.record_id == record_id)
            .cloned())
    }

    async fn list_records(&self, scope: &RecordScope) -> Result<Vec<HealthRecord>, StoreError> {
        let tables = self.lock();
        Ok(newest_first(
            tables.records.iter().filter(|r| scope.admits(r)),
            |r| r.created_at.as_str(),
        ))
    }

    async fn delete_record(&self, record_id: &str) -> Result<Vec<HealthRecordFile>, StoreError> {
        let mut tables = self.lock();
        let before = tables.records.len();
        tables.records.retain(|r| r.record_id != record_id);
        if tables.records.len() == before {
            return Err(StoreError::NotFound("health record".to_string()));
        }
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut tables.files)
            .into_iter()
            .partition(|f| f.record_id == record_id);
        tables.files = kept;
        tables.annotations.retain(|a| a.record_id != record_id);
        tables.notifications.retain(|n| n.record_id != record_id);
        Ok(removed)
    }

    async fn list_files(&self, record_id: &str) -> Result<Vec<HealthRecordFile>, StoreError> {
        Ok(self
            .lock()
            .files
            .iter()
            .filter(|f| f.record_id == record_id)
            .cloned()
            .collect())
    }

    async fn get_file(&self, file_id: &str) -> Result<Option<HealthRecordFile>, StoreError> {
        Ok(self
            .lock()
            .files
            .iter()
            .find(|f| f.file_id == file_id)
            .cloned())
    }

    async fn delete_file(&self, file: &HealthRecordFile) -> Result<(), StoreError> {
        self.lock().files.retain(|f| f.file_id != file.file_id);
        Ok(())
    }

    async fn insert_annotation(&self, annotation: &DoctorAnnotation) -> Result<(), StoreError> {
        let mut tables = self.lock();
        if !tables.records.iter().any(|r| r.record_id == annotation.record_id) {
            return Err(StoreError::NotFound("health record".to_string()));
        }
        tables.annotations.push(annotation.clone());
        Ok(())
    }

    async fn list_annotations(&self, record_id: &str) -> Result<Vec<DoctorAnnotation>, StoreError> {
        Ok(self
            .lock()
            .annotations
            .iter()
            .filter(|a| a.record_id == record_id)
            .cloned()
            .collect())
    }

    async fn get_annotation(
        &self,
        annotation_id: &str,
    ) -> Result<Option<DoctorAnnotation>, StoreError> {
        Ok(self
            .lock()
            .annotations
            .iter()
            .find(|a| a.annotation_id == annotation_id)
            .cloned())
    }

    async fn update_annotation(&self, annotation: &DoctorAnnotation) -> Result<(), StoreError> {
        let mut tables = self.lock();
        let existing = tables
            .annotations
            .iter_mut()
            .find(|a| a.annotation_id == annotation.annotation_id)
            .ok_or_else(|| StoreError::NotFound("annotation".to_string()))?;
        *existing = annotation.clone();
        Ok(())
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        if self.fail_notification_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("notification write rejected".to_string()));
        }
        let mut tables = self.lock();
        if !tables
            .records
            .iter()
            .any(|r| r.record_id == notification.record_id)
        {
            return Err(StoreError::NotFound("health record".to_string()));
        }
        tables.notifications.push(notification.clone());
        Ok(())
    }

    async fn get_notification(
        &self,
        notification_id: &str,
    ) -> Result<Option<Notification>, StoreError> {
        Ok(self
            .lock()
            .notifications
            .iter()
            .find(|n| n.notification_id == notification_id)
            .cloned())
    }

    async fn list_notifications(&self, recipient_id: &str) -> Result<Vec<Notification>, StoreError> {
        let tables = self.lock();
        Ok(newest_first(
            tables
                .notifications
                .iter()
                .filter(|n| n.recipient_id == recipient_id),
            |n| n.created_at.as_str(),
        ))
    }

    async fn mark_notification_read(
        &self,
        recipient_id: &str,
        notification_id: &str,
        read_at: &str,
    ) -> Result<Option<Notification>, StoreError> {
        let mut tables = self.lock();
        let Some(notification) = tables
            .notifications
            .iter_mut()
            .find(|n| n.notification_id == notification_id && n.recipient_id == recipient_id)
        else {
            return Ok(None);
        };
        if !notification.is_read {
            notification.is_read = true;
            notification.read_at = Some(read_at.to_string());
        }
        Ok(Some(notification.clone()))
    }

    async fn mark_all_notifications_read(
        &self,
        recipient_id: &str,
        read_at: &str,
    ) -> Result<usize, StoreError> {
        let mut tables = self.lock();
        let mut updated = 0;
        for notification in tables
            .notifications
            .iter_mut()
            .filter(|n| n.recipient_id == recipient_id && !n.is_read)
        {
            notification.is_read = true;
            notification.read_at = Some(read_at.to_string());
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete_all_notifications(&self, recipient_id: &str) -> Result<usize, StoreError> {
        let mut tables = self.lock();
        let before = tables.notifications.len();
        tables.notifications.retain(|n| n.recipient_id != recipient_id);
        Ok(before - tables.notifications.len())
    }
}
