//! Notification pipeline.
//!
//! Writes to the record aggregate call the `on_*` hooks after they commit.
//! A hook stores exactly one notification row and queues an email task; a
//! queue failure is logged and leaves the row in place. The worker side
//! ([`run_task`]) re-reads the row at send time and never mutates it, so
//! running a task twice only sends a duplicate email.

use crate::email::{compose_notification_email, Mailer};
use crate::error::ApiError;
use crate::records::ViewBuilder;
use crate::scope::{found, Requester};
use crate::store::Store;
use crate::tasks::{run_with_retry, DeliveryError, RetryPolicy, Task, TaskOutcome, TaskQueue};
use crate::types::{
    new_id, timestamp, BulkUpdateResponse, HealthRecord, Notification, NotificationType,
    NotificationView, User,
};

async fn notify<S: Store, Q: TaskQueue>(
    store: &S,
    queue: &Q,
    recipient_id: &str,
    record_id: &str,
    notification_type: NotificationType,
    message: String,
) -> Result<Notification, ApiError> {
    let notification = Notification {
        notification_id: new_id(),
        recipient_id: recipient_id.to_string(),
        record_id: record_id.to_string(),
        notification_type,
        message,
        is_read: false,
        read_at: None,
        created_at: timestamp(),
    };
    store.insert_notification(&notification).await?;

    let task = Task::SendNotificationEmail {
        notification_id: notification.notification_id.clone(),
    };
    match queue.submit(task).await {
        Ok(receipt) => tracing::info!(
            "Notification {} queued for delivery as task {}",
            notification.notification_id,
            receipt.task_id
        ),
        Err(e) => tracing::error!(
            "Notification {} stored but email not queued: {}",
            notification.notification_id,
            e
        ),
    }
    Ok(notification)
}

/// Tell the assigned doctor about a new record.
pub async fn on_record_created<S: Store, Q: TaskQueue>(
    store: &S,
    queue: &Q,
    record: &HealthRecord,
    patient: &User,
) -> Result<Notification, ApiError> {
    notify(
        store,
        queue,
        record.doctor.as_str(),
        &record.record_id,
        NotificationType::PatientAssigned,
        format!("New health record created by patient {}", patient.full_name()),
    )
    .await
}

/// Tell the record's patient that their doctor annotated it.
pub async fn on_annotation_created<S: Store, Q: TaskQueue>(
    store: &S,
    queue: &Q,
    record: &HealthRecord,
    doctor: &User,
) -> Result<Notification, ApiError> {
    notify(
        store,
        queue,
        record.patient.as_str(),
        &record.record_id,
        NotificationType::RecordAnnotated,
        format!(
            "Dr. {} has annotated health record: {}",
            doctor.full_name(),
            record.record_id
        ),
    )
    .await
}

// ---- reader operations ----

async fn view<S: Store>(
    builder: &mut ViewBuilder<'_, S>,
    store: &S,
    notification: Notification,
) -> Result<Option<NotificationView>, ApiError> {
    let Some(record) = store.get_record(&notification.record_id).await? else {
        // The record was deleted between the two reads.
        return Ok(None);
    };
    Ok(Some(NotificationView {
        id: notification.notification_id,
        record: builder.view(record).await?,
        notification_type: notification.notification_type,
        message: notification.message,
        is_read: notification.is_read,
        read_at: notification.read_at,
        created_at: notification.created_at,
    }))
}

/// The requester's notifications, newest first. Listing does not mark
/// anything read.
pub async fn list_notifications<S: Store>(
    store: &S,
    requester: &Requester,
) -> Result<Vec<NotificationView>, ApiError> {
    let notifications = store.list_notifications(requester.id()).await?;
    let mut builder = ViewBuilder::new(store);
    let mut views = Vec::with_capacity(notifications.len());
    for notification in notifications {
        if let Some(view) = view(&mut builder, store, notification).await? {
            views.push(view);
        }
    }
    Ok(views)
}

/// Fetch one notification and mark it read. A notification that was already
/// read keeps its original `read_at`.
pub async fn retrieve_notification<S: Store>(
    store: &S,
    requester: &Requester,
    notification_id: &str,
) -> Result<NotificationView, ApiError> {
    let notification = store
        .mark_notification_read(requester.id(), notification_id, &timestamp())
        .await?;
    let notification = found(notification, "Notification")?;
    let mut builder = ViewBuilder::new(store);
    let view = view(&mut builder, store, notification).await?;
    found(view, "Notification")
}

pub async fn mark_all_read<S: Store>(
    store: &S,
    requester: &Requester,
) -> Result<BulkUpdateResponse, ApiError> {
    let updated = store
        .mark_all_notifications_read(requester.id(), &timestamp())
        .await?;
    tracing::info!("Marked {} notification(s) read for {}", updated, requester.id());
    Ok(BulkUpdateResponse { updated })
}

pub async fn delete_all<S: Store>(store: &S, requester: &Requester) -> Result<usize, ApiError> {
    let deleted = store.delete_all_notifications(requester.id()).await?;
    tracing::info!("Deleted {} notification(s) for {}", deleted, requester.id());
    Ok(deleted)
}

// ---- delivery ----

/// One delivery attempt: load the notification and its recipient, then mail.
pub async fn deliver_notification_email<S: Store, M: Mailer>(
    store: &S,
    mailer: &M,
    notification_id: &str,
) -> Result<(), DeliveryError> {
    let notification = store
        .get_notification(notification_id)
        .await
        .map_err(|e| DeliveryError::Transient(e.to_string()))?
        .ok_or_else(|| {
            DeliveryError::Permanent(format!("notification {} does not exist", notification_id))
        })?;
    let recipient = store
        .get_user(&notification.recipient_id)
        .await
        .map_err(|e| DeliveryError::Transient(e.to_string()))?
        .ok_or_else(|| {
            DeliveryError::Permanent(format!(
                "recipient {} of notification {} does not exist",
                notification.recipient_id, notification_id
            ))
        })?;

    let email = compose_notification_email(&recipient, &notification);
    mailer
        .send(&email)
        .await
        .map_err(|e| DeliveryError::Transient(e.to_string()))
}

/// Execute a queued task with the retry policy.
pub async fn run_task<S: Store, M: Mailer>(
    store: &S,
    mailer: &M,
    policy: RetryPolicy,
    task: &Task,
) -> TaskOutcome {
    match task {
        Task::SendNotificationEmail { notification_id } => {
            let notification_id = notification_id.as_str();
            run_with_retry(policy, task, move || {
                deliver_notification_email(store, mailer, notification_id)
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::email::MemoryMailer;
    use crate::scope::{DoctorRef, PatientRef};
    use crate::store::MemoryStore;
    use crate::tasks::MemoryTaskQueue;
    use crate::types::{RecordType, Role};

    fn user(id: &str, first: &str, last: &str, role: Role) -> User {
        User {
            id: id.to_string(),
            email: format!("{}@test.com", id),
            first_name: first.to_string(),
            last_name: last.to_string(),
            phone_number: None,
            role,
            is_active: true,
            is_staff: false,
            created_at: timestamp(),
            updated_at: timestamp(),
        }
    }

    struct Fixture {
        store: MemoryStore,
        queue: MemoryTaskQueue,
        patient: User,
        doctor: User,
        record: HealthRecord,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let patient = user("p1", "Jane", "Doe", Role::Patient);
        let doctor = user("d1", "Gregory", "House", Role::Doctor);
        store.insert_user(&patient).await.unwrap();
        store.insert_user(&doctor).await.unwrap();
        let record = HealthRecord {
            record_id: "r1".to_string(),
            patient: PatientRef::from_user(&patient).unwrap(),
            doctor: DoctorRef::from_user(&doctor).unwrap(),
            record_type: RecordType::General,
            description: String::new(),
            created_at: timestamp(),
            updated_at: timestamp(),
        };
        store.insert_record(&record, &[]).await.unwrap();
        Fixture {
            store,
            queue: MemoryTaskQueue::new(),
            patient,
            doctor,
            record,
        }
    }

    fn immediate() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            countdown: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_hooks_address_the_other_party() {
        let fx = fixture().await;
        let to_doctor = on_record_created(&fx.store, &fx.queue, &fx.record, &fx.patient)
            .await
            .unwrap();
        assert_eq!(to_doctor.recipient_id, "d1");
        assert_eq!(to_doctor.message, "New health record created by patient Jane Doe");

        let to_patient = on_annotation_created(&fx.store, &fx.queue, &fx.record, &fx.doctor)
            .await
            .unwrap();
        assert_eq!(to_patient.recipient_id, "p1");
        assert_eq!(
            to_patient.message,
            "Dr. Gregory House has annotated health record: r1"
        );
        assert_eq!(fx.queue.pending().len(), 2);
    }

    #[tokio::test]
    async fn test_queue_failure_keeps_the_row() {
        let fx = fixture().await;
        fx.queue.reject_submissions(true);
        on_record_created(&fx.store, &fx.queue, &fx.record, &fx.patient)
            .await
            .unwrap();
        assert_eq!(fx.store.notification_count(), 1);
    }

    #[tokio::test]
    async fn test_read_marking_is_idempotent() {
        let fx = fixture().await;
        let doctor = Requester::new(fx.doctor.clone()).unwrap();
        let created = on_record_created(&fx.store, &fx.queue, &fx.record, &fx.patient)
            .await
            .unwrap();

        let first = retrieve_notification(&fx.store, &doctor, &created.notification_id)
            .await
            .unwrap();
        assert!(first.is_read);
        assert!(first.read_at.is_some());

        let second = retrieve_notification(&fx.store, &doctor, &created.notification_id)
            .await
            .unwrap();
        assert_eq!(second.read_at, first.read_at);

        let bulk = mark_all_read(&fx.store, &doctor).await.unwrap();
        assert_eq!(bulk.updated, 0);
        let listed = list_notifications(&fx.store, &doctor).await.unwrap();
        assert_eq!(listed[0].read_at, first.read_at);
    }

    #[tokio::test]
    async fn test_reader_operations_are_scoped() {
        let fx = fixture().await;
        let patient = Requester::new(fx.patient.clone()).unwrap();
        let doctor = Requester::new(fx.doctor.clone()).unwrap();
        let created = on_record_created(&fx.store, &fx.queue, &fx.record, &fx.patient)
            .await
            .unwrap();

        let err = retrieve_notification(&fx.store, &patient, &created.notification_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert_eq!(mark_all_read(&fx.store, &patient).await.unwrap().updated, 0);
        assert_eq!(delete_all(&fx.store, &patient).await.unwrap(), 0);

        assert_eq!(mark_all_read(&fx.store, &doctor).await.unwrap().updated, 1);
        assert_eq!(delete_all(&fx.store, &doctor).await.unwrap(), 1);
        assert!(list_notifications(&fx.store, &doctor).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_retries_then_sends() {
        let fx = fixture().await;
        let mailer = MemoryMailer::new();
        on_record_created(&fx.store, &fx.queue, &fx.record, &fx.patient)
            .await
            .unwrap();
        let task = fx.queue.drain().remove(0);

        mailer.fail_next(2);
        let outcome = run_task(&fx.store, &mailer, immediate(), &task).await;
        assert_eq!(outcome, TaskOutcome::Completed { attempts: 3 });

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "d1@test.com");
        assert_eq!(sent[0].subject, "Health Record Notification - Patient Assigned");
    }

    #[tokio::test]
    async fn test_delivery_is_abandoned_after_retries() {
        let fx = fixture().await;
        let mailer = MemoryMailer::new();
        on_record_created(&fx.store, &fx.queue, &fx.record, &fx.patient)
            .await
            .unwrap();
        let task = fx.queue.drain().remove(0);

        mailer.fail_next(10);
        let outcome = run_task(&fx.store, &mailer, immediate(), &task).await;
        assert!(matches!(outcome, TaskOutcome::Abandoned { attempts: 4, .. }));
        assert!(mailer.sent().is_empty());
        // the row is untouched by delivery
        assert_eq!(fx.store.notification_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_notification_is_dropped() {
        let fx = fixture().await;
        let mailer = MemoryMailer::new();
        let task = Task::SendNotificationEmail {
            notification_id: "gone".to_string(),
        };
        let outcome = run_task(&fx.store, &mailer, immediate(), &task).await;
        assert!(matches!(outcome, TaskOutcome::Dropped { .. }));
    }
}
