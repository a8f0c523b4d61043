//! DynamoDB single-table store.
//!
//! Item layout:
//!
//! | Entity | PK | SK | GSI1PK / GSI1SK | GSI2PK / GSI2SK |
//! |---|---|---|---|---|
//! | User | `USER#{id}` | `USER#{id}` | | |
//! | Email claim | `EMAIL#{email}` | `EMAIL` | | |
//! | Profile | `USER#{id}` | `PROFILE` | `PROFILE#doctor` / `USER#{id}` (doctors only) | |
//! | Record | `RECORD#{id}` | `RECORD` | `PATIENT#{pid}` / created_at | `DOCTOR#{did}` / created_at |
//! | File | `RECORD#{rid}` | `FILE#{id}` | `FILE#{id}` / `FILE` | |
//! | Annotation | `RECORD#{rid}` | `ANNOTATION#{id}` | `ANNOTATION#{id}` / `ANNOTATION` | |
//! | Notification | `NOTIFICATION#{id}` | `NOTIFICATION` | `RECIPIENT#{uid}` / created_at | `RECORD_NOTIFICATIONS#{rid}` / created_at |
//!
//! Both GSIs project all attributes.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::{
    AttributeValue, Delete, DeleteRequest, Put, ReturnValue, TransactWriteItem, Update,
    WriteRequest,
};
use aws_sdk_dynamodb::Client as DynamoClient;

use crate::error::StoreError;
use crate::scope::{DoctorRef, PatientRef, RecordScope};
use crate::store::Store;
use crate::types::{
    DoctorAnnotation, DoctorProfile, Gender, HealthRecord, HealthRecordFile, Notification,
    NotificationType, PatientProfile, Profile, RecordType, Role, User,
};

type Item = HashMap<String, AttributeValue>;

const GSI1: &str = "GSI1";
const GSI2: &str = "GSI2";
const MAX_TRANSACTION_ITEMS: usize = 100;
const MAX_BULK_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct DynamoStore {
    client: DynamoClient,
    table_name: String,
}

impl DynamoStore {
    pub fn new(client: DynamoClient, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    async fn get_item(&self, pk: String, sk: String) -> Result<Option<Item>, StoreError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", s(pk))
            .key("SK", s(sk))
            .send()
            .await
            .map_err(backend)?;
        Ok(result.item().cloned())
    }

    /// Query one partition (of the table or an index), following pagination.
    async fn query_all(
        &self,
        index: Option<&str>,
        key_attr: &str,
        key: String,
        sk_prefix: Option<&str>,
        newest_first: bool,
    ) -> Result<Vec<Item>, StoreError> {
        let sk_attr = match key_attr {
            "GSI1PK" => "GSI1SK",
            "GSI2PK" => "GSI2SK",
            _ => "SK",
        };
        let condition = if sk_prefix.is_some() {
            "#pk = :pk AND begins_with(#sk, :sk_prefix)"
        } else {
            "#pk = :pk"
        };

        let mut items = Vec::new();
        let mut start: Option<Item> = None;
        loop {
            let mut query = self
                .client
                .query()
                .table_name(&self.table_name)
                .set_index_name(index.map(str::to_string))
                .key_condition_expression(condition)
                .expression_attribute_names("#pk", key_attr)
                .expression_attribute_values(":pk", s(key.clone()))
                .scan_index_forward(!newest_first)
                .set_exclusive_start_key(start.take());
            if let Some(prefix) = sk_prefix {
                query = query
                    .expression_attribute_names("#sk", sk_attr)
                    .expression_attribute_values(":sk_prefix", s(prefix));
            }

            let result = query.send().await.map_err(backend)?;
            items.extend(result.items().iter().cloned());

            match result.last_evaluated_key() {
                Some(key) if !key.is_empty() => start = Some(key.clone()),
                _ => break,
            }
        }
        Ok(items)
    }

    fn put(&self, item: Item, condition: Option<&str>) -> Result<TransactWriteItem, StoreError> {
        let put = Put::builder()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .set_condition_expression(condition.map(str::to_string))
            .build()
            .map_err(backend)?;
        Ok(TransactWriteItem::builder().put(put).build())
    }

    async fn transact(&self, items: Vec<TransactWriteItem>) -> Result<(), StoreError> {
        if items.len() > MAX_TRANSACTION_ITEMS {
            return Err(StoreError::Backend(format!(
                "transaction of {} items exceeds the limit of {}",
                items.len(),
                MAX_TRANSACTION_ITEMS
            )));
        }
        self.client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
            .map_err(|e| {
                let cancelled = e
                    .as_service_error()
                    .map(|se| se.is_transaction_canceled_exception())
                    .unwrap_or(false);
                if cancelled {
                    StoreError::Conflict(format!("Transaction cancelled: {:?}", e))
                } else {
                    backend(e)
                }
            })?;
        Ok(())
    }

    /// Delete keys in batches of 25, re-sending unprocessed items.
    async fn batch_delete(&self, keys: Vec<Item>) -> Result<usize, StoreError> {
        let total = keys.len();
        for chunk in keys.chunks(25) {
            let requests = chunk
                .iter()
                .map(|key| {
                    DeleteRequest::builder()
                        .set_key(Some(key.clone()))
                        .build()
                        .map(|request| WriteRequest::builder().delete_request(request).build())
                        .map_err(backend)
                })
                .collect::<Result<Vec<_>, _>>()?;

            let mut attempts = 0u64;
            let mut unprocessed = Some(requests);
            while let Some(requests) = unprocessed {
                attempts += 1;
                if attempts > 5 {
                    return Err(StoreError::Backend(format!(
                        "{} deletes still unprocessed after {} attempts",
                        requests.len(),
                        attempts - 1
                    )));
                }

                let result = self
                    .client
                    .batch_write_item()
                    .request_items(&self.table_name, requests)
                    .send()
                    .await
                    .map_err(backend)?;

                unprocessed = result
                    .unprocessed_items()
                    .and_then(|items| items.get(&self.table_name))
                    .filter(|items| !items.is_empty())
                    .cloned();

                if let Some(pending) = unprocessed.as_ref() {
                    tracing::warn!(
                        "Retrying {} unprocessed deletes (attempt {})",
                        pending.len(),
                        attempts
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(100 * attempts)).await;
                }
            }
        }
        Ok(total)
    }
}

fn backend<E: std::fmt::Debug>(e: E) -> StoreError {
    StoreError::Backend(format!("{:?}", e))
}

fn s(value: impl Into<String>) -> AttributeValue {
    AttributeValue::S(value.into())
}

fn opt_s(value: &Option<String>) -> AttributeValue {
    match value {
        Some(v) => AttributeValue::S(v.clone()),
        None => AttributeValue::Null(true),
    }
}

fn key(pk: String, sk: String) -> Item {
    HashMap::from([("PK".to_string(), s(pk)), ("SK".to_string(), s(sk))])
}

fn key_of(item: &Item) -> Item {
    ["PK", "SK"]
        .iter()
        .filter_map(|k| item.get(*k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

fn get_string(item: &Item, field: &str) -> Result<String, StoreError> {
    item.get(field)
        .and_then(|v| v.as_s().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| StoreError::Backend(format!("item is missing attribute {}", field)))
}

fn get_opt_string(item: &Item, field: &str) -> Option<String> {
    item.get(field)
        .and_then(|v| v.as_s().ok())
        .map(|s| s.to_string())
}

fn get_bool(item: &Item, field: &str) -> bool {
    item.get(field)
        .and_then(|v| v.as_bool().ok())
        .copied()
        .unwrap_or(false)
}

fn get_u32(item: &Item, field: &str) -> u32 {
    item.get(field)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse::<u32>().ok())
        .unwrap_or(0)
}

fn invalid(field: &str, value: &str) -> StoreError {
    StoreError::Backend(format!("invalid stored {}: {}", field, value))
}

// ---- item <-> domain ----

fn user_item(user: &User) -> Item {
    let pk = format!("USER#{}", user.id);
    let mut item = key(pk.clone(), pk);
    item.insert("user_id".to_string(), s(&user.id));
    item.insert("email".to_string(), s(&user.email));
    item.insert("first_name".to_string(), s(&user.first_name));
    item.insert("last_name".to_string(), s(&user.last_name));
    item.insert("phone_number".to_string(), opt_s(&user.phone_number));
    item.insert("role".to_string(), s(user.role.as_str()));
    item.insert("is_active".to_string(), AttributeValue::Bool(user.is_active));
    item.insert("is_staff".to_string(), AttributeValue::Bool(user.is_staff));
    item.insert("created_at".to_string(), s(&user.created_at));
    item.insert("updated_at".to_string(), s(&user.updated_at));
    item
}

fn user_from_item(item: &Item) -> Result<User, StoreError> {
    let role = get_string(item, "role")?;
    Ok(User {
        id: get_string(item, "user_id")?,
        email: get_string(item, "email")?,
        first_name: get_opt_string(item, "first_name").unwrap_or_default(),
        last_name: get_opt_string(item, "last_name").unwrap_or_default(),
        phone_number: get_opt_string(item, "phone_number"),
        role: Role::parse(&role).ok_or_else(|| invalid("role", &role))?,
        is_active: get_bool(item, "is_active"),
        is_staff: get_bool(item, "is_staff"),
        created_at: get_opt_string(item, "created_at").unwrap_or_default(),
        updated_at: get_opt_string(item, "updated_at").unwrap_or_default(),
    })
}

fn profile_item(user_id: &str, profile: &Profile) -> Item {
    let mut item = key(format!("USER#{}", user_id), "PROFILE".to_string());
    item.insert("user_id".to_string(), s(user_id));
    item.insert("kind".to_string(), s(profile.role().as_str()));
    match profile {
        Profile::Patient(p) => {
            item.insert("date_of_birth".to_string(), opt_s(&p.date_of_birth));
            item.insert("gender".to_string(), s(p.gender.as_str()));
            item.insert("address".to_string(), opt_s(&p.address));
            item.insert("created_at".to_string(), s(&p.created_at));
            item.insert("updated_at".to_string(), s(&p.updated_at));
        }
        Profile::Doctor(d) => {
            item.insert("GSI1PK".to_string(), s("PROFILE#doctor"));
            item.insert("GSI1SK".to_string(), s(format!("USER#{}", user_id)));
            item.insert("specialization".to_string(), s(&d.specialization));
            item.insert("license_number".to_string(), s(&d.license_number));
            item.insert(
                "years_of_experience".to_string(),
                AttributeValue::N(d.years_of_experience.to_string()),
            );
            item.insert("created_at".to_string(), s(&d.created_at));
            item.insert("updated_at".to_string(), s(&d.updated_at));
        }
    }
    item
}

fn profile_from_item(item: &Item) -> Result<Profile, StoreError> {
    let kind = get_string(item, "kind")?;
    let created_at = get_opt_string(item, "created_at").unwrap_or_default();
    let updated_at = get_opt_string(item, "updated_at").unwrap_or_default();
    match Role::parse(&kind) {
        Some(Role::Patient) => {
            let gender = get_opt_string(item, "gender").unwrap_or_default();
            Ok(Profile::Patient(PatientProfile {
                date_of_birth: get_opt_string(item, "date_of_birth"),
                gender: Gender::parse(&gender).unwrap_or_default(),
                address: get_opt_string(item, "address"),
                created_at,
                updated_at,
            }))
        }
        Some(Role::Doctor) => Ok(Profile::Doctor(DoctorProfile {
            specialization: get_string(item, "specialization")?,
            license_number: get_string(item, "license_number")?,
            years_of_experience: get_u32(item, "years_of_experience"),
            created_at,
            updated_at,
        })),
        None => Err(invalid("profile kind", &kind)),
    }
}

fn record_item(record: &HealthRecord) -> Item {
    let mut item = key(format!("RECORD#{}", record.record_id), "RECORD".to_string());
    item.insert("record_id".to_string(), s(&record.record_id));
    item.insert("patient_id".to_string(), s(record.patient.as_str()));
    item.insert("doctor_id".to_string(), s(record.doctor.as_str()));
    item.insert("record_type".to_string(), s(record.record_type.as_str()));
    item.insert("description".to_string(), s(&record.description));
    item.insert("created_at".to_string(), s(&record.created_at));
    item.insert("updated_at".to_string(), s(&record.updated_at));
    item.insert(
        "GSI1PK".to_string(),
        s(format!("PATIENT#{}", record.patient.as_str())),
    );
    item.insert("GSI1SK".to_string(), s(&record.created_at));
    item.insert(
        "GSI2PK".to_string(),
        s(format!("DOCTOR#{}", record.doctor.as_str())),
    );
    item.insert("GSI2SK".to_string(), s(&record.created_at));
    item
}

fn record_from_item(item: &Item) -> Result<HealthRecord, StoreError> {
    let record_type = get_string(item, "record_type")?;
    Ok(HealthRecord {
        record_id: get_string(item, "record_id")?,
        patient: PatientRef::from_stored(get_string(item, "patient_id")?),
        doctor: DoctorRef::from_stored(get_string(item, "doctor_id")?),
        record_type: RecordType::parse(&record_type)
            .ok_or_else(|| invalid("record_type", &record_type))?,
        description: get_opt_string(item, "description").unwrap_or_default(),
        created_at: get_opt_string(item, "created_at").unwrap_or_default(),
        updated_at: get_opt_string(item, "updated_at").unwrap_or_default(),
    })
}

fn file_item(file: &HealthRecordFile) -> Item {
    let mut item = key(
        format!("RECORD#{}", file.record_id),
        format!("FILE#{}", file.file_id),
    );
    item.insert("file_id".to_string(), s(&file.file_id));
    item.insert("record_id".to_string(), s(&file.record_id));
    item.insert("blob_key".to_string(), s(&file.key));
    item.insert("url".to_string(), s(&file.url));
    item.insert("file_name".to_string(), s(&file.file_name));
    item.insert("content_type".to_string(), s(&file.content_type));
    item.insert("created_at".to_string(), s(&file.created_at));
    item.insert("GSI1PK".to_string(), s(format!("FILE#{}", file.file_id)));
    item.insert("GSI1SK".to_string(), s("FILE"));
    item
}

fn file_from_item(item: &Item) -> Result<HealthRecordFile, StoreError> {
    Ok(HealthRecordFile {
        file_id: get_string(item, "file_id")?,
        record_id: get_string(item, "record_id")?,
        key: get_string(item, "blob_key")?,
        url: get_opt_string(item, "url").unwrap_or_default(),
        file_name: get_opt_string(item, "file_name").unwrap_or_default(),
        content_type: get_opt_string(item, "content_type").unwrap_or_default(),
        created_at: get_opt_string(item, "created_at").unwrap_or_default(),
    })
}

fn annotation_item(annotation: &DoctorAnnotation) -> Item {
    let mut item = key(
        format!("RECORD#{}", annotation.record_id),
        format!("ANNOTATION#{}", annotation.annotation_id),
    );
    item.insert("annotation_id".to_string(), s(&annotation.annotation_id));
    item.insert("record_id".to_string(), s(&annotation.record_id));
    item.insert("note".to_string(), s(&annotation.note));
    item.insert("created_at".to_string(), s(&annotation.created_at));
    item.insert("updated_at".to_string(), s(&annotation.updated_at));
    item.insert(
        "GSI1PK".to_string(),
        s(format!("ANNOTATION#{}", annotation.annotation_id)),
    );
    item.insert("GSI1SK".to_string(), s("ANNOTATION"));
    item
}

fn annotation_from_item(item: &Item) -> Result<DoctorAnnotation, StoreError> {
    Ok(DoctorAnnotation {
        annotation_id: get_string(item, "annotation_id")?,
        record_id: get_string(item, "record_id")?,
        note: get_opt_string(item, "note").unwrap_or_default(),
        created_at: get_opt_string(item, "created_at").unwrap_or_default(),
        updated_at: get_opt_string(item, "updated_at").unwrap_or_default(),
    })
}

fn notification_item(notification: &Notification) -> Item {
    let mut item = key(
        format!("NOTIFICATION#{}", notification.notification_id),
        "NOTIFICATION".to_string(),
    );
    item.insert(
        "notification_id".to_string(),
        s(&notification.notification_id),
    );
    item.insert("recipient_id".to_string(), s(&notification.recipient_id));
    item.insert("record_id".to_string(), s(&notification.record_id));
    item.insert(
        "notification_type".to_string(),
        s(notification.notification_type.as_str()),
    );
    item.insert("message".to_string(), s(&notification.message));
    item.insert("is_read".to_string(), AttributeValue::Bool(notification.is_read));
    item.insert("read_at".to_string(), opt_s(&notification.read_at));
    item.insert("created_at".to_string(), s(&notification.created_at));
    item.insert(
        "GSI1PK".to_string(),
        s(format!("RECIPIENT#{}", notification.recipient_id)),
    );
    item.insert("GSI1SK".to_string(), s(&notification.created_at));
    item.insert(
        "GSI2PK".to_string(),
        s(format!("RECORD_NOTIFICATIONS#{}", notification.record_id)),
    );
    item.insert("GSI2SK".to_string(), s(&notification.created_at));
    item
}

fn notification_from_item(item: &Item) -> Result<Notification, StoreError> {
    let notification_type = get_string(item, "notification_type")?;
    Ok(Notification {
        notification_id: get_string(item, "notification_id")?,
        recipient_id: get_string(item, "recipient_id")?,
        record_id: get_string(item, "record_id")?,
        notification_type: NotificationType::parse(&notification_type)
            .ok_or_else(|| invalid("notification_type", &notification_type))?,
        message: get_opt_string(item, "message").unwrap_or_default(),
        is_read: get_bool(item, "is_read"),
        read_at: get_opt_string(item, "read_at"),
        created_at: get_opt_string(item, "created_at").unwrap_or_default(),
    })
}

/// Unconditional transactional deletes for the given keys.
fn delete_items(table_name: &str, keys: &[Item]) -> Result<Vec<TransactWriteItem>, StoreError> {
    keys.iter()
        .map(|key| {
            Delete::builder()
                .table_name(table_name)
                .set_key(Some(key.clone()))
                .build()
                .map(|delete| TransactWriteItem::builder().delete(delete).build())
                .map_err(backend)
        })
        .collect()
}

/// A stored notification, only if it is addressed to `recipient_id`.
fn notification_for_recipient(
    item: &Item,
    recipient_id: &str,
) -> Result<Option<Notification>, StoreError> {
    let notification = notification_from_item(item)?;
    Ok((notification.recipient_id == recipient_id).then_some(notification))
}

impl Store for DynamoStore {
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        // The email claim item makes the address unique across users.
        let mut email_claim = key(
            format!("EMAIL#{}", user.email.to_lowercase()),
            "EMAIL".to_string(),
        );
        email_claim.insert("user_id".to_string(), s(&user.id));

        let items = vec![
            self.put(email_claim, Some("attribute_not_exists(PK)"))?,
            self.put(user_item(user), Some("attribute_not_exists(PK)"))?,
        ];
        self.transact(items).await.map_err(|e| match e {
            StoreError::Conflict(_) => {
                StoreError::Conflict("A user with this email already exists".to_string())
            }
            other => other,
        })?;

        tracing::info!("Stored user {} ({})", user.id, user.role.as_str());
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let pk = format!("USER#{}", user_id);
        self.get_item(pk.clone(), pk)
            .await?
            .map(|item| user_from_item(&item))
            .transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let claim = self
            .get_item(
                format!("EMAIL#{}", email.to_lowercase()),
                "EMAIL".to_string(),
            )
            .await?;
        match claim.and_then(|item| get_opt_string(&item, "user_id")) {
            Some(user_id) => self.get_user(&user_id).await,
            None => Ok(None),
        }
    }

    async fn insert_profile(&self, user_id: &str, profile: &Profile) -> Result<(), StoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(profile_item(user_id, profile)))
            .condition_expression("attribute_not_exists(PK)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let exists = e
                    .as_service_error()
                    .map(|se| se.is_conditional_check_failed_exception())
                    .unwrap_or(false);
                if exists {
                    Err(StoreError::Conflict(
                        "Profile already exists for this user".to_string(),
                    ))
                } else {
                    Err(backend(e))
                }
            }
        }
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError> {
        self.get_item(format!("USER#{}", user_id), "PROFILE".to_string())
            .await?
            .map(|item| profile_from_item(&item))
            .transpose()
    }

    async fn replace_profile(&self, user_id: &str, profile: &Profile) -> Result<(), StoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(profile_item(user_id, profile)))
            .condition_expression("attribute_exists(PK)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_conditional_check_failed_exception())
                    .unwrap_or(false);
                if missing {
                    Err(StoreError::NotFound("profile".to_string()))
                } else {
                    Err(backend(e))
                }
            }
        }
    }

    async fn list_doctors_with_profile(&self) -> Result<Vec<(User, DoctorProfile)>, StoreError> {
        let items = self
            .query_all(Some(GSI1), "GSI1PK", "PROFILE#doctor".to_string(), None, false)
            .await?;

        let mut doctors = Vec::new();
        for item in &items {
            let Profile::Doctor(profile) = profile_from_item(item)? else {
                continue;
            };
            let user_id = get_string(item, "user_id")?;
            if let Some(user) = self.get_user(&user_id).await? {
                doctors.push((user, profile));
            }
        }
        doctors.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at));
        Ok(doctors)
    }

    async fn insert_record(
        &self,
        record: &HealthRecord,
        files: &[HealthRecordFile],
    ) -> Result<(), StoreError> {
        let mut items = vec![self.put(record_item(record), Some("attribute_not_exists(PK)"))?];
        for file in files {
            items.push(self.put(file_item(file), None)?);
        }
        self.transact(items).await?;
        tracing::info!(
            "Stored health record {} with {} file(s)",
            record.record_id,
            files.len()
        );
        Ok(())
    }

    async fn update_record(
        &self,
        record: &HealthRecord,
        new_files: &[HealthRecordFile],
    ) -> Result<(), StoreError> {
        let mut items = vec![self.put(record_item(record), Some("attribute_exists(PK)"))?];
        for file in new_files {
            items.push(self.put(file_item(file), None)?);
        }
        self.transact(items).await.map_err(|e| match e {
            StoreError::Conflict(_) => StoreError::NotFound("health record".to_string()),
            other => other,
        })
    }

    async fn get_record(&self, record_id: &str) -> Result<Option<HealthRecord>, StoreError> {
        self.get_item(format!("RECORD#{}", record_id), "RECORD".to_string())
            .await?
            .map(|item| record_from_item(&item))
            .transpose()
    }

    async fn list_records(&self, scope: &RecordScope) -> Result<Vec<HealthRecord>, StoreError> {
        let (index, key_attr, key) = match scope {
            RecordScope::Patient(patient) => {
                (GSI1, "GSI1PK", format!("PATIENT#{}", patient.as_str()))
            }
            RecordScope::Doctor(doctor) => (GSI2, "GSI2PK", format!("DOCTOR#{}", doctor.as_str())),
        };
        let items = self.query_all(Some(index), key_attr, key, None, true).await?;
        let records = items
            .iter()
            .map(record_from_item)
            .collect::<Result<Vec<_>, _>>()?;
        // The index key already scopes the query; this guards against stale projections.
        Ok(records.into_iter().filter(|r| scope.admits(r)).collect())
    }

    async fn delete_record(&self, record_id: &str) -> Result<Vec<HealthRecordFile>, StoreError> {
        let partition = self
            .query_all(None, "PK", format!("RECORD#{}", record_id), None, false)
            .await?;
        if partition.is_empty() {
            return Err(StoreError::NotFound("health record".to_string()));
        }
        let notifications = self
            .query_all(
                Some(GSI2),
                "GSI2PK",
                format!("RECORD_NOTIFICATIONS#{}", record_id),
                None,
                false,
            )
            .await?;

        let files = partition
            .iter()
            .filter(|item| {
                get_opt_string(item, "SK")
                    .map(|sk| sk.starts_with("FILE#"))
                    .unwrap_or(false)
            })
            .map(file_from_item)
            .collect::<Result<Vec<_>, _>>()?;

        // Children first, the record row last, so a partial failure never
        // leaves orphans pointing at a missing record.
        let (record_rows, mut keys): (Vec<Item>, Vec<Item>) = partition
            .iter()
            .map(key_of)
            .partition(|k| get_opt_string(k, "SK").as_deref() == Some("RECORD"));
        keys.extend(notifications.iter().map(key_of));
        let deleted = self.batch_delete(keys).await?;
        self.batch_delete(record_rows).await?;

        tracing::info!(
            "Cascade deleted record {} ({} dependent items)",
            record_id,
            deleted
        );
        Ok(files)
    }

    async fn list_files(&self, record_id: &str) -> Result<Vec<HealthRecordFile>, StoreError> {
        self.query_all(
            None,
            "PK",
            format!("RECORD#{}", record_id),
            Some("FILE#"),
            false,
        )
        .await?
        .iter()
        .map(file_from_item)
        .collect()
    }

    async fn get_file(&self, file_id: &str) -> Result<Option<HealthRecordFile>, StoreError> {
        self.query_all(Some(GSI1), "GSI1PK", format!("FILE#{}", file_id), None, false)
            .await?
            .first()
            .map(file_from_item)
            .transpose()
    }

    async fn delete_file(&self, file: &HealthRecordFile) -> Result<(), StoreError> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key("PK", s(format!("RECORD#{}", file.record_id)))
            .key("SK", s(format!("FILE#{}", file.file_id)))
            .send()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn insert_annotation(&self, annotation: &DoctorAnnotation) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(annotation_item(annotation)))
            .send()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_annotations(&self, record_id: &str) -> Result<Vec<DoctorAnnotation>, StoreError> {
        let mut annotations = self
            .query_all(
                None,
                "PK",
                format!("RECORD#{}", record_id),
                Some("ANNOTATION#"),
                false,
            )
            .await?
            .iter()
            .map(annotation_from_item)
            .collect::<Result<Vec<_>, _>>()?;
        annotations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(annotations)
    }

    async fn get_annotation(
        &self,
        annotation_id: &str,
    ) -> Result<Option<DoctorAnnotation>, StoreError> {
        self.query_all(
            Some(GSI1),
            "GSI1PK",
            format!("ANNOTATION#{}", annotation_id),
            None,
            false,
        )
        .await?
        .first()
        .map(annotation_from_item)
        .transpose()
    }

    async fn update_annotation(&self, annotation: &DoctorAnnotation) -> Result<(), StoreError> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", s(format!("RECORD#{}", annotation.record_id)))
            .key("SK", s(format!("ANNOTATION#{}", annotation.annotation_id)))
            .update_expression("SET note = :note, updated_at = :updated_at")
            .condition_expression("attribute_exists(PK)")
            .expression_attribute_values(":note", s(&annotation.note))
            .expression_attribute_values(":updated_at", s(&annotation.updated_at))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_conditional_check_failed_exception())
                    .unwrap_or(false);
                if missing {
                    Err(StoreError::NotFound("annotation".to_string()))
                } else {
                    Err(backend(e))
                }
            }
        }
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(notification_item(notification)))
            .condition_expression("attribute_not_exists(PK)")
            .send()
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_notification(
        &self,
        notification_id: &str,
    ) -> Result<Option<Notification>, StoreError> {
        self.get_item(
            format!("NOTIFICATION#{}", notification_id),
            "NOTIFICATION".to_string(),
        )
        .await?
        .map(|item| notification_from_item(&item))
        .transpose()
    }

    async fn list_notifications(&self, recipient_id: &str) -> Result<Vec<Notification>, StoreError> {
        self.query_all(
            Some(GSI1),
            "GSI1PK",
            format!("RECIPIENT#{}", recipient_id),
            None,
            true,
        )
        .await?
        .iter()
        .map(notification_from_item)
        .collect()
    }

    async fn mark_notification_read(
        &self,
        recipient_id: &str,
        notification_id: &str,
        read_at: &str,
    ) -> Result<Option<Notification>, StoreError> {
        // Only an unread notification of this recipient is touched, so a
        // second read leaves read_at alone.
        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", s(format!("NOTIFICATION#{}", notification_id)))
            .key("SK", s("NOTIFICATION"))
            .update_expression("SET is_read = :true, read_at = :read_at")
            .condition_expression("recipient_id = :recipient AND is_read = :false")
            .expression_attribute_values(":true", AttributeValue::Bool(true))
            .expression_attribute_values(":false", AttributeValue::Bool(false))
            .expression_attribute_values(":read_at", s(read_at))
            .expression_attribute_values(":recipient", s(recipient_id))
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        match result {
            Ok(output) => match output.attributes() {
                Some(item) => notification_for_recipient(item, recipient_id),
                None => Err(StoreError::Backend(format!(
                    "update of notification {} returned no attributes",
                    notification_id
                ))),
            },
            Err(e) => {
                let unchanged = e
                    .as_service_error()
                    .map(|se| se.is_conditional_check_failed_exception())
                    .unwrap_or(false);
                if !unchanged {
                    return Err(backend(e));
                }
                // Already read, or not this recipient's: report the stored state.
                let current = self
                    .client
                    .get_item()
                    .table_name(&self.table_name)
                    .key("PK", s(format!("NOTIFICATION#{}", notification_id)))
                    .key("SK", s("NOTIFICATION"))
                    .consistent_read(true)
                    .send()
                    .await
                    .map_err(backend)?;
                match current.item() {
                    Some(item) => notification_for_recipient(item, recipient_id),
                    None => Ok(None),
                }
            }
        }
    }

    async fn mark_all_notifications_read(
        &self,
        recipient_id: &str,
        read_at: &str,
    ) -> Result<usize, StoreError> {
        let mut updated = 0;
        // A batch cancelled by a concurrent read is re-planned from fresh state.
        for _ in 0..MAX_BULK_ATTEMPTS {
            let unread: Vec<Notification> = self
                .list_notifications(recipient_id)
                .await?
                .into_iter()
                .filter(|n| !n.is_read)
                .collect();
            if unread.is_empty() {
                return Ok(updated);
            }

            let mut cancelled = false;
            for batch in unread.chunks(MAX_TRANSACTION_ITEMS) {
                let items = batch
                    .iter()
                    .map(|n| {
                        Update::builder()
                            .table_name(&self.table_name)
                            .key("PK", s(format!("NOTIFICATION#{}", n.notification_id)))
                            .key("SK", s("NOTIFICATION"))
                            .update_expression("SET is_read = :true, read_at = :read_at")
                            .condition_expression("recipient_id = :recipient AND is_read = :false")
                            .expression_attribute_values(":true", AttributeValue::Bool(true))
                            .expression_attribute_values(":false", AttributeValue::Bool(false))
                            .expression_attribute_values(":read_at", s(read_at))
                            .expression_attribute_values(":recipient", s(recipient_id))
                            .build()
                            .map(|update| TransactWriteItem::builder().update(update).build())
                            .map_err(backend)
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                match self.transact(items).await {
                    Ok(()) => updated += batch.len(),
                    Err(StoreError::Conflict(_)) => {
                        cancelled = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !cancelled {
                return Ok(updated);
            }
            tracing::warn!("Bulk mark-read for {} raced a concurrent update, retrying", recipient_id);
        }
        Err(StoreError::Backend(format!(
            "bulk mark-read for {} kept conflicting",
            recipient_id
        )))
    }

    async fn delete_all_notifications(&self, recipient_id: &str) -> Result<usize, StoreError> {
        let keys: Vec<Item> = self
            .query_all(
                Some(GSI1),
                "GSI1PK",
                format!("RECIPIENT#{}", recipient_id),
                None,
                false,
            )
            .await?
            .iter()
            .map(key_of)
            .collect();

        // The keys come from the recipient's own index partition. Deleting a
        // row that vanished in the meantime is a no-op, not a cancellation.
        let mut deleted = 0;
        for batch in keys.chunks(MAX_TRANSACTION_ITEMS) {
            self.transact(delete_items(&self.table_name, batch)?).await?;
            deleted += batch.len();
        }
        Ok(deleted)
    }
}
