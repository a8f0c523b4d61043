//! Background work handed off from request handling.
//!
//! In production a task is a `TASK#{id}` item written to the table; the
//! stream lambda picks up the INSERT from the DynamoDB stream and runs it.
//! Items carry an `expires_at` TTL so the table cleans them up afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client as DynamoClient;

use crate::types::{new_id, timestamp};

const TASK_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    SendNotificationEmail { notification_id: String },
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::SendNotificationEmail { .. } => "send_notification_email",
        }
    }

    /// Rebuild a task from the attributes of its queue item.
    pub fn decode(kind: &str, fields: &HashMap<String, String>) -> Option<Self> {
        match kind {
            "send_notification_email" => Some(Task::SendNotificationEmail {
                notification_id: fields.get("notification_id")?.clone(),
            }),
            _ => None,
        }
    }

    fn fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            Task::SendNotificationEmail { notification_id } => {
                vec![("notification_id", notification_id.as_str())]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReceipt {
    pub task_id: String,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to enqueue task: {0}")]
pub struct QueueError(pub String);

pub trait TaskQueue: Send + Sync {
    fn submit(&self, task: Task) -> impl Future<Output = Result<TaskReceipt, QueueError>> + Send;
}

#[derive(Clone)]
pub struct DynamoTaskQueue {
    client: DynamoClient,
    table_name: String,
}

impl DynamoTaskQueue {
    pub fn new(client: DynamoClient, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }
}

impl TaskQueue for DynamoTaskQueue {
    async fn submit(&self, task: Task) -> Result<TaskReceipt, QueueError> {
        let task_id = new_id();
        let expires_at = chrono::Utc::now().timestamp() + TASK_TTL_SECS;

        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item("PK", AttributeValue::S(format!("TASK#{}", task_id)))
            .item("SK", AttributeValue::S("TASK".to_string()))
            .item("task_id", AttributeValue::S(task_id.clone()))
            .item("task_type", AttributeValue::S(task.kind().to_string()))
            .item("created_at", AttributeValue::S(timestamp()))
            .item("expires_at", AttributeValue::N(expires_at.to_string()));
        for (name, value) in task.fields() {
            request = request.item(name, AttributeValue::S(value.to_string()));
        }

        request
            .send()
            .await
            .map_err(|e| QueueError(format!("{:?}", e)))?;

        tracing::info!("Queued {} task {}", task.kind(), task_id);
        Ok(TaskReceipt { task_id })
    }
}

/// Queue that only records submissions. Tests and local runs drain it and
/// execute the tasks inline.
#[derive(Default)]
pub struct MemoryTaskQueue {
    submitted: Mutex<Vec<Task>>,
    reject: Mutex<bool>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_submissions(&self, reject: bool) {
        *self.reject.lock().unwrap_or_else(|p| p.into_inner()) = reject;
    }

    pub fn pending(&self) -> Vec<Task> {
        self.submitted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn drain(&self) -> Vec<Task> {
        std::mem::take(&mut *self.submitted.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl TaskQueue for MemoryTaskQueue {
    async fn submit(&self, task: Task) -> Result<TaskReceipt, QueueError> {
        if *self.reject.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(QueueError("queue unavailable".to_string()));
        }
        self.submitted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(task);
        Ok(TaskReceipt { task_id: new_id() })
    }
}

/// Retry schedule for a task: up to `max_retries` re-runs after the first
/// attempt, `countdown` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub countdown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            countdown: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Worth another attempt (mail transport hiccup, throttling).
    #[error("transient failure: {0}")]
    Transient(String),
    /// Retrying cannot help (the notification no longer exists).
    #[error("permanent failure: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { attempts: u32 },
    Abandoned { attempts: u32, reason: String },
    Dropped { reason: String },
}

/// Run `attempt` until it succeeds, fails permanently, or the policy's
/// retries are used up. Failures never propagate: an abandoned task is
/// logged and reported in the outcome.
pub async fn run_with_retry<F, Fut>(policy: RetryPolicy, task: &Task, mut attempt: F) -> TaskOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), DeliveryError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(()) => {
                tracing::info!("{} task completed after {} attempt(s)", task.kind(), attempts);
                return TaskOutcome::Completed { attempts };
            }
            Err(DeliveryError::Permanent(reason)) => {
                tracing::warn!("Dropping {} task: {}", task.kind(), reason);
                return TaskOutcome::Dropped { reason };
            }
            Err(DeliveryError::Transient(reason)) => {
                if attempts > policy.max_retries {
                    tracing::error!(
                        "Abandoning {:?} after {} attempts: {}",
                        task,
                        attempts,
                        reason
                    );
                    return TaskOutcome::Abandoned { attempts, reason };
                }
                tracing::warn!(
                    "{} task attempt {} failed, retrying in {:?}: {}",
                    task.kind(),
                    attempts,
                    policy.countdown,
                    reason
                );
                tokio::time::sleep(policy.countdown).await;
            }
        }
    }
}
