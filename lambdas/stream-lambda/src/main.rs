#![recursion_limit = "256"]

use aws_lambda_events::event::dynamodb::{Event, EventRecord};
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_sdk_sesv2::Client as SesClient;
use health_records_shared::config::AppConfig;
use health_records_shared::email::SesMailer;
use health_records_shared::notifications;
use health_records_shared::store::DynamoStore;
use health_records_shared::tasks::{RetryPolicy, Task, TaskOutcome};
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a task needs, built once per container.
struct Worker {
    store: DynamoStore,
    mailer: SesMailer,
    retry: RetryPolicy,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();

    let config = AppConfig::from_env()?;
    let sdk_config = aws_config::load_from_env().await;
    let worker = Arc::new(Worker {
        store: DynamoStore::new(DynamoClient::new(&sdk_config), &config.table_name),
        mailer: SesMailer::new(SesClient::new(&sdk_config), config.from_email.clone()),
        retry: config.email_retry,
    });

    run(service_fn(move |event: LambdaEvent<Event>| {
        let worker = Arc::clone(&worker);
        async move { function_handler(event, &worker).await }
    }))
    .await
}

async fn function_handler(event: LambdaEvent<Event>, worker: &Worker) -> Result<(), Error> {
    tracing::info!(
        "DynamoDB Stream event received with {} records",
        event.payload.records.len()
    );

    // Tasks handle their own retries; one bad record must not fail the batch.
    for record in &event.payload.records {
        if let Err(e) = process_record(record, worker).await {
            tracing::error!("Failed to process record: {}", e);
        }
    }

    Ok(())
}

async fn process_record(record: &EventRecord, worker: &Worker) -> Result<(), Error> {
    if record.event_name != "INSERT" {
        return Ok(());
    }

    let image = string_attributes(&serde_json::to_value(&record.change.new_image)?);
    let Some(pk) = image.get("PK") else {
        return Err("Missing PK".into());
    };
    if !pk.starts_with("TASK#") {
        return Ok(());
    }

    let task_type = image.get("task_type").ok_or("Task item without task_type")?;
    let Some(task) = Task::decode(task_type, &image) else {
        tracing::warn!("Skipping unknown task type {} ({})", task_type, pk);
        return Ok(());
    };

    tracing::info!("Running {} task {}", task.kind(), pk);
    match notifications::run_task(&worker.store, &worker.mailer, worker.retry, &task).await {
        TaskOutcome::Completed { attempts } => {
            tracing::info!("Task {} done in {} attempt(s)", pk, attempts)
        }
        TaskOutcome::Abandoned { attempts, .. } => {
            tracing::error!("Task {} abandoned after {} attempts", pk, attempts)
        }
        TaskOutcome::Dropped { reason } => tracing::warn!("Task {} dropped: {}", pk, reason),
    }

    Ok(())
}

/// String-typed attributes of a stream image. Images serialize either in
/// DynamoDB's typed form (`{"S": "..."}`) or as plain JSON values.
fn string_attributes(image: &Value) -> HashMap<String, String> {
    let Some(attributes) = image.as_object() else {
        return HashMap::new();
    };

    attributes
        .iter()
        .filter_map(|(name, value)| {
            let text = match value {
                Value::String(s) => s.as_str(),
                Value::Object(typed) => typed.get("S")?.as_str()?,
                _ => return None,
            };
            Some((name.clone(), text.to_string()))
        })
        .collect()
}
