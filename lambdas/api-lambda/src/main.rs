use health_records_shared::config::AppConfig;
use health_records_shared::AwsState;
use lambda_http::{run, service_fn, tracing, Error, Request};
use std::sync::Arc;

mod http_handler;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing::init_default_subscriber();

    let config = AppConfig::from_env()?;
    tracing::info!(
        "Starting API lambda (table: {}, bucket: {})",
        config.table_name,
        config.bucket_name
    );

    // Initialize AWS clients once at startup
    let sdk_config = aws_config::load_from_env().await;
    let state = AwsState::from_sdk_config(&sdk_config, config)?;

    run(service_fn(move |event: Request| {
        let state = Arc::clone(&state);
        async move { http_handler::function_handler(event, state).await }
    }))
    .await
}
