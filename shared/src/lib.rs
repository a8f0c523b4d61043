pub mod auth;
pub mod blobs;
pub mod config;
pub mod email;
pub mod error;
pub mod http;
pub mod notifications;
pub mod profiles;
pub mod records;
pub mod scope;
pub mod store;
pub mod tasks;
pub mod types;

use aws_sdk_cognitoidentityprovider::Client as CognitoClient;
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_sdk_s3::Client as S3Client;
use std::sync::Arc;

use auth::{CognitoIdentityProvider, IdentityProvider, MemoryIdentityProvider};
use blobs::{BlobStore, MemoryBlobStore, S3BlobStore};
use config::{AppConfig, ConfigError};
use store::{DynamoStore, MemoryStore, Store};
use tasks::{DynamoTaskQueue, MemoryTaskQueue, TaskQueue};

/// Shared application state
pub struct AppState<S, I, B, Q> {
    pub store: S,
    pub identity: I,
    pub blobs: B,
    pub queue: Q,
    pub config: AppConfig,
}

impl<S, I, B, Q> AppState<S, I, B, Q>
where
    S: Store,
    I: IdentityProvider,
    B: BlobStore,
    Q: TaskQueue,
{
    pub fn new(store: S, identity: I, blobs: B, queue: Q, config: AppConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            identity,
            blobs,
            queue,
            config,
        })
    }
}

/// State backed by DynamoDB, Cognito and S3.
pub type AwsState = AppState<DynamoStore, CognitoIdentityProvider, S3BlobStore, DynamoTaskQueue>;

/// State backed entirely by in-process doubles.
pub type MemoryState =
    AppState<MemoryStore, MemoryIdentityProvider, MemoryBlobStore, MemoryTaskQueue>;

impl AwsState {
    pub fn from_sdk_config(
        sdk_config: &aws_config::SdkConfig,
        config: AppConfig,
    ) -> Result<Arc<Self>, ConfigError> {
        let cognito = config.require_cognito()?.clone();
        let dynamo_client = DynamoClient::new(sdk_config);

        Ok(Self::new(
            DynamoStore::new(dynamo_client.clone(), &config.table_name),
            CognitoIdentityProvider::new(CognitoClient::new(sdk_config), cognito),
            S3BlobStore::new(S3Client::new(sdk_config), &config.bucket_name),
            DynamoTaskQueue::new(dynamo_client, &config.table_name),
            config,
        ))
    }
}

impl MemoryState {
    pub fn in_memory(config: AppConfig) -> Arc<Self> {
        Self::new(
            MemoryStore::new(),
            MemoryIdentityProvider::new(config.token_lifetimes),
            MemoryBlobStore::new(),
            MemoryTaskQueue::new(),
            config,
        )
    }
}
