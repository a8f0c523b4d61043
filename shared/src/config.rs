use std::env;
use std::time::Duration;

use crate::tasks::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct CognitoConfig {
    pub client_id: String,
    pub client_secret: String,
    pub user_pool_id: Option<String>,
}

/// Token lifetimes handed out by the identity provider. Cognito enforces its
/// own app-client settings; these values are reported in `expires_in` and used
/// by the in-memory provider.
#[derive(Debug, Clone, Copy)]
pub struct TokenLifetimes {
    pub access: Duration,
    pub refresh: Duration,
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            access: Duration::from_secs(1000 * 60),
            refresh: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub table_name: String,
    pub bucket_name: String,
    pub from_email: String,
    pub cognito: Option<CognitoConfig>,
    pub allow_user_id_header: bool,
    pub token_lifetimes: TokenLifetimes,
    pub email_retry: RetryPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            table_name: "health-records".to_string(),
            bucket_name: "health-records-files".to_string(),
            from_email: "noreply@healthrecords.com".to_string(),
            cognito: None,
            allow_user_id_header: false,
            token_lifetimes: TokenLifetimes::default(),
            email_retry: RetryPolicy::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = AppConfig::default();

        let cognito = match env::var("COGNITO_CLIENT_ID") {
            Ok(client_id) => Some(CognitoConfig {
                client_id,
                client_secret: env::var("COGNITO_CLIENT_SECRET")
                    .map_err(|_| ConfigError::Missing("COGNITO_CLIENT_SECRET"))?,
                user_pool_id: env::var("COGNITO_USER_POOL_ID").ok(),
            }),
            Err(_) => None,
        };

        let access_minutes = parse_var("ACCESS_TOKEN_MINUTES", 1000u64)?;
        let refresh_days = parse_var("REFRESH_TOKEN_DAYS", 7u64)?;
        let max_retries = parse_var("EMAIL_MAX_RETRIES", defaults.email_retry.max_retries)?;
        let retry_delay = parse_var(
            "EMAIL_RETRY_DELAY_SECS",
            defaults.email_retry.countdown.as_secs(),
        )?;

        Ok(Self {
            table_name: env::var("TABLE_NAME").unwrap_or(defaults.table_name),
            bucket_name: env::var("BUCKET_NAME").unwrap_or(defaults.bucket_name),
            from_email: env::var("DEFAULT_FROM_EMAIL").unwrap_or(defaults.from_email),
            cognito,
            allow_user_id_header: parse_var("ALLOW_USER_ID_HEADER", false)?,
            token_lifetimes: TokenLifetimes {
                access: Duration::from_secs(access_minutes * 60),
                refresh: Duration::from_secs(refresh_days * 24 * 60 * 60),
            },
            email_retry: RetryPolicy {
                max_retries,
                countdown: Duration::from_secs(retry_delay),
            },
        })
    }

    /// Cognito settings are mandatory wherever real credentials are checked.
    pub fn require_cognito(&self) -> Result<&CognitoConfig, ConfigError> {
        self.cognito
            .as_ref()
            .ok_or(ConfigError::Missing("COGNITO_CLIENT_ID"))
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}
