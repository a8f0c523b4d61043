use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use aws_sdk_cognitoidentityprovider::types::{AttributeType, AuthFlowType};
use aws_sdk_cognitoidentityprovider::Client as CognitoClient;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::{CognitoConfig, TokenLifetimes};
use crate::error::{ApiError, StoreError};
use crate::scope::Requester;
use crate::store::Store;
use crate::types::{
    new_id, timestamp, AuthenticatedUser, LoginRequest, RegisterRequest, TokenPair, User,
    UserSummary,
};

const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Incorrect email or password")]
    InvalidCredentials,
    #[error("An account with this email already exists")]
    UsernameExists,
    #[error("{0}")]
    InvalidPassword(String),
    #[error("Access token is invalid or expired")]
    InvalidToken,
    #[error("identity provider error: {0}")]
    Backend(String),
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials | AuthError::InvalidToken => ApiError::Unauthenticated,
            AuthError::UsernameExists => ApiError::Conflict(e.to_string()),
            AuthError::InvalidPassword(message) => ApiError::Validation(message),
            AuthError::Backend(message) => ApiError::Internal(message),
        }
    }
}

/// Credential checks and token issuance. Subjects returned here are the
/// stored user ids.
pub trait IdentityProvider: Send + Sync {
    /// Create an identity and return its subject.
    fn sign_up(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<String, AuthError>> + Send;

    fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<TokenPair, AuthError>> + Send;

    /// Verify an access token and return its subject.
    fn resolve_access_token(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<String, AuthError>> + Send;

    /// Remove an identity whose user row could not be written.
    fn delete_identity(&self, email: &str) -> impl Future<Output = Result<(), AuthError>> + Send;
}

type HmacSha256 = Hmac<Sha256>;

/// Compute the SECRET_HASH for Cognito authentication
fn compute_secret_hash(
    username: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<String, AuthError> {
    let message = format!("{}{}", username, client_id);
    let mut mac = HmacSha256::new_from_slice(client_secret.as_bytes())
        .map_err(|e| AuthError::Backend(format!("Invalid client secret: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

pub struct CognitoIdentityProvider {
    client: CognitoClient,
    config: CognitoConfig,
}

impl CognitoIdentityProvider {
    pub fn new(client: CognitoClient, config: CognitoConfig) -> Self {
        Self { client, config }
    }
}

impl IdentityProvider for CognitoIdentityProvider {
    async fn sign_up(&self, email: &str, password: &str) -> Result<String, AuthError> {
        let secret_hash =
            compute_secret_hash(email, &self.config.client_id, &self.config.client_secret)?;

        let email_attribute = AttributeType::builder()
            .name("email")
            .value(email)
            .build()
            .map_err(|e| AuthError::Backend(format!("{:?}", e)))?;

        let result = self
            .client
            .sign_up()
            .client_id(&self.config.client_id)
            .username(email)
            .password(password)
            .secret_hash(&secret_hash)
            .user_attributes(email_attribute)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let error_message = format!("{:?}", e);
                tracing::error!("Cognito signup error: {}", error_message);
                return Err(if error_message.contains("UsernameExistsException") {
                    AuthError::UsernameExists
                } else if error_message.contains("InvalidPasswordException") {
                    AuthError::InvalidPassword(
                        "Password does not meet the password policy".to_string(),
                    )
                } else {
                    AuthError::Backend(error_message)
                });
            }
        };

        // Registration logs the user straight in, so confirm them now.
        match &self.config.user_pool_id {
            Some(user_pool_id) => {
                if let Err(e) = self
                    .client
                    .admin_confirm_sign_up()
                    .user_pool_id(user_pool_id)
                    .username(email)
                    .send()
                    .await
                {
                    tracing::error!("Failed to auto-confirm user: {:?}", e);
                } else {
                    tracing::info!("User auto-confirmed: {}", email);
                }
            }
            None => tracing::warn!("COGNITO_USER_POOL_ID not set; skipping auto-confirm"),
        }

        Ok(output.user_sub().to_string())
    }

    async fn authenticate(&self, email: &str, password: &str) -> Result<TokenPair, AuthError> {
        let secret_hash =
            compute_secret_hash(email, &self.config.client_id, &self.config.client_secret)?;

        let result = self
            .client
            .initiate_auth()
            .auth_flow(AuthFlowType::UserPasswordAuth)
            .client_id(&self.config.client_id)
            .auth_parameters("USERNAME", email)
            .auth_parameters("PASSWORD", password)
            .auth_parameters("SECRET_HASH", &secret_hash)
            .send()
            .await;

        match result {
            Ok(response) => {
                let auth_result = response.authentication_result().ok_or_else(|| {
                    AuthError::Backend("No authentication result returned".to_string())
                })?;
                Ok(TokenPair {
                    access: auth_result.access_token().unwrap_or_default().to_string(),
                    refresh: auth_result.refresh_token().unwrap_or_default().to_string(),
                    expires_in: auth_result.expires_in(),
                })
            }
            Err(e) => {
                let error_message = format!("{:?}", e);
                if error_message.contains("NotAuthorizedException")
                    || error_message.contains("UserNotFoundException")
                    || error_message.contains("UserNotConfirmedException")
                {
                    tracing::warn!("Rejected login for {}", email);
                    Err(AuthError::InvalidCredentials)
                } else {
                    tracing::error!("Cognito authentication error: {}", error_message);
                    Err(AuthError::Backend(error_message))
                }
            }
        }
    }

    async fn resolve_access_token(&self, token: &str) -> Result<String, AuthError> {
        let output = self
            .client
            .get_user()
            .access_token(token)
            .send()
            .await
            .map_err(|e| {
                let error_message = format!("{:?}", e);
                if error_message.contains("NotAuthorizedException") {
                    AuthError::InvalidToken
                } else {
                    AuthError::Backend(error_message)
                }
            })?;

        output
            .user_attributes()
            .iter()
            .find(|attribute| attribute.name() == "sub")
            .and_then(|attribute| attribute.value())
            .map(str::to_string)
            .ok_or(AuthError::InvalidToken)
    }

    async fn delete_identity(&self, email: &str) -> Result<(), AuthError> {
        let Some(user_pool_id) = &self.config.user_pool_id else {
            return Err(AuthError::Backend(
                "COGNITO_USER_POOL_ID not set; cannot delete identity".to_string(),
            ));
        };
        self.client
            .admin_delete_user()
            .user_pool_id(user_pool_id)
            .username(email)
            .send()
            .await
            .map_err(|e| AuthError::Backend(format!("{:?}", e)))?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryIdentities {
    // email -> (password, subject)
    accounts: HashMap<String, (String, String)>,
    // access token -> subject
    tokens: HashMap<String, String>,
}

/// In-process identity provider for local runs and tests.
#[derive(Default)]
pub struct MemoryIdentityProvider {
    identities: Mutex<MemoryIdentities>,
    lifetimes: TokenLifetimes,
}

impl MemoryIdentityProvider {
    pub fn new(lifetimes: TokenLifetimes) -> Self {
        Self {
            identities: Mutex::default(),
            lifetimes,
        }
    }
}

impl IdentityProvider for MemoryIdentityProvider {
    async fn sign_up(&self, email: &str, password: &str) -> Result<String, AuthError> {
        let mut identities = self.identities.lock().unwrap_or_else(|p| p.into_inner());
        let username = email.to_lowercase();
        if identities.accounts.contains_key(&username) {
            return Err(AuthError::UsernameExists);
        }
        let subject = new_id();
        identities
            .accounts
            .insert(username, (password.to_string(), subject.clone()));
        Ok(subject)
    }

    async fn authenticate(&self, email: &str, password: &str) -> Result<TokenPair, AuthError> {
        let mut identities = self.identities.lock().unwrap_or_else(|p| p.into_inner());
        let subject = match identities.accounts.get(&email.to_lowercase()) {
            Some((stored, subject)) if stored == password => subject.clone(),
            _ => return Err(AuthError::InvalidCredentials),
        };
        let access = format!("access-{}", new_id());
        identities.tokens.insert(access.clone(), subject);
        Ok(TokenPair {
            access,
            refresh: format!("refresh-{}", new_id()),
            expires_in: i32::try_from(self.lifetimes.access.as_secs()).unwrap_or(i32::MAX),
        })
    }

    async fn resolve_access_token(&self, token: &str) -> Result<String, AuthError> {
        self.identities
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }

    async fn delete_identity(&self, email: &str) -> Result<(), AuthError> {
        self.identities
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .accounts
            .remove(&email.to_lowercase());
        Ok(())
    }
}

fn validate_registration(request: &RegisterRequest) -> Result<(), ApiError> {
    let email = request.email.trim();
    let well_formed = email
        .split_once('@')
        .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
        .unwrap_or(false);
    if !well_formed {
        return Err(ApiError::validation("Enter a valid email address"));
    }
    if request.password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

/// Create an identity and its user row, then log the new user in.
pub async fn register<S: Store, I: IdentityProvider>(
    store: &S,
    identity: &I,
    request: RegisterRequest,
) -> Result<AuthenticatedUser, ApiError> {
    validate_registration(&request)?;
    let email = request.email.trim().to_lowercase();

    tracing::info!("Registering {} as {}", email, request.role.as_str());

    if store.find_user_by_email(&email).await?.is_some() {
        return Err(ApiError::Conflict(AuthError::UsernameExists.to_string()));
    }

    let subject = identity.sign_up(&email, &request.password).await?;

    let now = timestamp();
    let user = User {
        id: subject,
        email: email.clone(),
        first_name: request.first_name.trim().to_string(),
        last_name: request.last_name.trim().to_string(),
        phone_number: request.phone_number.filter(|p| !p.trim().is_empty()),
        role: request.role,
        is_active: true,
        is_staff: false,
        created_at: now.clone(),
        updated_at: now,
    };

    if let Err(e) = store.insert_user(&user).await {
        if let Err(cleanup) = identity.delete_identity(&email).await {
            tracing::error!("Failed to remove identity for {}: {}", email, cleanup);
        }
        return Err(match e {
            StoreError::Conflict(_) => ApiError::Conflict(AuthError::UsernameExists.to_string()),
            other => other.into(),
        });
    }

    let tokens = identity.authenticate(&email, &request.password).await?;
    tracing::info!("Registered user {}", user.id);

    Ok(AuthenticatedUser {
        user: UserSummary::new(&user, None),
        tokens,
    })
}

pub async fn login<S: Store, I: IdentityProvider>(
    store: &S,
    identity: &I,
    request: LoginRequest,
) -> Result<AuthenticatedUser, ApiError> {
    let email = request.email.trim().to_lowercase();
    let tokens = identity.authenticate(&email, &request.password).await?;

    let Some(user) = store.find_user_by_email(&email).await? else {
        tracing::error!("Identity {} has no stored user", email);
        return Err(ApiError::Unauthenticated);
    };
    let requester = Requester::new(user)?;
    let profile = store.get_profile(requester.id()).await?;

    tracing::info!("Login successful for user {}", requester.id());
    Ok(AuthenticatedUser {
        user: UserSummary::new(requester.user(), profile),
        tokens,
    })
}

/// Identity evidence carried by a request, strongest first.
#[derive(Debug, Default, Clone, Copy)]
pub struct Credentials<'a> {
    /// `sub` claim already verified by the API Gateway JWT authorizer.
    pub verified_subject: Option<&'a str>,
    pub bearer_token: Option<&'a str>,
    /// Only honoured when the deployment allows it.
    pub user_id_header: Option<&'a str>,
}

pub async fn resolve_requester<S: Store, I: IdentityProvider>(
    store: &S,
    identity: &I,
    credentials: Credentials<'_>,
    allow_user_id_header: bool,
) -> Result<Requester, ApiError> {
    let subject = if let Some(subject) = credentials.verified_subject {
        subject.to_string()
    } else if let Some(token) = credentials.bearer_token {
        identity.resolve_access_token(token).await?
    } else if let (true, Some(user_id)) = (allow_user_id_header, credentials.user_id_header) {
        user_id.to_string()
    } else {
        return Err(ApiError::Unauthenticated);
    };

    match store.get_user(&subject).await? {
        Some(user) => Requester::new(user),
        None => {
            tracing::warn!("No user for subject {}", subject);
            Err(ApiError::Unauthenticated)
        }
    }
}
