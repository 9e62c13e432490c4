/// Account management
///
/// Registration, password login, session validation and account removal.
/// Session tokens are handed to the client once; the database only keeps a
/// keyed hash of them.
use crate::{
    auth::{generate_token, hash_password, session_token_hash, verify_password},
    config::ServerConfig,
    db::{now, MetadataStore, User},
    error::{TroveError, TroveResult},
    files::FileService,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const MIN_PASSWORD_LEN: usize = 8;

/// Registration request
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub handle: String,
    pub email: String,
    pub password: String,
}

/// Login request
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    /// Handle or email
    pub identifier: String,
    pub password: String,
}

/// Data kept with a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionPayload {
    pub csrf_token: String,
}

/// Successful login
#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub csrf_token: String,
    pub expires_at: i64,
    pub user: User,
}

/// Validated session from a bearer token or cookie
#[derive(Debug, Clone)]
pub struct ValidatedSession {
    pub user: User,
    pub payload: SessionPayload,
    pub token_hash: String,
    pub expires_at: i64,
}

/// Account manager service
pub struct AccountManager {
    store: MetadataStore,
    config: Arc<ServerConfig>,
}

impl AccountManager {
    pub fn new(store: MetadataStore, config: Arc<ServerConfig>) -> Self {
        Self { store, config }
    }

    /// Create an account; the first account becomes the administrator
    pub async fn register(&self, request: RegisterRequest) -> TroveResult<User> {
        if !self.config.authentication.registration_enabled {
            return Err(TroveError::Forbidden("Registration is disabled".to_string()));
        }

        let handle = request.handle.trim().to_ascii_lowercase();
        let email = request.email.trim().to_ascii_lowercase();
        validate_handle(&handle)?;
        validate_email(&email)?;
        if request.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(TroveError::Validation(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let password_hash = hash_password(&request.password, self.config.authentication.password_cost)?;
        let is_admin = self.store.count_users().await? == 0;
        let quota = i64::try_from(self.config.limits.default_user_quota).unwrap_or(i64::MAX);

        let user = self
            .store
            .create_user(&handle, &email, &password_hash, quota, is_admin)
            .await?;

        info!(
            "Registered user {} ({}){}",
            user.handle,
            user.id,
            if is_admin { " as administrator" } else { "" }
        );
        Ok(user)
    }

    /// Check credentials and open a session
    pub async fn login(&self, request: LoginRequest) -> TroveResult<LoginResponse> {
        let identifier = request.identifier.trim().to_ascii_lowercase();
        let invalid = || TroveError::Authentication("Invalid credentials".to_string());

        let user = self
            .store
            .find_user_by_handle(&identifier)
            .await?
            .ok_or_else(invalid)?;

        if !verify_password(&request.password, &user.password_hash) {
            warn!("Failed login for {}", identifier);
            return Err(invalid());
        }
        if user.deleted_at.is_some() {
            return Err(TroveError::Authentication(
                "Account is scheduled for deletion".to_string(),
            ));
        }

        let token = generate_token();
        let payload = SessionPayload {
            csrf_token: generate_token(),
        };
        let expires_at = now() + self.config.authentication.session_duration.as_secs() as i64;
        let payload_json = serde_json::to_string(&payload)
            .map_err(|e| TroveError::Internal(format!("Failed to encode session: {}", e)))?;

        self.store
            .create_session(&self.token_hash(&token), user.id, &payload_json, expires_at)
            .await?;

        info!("User {} signed in", user.handle);
        Ok(LoginResponse {
            token,
            csrf_token: payload.csrf_token,
            expires_at,
            user,
        })
    }

    /// End a session; unknown sessions are ignored
    pub async fn logout(&self, session: &ValidatedSession) -> TroveResult<()> {
        self.store.delete_session(&session.token_hash).await?;
        Ok(())
    }

    /// Resolve a session token to its user
    pub async fn validate_session(&self, token: &str) -> TroveResult<ValidatedSession> {
        let token_hash = self.token_hash(token);
        let expired = || TroveError::Authentication("Session expired or invalid".to_string());

        let Some(session) = self.store.get_session(&token_hash).await? else {
            // Expired rows are dropped on sight; the cleanup job gets the rest
            self.store.delete_session(&token_hash).await?;
            return Err(expired());
        };

        let user = self
            .store
            .get_user(session.user_id)
            .await?
            .filter(|u| u.deleted_at.is_none())
            .ok_or_else(expired)?;

        let payload: SessionPayload = serde_json::from_str(&session.payload)
            .map_err(|e| TroveError::Internal(format!("Corrupt session payload: {}", e)))?;

        Ok(ValidatedSession {
            user,
            payload,
            token_hash,
            expires_at: session.expires_at,
        })
    }

    pub async fn get_user(&self, user_id: i64) -> TroveResult<User> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| TroveError::NotFound(format!("user {}", user_id)))
    }

    /// Change a user's storage quota
    pub async fn set_quota(&self, user_id: i64, bytes: u64) -> TroveResult<User> {
        let bytes = i64::try_from(bytes)
            .map_err(|_| TroveError::Validation("Quota is too large".to_string()))?;
        let user = self.store.set_user_quota(user_id, bytes).await?;
        info!("Set quota of user {} to {} bytes", user_id, bytes);
        Ok(user)
    }

    /// Schedule an account for removal and sign it out everywhere
    pub async fn schedule_deletion(&self, user_id: i64) -> TroveResult<()> {
        self.store.soft_delete_user(user_id).await?;
        let sessions = self.store.delete_user_sessions(user_id).await?;
        info!(
            "Scheduled user {} for deletion ({} sessions revoked)",
            user_id, sessions
        );
        Ok(())
    }

    /// Remove accounts whose deletion retention has elapsed
    ///
    /// Files are purged through the normal path so shared blobs survive.
    pub async fn purge_deleted_accounts(&self, files: &FileService) -> TroveResult<u64> {
        let due = self
            .store
            .users_due_for_purge(now(), self.config.retention.deleted_retention_days)
            .await?;
        let mut removed = 0;

        for user in due {
            let purged = files.purge_user_files(user.id).await?;
            if self.store.delete_user_row(user.id).await? {
                removed += 1;
                info!(
                    "Purged account {} ({}) and {} files",
                    user.handle, user.id, purged
                );
            }
        }
        Ok(removed)
    }

    /// Drop sessions past their expiry
    pub async fn cleanup_sessions(&self) -> TroveResult<u64> {
        self.store.delete_expired_sessions(now()).await
    }

    fn token_hash(&self, token: &str) -> String {
        session_token_hash(&self.config.authentication.session_secret, token)
    }
}

fn validate_handle(handle: &str) -> TroveResult<()> {
    let len = handle.chars().count();
    if !(3..=32).contains(&len) {
        return Err(TroveError::Validation(
            "Handle must be between 3 and 32 characters".to_string(),
        ));
    }
    if !handle
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
    {
        return Err(TroveError::Validation(
            "Handle may only contain a-z, 0-9, '_', '.' and '-'".to_string(),
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> TroveResult<()> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !email.contains(' ') => {
            Ok(())
        }
        _ => Err(TroveError::Validation("Invalid email address".to_string())),
    }
}
