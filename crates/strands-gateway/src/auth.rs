//! Authentication: HS256 JWTs with a required issuer claim, and API keys
//! compared by SHA-256 digest only.
//!
//! Credential storage and password hashing live behind `CredentialStore`;
//! the in-memory implementation is for development and tests, production
//! deployments plug in a real store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use strands_types::StrandError;

/// Prefix carried by raw API keys so they are recognizable in headers.
pub const API_KEY_PREFIX: &str = "lsak_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
    Readonly,
    Service,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthContext {
    pub user_id: String,
    pub username: String,
    pub role: UserRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    username: String,
    role: UserRole,
    iss: String,
    iat: i64,
    exp: i64,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Check a username/password pair; `None` on mismatch.
    async fn verify(&self, username: &str, password: &str)
        -> Result<Option<AuthContext>, StrandError>;

    /// Create a user; conflicts are an error.
    async fn create(&self, username: &str, password: &str) -> Result<AuthContext, StrandError>;
}

/// Dev/test credential store. Passwords are stored as digests here too,
/// but this is not a production hash.
#[derive(Debug, Default)]
pub struct InMemoryCredentials {
    users: Mutex<HashMap<String, (String, AuthContext)>>,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, username: &str, password: &str, role: UserRole) -> Self {
        let context = AuthContext {
            user_id: username.to_string(),
            username: username.to_string(),
            role,
        };
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(username.to_string(), (sha256_hex(password), context));
        self
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentials {
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AuthContext>, StrandError> {
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        Ok(users.get(username).and_then(|(digest, context)| {
            (digest == &sha256_hex(password)).then(|| context.clone())
        }))
    }

    async fn create(&self, username: &str, password: &str) -> Result<AuthContext, StrandError> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        if users.contains_key(username) {
            return Err(StrandError::ValidationFailed(format!(
                "user {username} already exists"
            )));
        }
        let context = AuthContext {
            user_id: username.to_string(),
            username: username.to_string(),
            role: UserRole::User,
        };
        users.insert(
            username.to_string(),
            (sha256_hex(password), context.clone()),
        );
        Ok(context)
    }
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct AuthManager {
    secret: String,
    issuer: String,
    expiration: Duration,
    credentials: Box<dyn CredentialStore>,
    /// API keys by SHA-256 digest; raw keys are never stored.
    api_keys: Mutex<HashMap<String, AuthContext>>,
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl AuthManager {
    pub fn new(
        secret: impl Into<String>,
        issuer: impl Into<String>,
        expiration: Duration,
        credentials: Box<dyn CredentialStore>,
    ) -> Self {
        Self {
            secret: secret.into(),
            issuer: issuer.into(),
            expiration,
            credentials,
            api_keys: Mutex::new(HashMap::new()),
        }
    }

    /// Register a raw API key for a principal; only the digest is kept.
    pub fn register_api_key(&self, raw_key: &str, context: AuthContext) {
        self.api_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sha256_hex(raw_key), context);
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<String, StrandError> {
        let context = self
            .credentials
            .verify(username, password)
            .await?
            .ok_or(StrandError::Unauthenticated)?;
        self.issue_token(&context)
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<AuthContext, StrandError> {
        if username.trim().is_empty() || password.len() < 8 {
            return Err(StrandError::ValidationFailed(
                "username required and password must be at least 8 characters".into(),
            ));
        }
        self.credentials.create(username, password).await
    }

    pub fn issue_token(&self, context: &AuthContext) -> Result<String, StrandError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: context.user_id.clone(),
            username: context.username.clone(),
            role: context.role,
            iss: self.issuer.clone(),
            iat: now,
            exp: now + self.expiration.as_secs() as i64,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| StrandError::Internal(e.to_string()))
    }

    /// Verify a bearer JWT: HS256, issuer required, expiry enforced with no
    /// leeway.
    pub fn verify_token(&self, token: &str) -> Result<AuthContext, StrandError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.clone()]);
        validation.leeway = 0;
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|_| StrandError::Unauthenticated)?;
        Ok(AuthContext {
            user_id: data.claims.sub,
            username: data.claims.username,
            role: data.claims.role,
        })
    }

    /// Verify an API key by digest comparison.
    pub fn verify_api_key(&self, raw_key: &str) -> Result<AuthContext, StrandError> {
        self.api_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&sha256_hex(raw_key))
            .cloned()
            .ok_or(StrandError::Unauthenticated)
    }

    /// Authenticate a request from its `Authorization` bearer value or its
    /// API key header. A bearer value with the API key prefix is treated as
    /// an API key.
    pub fn authenticate(
        &self,
        bearer: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<AuthContext, StrandError> {
        if let Some(raw_key) = api_key {
            return self.verify_api_key(raw_key);
        }
        if let Some(token) = bearer {
            if token.starts_with(API_KEY_PREFIX) {
                return self.verify_api_key(token);
            }
            return self.verify_token(token);
        }
        Err(StrandError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AuthManager {
        let credentials =
            InMemoryCredentials::new().with_user("alice", "correct-horse", UserRole::User);
        AuthManager::new(
            "test-secret",
            "life-strands-gateway",
            Duration::from_secs(3600),
            Box::new(credentials),
        )
    }

    #[tokio::test]
    async fn login_issues_verifiable_token() {
        let manager = manager();
        let token = manager.login("alice", "correct-horse").await.unwrap();
        let context = manager.verify_token(&token).unwrap();
        assert_eq!(context.user_id, "alice");
        assert_eq!(context.role, UserRole::User);
    }

    #[tokio::test]
    async fn wrong_password_is_unauthenticated() {
        let manager = manager();
        let err = manager.login("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, StrandError::Unauthenticated));
    }

    #[tokio::test]
    async fn token_from_other_issuer_is_rejected() {
        let manager = manager();
        let other = AuthManager::new(
            "test-secret",
            "someone-else",
            Duration::from_secs(3600),
            Box::new(InMemoryCredentials::new()),
        );
        let context = AuthContext {
            user_id: "alice".to_string(),
            username: "alice".to_string(),
            role: UserRole::User,
        };
        let token = other.issue_token(&context).unwrap();
        assert!(manager.verify_token(&token).is_err());
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let manager = manager();
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "alice".to_string(),
            username: "alice".to_string(),
            role: UserRole::User,
            iss: "life-strands-gateway".to_string(),
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(manager.verify_token(&token).is_err());
    }

    #[test]
    fn api_keys_match_by_digest_only() {
        let manager = manager();
        let context = AuthContext {
            user_id: "service".to_string(),
            username: "service".to_string(),
            role: UserRole::Service,
        };
        manager.register_api_key("lsak_super_secret", context);

        let verified = manager.verify_api_key("lsak_super_secret").unwrap();
        assert_eq!(verified.user_id, "service");
        assert!(manager.verify_api_key("lsak_other").is_err());

        // The raw key never appears in the store.
        let keys = manager.api_keys.lock().unwrap();
        assert!(keys.keys().all(|k| !k.contains("super_secret")));
    }

    #[tokio::test]
    async fn register_rejects_weak_passwords_and_duplicates() {
        let manager = manager();
        assert!(manager.register("bob", "short").await.is_err());
        manager.register("bob", "a-long-password").await.unwrap();
        let err = manager.register("bob", "a-long-password").await.unwrap_err();
        assert!(matches!(err, StrandError::ValidationFailed(_)));
    }
}
