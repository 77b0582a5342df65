use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// async_trait my beloved. this shit rocks

/// Resource owner. `password_hash` is an argon2 PHC string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub verified: bool,
}

/// Registered application. The key pair is PEM encoded; the private half never
/// leaves the token issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub secret_hash: String,
    pub private_key: String,
    pub public_key: String,
}

/// Returned (inside the `anyhow::Error`) by `insert_*` when a unique field is
/// taken. Anything else coming out of a store is a store fault.
#[derive(Debug, thiserror::Error)]
#[error("{field} already registered: {value}")]
pub struct AlreadyExists {
    pub field: &'static str,
    pub value: String,
}

/// Durable identity storage. `Ok(None)` means not found, `Err` means the store
/// itself failed.
#[async_trait]
pub trait CredentialStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>>;
    async fn find_client_by_id(&self, id: &str) -> Result<Option<Client>>;
    async fn find_client_by_name(&self, name: &str) -> Result<Option<Client>>;
    async fn insert_user(&self, user: User) -> Result<()>;
    /// Replaces an existing user record (verified flag, password hash).
    async fn update_user(&self, user: User) -> Result<()>;
    async fn insert_client(&self, client: Client) -> Result<()>;
}

/// Short-lived key/value storage for authorization codes and the refresh token
/// denylist.
#[async_trait]
pub trait CodeStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Must be atomic: of N concurrent callers for one key, exactly one sees the value.
    async fn get_and_delete(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Compares a plaintext candidate against a stored hash. The hashing scheme is
/// the implementor's business.
pub trait SecretVerifier {
    fn verify(&self, candidate: &str, stored: &str) -> bool;

    /// A well-formed hash that nothing verifies against, costed like a real
    /// one. Checked when the account doesn't exist so that path takes as long
    /// as a wrong password.
    fn decoy_hash(&self) -> &str;
}

pub trait SecretHasher {
    fn hash(&self, plaintext: &str) -> Result<String>;
}

/// Outbound mail for verification and password reset codes.
#[async_trait]
pub trait EmailSender {
    async fn send_verification(&self, to: &str, code: &str) -> Result<()>;
    async fn send_password_reset(&self, to: &str, code: &str) -> Result<()>;
}

/// PEM encoded key pair for a newly registered client.
#[derive(Clone)]
pub struct KeyPair {
    pub private_pem: String,
    pub public_pem: String,
}

/// Makes signing keys for new clients. Slow (RSA), so callers run it off the
/// async workers.
pub trait KeyPairGenerator {
    fn generate(&self) -> Result<KeyPair>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: u64, // seconds
}

/// Claims carried by both token kinds. Only ever produced by a successful
/// signature check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub aud: String, // client id
    pub iat: i64,
    pub exp: i64,
}
