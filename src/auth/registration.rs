use super::error::AuthError;
use super::traits::{AlreadyExists, Client, CredentialStore, KeyPairGenerator, SecretHasher, User};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 8;
const CLIENT_SECRET_BYTES: usize = 32;

#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// What a registration hands back. Never includes the hash.
#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub verified: bool,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            email: user.email.clone(),
            verified: user.verified,
        }
    }
}

type FieldErrors = BTreeMap<&'static str, Vec<String>>;

/// Every problem with the request at once, so the form can show them together.
pub async fn register_user(
    req: RegisterUserRequest,
    credentials: &(dyn CredentialStore + Send + Sync),
    hasher: &(dyn SecretHasher + Send + Sync),
) -> Result<User, AuthError> {
    let mut errors = FieldErrors::new();

    for (field, value) in [
        ("first_name", &req.first_name),
        ("last_name", &req.last_name),
        ("email", &req.email),
        ("password", &req.password),
    ] {
        if value.trim().is_empty() {
            push(&mut errors, field, "This field is required");
        }
    }

    let email = req.email.trim().to_string();
    if !email.is_empty() {
        if !looks_like_email(&email) {
            push(&mut errors, "email", "Invalid email");
        } else if credentials
            .find_user_by_email(&email)
            .await
            .map_err(AuthError::store)?
            .is_some()
        {
            push(&mut errors, "email", "Email already registered");
        }
    }

    if !req.password.is_empty() {
        for problem in password_problems(&req.password) {
            push(&mut errors, "password", &format!("Password must {}", problem));
        }
    }

    if !errors.is_empty() {
        return Err(AuthError::Validation(errors));
    }

    let password_hash = hasher.hash(&req.password).map_err(AuthError::Internal)?;
    let user = User {
        id: Uuid::new_v4().to_string(),
        first_name: req.first_name.trim().to_string(),
        last_name: req.last_name.trim().to_string(),
        email,
        password_hash,
        verified: false,
    };

    // lost a race with a concurrent registration for the same email
    credentials
        .insert_user(user.clone())
        .await
        .map_err(|e| conflict_or_store(e, "Email already registered"))?;

    tracing::info!(user_id = %user.id, email = %user.email, "User registered");
    Ok(user)
}

#[derive(Debug, Deserialize)]
pub struct RegisterClientRequest {
    #[serde(default)]
    pub name: String,
}

/// A freshly registered client. `secret` is the only time the plaintext
/// leaves the server.
#[derive(Debug, Serialize)]
pub struct RegisteredClient {
    pub id: String,
    pub name: String,
    pub secret: String,
    pub public_key: String,
}

/// Creates a client with a random secret and its own RSA key pair.
pub async fn register_client(
    req: RegisterClientRequest,
    credentials: &(dyn CredentialStore + Send + Sync),
    hasher: &(dyn SecretHasher + Send + Sync),
    keys: Arc<dyn KeyPairGenerator + Send + Sync>,
) -> Result<RegisteredClient, AuthError> {
    let name = req.name.trim().to_string();
    let mut errors = FieldErrors::new();
    if name.is_empty() {
        push(&mut errors, "name", "This field is required");
    } else if credentials
        .find_client_by_name(&name)
        .await
        .map_err(AuthError::store)?
        .is_some()
    {
        push(&mut errors, "name", "Client name already registered");
    }
    if !errors.is_empty() {
        return Err(AuthError::Validation(errors));
    }

    let mut secret_bytes = [0u8; CLIENT_SECRET_BYTES];
    rand::rng().fill_bytes(&mut secret_bytes);
    let secret = URL_SAFE_NO_PAD.encode(secret_bytes);
    let secret_hash = hasher.hash(&secret).map_err(AuthError::Internal)?;

    // RSA generation takes a noticeable fraction of a second
    let pair = tokio::task::spawn_blocking(move || keys.generate())
        .await
        .map_err(|e| AuthError::Internal(e.into()))?
        .map_err(AuthError::Internal)?;

    let client = Client {
        id: Uuid::new_v4().to_string(),
        name,
        secret_hash,
        private_key: pair.private_pem,
        public_key: pair.public_pem,
    };
    credentials
        .insert_client(client.clone())
        .await
        .map_err(|e| conflict_or_store(e, "Client name already registered"))?;

    tracing::info!(client_id = %client.id, name = %client.name, "Client registered");
    Ok(RegisteredClient {
        id: client.id,
        name: client.name,
        secret,
        public_key: client.public_key,
    })
}

/// A uniqueness clash is the caller's problem; anything else is the store's.
fn conflict_or_store(err: anyhow::Error, message: &'static str) -> AuthError {
    if err.downcast_ref::<AlreadyExists>().is_some() {
        AuthError::Conflict(message)
    } else {
        AuthError::store(err)
    }
}

fn push(errors: &mut FieldErrors, field: &'static str, message: &str) {
    errors.entry(field).or_default().push(message.to_string());
}

pub(super) fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}

pub(super) fn password_problems(password: &str) -> Vec<&'static str> {
    let mut problems = Vec::new();
    if password.chars().count() < MIN_PASSWORD_LEN {
        problems.push("be at least 8 characters long");
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        problems.push("contain at least one uppercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        problems.push("contain at least one lowercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        problems.push("contain at least one number");
    }
    if password.chars().all(|c| c.is_ascii_alphanumeric()) {
        problems.push("contain at least one special character");
    }
    problems
}
