use super::error::AuthError;
use super::traits::{Client, CredentialStore, SecretHasher, SecretVerifier};
use anyhow::{Result, anyhow};
use argon2::{
    Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString,
};
use rand::RngCore;
use std::sync::Arc;

// fixed salt and digest for the decoy hash; only the cost parameters vary
const DECOY_SALT: &str = "X+fel6K1S5RalJY/qlhfDA";
const DECOY_DIGEST: &str = "NqHVOx5eMarSO4zpmwcJR1EN46Vhjnij8G7gMz7O4Lo";

/// argon2id PHC strings for user passwords and client secrets. Verification
/// reads the parameters back out of the stored hash.
#[derive(Clone)]
pub struct Argon2Secrets {
    params: Option<Params>,
    decoy: String,
}

impl Argon2Secrets {
    pub fn new() -> Self {
        Self {
            params: None,
            decoy: decoy_phc(&Params::default()),
        }
    }

    /// Cheaper hashing for test fixtures.
    #[cfg(test)]
    pub fn with_params(params: Params) -> Self {
        Self {
            decoy: decoy_phc(&params),
            params: Some(params),
        }
    }

    fn argon2(&self) -> Argon2<'static> {
        match &self.params {
            Some(params) => Argon2::new(
                argon2::Algorithm::Argon2id,
                argon2::Version::V0x13,
                params.clone(),
            ),
            None => Argon2::default(),
        }
    }
}

impl Default for Argon2Secrets {
    fn default() -> Self {
        Self::new()
    }
}

/// Same cost as what `hash` produces, so verifying against it takes as long.
fn decoy_phc(params: &Params) -> String {
    format!(
        "$argon2id$v=19$m={},t={},p={}${}${}",
        params.m_cost(),
        params.t_cost(),
        params.p_cost(),
        DECOY_SALT,
        DECOY_DIGEST
    )
}

impl SecretVerifier for Argon2Secrets {
    fn verify(&self, candidate: &str, stored: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(stored) else {
            tracing::warn!("stored secret is not a valid PHC string");
            return false;
        };
        Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok()
    }

    fn decoy_hash(&self) -> &str {
        &self.decoy
    }
}

impl SecretHasher for Argon2Secrets {
    fn hash(&self, plaintext: &str) -> Result<String> {
        let mut salt_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut salt_bytes);
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| anyhow!("failed to encode salt: {}", e))?;

        let hash = self
            .argon2()
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| anyhow!("failed to hash secret: {}", e))?;
        Ok(hash.to_string())
    }
}

/// Authenticates a client by id + secret against the credential store.
#[derive(Clone)]
pub struct ClientAuthenticator {
    credentials: Arc<dyn CredentialStore + Send + Sync>,
    verifier: Arc<dyn SecretVerifier + Send + Sync>,
}

impl ClientAuthenticator {
    pub fn new(
        credentials: Arc<dyn CredentialStore + Send + Sync>,
        verifier: Arc<dyn SecretVerifier + Send + Sync>,
    ) -> Self {
        Self {
            credentials,
            verifier,
        }
    }

    pub async fn authenticate(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Client, AuthError> {
        let client = self
            .credentials
            .find_client_by_id(client_id)
            .await
            .map_err(AuthError::store)?;

        // an unknown id still pays for one hash check
        let stored = client
            .as_ref()
            .map_or(self.verifier.decoy_hash(), |c| c.secret_hash.as_str());
        let secret_ok = self.verifier.verify(client_secret, stored);

        match client {
            Some(client) if secret_ok => Ok(client),
            _ => {
                // Don't leak which half was wrong
                tracing::warn!(
                    "Invalid client credentials attempted for client_id: {}",
                    client_id
                );
                Err(AuthError::Unauthorized)
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn fast_secrets() -> Argon2Secrets {
    Argon2Secrets::with_params(Params::new(8, 1, 1, None).expect("valid argon2 params"))
}
