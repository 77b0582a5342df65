use super::client_credentials::ClientAuthenticator;
use super::clock::Clock;
use super::error::AuthError;
use super::pkce::{CodeChallengeMethod, verify_pkce};
use super::token::JwtTokenIssuer;
use super::traits::{CodeStore, CredentialStore, SecretVerifier, TokenResponse};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// 32 random bytes, comfortably above the 16 byte floor
const CODE_BYTES: usize = 32;

/// What gets stored against an authorization code until it is exchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCodeData {
    pub client_id: String,
    pub user_id: String,
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: CodeChallengeMethod,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub client_id: String,
    pub email: String,
    pub password: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
}

/// Login -> code issuance -> code exchange.
pub struct AuthorizationCodeManager {
    credentials: Arc<dyn CredentialStore + Send + Sync>,
    codes: Arc<dyn CodeStore + Send + Sync>,
    verifier: Arc<dyn SecretVerifier + Send + Sync>,
    clients: ClientAuthenticator,
    issuer: Arc<JwtTokenIssuer>,
    clock: Arc<dyn Clock>,
    code_ttl: Duration,
}

impl AuthorizationCodeManager {
    pub fn new(
        credentials: Arc<dyn CredentialStore + Send + Sync>,
        codes: Arc<dyn CodeStore + Send + Sync>,
        verifier: Arc<dyn SecretVerifier + Send + Sync>,
        issuer: Arc<JwtTokenIssuer>,
        clock: Arc<dyn Clock>,
        code_ttl: Duration,
    ) -> Self {
        let clients = ClientAuthenticator::new(credentials.clone(), verifier.clone());
        Self {
            credentials,
            codes,
            verifier,
            clients,
            issuer,
            clock,
            code_ttl,
        }
    }

    pub fn clients(&self) -> &ClientAuthenticator {
        &self.clients
    }

    /// Checks the user's password for `client_id` and hands back a fresh,
    /// single-use authorization code.
    pub async fn issue_code(&self, req: &LoginRequest) -> Result<String, AuthError> {
        let client = self
            .credentials
            .find_client_by_id(&req.client_id)
            .await
            .map_err(AuthError::store)?;
        let user = self
            .credentials
            .find_user_by_email(&req.email)
            .await
            .map_err(AuthError::store)?;

        // exactly one hash check on every path, so a missing client or email
        // costs the same as a wrong password
        let stored = user
            .as_ref()
            .map_or(self.verifier.decoy_hash(), |u| u.password_hash.as_str());
        let password_ok = self.verifier.verify(&req.password, stored);

        let client = client.ok_or(AuthError::InvalidClient)?;
        let user = match user {
            Some(user) if password_ok => user,
            _ => return Err(AuthError::InvalidCredentials),
        };

        let code_challenge = req
            .code_challenge
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        let data = AuthCodeData {
            client_id: client.id.clone(),
            user_id: user.id.clone(),
            expires_at: self.clock.now().timestamp() + self.code_ttl.as_secs() as i64,
            code_challenge,
            code_challenge_method: req.code_challenge_method.unwrap_or_default(),
        };
        let payload = serde_json::to_string(&data).map_err(|e| AuthError::Internal(e.into()))?;

        let code = generate_code();
        self.codes
            .set(&code_key(&code), &payload, self.code_ttl)
            .await
            .map_err(AuthError::store)?;

        tracing::info!(user_id = %user.id, client_id = %client.id, "User logged in");
        Ok(code)
    }

    /// Trades an authorization code for an access + refresh token pair.
    ///
    /// The code is deleted the moment it is read, before any of the binding,
    /// expiry or PKCE checks run, so a failed attempt still burns it.
    pub async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, AuthError> {
        let client = self.clients.authenticate(client_id, client_secret).await?;

        let raw = self
            .codes
            .get_and_delete(&code_key(code))
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::InvalidGrant("Invalid or expired authorization code"))?;

        let data: AuthCodeData =
            serde_json::from_str(&raw).map_err(|e| AuthError::Internal(e.into()))?;

        if data.client_id != client.id {
            tracing::warn!(
                "authorization code presented by client {} was issued to {}",
                client.id,
                data.client_id
            );
            return Err(AuthError::InvalidGrant("Invalid code for this client"));
        }

        // the store ttl should already have evicted it
        if self.clock.now().timestamp() >= data.expires_at {
            return Err(AuthError::InvalidGrant("Authorization code expired"));
        }

        if let Some(challenge) = &data.code_challenge {
            let verifier = code_verifier
                .filter(|v| !v.is_empty())
                .ok_or(AuthError::InvalidRequest("code_verifier required"))?;
            if !verify_pkce(challenge, verifier, data.code_challenge_method) {
                tracing::warn!("PKCE verification failed for client {}", client.id);
                return Err(AuthError::InvalidGrant("Invalid code_verifier"));
            }
        }

        let access = self
            .issuer
            .issue_access_token(&client.private_key, &data.user_id, &client.id)?;
        let refresh = self.issuer.issue_refresh_token(&data.user_id, &client.id)?;

        tracing::info!(client_id = %client.id, user_id = %data.user_id, "Token exchanged");
        Ok(TokenResponse {
            access_token: access.token,
            refresh_token: Some(refresh.token),
            token_type: "Bearer".to_string(),
            expires_in: self.issuer.access_ttl().num_seconds() as u64,
        })
    }
}

pub(super) fn generate_code() -> String {
    let mut bytes = [0u8; CODE_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn code_key(code: &str) -> String {
    format!("authcode:{}", code)
}
