mod account;
mod authorization_code;
mod client_credentials;
mod clock;
mod code_store;
mod email;
mod error;
mod handlers;
mod keys;
mod middleware;
mod pkce;
mod registration;
mod revocation;
mod token;
mod traits;

pub use account::{AccountFlows, EmailRequest, ResetPasswordRequest, VerifyOutcome};
pub use authorization_code::{AuthorizationCodeManager, LoginRequest};
pub use client_credentials::Argon2Secrets;
pub use clock::{Clock, SystemClock};
pub use code_store::{MemoryCodeStore, RedisCodeStore};
pub use email::LogEmailSender;
pub use error::AuthError;
pub use handlers::{OAuthAppState, credential_routes, resource_routes};
pub use keys::RsaKeyPairGenerator;
pub use middleware::trace_id_middleware;
pub use registration::{
    RegisterClientRequest, RegisterUserRequest, RegisteredClient, register_client, register_user,
};
pub use revocation::RevocationRegistry;
pub use token::{JwtTokenIssuer, JwtTokenValidator, UnverifiedToken};
pub use traits::{
    AlreadyExists, Claims, Client, CodeStore, CredentialStore, EmailSender, KeyPair,
    KeyPairGenerator, SecretHasher, SecretVerifier, TokenResponse, User,
};

#[cfg(test)]
pub(crate) use client_credentials::fast_secrets;

use std::sync::Arc;

/// Configuration for the authentication system
#[derive(Clone)]
pub struct AuthConfig {
    /// HS256 secret for refresh tokens
    pub jwt_secret: String,
    pub access_token_exp: chrono::Duration,
    pub refresh_token_exp: chrono::Duration,
    pub auth_code_exp: std::time::Duration,
    pub verification_exp: std::time::Duration,
    pub password_reset_exp: std::time::Duration,
}

/// Outside collaborators the service can't build for itself.
pub struct Integrations {
    pub email: Arc<dyn EmailSender + Send + Sync>,
    pub keys: Arc<dyn KeyPairGenerator + Send + Sync>,
}

/// Complete OAuth service: code issuance and exchange, refresh, logout,
/// access token verification for resource endpoints, and the account
/// lifecycle around them.
#[derive(Clone)]
pub struct OAuthService {
    pub(crate) codes: Arc<AuthorizationCodeManager>,
    pub(crate) accounts: Arc<AccountFlows>,
    credentials: Arc<dyn CredentialStore + Send + Sync>,
    hasher: Arc<dyn SecretHasher + Send + Sync>,
    keys: Arc<dyn KeyPairGenerator + Send + Sync>,
    issuer: Arc<JwtTokenIssuer>,
    validator: Arc<JwtTokenValidator>,
    revocations: RevocationRegistry,
}

impl OAuthService {
    pub fn new<S>(
        config: AuthConfig,
        credentials: Arc<dyn CredentialStore + Send + Sync>,
        code_store: Arc<dyn CodeStore + Send + Sync>,
        secrets: Arc<S>,
        clock: Arc<dyn Clock>,
        integrations: Integrations,
    ) -> Self
    where
        S: SecretVerifier + SecretHasher + Send + Sync + 'static,
    {
        let issuer = Arc::new(JwtTokenIssuer::new(
            config.jwt_secret.as_bytes(),
            config.access_token_exp,
            config.refresh_token_exp,
            clock.clone(),
        ));
        let validator = Arc::new(JwtTokenValidator::new(config.jwt_secret.as_bytes()));
        let revocations = RevocationRegistry::new(code_store.clone(), clock.clone());

        let accounts = Arc::new(AccountFlows::new(
            credentials.clone(),
            code_store.clone(),
            secrets.clone(),
            integrations.email,
            config.verification_exp,
            config.password_reset_exp,
        ));

        let codes = Arc::new(AuthorizationCodeManager::new(
            credentials.clone(),
            code_store,
            secrets.clone(),
            issuer.clone(),
            clock,
            config.auth_code_exp,
        ));

        Self {
            codes,
            accounts,
            credentials,
            hasher: secrets,
            keys: integrations.keys,
            issuer,
            validator,
            revocations,
        }
    }

    // Delegate methods for easy access
    pub async fn login(&self, req: &LoginRequest) -> Result<String, AuthError> {
        self.codes.issue_code(req).await
    }

    pub async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, AuthError> {
        self.codes
            .exchange_code(client_id, client_secret, code, code_verifier)
            .await
    }

    /// Mints a new access token from a refresh token. The refresh token
    /// itself is not rotated.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let claims = self.validator.validate_refresh_token(refresh_token)?;

        if self.revocations.is_revoked(refresh_token).await? {
            tracing::warn!(client_id = %claims.aud, "revoked refresh token presented");
            return Err(AuthError::InvalidGrant("Refresh token has been revoked"));
        }

        let client = self
            .credentials
            .find_client_by_id(&claims.aud)
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::InvalidGrant("Unknown client"))?;

        let access = self
            .issuer
            .issue_access_token(&client.private_key, &claims.sub, &client.id)?;

        tracing::info!(client_id = %client.id, user_id = %claims.sub, "Token refreshed");
        Ok(TokenResponse {
            access_token: access.token,
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_in: self.issuer.access_ttl().num_seconds() as u64,
        })
    }

    /// Denylists the refresh token until it would have expired on its own.
    pub async fn logout(&self, refresh_token: &str) -> Result<(), AuthError> {
        let claims = self.validator.validate_refresh_token(refresh_token)?;
        self.revocations.revoke(refresh_token, claims.exp).await?;
        tracing::info!(client_id = %claims.aud, user_id = %claims.sub, "RefreshToken blocked");
        Ok(())
    }

    /// Two-phase access token check: read the audience without trusting it,
    /// find that client's public key, then verify the whole token with it.
    pub async fn verify_access_token(&self, token: &str) -> Result<Claims, AuthError> {
        let unverified = UnverifiedToken::parse(token)?;

        let client = self
            .credentials
            .find_client_by_id(unverified.audience())
            .await
            .map_err(AuthError::store)?
            .ok_or_else(|| AuthError::invalid_token("unknown audience"))?;

        self.validator
            .validate_access_token(unverified.raw(), &client.public_key, &client.id)
    }

    /// Looks up the user behind already-verified access token claims.
    pub async fn user_for_claims(&self, claims: &Claims) -> Result<User, AuthError> {
        self.credentials
            .find_user_by_id(&claims.sub)
            .await
            .map_err(AuthError::store)?
            .ok_or_else(|| AuthError::invalid_token("unknown subject"))
    }

    pub async fn authenticate_client(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Client, AuthError> {
        self.codes
            .clients()
            .authenticate(client_id, client_secret)
            .await
    }

    /// Creates the user, then mails a verification code. A failed mail does
    /// not undo the registration; the user can ask for another code.
    pub async fn register_user(&self, req: RegisterUserRequest) -> Result<User, AuthError> {
        let user = register_user(req, self.credentials.as_ref(), self.hasher.as_ref()).await?;
        if let Err(e) = self.accounts.start_verification(&user).await {
            tracing::warn!(user_id = %user.id, "could not send verification code: {}", e);
        }
        Ok(user)
    }

    pub async fn register_client(
        &self,
        req: RegisterClientRequest,
    ) -> Result<RegisteredClient, AuthError> {
        register_client(
            req,
            self.credentials.as_ref(),
            self.hasher.as_ref(),
            self.keys.clone(),
        )
        .await
    }

    pub async fn verify_email(&self, code: &str) -> Result<VerifyOutcome, AuthError> {
        self.accounts.verify_email(code).await
    }

    pub async fn resend_verification(&self, req: &EmailRequest) -> Result<(), AuthError> {
        self.accounts.resend_verification(req).await
    }

    pub async fn forgot_password(&self, req: &EmailRequest) -> Result<(), AuthError> {
        self.accounts.forgot_password(req).await
    }

    pub async fn reset_password(&self, req: &ResetPasswordRequest) -> Result<(), AuthError> {
        self.accounts.reset_password(req).await
    }
}
