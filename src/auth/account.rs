use super::authorization_code::generate_code;
use super::error::AuthError;
use super::registration::{looks_like_email, password_problems};
use super::traits::{CodeStore, CredentialStore, EmailSender, SecretHasher, User};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

const VERIFICATION_PREFIX: &str = "user:verification:";
const PASSWORD_RESET_PREFIX: &str = "user:password:reset:";

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub new_password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    AlreadyVerified,
}

/// Email verification and password reset. Both hand a one-time code to the
/// user by mail and keep it in the code store until it's used or expires.
pub struct AccountFlows {
    credentials: Arc<dyn CredentialStore + Send + Sync>,
    codes: Arc<dyn CodeStore + Send + Sync>,
    hasher: Arc<dyn SecretHasher + Send + Sync>,
    email: Arc<dyn EmailSender + Send + Sync>,
    verification_ttl: Duration,
    reset_ttl: Duration,
}

impl AccountFlows {
    pub fn new(
        credentials: Arc<dyn CredentialStore + Send + Sync>,
        codes: Arc<dyn CodeStore + Send + Sync>,
        hasher: Arc<dyn SecretHasher + Send + Sync>,
        email: Arc<dyn EmailSender + Send + Sync>,
        verification_ttl: Duration,
        reset_ttl: Duration,
    ) -> Self {
        Self {
            credentials,
            codes,
            hasher,
            email,
            verification_ttl,
            reset_ttl,
        }
    }

    /// Stores a fresh verification code for `user` and mails it.
    pub async fn start_verification(&self, user: &User) -> Result<(), AuthError> {
        let code = generate_code();
        self.codes
            .set(
                &format!("{}{}", VERIFICATION_PREFIX, code),
                &user.id,
                self.verification_ttl,
            )
            .await
            .map_err(AuthError::store)?;

        self.email
            .send_verification(&user.email, &code)
            .await
            .map_err(AuthError::Internal)?;
        tracing::info!(user_id = %user.id, "Verification code sent");
        Ok(())
    }

    /// Consumes a verification code and marks its user verified.
    pub async fn verify_email(&self, code: &str) -> Result<VerifyOutcome, AuthError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(AuthError::InvalidRequest("Missing verification code"));
        }

        let user_id = self
            .codes
            .get_and_delete(&format!("{}{}", VERIFICATION_PREFIX, code))
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::InvalidGrant("Invalid or expired verification code"))?;

        let mut user = self
            .credentials
            .find_user_by_id(&user_id)
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::InvalidGrant("Invalid or expired verification code"))?;

        if user.verified {
            return Ok(VerifyOutcome::AlreadyVerified);
        }

        user.verified = true;
        self.credentials
            .update_user(user.clone())
            .await
            .map_err(AuthError::store)?;
        tracing::info!(user_id = %user.id, "Email verified");
        Ok(VerifyOutcome::Verified)
    }

    /// Mails a new code to an unverified user. Succeeds silently for unknown
    /// or already verified addresses.
    pub async fn resend_verification(&self, req: &EmailRequest) -> Result<(), AuthError> {
        let email = checked_email(&req.email)?;
        let user = self
            .credentials
            .find_user_by_email(email)
            .await
            .map_err(AuthError::store)?;

        match user {
            Some(user) if !user.verified => self.start_verification(&user).await,
            _ => {
                tracing::debug!("verification resend requested for {}, nothing sent", email);
                Ok(())
            }
        }
    }

    /// Stores a reset code for the address and mails it. Unknown addresses get
    /// the same (successful) answer.
    pub async fn forgot_password(&self, req: &EmailRequest) -> Result<(), AuthError> {
        let email = checked_email(&req.email)?;
        let Some(user) = self
            .credentials
            .find_user_by_email(email)
            .await
            .map_err(AuthError::store)?
        else {
            tracing::info!("Password reset requested for unknown email");
            return Ok(());
        };

        let code = generate_code();
        self.codes
            .set(&reset_key(&user.email), &code, self.reset_ttl)
            .await
            .map_err(AuthError::store)?;
        self.email
            .send_password_reset(&user.email, &code)
            .await
            .map_err(AuthError::Internal)?;

        tracing::info!(user_id = %user.id, "Password reset code generated");
        Ok(())
    }

    /// Sets a new password given the mailed code. The code is gone after the
    /// first attempt, right or wrong.
    pub async fn reset_password(&self, req: &ResetPasswordRequest) -> Result<(), AuthError> {
        let mut errors: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        let email = req.email.trim();
        if email.is_empty() {
            errors.entry("email").or_default().push("This field is required".to_string());
        } else if !looks_like_email(email) {
            errors.entry("email").or_default().push("Invalid email".to_string());
        }
        if req.code.trim().is_empty() {
            errors.entry("code").or_default().push("This field is required".to_string());
        }
        if req.new_password.is_empty() {
            errors
                .entry("new_password")
                .or_default()
                .push("This field is required".to_string());
        } else {
            for problem in password_problems(&req.new_password) {
                errors
                    .entry("new_password")
                    .or_default()
                    .push(format!("Password must {}", problem));
            }
        }
        if !errors.is_empty() {
            return Err(AuthError::Validation(errors));
        }

        let stored = self
            .codes
            .get_and_delete(&reset_key(email))
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::InvalidGrant("Invalid or expired reset code"))?;

        if !bool::from(stored.as_bytes().ct_eq(req.code.trim().as_bytes())) {
            tracing::warn!("wrong password reset code presented");
            return Err(AuthError::InvalidGrant("Invalid reset code"));
        }

        let mut user = self
            .credentials
            .find_user_by_email(email)
            .await
            .map_err(AuthError::store)?
            .ok_or(AuthError::InvalidGrant("Invalid or expired reset code"))?;

        user.password_hash = self
            .hasher
            .hash(&req.new_password)
            .map_err(AuthError::Internal)?;
        self.credentials
            .update_user(user.clone())
            .await
            .map_err(AuthError::store)?;

        tracing::info!(user_id = %user.id, "Password reset successful");
        Ok(())
    }
}

fn checked_email(email: &str) -> Result<&str, AuthError> {
    let email = email.trim();
    let problem = if email.is_empty() {
        "This field is required"
    } else if !looks_like_email(email) {
        "Invalid email"
    } else {
        return Ok(email);
    };
    Err(AuthError::Validation(BTreeMap::from([(
        "email",
        vec![problem.to_string()],
    )])))
}

// emails match case-insensitively, so the key must too
fn reset_key(email: &str) -> String {
    format!("{}{}", PASSWORD_RESET_PREFIX, email.to_ascii_lowercase())
}
