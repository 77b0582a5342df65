use super::clock::Clock;
use super::error::AuthError;
use super::traits::Claims;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Duration;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode,
};
use serde::Deserialize;
use std::sync::Arc;

/// A freshly minted token together with the claims that went into it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

/// Mints access tokens (RS256, signed with the requesting client's private key)
/// and refresh tokens (HS256, signed with the server-wide secret).
pub struct JwtTokenIssuer {
    refresh_key: EncodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl JwtTokenIssuer {
    pub fn new(
        server_secret: &[u8],
        access_ttl: Duration,
        refresh_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            refresh_key: EncodingKey::from_secret(server_secret),
            access_ttl,
            refresh_ttl,
            clock,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn issue_access_token(
        &self,
        client_private_key: &str,
        user_id: &str,
        client_id: &str,
    ) -> Result<IssuedToken, AuthError> {
        let key =
            EncodingKey::from_rsa_pem(client_private_key.as_bytes()).map_err(AuthError::KeyError)?;
        let claims = self.claims(user_id, client_id, self.access_ttl);
        let token = encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(AuthError::KeyError)?;
        Ok(IssuedToken { token, claims })
    }

    pub fn issue_refresh_token(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<IssuedToken, AuthError> {
        let claims = self.claims(user_id, client_id, self.refresh_ttl);
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.refresh_key)
            .map_err(AuthError::KeyError)?;
        Ok(IssuedToken { token, claims })
    }

    fn claims(&self, user_id: &str, client_id: &str, ttl: Duration) -> Claims {
        let now = self.clock.now();
        Claims {
            sub: user_id.to_string(),
            aud: client_id.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        }
    }
}

/// Verifies both token kinds. Each entry point pins exactly one algorithm, so
/// an HS256 token can never pass as an access token (or the other way round).
pub struct JwtTokenValidator {
    refresh_key: DecodingKey,
}

impl JwtTokenValidator {
    pub fn new(server_secret: &[u8]) -> Self {
        Self {
            refresh_key: DecodingKey::from_secret(server_secret),
        }
    }

    /// `expected_client` is the audience the caller resolved the public key for.
    pub fn validate_access_token(
        &self,
        token: &str,
        client_public_key: &str,
        expected_client: &str,
    ) -> Result<Claims, AuthError> {
        let key =
            DecodingKey::from_rsa_pem(client_public_key.as_bytes()).map_err(AuthError::KeyError)?;
        let mut validation = pinned_validation(Algorithm::RS256);
        validation.set_audience(&[expected_client]);

        let data = decode::<Claims>(token, &key, &validation).map_err(AuthError::invalid_token)?;
        Ok(data.claims)
    }

    pub fn validate_refresh_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = pinned_validation(Algorithm::HS256);
        // refresh tokens come back to us from any client; aud must exist but isn't pinned
        validation.validate_aud = false;

        let data = decode::<Claims>(token, &self.refresh_key, &validation)
            .map_err(AuthError::invalid_token)?;
        Ok(data.claims)
    }
}

fn pinned_validation(alg: Algorithm) -> Validation {
    let mut validation = Validation::new(alg);
    validation.set_required_spec_claims(&["exp", "sub", "aud"]);
    // no grace period: a denylist entry lapses exactly at exp, so must the token
    validation.leeway = 0;
    validation
}

/// An access token whose payload has been decoded but NOT verified. The only
/// thing it hands out is the audience, which is just enough to find the key
/// that can verify it.
#[derive(Debug)]
pub struct UnverifiedToken<'a> {
    raw: &'a str,
    audience: String,
}

#[derive(Deserialize)]
struct AudiencePeek {
    aud: Option<String>,
}

impl<'a> UnverifiedToken<'a> {
    pub fn parse(raw: &'a str) -> Result<Self, AuthError> {
        let header = decode_header(raw).map_err(AuthError::invalid_token)?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::invalid_token(format!(
                "unexpected signing algorithm {:?}",
                header.alg
            )));
        }

        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() != 3 {
            return Err(AuthError::invalid_token("malformed token"));
        }

        let payload = URL_SAFE_NO_PAD
            .decode(segments[1])
            .map_err(AuthError::invalid_token)?;
        let peek: AudiencePeek =
            serde_json::from_slice(&payload).map_err(AuthError::invalid_token)?;

        let audience = peek
            .aud
            .filter(|aud| !aud.is_empty())
            .ok_or_else(|| AuthError::invalid_token("missing aud claim"))?;

        Ok(Self { raw, audience })
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn raw(&self) -> &'a str {
        self.raw
    }
}
