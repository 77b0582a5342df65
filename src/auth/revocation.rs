use super::clock::Clock;
use super::error::AuthError;
use super::traits::CodeStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;

const BLOCKLIST_PREFIX: &str = "blocklist:";

/// Denylist of refresh tokens revoked before their natural expiry. Entries
/// live exactly as long as the token would have, so the list never outgrows
/// the set of tokens that are still otherwise valid.
#[derive(Clone)]
pub struct RevocationRegistry {
    store: Arc<dyn CodeStore + Send + Sync>,
    clock: Arc<dyn Clock>,
}

impl RevocationRegistry {
    pub fn new(store: Arc<dyn CodeStore + Send + Sync>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// `expires_at` is the token's own `exp` claim. Already-expired tokens are
    /// left alone: there's nothing left to protect.
    pub async fn revoke(&self, refresh_token: &str, expires_at: i64) -> Result<(), AuthError> {
        let remaining = remaining_ttl(expires_at, self.clock.now());
        let Some(ttl) = remaining else {
            tracing::debug!("refresh token already expired, nothing to revoke");
            return Ok(());
        };

        self.store
            .set(&blocklist_key(refresh_token), "revoked", ttl)
            .await
            .map_err(AuthError::store)?;

        tracing::info!(ttl_secs = ttl.as_secs(), "refresh token revoked");
        Ok(())
    }

    pub async fn is_revoked(&self, refresh_token: &str) -> Result<bool, AuthError> {
        let entry = self
            .store
            .get(&blocklist_key(refresh_token))
            .await
            .map_err(AuthError::store)?;
        Ok(entry.is_some())
    }
}

fn blocklist_key(refresh_token: &str) -> String {
    format!("{}{}", BLOCKLIST_PREFIX, refresh_token)
}

fn remaining_ttl(expires_at: i64, now: DateTime<Utc>) -> Option<std::time::Duration> {
    let expires_at = DateTime::<Utc>::from_timestamp(expires_at, 0)?;
    (expires_at - now).to_std().ok().filter(|ttl| !ttl.is_zero())
}
