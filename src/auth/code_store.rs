use super::clock::Clock;
use super::traits::CodeStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// sweep expired entries once the map grows past this
const SWEEP_THRESHOLD: usize = 1000;

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process code store. Every operation runs under one mutex, which is what
/// makes `get_and_delete` atomic.
#[derive(Clone)]
pub struct MemoryCodeStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCodeStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::default(),
            clock,
        }
    }

    /// boot out anything past its ttl
    pub async fn cleanup_expired(&self) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);

        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!("cleaned up {} expired code store entries", removed);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl CodeStore for MemoryCodeStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        if self.len().await >= SWEEP_THRESHOLD {
            self.cleanup_expired().await;
        }

        let ttl = chrono::Duration::from_std(ttl).context("ttl out of range")?;
        let entry = Entry {
            value: value.to_string(),
            expires_at: self.clock.now() + ttl,
        };
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        Ok(entries
            .remove(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Redis-backed code store. Expiry is left to Redis; `GETDEL` (Redis >= 6.2)
/// gives the single-use guarantee.
#[derive(Clone)]
pub struct RedisCodeStore {
    conn_manager: ConnectionManager,
}

impl RedisCodeStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("invalid redis url")?;
        let conn_manager = ConnectionManager::new(client)
            .await
            .context("failed to create redis connection manager")?;

        // Test the connection to ensure it's working
        let mut conn = conn_manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context("failed to ping redis")?;

        Ok(Self { conn_manager })
    }
}

#[async_trait]
impl CodeStore for RedisCodeStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        // PX keeps millisecond precision so denylist entries lapse with the token
        let millis = ttl.as_millis().max(1) as u64;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query_async::<()>(&mut conn)
            .await
            .with_context(|| format!("redis SET failed for {}", redact(key)))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_manager.clone();
        conn.get::<_, Option<String>>(key)
            .await
            .with_context(|| format!("redis GET failed for {}", redact(key)))
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_manager.clone();
        redis::cmd("GETDEL")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await
            .with_context(|| format!("redis GETDEL failed for {}", redact(key)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        conn.del::<_, ()>(key)
            .await
            .with_context(|| format!("redis DEL failed for {}", redact(key)))
    }
}

/// keys embed live codes and tokens, keep them out of logs
fn redact(key: &str) -> String {
    match key.split_once(':') {
        Some((prefix, _)) => format!("{}:<redacted>", prefix),
        None => "<redacted>".to_string(),
    }
}
