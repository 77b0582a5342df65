use crate::auth::{AlreadyExists, Client, CredentialStore, SecretHasher, User};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Identity records held in memory. Emails are matched case-insensitively,
/// client names exactly.
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    users: Arc<RwLock<HashMap<String, User>>>,
    clients: Arc<RwLock<HashMap<String, Client>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|user| user.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn find_client_by_id(&self, id: &str) -> Result<Option<Client>> {
        Ok(self.clients.read().await.get(id).cloned())
    }

    async fn find_client_by_name(&self, name: &str) -> Result<Option<Client>> {
        let clients = self.clients.read().await;
        Ok(clients.values().find(|client| client.name == name).cloned())
    }

    async fn insert_user(&self, user: User) -> Result<()> {
        let mut users = self.users.write().await;
        if users
            .values()
            .any(|existing| existing.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(AlreadyExists {
                field: "email",
                value: user.email,
            }
            .into());
        }
        if users.contains_key(&user.id) {
            bail!("duplicate user id: {}", user.id);
        }
        users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn update_user(&self, user: User) -> Result<()> {
        let mut users = self.users.write().await;
        if users.values().any(|existing| {
            existing.id != user.id && existing.email.eq_ignore_ascii_case(&user.email)
        }) {
            return Err(AlreadyExists {
                field: "email",
                value: user.email,
            }
            .into());
        }
        match users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user;
                Ok(())
            }
            None => bail!("no such user: {}", user.id),
        }
    }

    async fn insert_client(&self, client: Client) -> Result<()> {
        let mut clients = self.clients.write().await;
        if clients.values().any(|existing| existing.name == client.name) {
            return Err(AlreadyExists {
                field: "name",
                value: client.name,
            }
            .into());
        }
        if clients.contains_key(&client.id) {
            bail!("duplicate client id: {}", client.id);
        }
        clients.insert(client.id.clone(), client);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    users: Vec<SeedUser>,
    #[serde(default)]
    clients: Vec<SeedClient>,
}

#[derive(Debug, Deserialize)]
struct SeedUser {
    id: Option<String>,
    first_name: String,
    last_name: String,
    email: String,
    /// plaintext, hashed on load
    password: Option<String>,
    password_hash: Option<String>,
    #[serde(default)]
    verified: bool,
}

#[derive(Debug, Deserialize)]
struct SeedClient {
    id: Option<String>,
    name: String,
    secret: Option<String>,
    secret_hash: Option<String>,
    /// paths are relative to the seed file
    private_key_file: String,
    public_key_file: String,
}

/// Loads users and clients from a JSON seed file into `store`.
pub async fn load_seed_file(
    path: &Path,
    store: &(dyn CredentialStore + Send + Sync),
    hasher: &dyn SecretHasher,
) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    let seed: SeedFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse seed file {}", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    for user in seed.users {
        let password_hash = match (user.password, user.password_hash) {
            (_, Some(hash)) => hash,
            (Some(plain), None) => hasher.hash(&plain)?,
            (None, None) => bail!("seed user {} has neither password nor password_hash", user.email),
        };
        let id = user.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::info!("seeding user {} ({})", user.email, id);
        store
            .insert_user(User {
                id,
                first_name: user.first_name,
                last_name: user.last_name,
                email: user.email,
                password_hash,
                verified: user.verified,
            })
            .await?;
    }

    for client in seed.clients {
        if store.find_client_by_name(&client.name).await?.is_some() {
            return Err(anyhow!("client name already registered: {}", client.name));
        }

        let secret_hash = match (client.secret, client.secret_hash) {
            (_, Some(hash)) => hash,
            (Some(plain), None) => hasher.hash(&plain)?,
            (None, None) => bail!("seed client {} has neither secret nor secret_hash", client.name),
        };
        let private_key = read_pem(&base_dir.join(&client.private_key_file)).await?;
        let public_key = read_pem(&base_dir.join(&client.public_key_file)).await?;

        let id = client.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::info!("seeding client {} ({})", client.name, id);
        store
            .insert_client(Client {
                id,
                name: client.name,
                secret_hash,
                private_key,
                public_key,
            })
            .await?;
    }

    Ok(())
}

async fn read_pem(path: &Path) -> Result<String> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    if !pem.trim_start().starts_with("-----BEGIN") {
        bail!("{} does not look like a PEM file", path.display());
    }
    Ok(pem)
}
