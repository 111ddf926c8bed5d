//! Per-deployment secrets, generated on first run and reused afterwards.

use async_trait::async_trait;

use crate::auth;

const TOKEN_SECRET_NAME: &str = "token_secret";

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> anyhow::Result<Option<String>>;
    /// First write wins; a concurrent `put` for the same name is a no-op.
    async fn put(&self, name: &str, value: &str) -> anyhow::Result<()>;
}

/// Load the token-signing secret, generating and persisting it on first run.
pub async fn load_or_create_token_secret(store: &dyn SecretStore) -> anyhow::Result<Vec<u8>> {
    if let Some(stored) = store.get(TOKEN_SECRET_NAME).await? {
        if let Some(secret) = auth::decode_hex(&stored) {
            return Ok(secret);
        }
        anyhow::bail!("persisted token secret is not valid hex");
    }

    let secret = auth::generate_secret();
    store
        .put(TOKEN_SECRET_NAME, &auth::encode_hex(&secret))
        .await?;
    // Re-read in case another instance won the first write.
    let stored = store
        .get(TOKEN_SECRET_NAME)
        .await?
        .ok_or_else(|| anyhow::anyhow!("token secret missing after write"))?;
    auth::decode_hex(&stored).ok_or_else(|| anyhow::anyhow!("persisted token secret is not valid hex"))
}
