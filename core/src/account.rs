//! Registration, login, and token verification.

use std::sync::Arc;

use argon2::Argon2;
use argon2::PasswordHash;
use argon2::PasswordHasher;
use argon2::PasswordVerifier;
use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use async_trait::async_trait;
use tracing::error;
use uuid::Uuid;

use tally_protocol::AccountError;

use crate::auth::TokenSigner;

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Persist a new user. `None` when the login is already taken.
    async fn add(&self, login: &str, password_hash: &str) -> anyhow::Result<Option<Uuid>>;
    async fn find(&self, login: &str) -> anyhow::Result<Option<(Uuid, String)>>;
}

pub struct AccountService {
    users: Arc<dyn UserStore>,
    tokens: TokenSigner,
    min_password_len: usize,
}

impl AccountService {
    pub fn new(users: Arc<dyn UserStore>, tokens: TokenSigner, min_password_len: usize) -> Self {
        Self {
            users,
            tokens,
            min_password_len,
        }
    }

    /// Create the account and return a fresh bearer token.
    pub async fn register(&self, login: &str, password: &str) -> Result<String, AccountError> {
        if login.trim().is_empty() {
            return Err(AccountError::EmptyLogin);
        }
        if password.chars().count() < self.min_password_len {
            return Err(AccountError::PasswordTooShort);
        }

        let hash = hash_password(password)?;
        match self.users.add(login, &hash).await {
            Ok(Some(user_id)) => self.tokens.issue(user_id),
            Ok(None) => Err(AccountError::LoginTaken),
            Err(err) => {
                error!(login, "failed to persist user: {err:#}");
                Err(AccountError::Internal)
            }
        }
    }

    /// Authenticate and return a fresh bearer token.
    pub async fn login(&self, login: &str, password: &str) -> Result<String, AccountError> {
        match self.users.find(login).await {
            Ok(Some((user_id, hash))) if verify_password(password, &hash) => {
                self.tokens.issue(user_id)
            }
            Ok(_) => Err(AccountError::InvalidPair),
            Err(err) => {
                error!(login, "failed to look up user: {err:#}");
                Err(AccountError::Internal)
            }
        }
    }

    pub fn verify_token(&self, token: &str) -> Result<Uuid, AccountError> {
        self.tokens.verify(token)
    }
}

/// argon2id with a fresh per-user salt, serialized as a PHC string.
fn hash_password(password: &str) -> Result<String, AccountError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| {
            error!("failed to hash password: {err}");
            AccountError::Internal
        })
}

fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}
