//! Registration, login, and secret bootstrap flows.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use tally_core::AccountService;
use tally_core::TokenSigner;
use tally_core::secrets;
use tally_protocol::AccountError;
use tally_state::memory::MemorySecretStore;
use tally_state::memory::MemoryUserStore;

const MIN_PASSWORD_LEN: usize = 12;

fn service() -> AccountService {
    AccountService::new(
        Arc::new(MemoryUserStore::default()),
        TokenSigner::new(b"test-secret", Duration::from_secs(3600)),
        MIN_PASSWORD_LEN,
    )
}

#[tokio::test]
async fn register_issues_a_verifiable_token() {
    let service = service();
    let token = service
        .register("alice", "longmegapassword")
        .await
        .expect("register");
    service.verify_token(&token).expect("token verifies");
}

#[tokio::test]
async fn login_round_trips_and_tokens_identify_the_user() {
    let service = service();
    let registered = service
        .register("alice", "longmegapassword")
        .await
        .expect("register");
    let logged_in = service
        .login("alice", "longmegapassword")
        .await
        .expect("login");

    let from_register = service.verify_token(&registered).expect("verify");
    let from_login = service.verify_token(&logged_in).expect("verify");
    assert_eq!(from_register, from_login);
}

#[tokio::test]
async fn wrong_password_and_unknown_login_both_read_as_invalid_pair() {
    let service = service();
    service
        .register("alice", "longmegapassword")
        .await
        .expect("register");

    assert_eq!(
        service.login("alice", "wrong-password-x").await,
        Err(AccountError::InvalidPair)
    );
    assert_eq!(
        service.login("nobody", "longmegapassword").await,
        Err(AccountError::InvalidPair)
    );
}

#[tokio::test]
async fn duplicate_login_is_a_conflict() {
    let service = service();
    service
        .register("alice", "longmegapassword")
        .await
        .expect("register");
    assert_eq!(
        service.register("alice", "otherlongpassword").await,
        Err(AccountError::LoginTaken)
    );
}

#[tokio::test]
async fn weak_credentials_are_rejected() {
    let service = service();
    assert_eq!(
        service.register("", "longmegapassword").await,
        Err(AccountError::EmptyLogin)
    );
    assert_eq!(
        service.register("   ", "longmegapassword").await,
        Err(AccountError::EmptyLogin)
    );
    assert_eq!(
        service.register("alice", "short").await,
        Err(AccountError::PasswordTooShort)
    );
}

#[tokio::test]
async fn token_secret_is_generated_once_and_reused() {
    let store = MemorySecretStore::default();
    let first = secrets::load_or_create_token_secret(&store)
        .await
        .expect("bootstrap");
    let second = secrets::load_or_create_token_secret(&store)
        .await
        .expect("reload");
    assert_eq!(first, second);
    assert_eq!(first.len(), 32);
}
