use thiserror::Error;

/// Order coordinator failures. The transport layer maps each variant to an
/// HTTP status; `Internal` deliberately carries no detail.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OrderError {
    #[error("invalid order number")]
    InvalidNumber,
    #[error("order already uploaded")]
    AlreadyUploaded,
    #[error("order uploaded by another user")]
    UploadedByAnotherUser,
    #[error("order already reached a final status")]
    AlreadyProcessed,
    #[error("internal error")]
    Internal,
}

/// Balance ledger failures.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("invalid order number")]
    InvalidOrderNumber,
    #[error("withdrawal sum must be positive")]
    InvalidWithdrawalSum,
    #[error("not enough balance")]
    NotEnoughBalance,
    #[error("internal error")]
    Internal,
}

/// Account registration / authentication failures.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AccountError {
    #[error("login must not be empty")]
    EmptyLogin,
    #[error("password is too short")]
    PasswordTooShort,
    #[error("login already taken")]
    LoginTaken,
    #[error("invalid login/password pair")]
    InvalidPair,
    #[error("invalid token")]
    InvalidToken,
    #[error("internal error")]
    Internal,
}
