use chrono::DateTime;
use chrono::Utc;

/// Loyalty-point balance for one user, in hundredths. A user without a
/// persisted row has the default balance.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Balance {
    pub current: i64,
    pub withdrawn: i64,
}

/// One entry in a user's append-only withdrawal journal.
#[derive(Clone, Debug, PartialEq)]
pub struct WithdrawalEntry {
    pub order_number: String,
    pub sum: i64,
    pub processed_at: DateTime<Utc>,
}
