use thiserror::Error;

/// Backend-level storage failures. `Busy` is the only transient variant; the
/// engine retries it a bounded number of times and everything else surfaces
/// immediately.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store busy: transient write conflict")]
    Busy,

    #[error("row not found")]
    NotFound,

    #[error("insufficient balance: balance={balance} requested={requested}")]
    InsufficientBalance { balance: i64, requested: u64 },

    #[error("ledger write failed: {0}")]
    LedgerWrite(String),

    #[error("invalid status transition: expected {expected}, found {found}")]
    InvalidTransition { expected: String, found: String },

    #[error("backend error: {0}")]
    Backend(String),
}

/// Crate-level error taxonomy. Denials from the pre-flight quota check are
/// returned as [`crate::quota::QuotaDecision`] values, not errors; these
/// variants cover the transactional paths.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Trial hard-stop or failed in-transaction re-check. Definitive denial;
    /// not retryable without tenant action.
    #[error("insufficient balance: balance={balance} requested={requested}")]
    InsufficientBalance { balance: i64, requested: u64 },

    #[error("organization not found: {org_id}")]
    TenantNotFound { org_id: String },

    /// The ledger entry could not be written. The enclosing transaction has
    /// been rolled back in full; no balance change was applied.
    #[error("ledger write failure: {message}")]
    LedgerWriteFailure { message: String },

    /// Infrastructure failure while reading balance state. Always maps to a
    /// denial, never an allow.
    #[error("balance check failed: {message}")]
    BalanceCheckFailed { message: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl BillingError {
    /// Maps a store failure into the caller-facing taxonomy for a given
    /// organization context.
    pub(crate) fn from_store(err: StoreError, org_id: &str) -> Self {
        match err {
            StoreError::NotFound => Self::TenantNotFound {
                org_id: org_id.to_string(),
            },
            StoreError::InsufficientBalance { balance, requested } => {
                Self::InsufficientBalance { balance, requested }
            }
            StoreError::LedgerWrite(message) => Self::LedgerWriteFailure { message },
            other => Self::Storage(other),
        }
    }
}
