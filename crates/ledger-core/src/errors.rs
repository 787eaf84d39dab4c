/// Error taxonomy for ledger sessions.
///
/// Every variant keeps its identity when the failing phase is attached, so
/// callers can `matches!` on the variant no matter which step produced it.
/// Errors are `Clone` because a poisoned session replays its construction
/// failure from every call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("begin session: {0}")]
    SessionConstructionFailed(Box<LedgerError>),

    #[error("account not found: {address}")]
    AccountNotFound { address: String },

    #[error("transfer to account: destination not affected: {address} ({rows} rows)")]
    DestinationNotAffected { address: String, rows: usize },

    #[error("insufficient funds: {address} cannot cover {requested}")]
    InsufficientFunds { address: String, requested: u64 },

    #[error("{op}: {detail}")]
    Persistence { op: &'static str, detail: String },

    #[error("{op}: cancelled")]
    Cancelled { op: &'static str },

    #[error("{op}: deadline exceeded")]
    DeadlineExceeded { op: &'static str },

    #[error("amount out of range: {0}")]
    AmountOutOfRange(u64),

    #[error("session already committed or rolled back")]
    SessionClosed,

    /// The store rolled the transaction back on its own (interrupt, I/O or
    /// out-of-memory failure). Replayed by every later call on the session.
    #[error("transaction aborted by store: {0}")]
    TransactionAborted(Box<LedgerError>),
}

impl LedgerError {
    pub fn persistence(op: &'static str, detail: impl ToString) -> Self {
        Self::Persistence {
            op,
            detail: detail.to_string(),
        }
    }

    /// Wrap a begin-transaction failure. Already-wrapped errors are kept as is.
    pub fn construction(cause: LedgerError) -> Self {
        match cause {
            Self::SessionConstructionFailed(_) => cause,
            other => Self::SessionConstructionFailed(Box::new(other)),
        }
    }

    /// The underlying failure, looking through session construction and
    /// store-side aborts.
    pub fn root_cause(&self) -> &LedgerError {
        match self {
            Self::SessionConstructionFailed(inner) | Self::TransactionAborted(inner) => {
                inner.root_cause()
            }
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::AccountNotFound { .. } | Self::DestinationNotAffected { .. }
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::Cancelled { .. } | Self::DeadlineExceeded { .. }
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::SessionConstructionFailed(_) => "session_construction_failed",
            Self::AccountNotFound { .. } => "account_not_found",
            Self::DestinationNotAffected { .. } => "destination_not_affected",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::Persistence { .. } => "persistence",
            Self::Cancelled { .. } => "cancelled",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::AmountOutOfRange(_) => "amount_out_of_range",
            Self::SessionClosed => "session_closed",
            Self::TransactionAborted(_) => "transaction_aborted",
        }
    }
}

/// Convert an interface amount into the signed integer SQLite stores.
pub fn to_sql_amount(amount: u64) -> Result<i64, LedgerError> {
    i64::try_from(amount).map_err(|_| LedgerError::AmountOutOfRange(amount))
}
