use crate::domain::actor::UserId;
use crate::domain::money::Money;
use crate::domain::order::{OrderId, OrderStatus};
use crate::domain::package::PackageId;
use crate::domain::payout::{PayoutId, PayoutStatus};
use crate::domain::timeline::EventKind;
use crate::domain::transaction::IdempotencyKey;
use crate::domain::wallet::{Bucket, WalletId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("order {order}: cannot {event} while {from}")]
    InvalidTransition {
        order: OrderId,
        from: OrderStatus,
        event: EventKind,
    },
    #[error("payout {payout}: cannot move from {from} to {to}")]
    InvalidPayoutTransition {
        payout: PayoutId,
        from: PayoutStatus,
        to: PayoutStatus,
    },
    #[error("{actor} is not allowed to {event} this order")]
    UnauthorizedTransition { actor: UserId, event: EventKind },
    #[error("order {order} already used all {max} revisions")]
    RevisionLimitExceeded { order: OrderId, max: u32 },
    #[error("package {package} cannot be ordered: {reason}")]
    InvalidPackage { package: PackageId, reason: String },
    #[error("idempotency key {key} was already used for a different request")]
    DuplicateTransaction { key: IdempotencyKey },
    #[error("timed out waiting for {resource}, retry later")]
    Contention { resource: String },
    #[error("wallet {wallet}: {bucket} balance {available} cannot cover {required}")]
    InsufficientBalance {
        wallet: WalletId,
        bucket: Bucket,
        available: Money,
        required: Money,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, EscrowError>;

/// Stable error classification for callers that map errors onto a
/// transport (HTTP status codes, CLI exit codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidTransition,
    UnauthorizedTransition,
    RevisionLimitExceeded,
    InvalidPackage,
    DuplicateTransaction,
    Contention,
    InsufficientBalance,
    NotFound,
    Validation,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::UnauthorizedTransition => "unauthorized_transition",
            ErrorKind::RevisionLimitExceeded => "revision_limit_exceeded",
            ErrorKind::InvalidPackage => "invalid_package",
            ErrorKind::DuplicateTransaction => "duplicate_transaction",
            ErrorKind::Contention => "contention",
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Storage => "storage",
        }
    }

    /// Only contention is worth retrying without a change in the request.
    pub fn is_retryable(self) -> bool {
        self == ErrorKind::Contention
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EscrowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EscrowError::InvalidTransition { .. } | EscrowError::InvalidPayoutTransition { .. } => {
                ErrorKind::InvalidTransition
            }
            EscrowError::UnauthorizedTransition { .. } => ErrorKind::UnauthorizedTransition,
            EscrowError::RevisionLimitExceeded { .. } => ErrorKind::RevisionLimitExceeded,
            EscrowError::InvalidPackage { .. } => ErrorKind::InvalidPackage,
            EscrowError::DuplicateTransaction { .. } => ErrorKind::DuplicateTransaction,
            EscrowError::Contention { .. } => ErrorKind::Contention,
            EscrowError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            EscrowError::NotFound { .. } => ErrorKind::NotFound,
            EscrowError::ValidationError(_) | EscrowError::ConfigError(_) | EscrowError::CsvError(_) => {
                ErrorKind::Validation
            }
            EscrowError::IoError(_) | EscrowError::InternalError(_) => ErrorKind::Storage,
            #[cfg(feature = "storage-rocksdb")]
            EscrowError::RocksDbError(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        EscrowError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        EscrowError::InternalError(message.into().into())
    }
}
