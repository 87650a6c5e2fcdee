use super::actor::UserId;
use super::money::Money;
use super::transaction::NewTransaction;
use crate::error::{EscrowError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A provider's wallet. Each provider owns exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(UserId);

impl WalletId {
    pub fn for_provider(provider: &UserId) -> Self {
        Self(provider.clone())
    }

    pub fn provider(&self) -> &UserId {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Available,
    Pending,
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Bucket::Available => "available",
            Bucket::Pending => "pending",
        })
    }
}

/// Cached balance of a provider wallet.
///
/// Kept in step with the ledger: every posting updates it in the same
/// commit, so `available + pending` always equals the sum of the wallet's
/// transaction amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    /// Funds the provider can be paid out.
    pub available: Money,
    /// Funds held in escrow for open orders.
    pub pending: Money,
    pub currency: String,
    pub transaction_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(id: WalletId, currency: impl Into<String>) -> Self {
        Self {
            id,
            available: Money::ZERO,
            pending: Money::ZERO,
            currency: currency.into(),
            transaction_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn total(&self) -> Money {
        self.available + self.pending
    }

    pub fn provider(&self) -> &UserId {
        self.id.provider()
    }

    /// Applies a posting, refusing any that would leave a bucket negative.
    /// On error the wallet is left untouched.
    pub fn apply(&mut self, posting: &NewTransaction, at: DateTime<Utc>) -> Result<()> {
        let pending = self.shift(Bucket::Pending, self.pending, posting.escrow)?;
        let available = self.shift(Bucket::Available, self.available, posting.available_delta())?;

        self.pending = pending;
        self.available = available;
        self.transaction_count += 1;
        self.updated_at = at;
        Ok(())
    }

    fn shift(&self, bucket: Bucket, current: Money, delta: Money) -> Result<Money> {
        let next = current.checked_add(delta).ok_or_else(|| {
            EscrowError::ValidationError(format!("{bucket} balance of wallet {} overflows", self.id))
        })?;
        if next.is_negative() {
            return Err(EscrowError::InsufficientBalance {
                wallet: self.id.clone(),
                bucket,
                available: current,
                required: -delta,
            });
        }
        Ok(next)
    }
}
