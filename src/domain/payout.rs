use super::money::Amount;
use super::wallet::WalletId;
use crate::error::{EscrowError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayoutId(Uuid);

impl PayoutId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for PayoutId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Requested,
    Processing,
    Paid,
    Failed,
}

impl PayoutStatus {
    /// Requested or processing: the wallet must not get another payout yet.
    pub fn is_open(self) -> bool {
        matches!(self, PayoutStatus::Requested | PayoutStatus::Processing)
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PayoutStatus::Requested => "requested",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Paid => "paid",
            PayoutStatus::Failed => "failed",
        })
    }
}

/// What the payment gateway reported for a payout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum PayoutOutcome {
    Paid { reference: Option<String> },
    Failed { reason: String },
}

impl PayoutOutcome {
    fn status(&self) -> PayoutStatus {
        match self {
            PayoutOutcome::Paid { .. } => PayoutStatus::Paid,
            PayoutOutcome::Failed { .. } => PayoutStatus::Failed,
        }
    }
}

/// Result of applying a gateway report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Applied,
    /// The payout already carried this outcome.
    Replayed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub id: PayoutId,
    pub wallet: WalletId,
    pub amount: Amount,
    pub status: PayoutStatus,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub gateway_reference: Option<String>,
    pub failure_reason: Option<String>,
}

impl PayoutRequest {
    pub fn new(wallet: WalletId, amount: Amount, now: DateTime<Utc>) -> Self {
        Self {
            id: PayoutId::new(),
            wallet,
            amount,
            status: PayoutStatus::Requested,
            requested_at: now,
            processed_at: None,
            gateway_reference: None,
            failure_reason: None,
        }
    }

    /// Handed to the gateway.
    pub fn begin_processing(&mut self, reference: String) -> Result<()> {
        if self.status != PayoutStatus::Requested {
            return Err(EscrowError::InvalidPayoutTransition {
                payout: self.id,
                from: self.status,
                to: PayoutStatus::Processing,
            });
        }
        self.status = PayoutStatus::Processing;
        self.gateway_reference = Some(reference);
        Ok(())
    }

    pub fn settle(&mut self, outcome: &PayoutOutcome, now: DateTime<Utc>) -> Result<Settlement> {
        let target = outcome.status();
        if self.status == target {
            return Ok(Settlement::Replayed);
        }
        if !self.status.is_open() {
            return Err(EscrowError::InvalidPayoutTransition {
                payout: self.id,
                from: self.status,
                to: target,
            });
        }

        match outcome {
            PayoutOutcome::Paid { reference } => {
                if reference.is_some() {
                    self.gateway_reference = reference.clone();
                }
            }
            PayoutOutcome::Failed { reason } => self.failure_reason = Some(reason.clone()),
        }
        self.status = target;
        self.processed_at = Some(now);
        Ok(Settlement::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::actor::UserId;

    fn request() -> PayoutRequest {
        PayoutRequest::new(
            WalletId::for_provider(&UserId::new("prov-1")),
            Amount::new(20_000).unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn test_paid_is_terminal() {
        let mut payout = request();
        payout.begin_processing("gw-1".into()).unwrap();
        let paid = PayoutOutcome::Paid { reference: None };

        assert_eq!(payout.settle(&paid, Utc::now()).unwrap(), Settlement::Applied);
        assert_eq!(payout.status, PayoutStatus::Paid);
        assert_eq!(payout.gateway_reference.as_deref(), Some("gw-1"));
        assert_eq!(payout.settle(&paid, Utc::now()).unwrap(), Settlement::Replayed);

        let failed = PayoutOutcome::Failed {
            reason: "late bounce".into(),
        };
        assert!(matches!(
            payout.settle(&failed, Utc::now()),
            Err(EscrowError::InvalidPayoutTransition { .. })
        ));
    }

    #[test]
    fn test_failure_records_reason() {
        let mut payout = request();
        let failed = PayoutOutcome::Failed {
            reason: "account closed".into(),
        };
        payout.settle(&failed, Utc::now()).unwrap();
        assert_eq!(payout.status, PayoutStatus::Failed);
        assert_eq!(payout.failure_reason.as_deref(), Some("account closed"));
        assert!(payout.processed_at.is_some());
    }

    #[test]
    fn test_processing_only_from_requested() {
        let mut payout = request();
        payout.begin_processing("gw-1".into()).unwrap();
        assert!(payout.begin_processing("gw-2".into()).is_err());
    }
}
