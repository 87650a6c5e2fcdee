use super::money::{Amount, Money};
use super::order::OrderId;
use super::payout::PayoutId;
use super::wallet::WalletId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller-supplied token that makes a retried request a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Ledger key of the posting `kind` makes for an order. One per order and kind.
    pub fn for_order(order: OrderId, kind: TransactionKind) -> Self {
        Self(format!("order:{order}:{kind}"))
    }

    pub fn for_payout(payout: PayoutId, kind: TransactionKind) -> Self {
        Self(format!("payout:{payout}:{kind}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IdempotencyKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Charge,
    Release,
    Refund,
    Payout,
    Fee,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionKind::Charge => "charge",
            TransactionKind::Release => "release",
            TransactionKind::Refund => "refund",
            TransactionKind::Payout => "payout",
            TransactionKind::Fee => "fee",
        })
    }
}

/// A posting request. The ledger turns it into an immutable [`Transaction`].
///
/// `amount` is the signed change of the wallet total and `escrow` the signed
/// change of its pending bucket; the available bucket moves by the difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub wallet: WalletId,
    pub order: Option<OrderId>,
    pub payout: Option<PayoutId>,
    pub kind: TransactionKind,
    pub amount: Money,
    pub escrow: Money,
    pub description: String,
    pub idempotency_key: IdempotencyKey,
}

impl NewTransaction {
    fn for_order(
        wallet: WalletId,
        order: OrderId,
        kind: TransactionKind,
        amount: Money,
        escrow: Money,
        description: String,
    ) -> Self {
        Self {
            wallet,
            order: Some(order),
            payout: None,
            kind,
            amount,
            escrow,
            description,
            idempotency_key: IdempotencyKey::for_order(order, kind),
        }
    }

    fn for_payout(
        wallet: WalletId,
        payout: PayoutId,
        kind: TransactionKind,
        amount: Money,
        description: String,
    ) -> Self {
        Self {
            wallet,
            order: None,
            payout: Some(payout),
            kind,
            amount,
            escrow: Money::ZERO,
            description,
            idempotency_key: IdempotencyKey::for_payout(payout, kind),
        }
    }

    /// Customer funds enter the provider's escrow.
    pub fn charge(wallet: WalletId, order: OrderId, price: Amount) -> Self {
        let price = price.as_money();
        let description = format!("escrow charge for order {order}");
        Self::for_order(wallet, order, TransactionKind::Charge, price, price, description)
    }

    /// Escrow becomes available to the provider.
    pub fn release(wallet: WalletId, order: OrderId, price: Amount) -> Self {
        let description = format!("escrow release for order {order}");
        Self::for_order(
            wallet,
            order,
            TransactionKind::Release,
            Money::ZERO,
            -price.as_money(),
            description,
        )
    }

    /// Platform fee deducted from the released funds.
    pub fn fee(wallet: WalletId, order: OrderId, fee: Amount) -> Self {
        let description = format!("platform fee for order {order}");
        Self::for_order(
            wallet,
            order,
            TransactionKind::Fee,
            -fee.as_money(),
            Money::ZERO,
            description,
        )
    }

    /// Escrow returned to the customer.
    pub fn refund(wallet: WalletId, order: OrderId, price: Amount) -> Self {
        let price = price.as_money();
        let description = format!("escrow refund for order {order}");
        Self::for_order(wallet, order, TransactionKind::Refund, -price, -price, description)
    }

    pub fn payout(wallet: WalletId, payout: PayoutId, amount: Amount) -> Self {
        let description = format!("payout {payout}");
        Self::for_payout(
            wallet,
            payout,
            TransactionKind::Payout,
            -amount.as_money(),
            description,
        )
    }

    /// Credits a failed payout back to the available bucket.
    pub fn payout_reversal(wallet: WalletId, payout: PayoutId, amount: Amount) -> Self {
        let description = format!("reversal of failed payout {payout}");
        Self::for_payout(
            wallet,
            payout,
            TransactionKind::Refund,
            amount.as_money(),
            description,
        )
    }

    pub fn available_delta(&self) -> Money {
        self.amount - self.escrow
    }
}

/// An immutable ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    /// Ledger-wide monotonic position; doubles as the history cursor.
    pub sequence: u64,
    pub wallet: WalletId,
    pub order: Option<OrderId>,
    pub payout: Option<PayoutId>,
    pub kind: TransactionKind,
    pub amount: Money,
    pub escrow: Money,
    /// Wallet total right after this row was applied.
    pub balance_after: Money,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
}

impl Transaction {
    pub fn record(
        request: NewTransaction,
        sequence: u64,
        balance_after: Money,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            sequence,
            wallet: request.wallet,
            order: request.order,
            payout: request.payout,
            kind: request.kind,
            amount: request.amount,
            escrow: request.escrow,
            balance_after,
            description: request.description,
            created_at,
            idempotency_key: request.idempotency_key,
        }
    }

    pub fn available_delta(&self) -> Money {
        self.amount - self.escrow
    }

    /// True when `request` is a retry of the posting that produced this row.
    pub fn is_retry_of(&self, request: &NewTransaction) -> bool {
        self.idempotency_key == request.idempotency_key
            && self.wallet == request.wallet
            && self.order == request.order
            && self.payout == request.payout
            && self.kind == request.kind
            && self.amount == request.amount
            && self.escrow == request.escrow
    }
}
