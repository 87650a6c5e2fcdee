use super::actor::UserId;
use super::order::{Order, OrderId};
use super::package::{PackageId, ServicePackage};
use super::payout::{PayoutId, PayoutRequest, PayoutStatus};
use super::timeline::{EventKind, TimelineEntry};
use super::transaction::{IdempotencyKey, Transaction};
use super::wallet::{Wallet, WalletId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stored outcome of an idempotent order operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub event: EventKind,
    pub order: Order,
}

/// Order write carried by a [`ChangeSet`].
#[derive(Debug, Clone)]
pub enum OrderWrite {
    /// A new order, with its replay record when the request carried a key.
    Insert {
        order: Order,
        replay_key: Option<IdempotencyKey>,
    },
    /// Replaces the stored order only if its version is still `expected_version`.
    Swap {
        order: Order,
        expected_version: u64,
        replay: Option<(IdempotencyKey, EventKind)>,
    },
}

#[derive(Debug, Clone)]
pub enum PayoutWrite {
    Insert(PayoutRequest),
    Update(PayoutRequest),
}

/// Everything one operation writes. Stored all together or not at all.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub order: Option<OrderWrite>,
    pub payout: Option<PayoutWrite>,
    /// New ledger rows, in sequence order.
    pub transactions: Vec<Transaction>,
    /// Wallet snapshots after `transactions`.
    pub wallets: Vec<Wallet>,
}

impl ChangeSet {
    pub fn with_order(mut self, write: OrderWrite) -> Self {
        self.order = Some(write);
        self
    }

    pub fn with_payout(mut self, write: PayoutWrite) -> Self {
        self.payout = Some(write);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_none()
            && self.payout.is_none()
            && self.transactions.is_empty()
            && self.wallets.is_empty()
    }
}

/// Atomic write side of the order, ledger and payout stores.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Checks every precondition in `changes` (order absent or at the
    /// expected version, ledger keys unused, payout present for an update)
    /// and then applies all of it. A failed check leaves storage untouched
    /// and fails with the matching error.
    async fn commit(&self, changes: ChangeSet) -> Result<()>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn get(&self, id: OrderId) -> Result<Option<Order>>;
    async fn replay(&self, key: &IdempotencyKey) -> Result<Option<ReplayRecord>>;
    /// Next value of the per-day order number sequence, starting at 1.
    async fn next_order_number(&self, date: NaiveDate) -> Result<u32>;
    /// Number of the provider's orders currently in `disputed`.
    async fn open_disputes(&self, provider: &UserId) -> Result<usize>;
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn wallet(&self, id: &WalletId) -> Result<Option<Wallet>>;
    async fn wallets(&self) -> Result<Vec<Wallet>>;
    async fn by_key(&self, key: &IdempotencyKey) -> Result<Option<Transaction>>;
    /// Wallet transactions with `sequence < before`, newest first.
    async fn history(
        &self,
        wallet: &WalletId,
        before: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Transaction>>;
    async fn for_order(&self, order: OrderId) -> Result<Vec<Transaction>>;
    async fn next_sequence(&self) -> Result<u64>;
}

#[async_trait]
pub trait PayoutRepository: Send + Sync {
    async fn get(&self, id: PayoutId) -> Result<Option<PayoutRequest>>;
    async fn for_wallet(&self, wallet: &WalletId) -> Result<Vec<PayoutRequest>>;
    async fn with_status(&self, status: PayoutStatus) -> Result<Vec<PayoutRequest>>;
}

#[async_trait]
pub trait TimelineRepository: Send + Sync {
    async fn append(&self, entry: TimelineEntry) -> Result<()>;
    /// Entries of one order in the order they were appended.
    async fn for_order(&self, order: OrderId) -> Result<Vec<TimelineEntry>>;
}

/// Read access to the service catalog.
#[async_trait]
pub trait PackageCatalog: Send + Sync {
    async fn package(&self, id: &PackageId) -> Result<Option<ServicePackage>>;
}

/// Outbound payment rail. Results arrive later through the payout scheduler.
#[async_trait]
pub trait PayoutGateway: Send + Sync {
    /// Submits the payout and returns the gateway's reference for it.
    async fn submit(&self, payout: &PayoutRequest) -> Result<String>;
}

pub type OrderRepositoryRef = Arc<dyn OrderRepository>;
pub type LedgerRepositoryRef = Arc<dyn LedgerRepository>;
pub type PayoutRepositoryRef = Arc<dyn PayoutRepository>;
pub type TimelineRepositoryRef = Arc<dyn TimelineRepository>;
pub type PackageCatalogRef = Arc<dyn PackageCatalog>;
pub type UnitOfWorkRef = Arc<dyn UnitOfWork>;
