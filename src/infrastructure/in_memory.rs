use crate::domain::actor::UserId;
use crate::domain::order::{Order, OrderId, OrderStatus};
use crate::domain::package::{PackageId, ServicePackage};
use crate::domain::payout::{PayoutId, PayoutRequest, PayoutStatus};
use crate::domain::ports::{
    ChangeSet, LedgerRepository, OrderRepository, OrderWrite, PackageCatalog, PayoutRepository,
    PayoutWrite, ReplayRecord, TimelineRepository, UnitOfWork,
};
use crate::domain::timeline::{EventKind, TimelineEntry};
use crate::domain::transaction::{IdempotencyKey, Transaction};
use crate::domain::wallet::{Wallet, WalletId};
use crate::error::{EscrowError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    orders: HashMap<OrderId, Order>,
    replays: HashMap<IdempotencyKey, ReplayRecord>,
    daily_numbers: HashMap<NaiveDate, u32>,
    transactions: BTreeMap<u64, Transaction>,
    by_key: HashMap<IdempotencyKey, u64>,
    wallets: HashMap<WalletId, Wallet>,
    payouts: HashMap<PayoutId, PayoutRequest>,
}

impl State {
    fn check(&self, changes: &ChangeSet) -> Result<()> {
        match &changes.order {
            Some(OrderWrite::Insert { order, .. }) if self.orders.contains_key(&order.id) => {
                return Err(EscrowError::internal(format!("order {} already stored", order.id)));
            }
            Some(OrderWrite::Swap {
                order,
                expected_version,
                ..
            }) => {
                let stored = self
                    .orders
                    .get(&order.id)
                    .ok_or_else(|| EscrowError::not_found("order", order.id))?;
                if stored.version != *expected_version {
                    return Err(EscrowError::Contention {
                        resource: format!("order {}", order.id),
                    });
                }
            }
            _ => {}
        }

        match &changes.payout {
            Some(PayoutWrite::Insert(payout)) if self.payouts.contains_key(&payout.id) => {
                return Err(EscrowError::internal(format!("payout {} already stored", payout.id)));
            }
            Some(PayoutWrite::Update(payout)) if !self.payouts.contains_key(&payout.id) => {
                return Err(EscrowError::not_found("payout", payout.id));
            }
            _ => {}
        }

        for tx in &changes.transactions {
            if self.by_key.contains_key(&tx.idempotency_key) {
                return Err(EscrowError::DuplicateTransaction {
                    key: tx.idempotency_key.clone(),
                });
            }
        }
        Ok(())
    }

    fn apply(&mut self, changes: ChangeSet) {
        match changes.order {
            Some(OrderWrite::Insert { order, replay_key }) => {
                if let Some(key) = replay_key {
                    let record = ReplayRecord {
                        event: EventKind::Create,
                        order: order.clone(),
                    };
                    self.replays.insert(key, record);
                }
                self.orders.insert(order.id, order);
            }
            Some(OrderWrite::Swap { order, replay, .. }) => {
                if let Some((key, event)) = replay {
                    let record = ReplayRecord {
                        event,
                        order: order.clone(),
                    };
                    self.replays.insert(key, record);
                }
                self.orders.insert(order.id, order);
            }
            None => {}
        }

        if let Some(PayoutWrite::Insert(payout) | PayoutWrite::Update(payout)) = changes.payout {
            self.payouts.insert(payout.id, payout);
        }

        for tx in changes.transactions {
            self.by_key.insert(tx.idempotency_key.clone(), tx.sequence);
            self.transactions.insert(tx.sequence, tx);
        }
        for wallet in changes.wallets {
            self.wallets.insert(wallet.id.clone(), wallet);
        }
    }

    fn payouts_matching(&self, filter: impl Fn(&PayoutRequest) -> bool) -> Vec<PayoutRequest> {
        let mut matching: Vec<PayoutRequest> =
            self.payouts.values().filter(|p| filter(p)).cloned().collect();
        matching.sort_by_key(|p| p.requested_at);
        matching
    }
}

/// Orders, ledger rows, wallets and payouts behind one `RwLock`.
///
/// `commit` checks and applies a whole [`ChangeSet`] under a single write
/// guard, so readers never see half of an operation.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    sequence: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UnitOfWork for InMemoryStore {
    async fn commit(&self, changes: ChangeSet) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(&changes)?;
        state.apply(changes);
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for InMemoryStore {
    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        let state = self.state.read().await;
        Ok(state.orders.get(&id).cloned())
    }

    async fn replay(&self, key: &IdempotencyKey) -> Result<Option<ReplayRecord>> {
        let state = self.state.read().await;
        Ok(state.replays.get(key).cloned())
    }

    async fn next_order_number(&self, date: NaiveDate) -> Result<u32> {
        let mut state = self.state.write().await;
        let counter = state.daily_numbers.entry(date).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn open_disputes(&self, provider: &UserId) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state
            .orders
            .values()
            .filter(|order| &order.provider == provider && order.status == OrderStatus::Disputed)
            .count())
    }
}

#[async_trait]
impl LedgerRepository for InMemoryStore {
    async fn wallet(&self, id: &WalletId) -> Result<Option<Wallet>> {
        let state = self.state.read().await;
        Ok(state.wallets.get(id).cloned())
    }

    async fn wallets(&self) -> Result<Vec<Wallet>> {
        let state = self.state.read().await;
        let mut wallets: Vec<Wallet> = state.wallets.values().cloned().collect();
        wallets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(wallets)
    }

    async fn by_key(&self, key: &IdempotencyKey) -> Result<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .by_key
            .get(key)
            .and_then(|sequence| state.transactions.get(sequence))
            .cloned())
    }

    async fn history(
        &self,
        wallet: &WalletId,
        before: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let state = self.state.read().await;
        let upper = before.unwrap_or(u64::MAX);
        Ok(state
            .transactions
            .range(..upper)
            .rev()
            .map(|(_, tx)| tx)
            .filter(|tx| &tx.wallet == wallet)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn for_order(&self, order: OrderId) -> Result<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .values()
            .filter(|tx| tx.order == Some(order))
            .cloned()
            .collect())
    }

    async fn next_sequence(&self) -> Result<u64> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl PayoutRepository for InMemoryStore {
    async fn get(&self, id: PayoutId) -> Result<Option<PayoutRequest>> {
        let state = self.state.read().await;
        Ok(state.payouts.get(&id).cloned())
    }

    async fn for_wallet(&self, wallet: &WalletId) -> Result<Vec<PayoutRequest>> {
        let state = self.state.read().await;
        Ok(state.payouts_matching(|p| &p.wallet == wallet))
    }

    async fn with_status(&self, status: PayoutStatus) -> Result<Vec<PayoutRequest>> {
        let state = self.state.read().await;
        Ok(state.payouts_matching(|p| p.status == status))
    }
}

#[derive(Default, Clone)]
pub struct InMemoryTimelineRepository {
    entries: Arc<RwLock<HashMap<OrderId, Vec<TimelineEntry>>>>,
}

impl InMemoryTimelineRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimelineRepository for InMemoryTimelineRepository {
    async fn append(&self, entry: TimelineEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.entry(entry.order).or_default().push(entry);
        Ok(())
    }

    async fn for_order(&self, order: OrderId) -> Result<Vec<TimelineEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&order).cloned().unwrap_or_default())
    }
}

/// Package catalog fed by the caller; stands in for the catalog service.
#[derive(Default, Clone)]
pub struct InMemoryPackageCatalog {
    packages: Arc<RwLock<HashMap<PackageId, ServicePackage>>>,
}

impl InMemoryPackageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_packages(packages: impl IntoIterator<Item = ServicePackage>) -> Self {
        let packages = packages
            .into_iter()
            .map(|package| (package.id.clone(), package))
            .collect();
        Self {
            packages: Arc::new(RwLock::new(packages)),
        }
    }

    /// Adds or replaces a package.
    pub async fn add(&self, package: ServicePackage) {
        let mut packages = self.packages.write().await;
        packages.insert(package.id.clone(), package);
    }
}

#[async_trait]
impl PackageCatalog for InMemoryPackageCatalog {
    async fn package(&self, id: &PackageId) -> Result<Option<ServicePackage>> {
        let packages = self.packages.read().await;
        Ok(packages.get(id).cloned())
    }
}
