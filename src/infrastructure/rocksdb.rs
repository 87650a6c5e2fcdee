use crate::application::marketplace::Stores;
use crate::domain::actor::UserId;
use crate::domain::order::{Order, OrderId, OrderStatus};
use crate::domain::payout::{PayoutId, PayoutRequest, PayoutStatus};
use crate::domain::ports::{
    ChangeSet, LedgerRepository, OrderRepository, OrderWrite, PayoutRepository, PayoutWrite,
    ReplayRecord, TimelineRepository, UnitOfWork,
};
use crate::domain::timeline::{EventKind, TimelineEntry};
use crate::domain::transaction::{IdempotencyKey, Transaction};
use crate::domain::wallet::{Wallet, WalletId};
use crate::error::{EscrowError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Orders by id.
pub const CF_ORDERS: &str = "orders";
/// Replay records by idempotency key.
pub const CF_REPLAYS: &str = "replays";
/// Daily order number counters by `YYYYMMDD`.
pub const CF_ORDER_NUMBERS: &str = "order_numbers";
/// Ledger rows by sequence.
pub const CF_TRANSACTIONS: &str = "transactions";
/// `idempotency key -> sequence`.
pub const CF_TRANSACTION_KEYS: &str = "transaction_keys";
/// `wallet \0 sequence -> ()`, scanned backwards for history.
pub const CF_WALLET_HISTORY: &str = "wallet_history";
/// `order id ++ sequence -> ()`.
pub const CF_ORDER_TRANSACTIONS: &str = "order_transactions";
pub const CF_WALLETS: &str = "wallets";
pub const CF_PAYOUTS: &str = "payouts";
/// Timeline entries by append sequence.
pub const CF_TIMELINE: &str = "timeline";
/// `order id ++ timeline sequence -> ()`.
pub const CF_ORDER_TIMELINE: &str = "order_timeline";

const COLUMN_FAMILIES: [&str; 11] = [
    CF_ORDERS,
    CF_REPLAYS,
    CF_ORDER_NUMBERS,
    CF_TRANSACTIONS,
    CF_TRANSACTION_KEYS,
    CF_WALLET_HISTORY,
    CF_ORDER_TRANSACTIONS,
    CF_WALLETS,
    CF_PAYOUTS,
    CF_TIMELINE,
    CF_ORDER_TIMELINE,
];

/// Persistent backend for every repository port.
///
/// A [`ChangeSet`] becomes a single `WriteBatch`: the order with its replay
/// record, the payout, every ledger row with its indexes, and the wallets.
/// The checks before it run under one async mutex.
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<DB>,
    ledger_sequence: Arc<AtomicU64>,
    timeline_sequence: Arc<AtomicU64>,
    writes: Arc<Mutex<()>>,
}

impl RocksDbStore {
    /// Opens or creates the database at `path`, creating missing column
    /// families and resuming the ledger and timeline sequences.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let store = Self {
            db: Arc::new(db),
            ledger_sequence: Arc::new(AtomicU64::new(0)),
            timeline_sequence: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(Mutex::new(())),
        };
        store
            .ledger_sequence
            .store(store.last_sequence(CF_TRANSACTIONS)?, Ordering::SeqCst);
        store
            .timeline_sequence
            .store(store.last_sequence(CF_TIMELINE)?, Ordering::SeqCst);
        Ok(store)
    }

    /// The repository handles for [`crate::application::marketplace::Marketplace`].
    pub fn stores(&self) -> Stores {
        let store = Arc::new(self.clone());
        Stores {
            unit: store.clone(),
            orders: store.clone(),
            ledger: store.clone(),
            payouts: store.clone(),
            timeline: store,
        }
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| EscrowError::internal(format!("{name} column family not found")))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: impl AsRef<[u8]>) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        self.db
            .iterator_cf(self.cf(cf)?, IteratorMode::Start)
            .map(|item| {
                let (_key, value) = item?;
                decode(&value)
            })
            .collect()
    }

    /// Sequences stored as index key suffixes under `prefix`, ascending.
    fn indexed(&self, cf: &str, prefix: &[u8]) -> Result<Vec<u64>> {
        let mut sequences = Vec::new();
        for item in self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            sequences.push(sequence_suffix(&key)?);
        }
        Ok(sequences)
    }

    fn last_sequence(&self, cf: &str) -> Result<u64> {
        match self.db.iterator_cf(self.cf(cf)?, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                sequence_suffix(&key)
            }
            None => Ok(0),
        }
    }

    fn transactions(&self, sequences: impl IntoIterator<Item = u64>) -> Result<Vec<Transaction>> {
        sequences
            .into_iter()
            .map(|sequence| {
                self.read(CF_TRANSACTIONS, sequence.to_be_bytes())?
                    .ok_or_else(|| EscrowError::internal(format!("ledger index points at missing row {sequence}")))
            })
            .collect()
    }

    fn put_order(
        &self,
        batch: &mut WriteBatch,
        order: &Order,
        replay: Option<(IdempotencyKey, EventKind)>,
    ) -> Result<()> {
        batch.put_cf(self.cf(CF_ORDERS)?, order.id.as_bytes(), encode(order)?);
        if let Some((key, event)) = replay {
            let record = ReplayRecord {
                event,
                order: order.clone(),
            };
            batch.put_cf(self.cf(CF_REPLAYS)?, key.as_str(), encode(&record)?);
        }
        Ok(())
    }

    fn put_transaction(&self, batch: &mut WriteBatch, transaction: &Transaction) -> Result<()> {
        let sequence = transaction.sequence.to_be_bytes();
        batch.put_cf(self.cf(CF_TRANSACTIONS)?, sequence, encode(transaction)?);
        batch.put_cf(
            self.cf(CF_TRANSACTION_KEYS)?,
            transaction.idempotency_key.as_str(),
            sequence,
        );
        batch.put_cf(
            self.cf(CF_WALLET_HISTORY)?,
            with_sequence(&wallet_prefix(&transaction.wallet), transaction.sequence),
            b"",
        );
        if let Some(order) = transaction.order {
            batch.put_cf(
                self.cf(CF_ORDER_TRANSACTIONS)?,
                with_sequence(order.as_bytes(), transaction.sequence),
                b"",
            );
        }
        Ok(())
    }

    fn check(&self, changes: &ChangeSet) -> Result<()> {
        match &changes.order {
            Some(OrderWrite::Insert { order, .. }) => {
                if self.read::<Order>(CF_ORDERS, order.id.as_bytes())?.is_some() {
                    return Err(EscrowError::internal(format!("order {} already stored", order.id)));
                }
            }
            Some(OrderWrite::Swap {
                order,
                expected_version,
                ..
            }) => {
                let stored: Order = self
                    .read(CF_ORDERS, order.id.as_bytes())?
                    .ok_or_else(|| EscrowError::not_found("order", order.id))?;
                if stored.version != *expected_version {
                    return Err(EscrowError::Contention {
                        resource: format!("order {}", order.id),
                    });
                }
            }
            None => {}
        }

        match &changes.payout {
            Some(PayoutWrite::Insert(payout)) => {
                if self.read::<PayoutRequest>(CF_PAYOUTS, payout.id.as_bytes())?.is_some() {
                    return Err(EscrowError::internal(format!("payout {} already stored", payout.id)));
                }
            }
            Some(PayoutWrite::Update(payout)) => {
                if self.read::<PayoutRequest>(CF_PAYOUTS, payout.id.as_bytes())?.is_none() {
                    return Err(EscrowError::not_found("payout", payout.id));
                }
            }
            None => {}
        }

        for tx in &changes.transactions {
            let key = &tx.idempotency_key;
            if self.db.get_pinned_cf(self.cf(CF_TRANSACTION_KEYS)?, key.as_str())?.is_some() {
                return Err(EscrowError::DuplicateTransaction { key: key.clone() });
            }
        }
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| EscrowError::internal(format!("Serialization error: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| EscrowError::internal(format!("Deserialization error: {e}")))
}

fn sequence_suffix(key: &[u8]) -> Result<u64> {
    key.len()
        .checked_sub(8)
        .and_then(|start| key[start..].try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| EscrowError::internal("malformed index key"))
}

fn wallet_prefix(wallet: &WalletId) -> Vec<u8> {
    let mut prefix = wallet.as_str().as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn with_sequence(prefix: &[u8], sequence: u64) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

#[async_trait]
impl UnitOfWork for RocksDbStore {
    async fn commit(&self, changes: ChangeSet) -> Result<()> {
        let _writes = self.writes.lock().await;
        self.check(&changes)?;

        let mut batch = WriteBatch::default();
        match changes.order {
            Some(OrderWrite::Insert { order, replay_key }) => {
                self.put_order(&mut batch, &order, replay_key.map(|key| (key, EventKind::Create)))?;
            }
            Some(OrderWrite::Swap { order, replay, .. }) => {
                self.put_order(&mut batch, &order, replay)?;
            }
            None => {}
        }
        if let Some(PayoutWrite::Insert(payout) | PayoutWrite::Update(payout)) = &changes.payout {
            batch.put_cf(self.cf(CF_PAYOUTS)?, payout.id.as_bytes(), encode(payout)?);
        }
        for transaction in &changes.transactions {
            self.put_transaction(&mut batch, transaction)?;
        }
        for wallet in &changes.wallets {
            batch.put_cf(self.cf(CF_WALLETS)?, wallet.id.as_str(), encode(wallet)?);
        }
        self.db.write(batch)?;
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for RocksDbStore {
    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        self.read(CF_ORDERS, id.as_bytes())
    }

    async fn replay(&self, key: &IdempotencyKey) -> Result<Option<ReplayRecord>> {
        self.read(CF_REPLAYS, key.as_str())
    }

    async fn next_order_number(&self, date: NaiveDate) -> Result<u32> {
        let _writes = self.writes.lock().await;
        let key = date.format("%Y%m%d").to_string();
        let next = self.read::<u32>(CF_ORDER_NUMBERS, &key)?.unwrap_or(0) + 1;
        self.db.put_cf(self.cf(CF_ORDER_NUMBERS)?, &key, encode(&next)?)?;
        Ok(next)
    }

    async fn open_disputes(&self, provider: &UserId) -> Result<usize> {
        let orders: Vec<Order> = self.scan(CF_ORDERS)?;
        Ok(orders
            .iter()
            .filter(|order| &order.provider == provider && order.status == OrderStatus::Disputed)
            .count())
    }
}

#[async_trait]
impl LedgerRepository for RocksDbStore {
    async fn wallet(&self, id: &WalletId) -> Result<Option<Wallet>> {
        self.read(CF_WALLETS, id.as_str())
    }

    async fn wallets(&self) -> Result<Vec<Wallet>> {
        self.scan(CF_WALLETS)
    }

    async fn by_key(&self, key: &IdempotencyKey) -> Result<Option<Transaction>> {
        match self.db.get_cf(self.cf(CF_TRANSACTION_KEYS)?, key.as_str())? {
            Some(sequence) => self.read(CF_TRANSACTIONS, sequence),
            None => Ok(None),
        }
    }

    async fn history(
        &self,
        wallet: &WalletId,
        before: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let prefix = wallet_prefix(wallet);
        let start = match before {
            Some(0) => return Ok(Vec::new()),
            Some(before) => with_sequence(&prefix, before - 1),
            None => with_sequence(&prefix, u64::MAX),
        };

        let mut sequences = Vec::with_capacity(limit);
        for item in self.db.iterator_cf(
            self.cf(CF_WALLET_HISTORY)?,
            IteratorMode::From(start.as_slice(), Direction::Reverse),
        ) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) || sequences.len() == limit {
                break;
            }
            sequences.push(sequence_suffix(&key)?);
        }
        self.transactions(sequences)
    }

    async fn for_order(&self, order: OrderId) -> Result<Vec<Transaction>> {
        let sequences = self.indexed(CF_ORDER_TRANSACTIONS, order.as_bytes())?;
        self.transactions(sequences)
    }

    async fn next_sequence(&self) -> Result<u64> {
        Ok(self.ledger_sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl PayoutRepository for RocksDbStore {
    async fn get(&self, id: PayoutId) -> Result<Option<PayoutRequest>> {
        self.read(CF_PAYOUTS, id.as_bytes())
    }

    async fn for_wallet(&self, wallet: &WalletId) -> Result<Vec<PayoutRequest>> {
        let mut payouts: Vec<PayoutRequest> = self.scan(CF_PAYOUTS)?;
        payouts.retain(|p| &p.wallet == wallet);
        payouts.sort_by_key(|p| p.requested_at);
        Ok(payouts)
    }

    async fn with_status(&self, status: PayoutStatus) -> Result<Vec<PayoutRequest>> {
        let mut payouts: Vec<PayoutRequest> = self.scan(CF_PAYOUTS)?;
        payouts.retain(|p| p.status == status);
        payouts.sort_by_key(|p| p.requested_at);
        Ok(payouts)
    }
}

#[async_trait]
impl TimelineRepository for RocksDbStore {
    async fn append(&self, entry: TimelineEntry) -> Result<()> {
        let sequence = self.timeline_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_TIMELINE)?, sequence.to_be_bytes(), encode(&entry)?);
        batch.put_cf(
            self.cf(CF_ORDER_TIMELINE)?,
            with_sequence(entry.order.as_bytes(), sequence),
            b"",
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn for_order(&self, order: OrderId) -> Result<Vec<TimelineEntry>> {
        self.indexed(CF_ORDER_TIMELINE, order.as_bytes())?
            .into_iter()
            .map(|sequence| {
                self.read(CF_TIMELINE, sequence.to_be_bytes())?
                    .ok_or_else(|| EscrowError::internal(format!("timeline index points at missing entry {sequence}")))
            })
            .collect()
    }
}
