use super::locks::KeyedLocks;
use crate::domain::money::Money;
use crate::domain::order::OrderId;
use crate::domain::ports::{ChangeSet, LedgerRepositoryRef, UnitOfWorkRef};
use crate::domain::transaction::{NewTransaction, Transaction};
use crate::domain::wallet::{Wallet, WalletId};
use crate::error::{EscrowError, Result};
use chrono::Utc;
use futures::stream::{self, Stream, TryStreamExt};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

const MAX_PAGE: usize = 500;

/// Proof that the caller holds a wallet's lock.
pub struct WalletGuard {
    wallet: WalletId,
    _guard: OwnedMutexGuard<()>,
}

impl WalletGuard {
    pub fn wallet(&self) -> &WalletId {
        &self.wallet
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    Posted(Transaction),
    /// A retry of an earlier posting; nothing was written.
    Replayed(Transaction),
}

impl PostOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            PostOutcome::Posted(tx) | PostOutcome::Replayed(tx) => tx,
        }
    }

    pub fn into_transaction(self) -> Transaction {
        match self {
            PostOutcome::Posted(tx) | PostOutcome::Replayed(tx) => tx,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, PostOutcome::Replayed(_))
    }
}

/// Cursor into a wallet's history. `before: None` starts at the newest row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub before: Option<u64>,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            before: None,
            limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub transactions: Vec<Transaction>,
    /// Pass back to continue; `None` once the oldest row has been returned.
    pub next: Option<PageRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub wallet: Wallet,
    pub ledger_total: Money,
    pub rows: usize,
}

impl Reconciliation {
    pub fn is_balanced(&self) -> bool {
        self.wallet.total() == self.ledger_total
    }
}

/// Append-only transactions plus cached wallet balances.
///
/// Rows for a wallet are only staged while its lock is held, and reach
/// storage in the same commit as the wallet snapshot they produce.
pub struct LedgerStore {
    repo: LedgerRepositoryRef,
    unit: UnitOfWorkRef,
    locks: KeyedLocks<WalletId>,
    currency: String,
}

impl LedgerStore {
    pub fn new(
        repo: LedgerRepositoryRef,
        unit: UnitOfWorkRef,
        currency: impl Into<String>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            unit,
            locks: KeyedLocks::new("wallet", lock_timeout),
            currency: currency.into(),
        }
    }

    pub async fn lock_wallet(&self, wallet: &WalletId) -> Result<WalletGuard> {
        let guard = self.locks.acquire(wallet).await?;
        Ok(WalletGuard {
            wallet: wallet.clone(),
            _guard: guard,
        })
    }

    /// Posts a transaction, serialized with every other posting to its wallet.
    pub async fn post(&self, request: NewTransaction) -> Result<PostOutcome> {
        let guard = self.lock_wallet(&request.wallet).await?;
        self.post_locked(&guard, request).await
    }

    /// Posts while the caller already holds the wallet lock, so a read of
    /// the balance and the posting that depends on it form one unit.
    pub async fn post_locked(&self, guard: &WalletGuard, request: NewTransaction) -> Result<PostOutcome> {
        let (changes, mut outcomes) = self.stage(guard, vec![request]).await?;
        if !changes.is_empty() {
            self.unit.commit(changes).await?;
        }
        let outcome = outcomes
            .pop()
            .ok_or_else(|| EscrowError::internal("staging returned no outcome"))?;
        if let PostOutcome::Posted(tx) = &outcome {
            info!(
                wallet = %tx.wallet,
                kind = %tx.kind,
                amount = %tx.amount,
                escrow = %tx.escrow,
                total = %tx.balance_after,
                "posted ledger transaction"
            );
        }
        Ok(outcome)
    }

    /// Turns `requests` into rows against the wallet's current balance
    /// without writing anything. The caller commits the returned changes,
    /// usually together with the order or payout they belong to, before
    /// releasing `guard`.
    ///
    /// A request whose key already holds the same row comes back as
    /// [`PostOutcome::Replayed`] and adds nothing to the changes.
    pub async fn stage(
        &self,
        guard: &WalletGuard,
        requests: Vec<NewTransaction>,
    ) -> Result<(ChangeSet, Vec<PostOutcome>)> {
        let now = Utc::now();
        let mut wallet = self.balance(&guard.wallet).await?;
        let mut changes = ChangeSet::default();
        let mut outcomes = Vec::with_capacity(requests.len());

        for request in requests {
            if guard.wallet != request.wallet {
                return Err(EscrowError::internal(format!(
                    "posting to wallet {} under the lock of wallet {}",
                    request.wallet, guard.wallet
                )));
            }

            if let Some(prior) = self.repo.by_key(&request.idempotency_key).await? {
                if prior.is_retry_of(&request) {
                    debug!(key = %request.idempotency_key, "replayed ledger posting");
                    outcomes.push(PostOutcome::Replayed(prior));
                    continue;
                }
                return Err(EscrowError::DuplicateTransaction {
                    key: request.idempotency_key,
                });
            }

            wallet.apply(&request, now)?;
            let sequence = self.repo.next_sequence().await?;
            let transaction = Transaction::record(request, sequence, wallet.total(), now);
            changes.transactions.push(transaction.clone());
            outcomes.push(PostOutcome::Posted(transaction));
        }

        if !changes.transactions.is_empty() {
            changes.wallets.push(wallet);
        }
        Ok((changes, outcomes))
    }

    /// Current available/pending split. Unknown wallets read as empty.
    pub async fn balance(&self, wallet: &WalletId) -> Result<Wallet> {
        Ok(self
            .repo
            .wallet(wallet)
            .await?
            .unwrap_or_else(|| Wallet::new(wallet.clone(), self.currency.as_str())))
    }

    pub async fn wallets(&self) -> Result<Vec<Wallet>> {
        self.repo.wallets().await
    }

    pub async fn transactions_for_order(&self, order: OrderId) -> Result<Vec<Transaction>> {
        self.repo.for_order(order).await
    }

    /// One page of a wallet's history, newest first.
    pub async fn history(&self, wallet: &WalletId, page: PageRequest) -> Result<HistoryPage> {
        if page.limit == 0 {
            return Err(EscrowError::ValidationError(
                "page limit must be at least 1".to_string(),
            ));
        }
        let limit = page.limit.min(MAX_PAGE);

        let mut transactions = self.repo.history(wallet, page.before, limit + 1).await?;
        let next = if transactions.len() > limit {
            transactions.truncate(limit);
            transactions.last().map(|tx| PageRequest {
                before: Some(tx.sequence),
                limit,
            })
        } else {
            None
        };

        Ok(HistoryPage { transactions, next })
    }

    /// Lazily walks the whole history from `start`, fetching one page at a
    /// time. Restart from any cursor a previous page returned.
    pub fn history_stream(
        &self,
        wallet: WalletId,
        start: PageRequest,
    ) -> impl Stream<Item = Result<Transaction>> + '_ {
        stream::try_unfold(Some(start), move |cursor| {
            let wallet = wallet.clone();
            async move {
                let Some(page) = cursor else {
                    return Ok::<_, EscrowError>(None);
                };
                let page = self.history(&wallet, page).await?;
                Ok(Some((page.transactions, page.next)))
            }
        })
        .map_ok(|rows| stream::iter(rows.into_iter().map(Ok)))
        .try_flatten()
    }

    /// Recomputes the wallet total from its rows.
    pub async fn reconcile(&self, wallet: &WalletId) -> Result<Reconciliation> {
        let guard = self.lock_wallet(wallet).await?;
        let rows: Vec<Transaction> = self
            .history_stream(guard.wallet().clone(), PageRequest::first(MAX_PAGE))
            .try_collect()
            .await?;
        let snapshot = self.balance(wallet).await?;

        Ok(Reconciliation {
            wallet: snapshot,
            ledger_total: rows.iter().map(|tx| tx.amount).sum(),
            rows: rows.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::actor::UserId;
    use crate::domain::money::Amount;
    use crate::domain::payout::PayoutId;
    use crate::infrastructure::in_memory::InMemoryStore;
    use std::sync::Arc;

    fn store() -> LedgerStore {
        let storage = Arc::new(InMemoryStore::new());
        LedgerStore::new(
            storage.clone(),
            storage,
            "USD",
            Duration::from_millis(200),
        )
    }

    fn wallet() -> WalletId {
        WalletId::for_provider(&UserId::new("prov-1"))
    }

    #[tokio::test]
    async fn test_post_updates_balance() {
        let store = store();
        let order = OrderId::new();
        store
            .post(NewTransaction::charge(wallet(), order, Amount::new(10_000).unwrap()))
            .await
            .unwrap();

        let balance = store.balance(&wallet()).await.unwrap();
        assert_eq!(balance.pending, Money::new(10_000));
        assert_eq!(balance.available, Money::ZERO);
    }

    #[tokio::test]
    async fn test_true_retry_is_replayed() {
        let store = store();
        let charge = NewTransaction::charge(wallet(), OrderId::new(), Amount::new(700).unwrap());

        let first = store.post(charge.clone()).await.unwrap();
        let second = store.post(charge).await.unwrap();

        assert!(!first.is_replay());
        assert!(second.is_replay());
        assert_eq!(first.transaction(), second.transaction());
        assert_eq!(store.balance(&wallet()).await.unwrap().pending, Money::new(700));
    }

    #[tokio::test]
    async fn test_reused_key_with_other_payload_is_rejected() {
        let store = store();
        let order = OrderId::new();
        store
            .post(NewTransaction::charge(wallet(), order, Amount::new(700).unwrap()))
            .await
            .unwrap();

        let result = store
            .post(NewTransaction::charge(wallet(), order, Amount::new(900).unwrap()))
            .await;
        assert!(matches!(result, Err(EscrowError::DuplicateTransaction { .. })));
        assert_eq!(store.balance(&wallet()).await.unwrap().pending, Money::new(700));
    }

    #[tokio::test]
    async fn test_overdraft_leaves_no_row() {
        let store = store();
        let result = store
            .post(NewTransaction::payout(wallet(), PayoutId::new(), Amount::new(1).unwrap()))
            .await;
        assert!(matches!(result, Err(EscrowError::InsufficientBalance { .. })));

        let page = store.history(&wallet(), PageRequest::first(10)).await.unwrap();
        assert!(page.transactions.is_empty());
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_history_pages_newest_first() {
        let store = store();
        for price in 1..=5 {
            store
                .post(NewTransaction::charge(wallet(), OrderId::new(), Amount::new(price).unwrap()))
                .await
                .unwrap();
        }

        let first = store.history(&wallet(), PageRequest::first(2)).await.unwrap();
        let amounts: Vec<i64> = first.transactions.iter().map(|tx| tx.amount.minor_units()).collect();
        assert_eq!(amounts, vec![5, 4]);

        let second = store.history(&wallet(), first.next.unwrap()).await.unwrap();
        let amounts: Vec<i64> = second.transactions.iter().map(|tx| tx.amount.minor_units()).collect();
        assert_eq!(amounts, vec![3, 2]);

        let third = store.history(&wallet(), second.next.unwrap()).await.unwrap();
        assert_eq!(third.transactions.len(), 1);
        assert!(third.next.is_none());
    }

    #[tokio::test]
    async fn test_history_stream_restarts_from_cursor() {
        let store = store();
        for price in 1..=7 {
            store
                .post(NewTransaction::charge(wallet(), OrderId::new(), Amount::new(price).unwrap()))
                .await
                .unwrap();
        }

        let all: Vec<Transaction> = store
            .history_stream(wallet(), PageRequest::first(3))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 7);
        assert!(all.windows(2).all(|w| w[0].sequence > w[1].sequence));

        let resumed: Vec<Transaction> = store
            .history_stream(
                wallet(),
                PageRequest {
                    before: Some(all[2].sequence),
                    limit: 3,
                },
            )
            .try_collect()
            .await
            .unwrap();
        assert_eq!(resumed, all[3..].to_vec());
    }

    #[tokio::test]
    async fn test_stage_writes_nothing_until_committed() {
        let store = store();
        let order = OrderId::new();
        let price = Amount::new(500).unwrap();
        let guard = store.lock_wallet(&wallet()).await.unwrap();

        let (changes, outcomes) = store
            .stage(
                &guard,
                vec![
                    NewTransaction::charge(wallet(), order, price),
                    NewTransaction::release(wallet(), order, price),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(changes.transactions.len(), 2);
        assert_eq!(changes.wallets[0].available, Money::new(500));
        assert_eq!(store.balance(&wallet()).await.unwrap().total(), Money::ZERO);

        store.unit.commit(changes).await.unwrap();
        assert_eq!(store.balance(&wallet()).await.unwrap().available, Money::new(500));
    }

    #[tokio::test]
    async fn test_concurrent_posts_keep_balance_invariant() {
        let store = Arc::new(store());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .post(NewTransaction::charge(wallet(), OrderId::new(), Amount::new(100).unwrap()))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let reconciliation = store.reconcile(&wallet()).await.unwrap();
        assert!(reconciliation.is_balanced());
        assert_eq!(reconciliation.rows, 32);
        assert_eq!(reconciliation.ledger_total, Money::new(3_200));
    }
}
