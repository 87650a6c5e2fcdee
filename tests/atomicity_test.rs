mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::*;
use escrow_ledger::application::marketplace::{Marketplace, Stores};
use escrow_ledger::application::orders::DisputeOutcome;
use escrow_ledger::config::Settings;
use escrow_ledger::domain::money::Money;
use escrow_ledger::domain::order::OrderStatus;
use escrow_ledger::domain::ports::{ChangeSet, OrderWrite, PayoutWrite, UnitOfWork};
use escrow_ledger::error::{EscrowError, Result};
use escrow_ledger::infrastructure::in_memory::{InMemoryStore, InMemoryTimelineRepository};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fails the next `remaining` commits accepted by `matches` with an I/O
/// error and passes everything else through.
struct FailingCommits {
    inner: Arc<InMemoryStore>,
    remaining: AtomicUsize,
    matches: fn(&ChangeSet) -> bool,
}

#[async_trait]
impl UnitOfWork for FailingCommits {
    async fn commit(&self, changes: ChangeSet) -> Result<()> {
        let fail = (self.matches)(&changes)
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            return Err(EscrowError::IoError(std::io::Error::other("disk full")));
        }
        self.inner.commit(changes).await
    }
}

fn failing_market(failures: usize, matches: fn(&ChangeSet) -> bool) -> Marketplace {
    let store = Arc::new(InMemoryStore::new());
    let unit = FailingCommits {
        inner: store.clone(),
        remaining: AtomicUsize::new(failures),
        matches,
    };
    let stores = Stores {
        unit: Arc::new(unit),
        orders: store.clone(),
        ledger: store.clone(),
        payouts: store,
        timeline: Arc::new(InMemoryTimelineRepository::new()),
    };
    marketplace_over(stores, &Settings::default())
}

fn order_swap(changes: &ChangeSet) -> bool {
    matches!(changes.order, Some(OrderWrite::Swap { .. })) && !changes.transactions.is_empty()
}

fn order_insert(changes: &ChangeSet) -> bool {
    matches!(changes.order, Some(OrderWrite::Insert { .. }))
}

fn payout_insert(changes: &ChangeSet) -> bool {
    matches!(changes.payout, Some(PayoutWrite::Insert(_)))
}

#[tokio::test]
async fn test_failed_approve_moves_no_money() {
    let market = failing_market(1, order_swap);
    let order = delivered(&market, 10_000).await;

    let result = market.orders.approve(&customer(), order.id).await;
    assert!(matches!(result, Err(EscrowError::IoError(_))));

    let stored = market.orders.get(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Delivered);
    let balance = market.ledger.balance(&wallet(PROVIDER)).await.unwrap();
    assert_eq!(balance.available, Money::ZERO);
    assert_eq!(balance.pending, Money::new(10_000));
    assert_eq!(market.ledger.transactions_for_order(order.id).await.unwrap().len(), 1);

    // the escrow is still there for the dispute path
    market.orders.dispute(&customer(), order.id, None).await.unwrap();
    let refunded = market
        .orders
        .resolve_dispute(&admin(), order.id, DisputeOutcome::Refund)
        .await
        .unwrap();
    assert_eq!(refunded.status, OrderStatus::Refunded);
    let balance = market.ledger.balance(&wallet(PROVIDER)).await.unwrap();
    assert_eq!(balance.total(), Money::ZERO);
    assert_balanced(&market).await;
}

#[tokio::test]
async fn test_approve_succeeds_after_failed_commit() {
    let market = failing_market(1, order_swap);
    let order = delivered(&market, 10_000).await;

    assert!(market.orders.approve(&customer(), order.id).await.is_err());
    let completed = market.orders.approve(&customer(), order.id).await.unwrap();

    assert_eq!(completed.status, OrderStatus::Completed);
    let balance = market.ledger.balance(&wallet(PROVIDER)).await.unwrap();
    assert_eq!(balance.available, Money::new(10_000));
    assert_eq!(market.ledger.transactions_for_order(order.id).await.unwrap().len(), 2);
    assert_balanced(&market).await;
}

#[tokio::test]
async fn test_failed_create_leaves_no_charge() {
    let market = failing_market(1, order_insert);

    let result = market.orders.create(&customer(), new_order(10_000)).await;
    assert!(matches!(result, Err(EscrowError::IoError(_))));
    assert!(market.ledger.wallets().await.unwrap().is_empty());

    let order = create(&market, 10_000).await;
    let balance = market.ledger.balance(&order.wallet()).await.unwrap();
    assert_eq!(balance.pending, Money::new(10_000));
    assert_balanced(&market).await;
}

#[tokio::test]
async fn test_failed_payout_request_keeps_available_balance() {
    let market = failing_market(1, payout_insert);
    let order = delivered(&market, 20_000).await;
    market.orders.approve(&customer(), order.id).await.unwrap();

    assert!(market.payouts.run(Utc::now()).await.is_err());
    let balance = market.ledger.balance(&wallet(PROVIDER)).await.unwrap();
    assert_eq!(balance.available, Money::new(20_000));
    assert!(market.payouts.payouts_for(&wallet(PROVIDER)).await.unwrap().is_empty());

    let run = market.payouts.run(Utc::now()).await.unwrap();
    assert_eq!(run.created.len(), 1);
    assert_eq!(run.created[0].amount.value(), 20_000);
    assert_balanced(&market).await;
}
