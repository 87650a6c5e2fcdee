use super::ledger::LedgerStore;
use super::locks::KeyedLocks;
use super::marketplace::Stores;
use crate::config::Settings;
use crate::domain::money::{Amount, Money};
use crate::domain::payout::{PayoutId, PayoutOutcome, PayoutRequest, PayoutStatus, Settlement};
use crate::domain::ports::{
    ChangeSet, OrderRepositoryRef, PayoutGateway, PayoutRepositoryRef, PayoutWrite, UnitOfWorkRef,
};
use crate::domain::transaction::NewTransaction;
use crate::domain::wallet::{Wallet, WalletId};
use crate::error::{EscrowError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a wallet got no payout in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    BelowThreshold,
    /// One of the provider's orders is disputed.
    DisputeHold,
    /// A previous payout is still requested or processing.
    OpenPayout,
}

#[derive(Debug, Default)]
pub struct PayoutRun {
    pub created: Vec<PayoutRequest>,
    pub skipped: Vec<(WalletId, SkipReason)>,
}

/// Batches available wallet balances into payout requests and applies the
/// gateway's reports.
pub struct PayoutScheduler {
    unit: UnitOfWorkRef,
    ledger: Arc<LedgerStore>,
    orders: OrderRepositoryRef,
    payouts: PayoutRepositoryRef,
    /// Held by the dispatcher that is submitting a payout.
    claims: KeyedLocks<PayoutId>,
    threshold: Money,
}

impl PayoutScheduler {
    pub fn new(stores: &Stores, ledger: Arc<LedgerStore>, settings: &Settings) -> Self {
        Self {
            unit: stores.unit.clone(),
            ledger,
            orders: stores.orders.clone(),
            payouts: stores.payouts.clone(),
            claims: KeyedLocks::new("payout", settings.locks.timeout()),
            threshold: settings.payouts.threshold(),
        }
    }

    /// Drains every eligible wallet's available balance into a `requested`
    /// payout. Each drain runs under the wallet lock and commits the payout
    /// row with its request.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<PayoutRun> {
        let mut run = PayoutRun::default();

        for wallet in self.ledger.wallets().await? {
            if !self.eligible(&wallet) {
                run.skipped.push((wallet.id, SkipReason::BelowThreshold));
                continue;
            }
            if self.orders.open_disputes(wallet.provider()).await? > 0 {
                debug!(wallet = %wallet.id, "payout held by open dispute");
                run.skipped.push((wallet.id, SkipReason::DisputeHold));
                continue;
            }

            let guard = self.ledger.lock_wallet(&wallet.id).await?;
            let open = self.payouts.for_wallet(&wallet.id).await?;
            if open.iter().any(|payout| payout.status.is_open()) {
                run.skipped.push((wallet.id, SkipReason::OpenPayout));
                continue;
            }

            // re-read under the lock; the listing may be stale
            let current = self.ledger.balance(&wallet.id).await?;
            let amount = match Amount::try_from(current.available) {
                Ok(amount) if self.eligible(&current) => amount,
                _ => {
                    run.skipped.push((wallet.id, SkipReason::BelowThreshold));
                    continue;
                }
            };

            let request = PayoutRequest::new(wallet.id.clone(), amount, now);
            let payout_row = NewTransaction::payout(wallet.id.clone(), request.id, amount);
            let (changes, _) = self.ledger.stage(&guard, vec![payout_row]).await?;
            self.unit
                .commit(changes.with_payout(PayoutWrite::Insert(request.clone())))
                .await?;
            drop(guard);

            info!(payout = %request.id, wallet = %wallet.id, %amount, "payout requested");
            run.created.push(request);
        }

        Ok(run)
    }

    /// Hands `requested` payouts to the gateway. A rejected submission stays
    /// `requested` and is picked up by the next dispatch.
    ///
    /// The gateway call runs without the wallet lock. A payout another
    /// dispatcher is already submitting is skipped.
    pub async fn dispatch(&self, gateway: &dyn PayoutGateway) -> Result<Vec<PayoutRequest>> {
        let mut dispatched = Vec::new();

        for queued in self.payouts.with_status(PayoutStatus::Requested).await? {
            let Some(_claim) = self.claims.try_acquire(&queued.id) else {
                debug!(payout = %queued.id, "payout already being submitted");
                continue;
            };
            let payout = self.get(queued.id).await?;
            if payout.status != PayoutStatus::Requested {
                continue;
            }

            let reference = match gateway.submit(&payout).await {
                Ok(reference) => reference,
                Err(e) => {
                    warn!(payout = %payout.id, error = %e, "gateway rejected payout");
                    continue;
                }
            };

            let _guard = self.ledger.lock_wallet(&payout.wallet).await?;
            let mut payout = self.get(payout.id).await?;
            if payout.status != PayoutStatus::Requested {
                // settled while the submission was in flight
                debug!(payout = %payout.id, status = %payout.status, "payout moved on during submission");
                continue;
            }
            payout.begin_processing(reference)?;
            self.unit
                .commit(ChangeSet::default().with_payout(PayoutWrite::Update(payout.clone())))
                .await?;
            info!(payout = %payout.id, "payout dispatched");
            dispatched.push(payout);
        }

        Ok(dispatched)
    }

    /// Applies a gateway report. A failed payout credits its amount back to
    /// the wallet's available bucket in the same commit.
    pub async fn report(&self, id: PayoutId, outcome: PayoutOutcome) -> Result<PayoutRequest> {
        let wallet = self.get(id).await?.wallet;
        let guard = self.ledger.lock_wallet(&wallet).await?;

        let mut payout = self.get(id).await?;
        if payout.settle(&outcome, Utc::now())? == Settlement::Replayed {
            debug!(payout = %id, status = %payout.status, "payout report replayed");
            return Ok(payout);
        }

        let postings = match &outcome {
            PayoutOutcome::Failed { reason } => {
                warn!(payout = %id, %reason, "payout failed, crediting wallet");
                vec![NewTransaction::payout_reversal(wallet, id, payout.amount)]
            }
            PayoutOutcome::Paid { .. } => Vec::new(),
        };
        let (changes, _) = self.ledger.stage(&guard, postings).await?;
        self.unit
            .commit(changes.with_payout(PayoutWrite::Update(payout.clone())))
            .await?;
        drop(guard);

        info!(payout = %id, status = %payout.status, "payout settled");
        Ok(payout)
    }

    pub async fn get(&self, id: PayoutId) -> Result<PayoutRequest> {
        self.payouts
            .get(id)
            .await?
            .ok_or_else(|| EscrowError::not_found("payout", id))
    }

    pub async fn payouts_for(&self, wallet: &WalletId) -> Result<Vec<PayoutRequest>> {
        self.payouts.for_wallet(wallet).await
    }

    fn eligible(&self, wallet: &Wallet) -> bool {
        wallet.available.is_positive() && wallet.available >= self.threshold
    }
}
