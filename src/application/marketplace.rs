use super::ledger::LedgerStore;
use super::orders::OrderStateMachine;
use super::payouts::PayoutScheduler;
use super::timeline::TimelineRecorder;
use crate::config::Settings;
use crate::domain::ports::{
    LedgerRepositoryRef, OrderRepositoryRef, PackageCatalogRef, PayoutRepositoryRef,
    TimelineRepositoryRef, UnitOfWorkRef,
};
use crate::domain::timeline::TimelineEntry;
use crate::infrastructure::in_memory::{InMemoryStore, InMemoryTimelineRepository};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The persistence ports of one backend. Every write goes through `unit`.
#[derive(Clone)]
pub struct Stores {
    pub unit: UnitOfWorkRef,
    pub orders: OrderRepositoryRef,
    pub ledger: LedgerRepositoryRef,
    pub payouts: PayoutRepositoryRef,
    pub timeline: TimelineRepositoryRef,
}

impl Stores {
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            unit: store.clone(),
            orders: store.clone(),
            ledger: store.clone(),
            payouts: store,
            timeline: Arc::new(InMemoryTimelineRepository::new()),
        }
    }
}

pub struct Marketplace {
    pub orders: OrderStateMachine,
    pub ledger: Arc<LedgerStore>,
    pub payouts: PayoutScheduler,
    pub timeline: Arc<TimelineRecorder>,
}

impl Marketplace {
    pub fn new(stores: Stores, catalog: PackageCatalogRef, settings: &Settings) -> Self {
        let timeline = TimelineRecorder::new(stores.timeline.clone());
        Self::assemble(stores, catalog, settings, timeline)
    }

    /// Like [`Marketplace::new`], also returning the notification stream.
    pub fn with_notifications(
        stores: Stores,
        catalog: PackageCatalogRef,
        settings: &Settings,
    ) -> (Self, mpsc::Receiver<TimelineEntry>) {
        let (timeline, rx) = TimelineRecorder::with_notifications(
            stores.timeline.clone(),
            settings.notifications.capacity,
        );
        (Self::assemble(stores, catalog, settings, timeline), rx)
    }

    fn assemble(
        stores: Stores,
        catalog: PackageCatalogRef,
        settings: &Settings,
        timeline: TimelineRecorder,
    ) -> Self {
        let ledger = Arc::new(LedgerStore::new(
            stores.ledger.clone(),
            stores.unit.clone(),
            settings.currency.clone(),
            settings.locks.timeout(),
        ));
        let timeline = Arc::new(timeline);
        let orders = OrderStateMachine::new(&stores, catalog, ledger.clone(), timeline.clone(), settings);
        let payouts = PayoutScheduler::new(&stores, ledger.clone(), settings);

        Self {
            orders,
            ledger,
            payouts,
            timeline,
        }
    }
}
