use super::ledger::{LedgerStore, WalletGuard};
use super::locks::{KeyedLocks, retry_on_contention};
use super::marketplace::Stores;
use super::timeline::TimelineRecorder;
use crate::config::{FeeSchedule, LockSettings, OrderSettings, Settings};
use crate::domain::actor::{Actor, Role, UserId};
use crate::domain::money::Amount;
use crate::domain::order::{Action, Order, OrderDraft, OrderId, OrderStatus, Party, order_number};
use crate::domain::package::{PackageId, ServicePackage};
use crate::domain::ports::{ChangeSet, OrderRepositoryRef, OrderWrite, PackageCatalogRef, UnitOfWorkRef};
use crate::domain::timeline::{EventKind, TimelineEntry};
use crate::domain::transaction::{IdempotencyKey, NewTransaction};
use crate::error::{EscrowError, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Caller identity plus the optional key that makes the call idempotent.
#[derive(Debug, Clone)]
pub struct Request {
    pub actor: Actor,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl Request {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<IdempotencyKey>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer: UserId,
    pub provider: UserId,
    pub package: PackageId,
    /// Minor currency units.
    pub price: i64,
}

/// Arbitration decision for a disputed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeOutcome {
    Refund,
    Complete,
}

enum Command {
    Accept,
    Start,
    Deliver { deliverable: String },
    Approve,
    RequestRevision { note: Option<String> },
    Dispute { reason: Option<String> },
    ResolveDispute(DisputeOutcome),
    Cancel,
}

impl Command {
    fn event(&self) -> EventKind {
        match self {
            Command::Accept => EventKind::Accept,
            Command::Start => EventKind::Start,
            Command::Deliver { .. } => EventKind::Deliver,
            Command::Approve => EventKind::Approve,
            Command::RequestRevision { .. } => EventKind::RequestRevision,
            Command::Dispute { .. } => EventKind::Dispute,
            Command::ResolveDispute(_) => EventKind::ResolveDispute,
            Command::Cancel => EventKind::Cancel,
        }
    }

    fn party(&self) -> Party {
        match self {
            Command::Accept | Command::Start | Command::Deliver { .. } => Party::Provider,
            Command::Approve | Command::RequestRevision { .. } => Party::Customer,
            Command::Dispute { .. } | Command::Cancel => Party::EitherParty,
            Command::ResolveDispute(_) => Party::Admin,
        }
    }

    fn route(&self, order: &Order) -> &'static [Action] {
        match self {
            Command::Accept => &[Action::Accept],
            Command::Start => &[Action::Start],
            Command::Deliver { .. } if order.status == OrderStatus::Accepted => {
                &[Action::Start, Action::Deliver]
            }
            Command::Deliver { .. } => &[Action::Deliver],
            Command::Approve => &[Action::Approve, Action::Complete],
            Command::RequestRevision { .. } => &[Action::RequestRevision, Action::Resume],
            Command::Dispute { .. } => &[Action::Dispute],
            Command::ResolveDispute(DisputeOutcome::Refund) => &[Action::ResolveRefund],
            Command::ResolveDispute(DisputeOutcome::Complete) => &[Action::ResolveComplete],
            Command::Cancel => &[Action::Cancel],
        }
    }

    fn note(&self) -> Option<String> {
        match self {
            Command::Deliver { deliverable } => Some(deliverable.clone()),
            Command::RequestRevision { note } => note.clone(),
            Command::Dispute { reason } => reason.clone(),
            _ => None,
        }
    }
}

/// Runs each operation as one unit under the order's lock: load, authorize,
/// walk the transition table on a copy, then commit the order together with
/// the ledger rows the transition moves, and append one timeline entry.
/// A rejected operation leaves nothing behind but its failed-attempt entry.
pub struct OrderStateMachine {
    unit: UnitOfWorkRef,
    orders: OrderRepositoryRef,
    catalog: PackageCatalogRef,
    ledger: Arc<LedgerStore>,
    timeline: Arc<TimelineRecorder>,
    order_locks: KeyedLocks<OrderId>,
    create_locks: KeyedLocks<IdempotencyKey>,
    settings: OrderSettings,
    fees: FeeSchedule,
    locks: LockSettings,
}

impl OrderStateMachine {
    pub fn new(
        stores: &Stores,
        catalog: PackageCatalogRef,
        ledger: Arc<LedgerStore>,
        timeline: Arc<TimelineRecorder>,
        settings: &Settings,
    ) -> Self {
        Self {
            unit: stores.unit.clone(),
            orders: stores.orders.clone(),
            catalog,
            ledger,
            timeline,
            order_locks: KeyedLocks::new("order", settings.locks.timeout()),
            create_locks: KeyedLocks::new("create request", settings.locks.timeout()),
            settings: settings.orders.clone(),
            fees: settings.fees.clone(),
            locks: settings.locks.clone(),
        }
    }

    /// Opens an order and moves the price into the provider's escrow.
    pub async fn create(&self, request: &Request, new_order: NewOrder) -> Result<Order> {
        let event = EventKind::Create;
        let _key_guard = match &request.idempotency_key {
            Some(key) => Some(self.create_locks.acquire(key).await?),
            None => None,
        };
        if let Some(order) = self.replayed(request, event, None).await? {
            return Ok(order);
        }

        let actor = &request.actor;
        if actor.role != Role::Customer || actor.id != new_order.customer {
            warn!(%actor, customer = %new_order.customer, "unauthorized order creation");
            return Err(EscrowError::UnauthorizedTransition {
                actor: actor.id.clone(),
                event,
            });
        }
        let price = Amount::new(new_order.price)?;
        let package = self.orderable_package(&new_order).await?;

        let now = Utc::now();
        let today = now.date_naive();
        let sequence = self.orders.next_order_number(today).await?;
        let delivery_days = package
            .delivery_days
            .unwrap_or(self.settings.default_delivery_days);
        let order = Order::open(
            OrderDraft {
                customer: new_order.customer,
                provider: new_order.provider,
                package: package.id,
                price,
                order_number: order_number(today, sequence),
                deadline: now + Duration::days(i64::from(delivery_days)),
            },
            now,
        );

        let guard = self.ledger.lock_wallet(&order.wallet()).await?;
        let charge = NewTransaction::charge(order.wallet(), order.id, price);
        let (changes, posted) = self.ledger.stage(&guard, vec![charge]).await?;
        let write = OrderWrite::Insert {
            order: order.clone(),
            replay_key: request.idempotency_key.clone(),
        };
        self.unit.commit(changes.with_order(write)).await?;
        drop(guard);
        let transactions: Vec<_> = posted.iter().map(|outcome| outcome.transaction().id).collect();

        info!(order = %order.id, number = %order.order_number, %price, "order created");
        self.record(
            TimelineEntry::succeeded(order.id, event, actor.id.clone(), None, order.status)
                .with_metadata(json!({
                    "order_number": order.order_number,
                    "price": order.price,
                    "deadline": order.deadline,
                    "transactions": transactions,
                })),
        )
        .await;

        Ok(order)
    }

    pub async fn accept(&self, request: &Request, order: OrderId) -> Result<Order> {
        self.execute(request, order, Command::Accept).await
    }

    pub async fn start(&self, request: &Request, order: OrderId) -> Result<Order> {
        self.execute(request, order, Command::Start).await
    }

    /// Delivering an accepted order passes through `in_progress` in the same unit.
    pub async fn deliver(
        &self,
        request: &Request,
        order: OrderId,
        deliverable: impl Into<String>,
    ) -> Result<Order> {
        let deliverable = deliverable.into();
        self.execute(request, order, Command::Deliver { deliverable })
            .await
    }

    /// Approves the delivery, completes the order and releases escrow.
    pub async fn approve(&self, request: &Request, order: OrderId) -> Result<Order> {
        self.execute(request, order, Command::Approve).await
    }

    pub async fn request_revision(
        &self,
        request: &Request,
        order: OrderId,
        note: Option<String>,
    ) -> Result<Order> {
        self.execute(request, order, Command::RequestRevision { note })
            .await
    }

    pub async fn dispute(
        &self,
        request: &Request,
        order: OrderId,
        reason: Option<String>,
    ) -> Result<Order> {
        self.execute(request, order, Command::Dispute { reason }).await
    }

    pub async fn resolve_dispute(
        &self,
        request: &Request,
        order: OrderId,
        outcome: DisputeOutcome,
    ) -> Result<Order> {
        self.execute(request, order, Command::ResolveDispute(outcome))
            .await
    }

    pub async fn cancel(&self, request: &Request, order: OrderId) -> Result<Order> {
        self.execute(request, order, Command::Cancel).await
    }

    pub async fn get(&self, order: OrderId) -> Result<Order> {
        self.orders
            .get(order)
            .await?
            .ok_or_else(|| EscrowError::not_found("order", order))
    }

    pub async fn timeline(&self, order: OrderId) -> Result<Vec<TimelineEntry>> {
        self.timeline.for_order(order).await
    }

    /// Retries `operation` on contention with the configured budget.
    pub async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_on_contention(self.locks.max_retries, self.locks.retry_backoff(), operation).await
    }

    async fn execute(&self, request: &Request, id: OrderId, command: Command) -> Result<Order> {
        let event = command.event();
        let _guard = self.order_locks.acquire(&id).await?;

        if let Some(order) = self.replayed(request, event, Some(id)).await? {
            return Ok(order);
        }

        let current = self.get(id).await?;
        if let Err(e) = current.authorize(&request.actor, command.party(), event) {
            warn!(order = %id, actor = %request.actor, %event, "unauthorized transition attempt");
            return Err(e);
        }

        match self.transition(request, &current, &command).await {
            Ok(order) => Ok(order),
            Err(e) => {
                warn!(order = %id, %event, from = %current.status, error = %e, "transition rejected");
                self.timeline
                    .record_failure(
                        TimelineEntry::failed(
                            id,
                            event,
                            request.actor.id.clone(),
                            current.status,
                            e.kind(),
                        )
                        .with_note(Some(e.to_string())),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn transition(&self, request: &Request, current: &Order, command: &Command) -> Result<Order> {
        let now = Utc::now();
        let event = command.event();
        let mut order = current.clone();
        order.advance(event, command.route(current), now)?;

        let mut metadata = json!({});
        match command {
            Command::Deliver { deliverable } => {
                order.late = now > order.deadline;
                order.deliverable = Some(deliverable.clone());
                metadata["late"] = json!(order.late);
            }
            Command::RequestRevision { .. } => {
                if current.revision_count >= self.settings.max_revisions {
                    return Err(EscrowError::RevisionLimitExceeded {
                        order: current.id,
                        max: self.settings.max_revisions,
                    });
                }
                order.revision_count += 1;
                metadata["revision"] = json!(order.revision_count);
            }
            Command::ResolveDispute(outcome) => metadata["outcome"] = json!(outcome),
            _ => {}
        }

        let postings = self.postings(command, &order);
        let guard: Option<WalletGuard> = if postings.is_empty() {
            None
        } else {
            Some(self.ledger.lock_wallet(&order.wallet()).await?)
        };
        let (changes, posted) = match &guard {
            Some(guard) => self.ledger.stage(guard, postings).await?,
            None => (ChangeSet::default(), Vec::new()),
        };
        if !posted.is_empty() {
            let ids: Vec<_> = posted.iter().map(|outcome| outcome.transaction().id).collect();
            metadata["transactions"] = json!(ids);
        }

        let write = OrderWrite::Swap {
            order: order.clone(),
            expected_version: current.version,
            replay: request.idempotency_key.clone().map(|key| (key, event)),
        };
        self.unit.commit(changes.with_order(write)).await?;
        drop(guard);

        info!(order = %order.id, %event, from = %current.status, to = %order.status, "order transition");
        self.record(
            TimelineEntry::succeeded(
                order.id,
                event,
                request.actor.id.clone(),
                Some(current.status),
                order.status,
            )
            .with_note(command.note())
            .with_metadata(metadata),
        )
        .await;

        Ok(order)
    }

    /// Ledger rows a transition moves. Their keys derive from the order, so
    /// each kind lands at most once per order.
    fn postings(&self, command: &Command, order: &Order) -> Vec<NewTransaction> {
        let wallet = order.wallet();
        match command {
            Command::Approve | Command::ResolveDispute(DisputeOutcome::Complete) => {
                let mut rows = vec![NewTransaction::release(wallet.clone(), order.id, order.price)];
                if let Ok(fee) = Amount::try_from(self.fees.fee_for(order.price)) {
                    rows.push(NewTransaction::fee(wallet, order.id, fee));
                }
                rows
            }
            Command::Cancel | Command::ResolveDispute(DisputeOutcome::Refund) => {
                vec![NewTransaction::refund(wallet, order.id, order.price)]
            }
            _ => Vec::new(),
        }
    }

    async fn orderable_package(&self, new_order: &NewOrder) -> Result<ServicePackage> {
        let invalid = |reason: &str| EscrowError::InvalidPackage {
            package: new_order.package.clone(),
            reason: reason.to_string(),
        };

        let package = self
            .catalog
            .package(&new_order.package)
            .await?
            .ok_or_else(|| invalid("unknown package"))?;
        if !package.active {
            return Err(invalid("package is inactive"));
        }
        if package.provider != new_order.provider {
            return Err(invalid("package belongs to another provider"));
        }
        Ok(package)
    }

    async fn replayed(
        &self,
        request: &Request,
        event: EventKind,
        order: Option<OrderId>,
    ) -> Result<Option<Order>> {
        let Some(key) = &request.idempotency_key else {
            return Ok(None);
        };
        let Some(record) = self.orders.replay(key).await? else {
            return Ok(None);
        };

        if record.event == event && order.is_none_or(|id| id == record.order.id) {
            debug!(%key, %event, "replayed order operation");
            Ok(Some(record.order))
        } else {
            Err(EscrowError::DuplicateTransaction { key: key.clone() })
        }
    }

    /// The transition is already committed when this runs; a failed append
    /// is reported, not rolled back.
    async fn record(&self, entry: TimelineEntry) {
        let (order, event) = (entry.order, entry.event);
        if let Err(e) = self.timeline.record(entry).await {
            error!(%order, %event, error = %e, "timeline append failed after commit");
        }
    }
}
