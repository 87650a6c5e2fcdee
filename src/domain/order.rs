use super::actor::{Actor, Role, UserId};
use super::money::Amount;
use super::package::PackageId;
use super::timeline::EventKind;
use super::wallet::WalletId;
use crate::error::{EscrowError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(Uuid);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Accepted,
    InProgress,
    Delivered,
    /// Transit state between `Delivered` and `Completed`; never persisted.
    Approved,
    /// Transit state between `Delivered` and `InProgress`; never persisted.
    RevisionRequested,
    Disputed,
    Completed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OrderStatus::Created => "created",
            OrderStatus::Accepted => "accepted",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Approved => "approved",
            OrderStatus::RevisionRequested => "revision_requested",
            OrderStatus::Disputed => "disputed",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        })
    }
}

/// Edges of the order state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Start,
    Deliver,
    Approve,
    Complete,
    RequestRevision,
    Resume,
    Dispute,
    ResolveRefund,
    ResolveComplete,
    Cancel,
}

/// The transition table. Every status change goes through
/// [`Order::advance`], which refuses a whole route if any step is missing.
pub fn transition(from: OrderStatus, action: Action) -> Option<OrderStatus> {
    use Action::*;
    use OrderStatus::*;

    match (from, action) {
        (Created, Accept) => Some(Accepted),
        (Accepted, Start) => Some(InProgress),
        (InProgress, Deliver) => Some(Delivered),
        (Delivered, Approve) => Some(Approved),
        (Approved, Complete) => Some(Completed),
        (Delivered, RequestRevision) => Some(RevisionRequested),
        (RevisionRequested, Resume) => Some(InProgress),
        (Created | Accepted | InProgress | Delivered, Dispute) => Some(Disputed),
        (Disputed, ResolveRefund) => Some(Refunded),
        (Disputed, ResolveComplete) => Some(Completed),
        (Created | Accepted, Cancel) => Some(Cancelled),
        _ => None,
    }
}

/// Who may drive an operation on an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Customer,
    Provider,
    EitherParty,
    Admin,
}

/// Everything needed to open an order; produced by the state machine's
/// `create` after the package has been validated.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub customer: UserId,
    pub provider: UserId,
    pub package: PackageId,
    pub price: Amount,
    pub order_number: String,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: String,
    pub customer: UserId,
    pub provider: UserId,
    pub package: PackageId,
    pub price: Amount,
    pub status: OrderStatus,
    pub revision_count: u32,
    pub deadline: DateTime<Utc>,
    /// Set when the order was delivered after its deadline.
    pub late: bool,
    pub deliverable: Option<String>,
    /// Bumped on every saved change; stores compare-and-swap on it.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn open(draft: OrderDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: OrderId::new(),
            order_number: draft.order_number,
            customer: draft.customer,
            provider: draft.provider,
            package: draft.package,
            price: draft.price,
            status: OrderStatus::Created,
            revision_count: 0,
            deadline: draft.deadline,
            late: false,
            deliverable: None,
            version: 1,
            created_at: now,
            updated_at: now,
            accepted_at: None,
            delivered_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    pub fn wallet(&self) -> WalletId {
        WalletId::for_provider(&self.provider)
    }

    /// Checks that `actor` may perform `event` on this order.
    pub fn authorize(&self, actor: &Actor, party: Party, event: EventKind) -> Result<()> {
        let allowed = match party {
            Party::Customer => actor.role == Role::Customer && actor.id == self.customer,
            Party::Provider => actor.role == Role::Provider && actor.id == self.provider,
            Party::EitherParty => {
                (actor.role == Role::Customer && actor.id == self.customer)
                    || (actor.role == Role::Provider && actor.id == self.provider)
            }
            Party::Admin => actor.role == Role::Admin,
        };
        if allowed {
            Ok(())
        } else {
            Err(EscrowError::UnauthorizedTransition {
                actor: actor.id.clone(),
                event,
            })
        }
    }

    /// Walks `route` through the transition table and applies the final
    /// status. Nothing changes unless every step is valid.
    pub fn advance(&mut self, event: EventKind, route: &[Action], now: DateTime<Utc>) -> Result<()> {
        let mut status = self.status;
        for action in route {
            status = transition(status, *action).ok_or(EscrowError::InvalidTransition {
                order: self.id,
                from: self.status,
                event,
            })?;
        }

        match status {
            OrderStatus::Accepted => self.accepted_at = Some(now),
            OrderStatus::Delivered => self.delivered_at = Some(now),
            OrderStatus::Completed => self.completed_at = Some(now),
            OrderStatus::Cancelled | OrderStatus::Refunded => self.cancelled_at = Some(now),
            _ => {}
        }
        self.status = status;
        self.updated_at = now;
        self.version += 1;
        Ok(())
    }
}

/// Human-facing order number: `ORD` + date + three-digit daily sequence.
pub fn order_number(date: NaiveDate, sequence: u32) -> String {
    format!("ORD{}{:03}", date.format("%Y%m%d"), sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn order() -> Order {
        let now = Utc::now();
        Order::open(
            OrderDraft {
                customer: UserId::new("cust-1"),
                provider: UserId::new("prov-1"),
                package: PackageId::new("pkg-1"),
                price: Amount::new(10_000).unwrap(),
                order_number: "ORD20260101001".into(),
                deadline: now + Duration::days(7),
            },
            now,
        )
    }

    #[test]
    fn test_happy_path_through_table() {
        let mut status = OrderStatus::Created;
        for action in [
            Action::Accept,
            Action::Start,
            Action::Deliver,
            Action::Approve,
            Action::Complete,
        ] {
            status = transition(status, action).unwrap();
        }
        assert_eq!(status, OrderStatus::Completed);
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        let actions = [
            Action::Accept,
            Action::Start,
            Action::Deliver,
            Action::Approve,
            Action::Complete,
            Action::RequestRevision,
            Action::Resume,
            Action::Dispute,
            Action::ResolveRefund,
            Action::ResolveComplete,
            Action::Cancel,
        ];
        for terminal in [
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::Refunded,
        ] {
            assert!(terminal.is_terminal());
            for action in actions {
                assert_eq!(transition(terminal, action), None, "{terminal} {action:?}");
            }
        }
    }

    #[test]
    fn test_cancel_only_before_work_starts() {
        assert_eq!(
            transition(OrderStatus::Created, Action::Cancel),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(
            transition(OrderStatus::Accepted, Action::Cancel),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(transition(OrderStatus::InProgress, Action::Cancel), None);
        assert_eq!(transition(OrderStatus::Delivered, Action::Cancel), None);
    }

    #[test]
    fn test_disputed_order_is_frozen() {
        for action in [
            Action::Approve,
            Action::Deliver,
            Action::Cancel,
            Action::Dispute,
        ] {
            assert_eq!(transition(OrderStatus::Disputed, action), None);
        }
    }

    #[test]
    fn test_advance_rejects_partial_route() {
        let mut order = order();
        let before = order.clone();
        let result = order.advance(
            EventKind::Deliver,
            &[Action::Start, Action::Deliver, Action::Approve],
            Utc::now(),
        );
        assert!(matches!(result, Err(EscrowError::InvalidTransition { .. })));
        assert_eq!(order, before);
    }

    #[test]
    fn test_advance_bumps_version_and_timestamps() {
        let mut order = order();
        order
            .advance(EventKind::Accept, &[Action::Accept], Utc::now())
            .unwrap();
        assert_eq!(order.status, OrderStatus::Accepted);
        assert_eq!(order.version, 2);
        assert!(order.accepted_at.is_some());
    }

    #[test]
    fn test_authorize_checks_role_and_identity() {
        let order = order();
        assert!(
            order
                .authorize(&Actor::customer("cust-1"), Party::Customer, EventKind::Approve)
                .is_ok()
        );
        assert!(matches!(
            order.authorize(&Actor::provider("cust-1"), Party::Customer, EventKind::Approve),
            Err(EscrowError::UnauthorizedTransition { .. })
        ));
        assert!(matches!(
            order.authorize(&Actor::provider("prov-2"), Party::EitherParty, EventKind::Dispute),
            Err(EscrowError::UnauthorizedTransition { .. })
        ));
        assert!(
            order
                .authorize(&Actor::admin("ops"), Party::Admin, EventKind::ResolveDispute)
                .is_ok()
        );
    }

    #[test]
    fn test_order_number_format() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert_eq!(order_number(date, 7), "ORD20260309007");
    }
}
