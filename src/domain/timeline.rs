use super::actor::UserId;
use super::order::{OrderId, OrderStatus};
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The operation a timeline entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Accept,
    Start,
    Deliver,
    Approve,
    RequestRevision,
    Dispute,
    ResolveDispute,
    Cancel,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Create => "create",
            EventKind::Accept => "accept",
            EventKind::Start => "start",
            EventKind::Deliver => "deliver",
            EventKind::Approve => "approve",
            EventKind::RequestRevision => "request_revision",
            EventKind::Dispute => "dispute",
            EventKind::ResolveDispute => "resolve_dispute",
            EventKind::Cancel => "cancel",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// A rejected attempt, kept for audit.
    Failed { kind: ErrorKind },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: Uuid,
    pub order: OrderId,
    pub event: EventKind,
    pub actor: UserId,
    pub from: Option<OrderStatus>,
    pub to: Option<OrderStatus>,
    pub outcome: Outcome,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl TimelineEntry {
    pub fn succeeded(
        order: OrderId,
        event: EventKind,
        actor: UserId,
        from: Option<OrderStatus>,
        to: OrderStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order,
            event,
            actor,
            from,
            to: Some(to),
            outcome: Outcome::Succeeded,
            note: None,
            recorded_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn failed(
        order: OrderId,
        event: EventKind,
        actor: UserId,
        from: OrderStatus,
        kind: ErrorKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order,
            event,
            actor,
            from: Some(from),
            to: None,
            outcome: Outcome::Failed { kind },
            note: None,
            recorded_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }
}
