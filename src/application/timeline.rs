use crate::domain::order::OrderId;
use crate::domain::ports::TimelineRepositoryRef;
use crate::domain::timeline::TimelineEntry;
use crate::error::Result;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Appends timeline entries and forwards them to the notification channel.
///
/// Delivery is fire-and-forget: a full or closed channel is logged and the
/// entry stays recorded.
pub struct TimelineRecorder {
    repo: TimelineRepositoryRef,
    notifications: Option<mpsc::Sender<TimelineEntry>>,
}

impl TimelineRecorder {
    pub fn new(repo: TimelineRepositoryRef) -> Self {
        Self {
            repo,
            notifications: None,
        }
    }

    /// Also returns the receiving end the notification collaborator drains.
    pub fn with_notifications(
        repo: TimelineRepositoryRef,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<TimelineEntry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                repo,
                notifications: Some(tx),
            },
            rx,
        )
    }

    pub async fn record(&self, entry: TimelineEntry) -> Result<()> {
        self.repo.append(entry.clone()).await?;
        self.notify(entry);
        Ok(())
    }

    /// Records a rejected attempt. Never fails: the caller is already
    /// returning the original error.
    pub async fn record_failure(&self, entry: TimelineEntry) {
        if let Err(e) = self.repo.append(entry.clone()).await {
            error!(order = %entry.order, event = %entry.event, error = %e, "could not record failed attempt");
            return;
        }
        self.notify(entry);
    }

    pub async fn for_order(&self, order: OrderId) -> Result<Vec<TimelineEntry>> {
        self.repo.for_order(order).await
    }

    fn notify(&self, entry: TimelineEntry) {
        let Some(sender) = &self.notifications else {
            return;
        };
        if let Err(e) = sender.try_send(entry) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "channel full",
                mpsc::error::TrySendError::Closed(_) => "channel closed",
            };
            warn!(reason, "dropped timeline notification");
        }
    }
}
