use crate::domain::payout::{PayoutId, PayoutRequest};
use crate::domain::ports::PayoutGateway;
use crate::error::{EscrowError, Result};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

/// Gateway that accepts every submission and remembers it.
///
/// Stands in for a real payment provider in the CLI and in tests; outcomes
/// are fed back through the scheduler's `report`.
#[derive(Default)]
pub struct RecordingGateway {
    submitted: Mutex<Vec<PayoutId>>,
    reject: bool,
    latency: Option<Duration>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gateway that refuses every submission.
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    /// Answers each submission only after `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn submitted(&self) -> Vec<PayoutId> {
        self.submitted
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PayoutGateway for RecordingGateway {
    async fn submit(&self, payout: &PayoutRequest) -> Result<String> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.reject {
            return Err(EscrowError::ValidationError(format!(
                "gateway refused payout {}",
                payout.id
            )));
        }
        let mut submitted = self
            .submitted
            .lock()
            .map_err(|_| EscrowError::internal("gateway log poisoned"))?;
        submitted.push(payout.id);
        Ok(format!("gw-{}", submitted.len()))
    }
}
