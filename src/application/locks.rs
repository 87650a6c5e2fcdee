use crate::error::{EscrowError, Result};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

const PRUNE_AT: usize = 1024;

/// One async mutex per key, acquired with a bounded wait.
///
/// Timing out yields [`EscrowError::Contention`] instead of waiting forever.
pub struct KeyedLocks<K> {
    name: &'static str,
    timeout: Duration,
    slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, key: &K) -> Result<OwnedMutexGuard<()>> {
        let slot = self.slot(key);
        match tokio::time::timeout(self.timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                warn!(lock = self.name, %key, timeout = ?self.timeout, "lock wait timed out");
                Err(EscrowError::Contention {
                    resource: format!("{} {}", self.name, key),
                })
            }
        }
    }

    /// Takes the lock only if nobody holds it.
    pub fn try_acquire(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
        self.slot(key).try_lock_owned().ok()
    }

    fn slot(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.len() >= PRUNE_AT {
            // Only this map holds an idle slot.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        slots.entry(key.clone()).or_default().clone()
    }
}

/// Runs `operation` again while it fails with a retryable error, up to
/// `max_retries` extra attempts with doubling backoff.
pub async fn retry_on_contention<T, F, Fut>(
    max_retries: u32,
    backoff: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Err(e) if e.kind().is_retryable() && attempt < max_retries => {
                attempt += 1;
                let delay = backoff.saturating_mul(1 << attempt.min(16));
                debug!(attempt, ?delay, error = %e, "retrying after contention");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_same_key_times_out_while_held() {
        let locks = KeyedLocks::new("order", Duration::from_millis(20));
        let _held = locks.acquire(&"a".to_string()).await.unwrap();

        let result = locks.acquire(&"a".to_string()).await;
        assert!(matches!(result, Err(EscrowError::Contention { .. })));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new("wallet", Duration::from_millis(20));
        let _a = locks.acquire(&"a".to_string()).await.unwrap();
        assert!(locks.acquire(&"b".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn test_released_lock_can_be_reacquired() {
        let locks = KeyedLocks::new("order", Duration::from_millis(20));
        drop(locks.acquire(&1u32).await.unwrap());
        assert!(locks.acquire(&1u32).await.is_ok());
    }

    #[tokio::test]
    async fn test_try_acquire_skips_held_key() {
        let locks = KeyedLocks::new("payout", Duration::from_millis(20));
        let held = locks.try_acquire(&1u32).unwrap();
        assert!(locks.try_acquire(&1u32).is_none());
        assert!(locks.try_acquire(&2u32).is_some());

        drop(held);
        assert!(locks.try_acquire(&1u32).is_some());
    }

    #[tokio::test]
    async fn test_retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_on_contention(3, Duration::from_millis(1), move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(EscrowError::Contention {
                    resource: "order".into(),
                })
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_business_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = retry_on_contention(3, Duration::from_millis(1), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(EscrowError::ValidationError("bad price".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
