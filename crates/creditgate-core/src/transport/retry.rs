//! ============================================================================
//! Delivery Retry - Bounded retry on transport rate limits
//! ============================================================================
//! A rate-limit signal is honoured by sleeping for the platform's delay
//! (clamped to a configured range) and retrying. Permanent and unknown
//! failures are returned immediately.
//! ============================================================================

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{MessagingTransport, TransportError};
use crate::types::{Content, UserId};

/// Configuration for delivery retry behavior
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt, only for rate limits
    pub max_retries: u32,
    /// Shortest wait before a retry
    pub min_wait: Duration,
    /// Longest wait before a retry, whatever the platform asks for
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            min_wait: Duration::ZERO,
            max_wait: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Wait derived from the transport's reported delay
    pub fn wait_for(&self, retry_after: Duration) -> Duration {
        retry_after.clamp(self.min_wait, self.max_wait)
    }
}

/// Result of a delivery attempt sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { retried: bool },
    Failed { error: TransportError, retried: bool },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn retried(&self) -> bool {
        match self {
            DeliveryOutcome::Delivered { retried } | DeliveryOutcome::Failed { retried, .. } => {
                *retried
            }
        }
    }
}

/// Send `content`, retrying rate limits up to `policy.max_retries` times
pub async fn send_with_retry(
    transport: &dyn MessagingTransport,
    recipient: UserId,
    content: &Content,
    policy: &RetryPolicy,
) -> DeliveryOutcome {
    let mut attempt = 0;

    loop {
        let retried = attempt > 0;
        match transport.send(recipient, content).await {
            Ok(()) => {
                if retried {
                    debug!("Delivered to {} after {} retries", recipient, attempt);
                }
                return DeliveryOutcome::Delivered { retried };
            }
            Err(TransportError::RateLimited { retry_after }) if attempt < policy.max_retries => {
                let wait = policy.wait_for(retry_after);
                warn!("Rate limited sending to {}, waiting {:?}", recipient, wait);
                sleep(wait).await;
                attempt += 1;
            }
            Err(error) => {
                debug!("Delivery to {} failed: {}", recipient, error);
                return DeliveryOutcome::Failed { error, retried };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed script of results
    struct Scripted {
        script: Mutex<VecDeque<Result<(), TransportError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(script: Vec<Result<(), TransportError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl MessagingTransport for Scripted {
        async fn send(&self, _recipient: UserId, _content: &Content) -> Result<(), TransportError> {
            *self.calls.lock().unwrap() += 1;
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn limited() -> Result<(), TransportError> {
        Err(TransportError::RateLimited { retry_after: Duration::from_millis(1) })
    }

    #[tokio::test]
    async fn test_retry_once_then_deliver() {
        let transport = Scripted::new(vec![limited(), Ok(())]);
        let outcome =
            send_with_retry(&transport, 1, &Content::text("hi"), &RetryPolicy::default()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { retried: true });
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_second_rate_limit_is_returned() {
        let transport = Scripted::new(vec![limited(), limited(), Ok(())]);
        let outcome =
            send_with_retry(&transport, 1, &Content::text("hi"), &RetryPolicy::default()).await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Failed { error: TransportError::RateLimited { .. }, retried: true }
        ));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let transport = Scripted::new(vec![Err(TransportError::Blocked)]);
        let outcome =
            send_with_retry(&transport, 1, &Content::text("hi"), &RetryPolicy::default()).await;
        assert_eq!(
            outcome,
            DeliveryOutcome::Failed { error: TransportError::Blocked, retried: false }
        );
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn test_wait_is_clamped() {
        let policy = RetryPolicy {
            max_retries: 1,
            min_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(5),
        };
        assert_eq!(policy.wait_for(Duration::ZERO), Duration::from_millis(100));
        assert_eq!(policy.wait_for(Duration::from_secs(2)), Duration::from_secs(2));
        assert_eq!(policy.wait_for(Duration::from_secs(60)), Duration::from_secs(5));
    }
}
