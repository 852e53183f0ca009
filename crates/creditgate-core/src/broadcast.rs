//! ============================================================================
//! Broadcast Dispatcher - Send one message to every known user
//! ============================================================================
//! Walks the ledger's user set in store order and delivers through the
//! transport with one rate-limit retry. Recipients that blocked the bot or
//! whose account is gone are pruned from the ledger. A single failed
//! recipient never aborts the run; only a store outage does.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::db::LedgerStore;
use crate::transport::{
    send_with_retry, DeliveryOutcome, MessagingTransport, RetryPolicy, TransportError,
};
use crate::types::{Content, EngineResult};

/// Log progress every this many recipients
const PROGRESS_EVERY: usize = 100;

/// Aggregate counts of one broadcast pass (not persisted)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    pub total: usize,
    pub delivered: usize,
    /// Recipients that needed the rate-limit retry, whatever its result
    pub rate_limited_retried: usize,
    pub permanently_blocked: usize,
    pub permanently_deactivated: usize,
    pub other_failures: usize,
}

impl BroadcastReport {
    /// Every recipient lands in exactly one terminal bucket
    pub fn is_consistent(&self) -> bool {
        self.delivered
            + self.permanently_blocked
            + self.permanently_deactivated
            + self.other_failures
            == self.total
    }

    pub fn pruned(&self) -> usize {
        self.permanently_blocked + self.permanently_deactivated
    }
}

impl fmt::Display for BroadcastReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Broadcast completed")?;
        writeln!(f, "  Total users:       {}", self.total)?;
        writeln!(f, "  Delivered:         {}", self.delivered)?;
        writeln!(f, "  Retried (limit):   {}", self.rate_limited_retried)?;
        writeln!(f, "  Blocked:           {}", self.permanently_blocked)?;
        writeln!(f, "  Deactivated:       {}", self.permanently_deactivated)?;
        write!(f, "  Other failures:    {}", self.other_failures)
    }
}

pub struct BroadcastDispatcher {
    store: Arc<dyn LedgerStore>,
    transport: Arc<dyn MessagingTransport>,
    retry_policy: RetryPolicy,
    /// Pause between recipients
    pace: Duration,
}

impl BroadcastDispatcher {
    pub fn new(store: Arc<dyn LedgerStore>, transport: Arc<dyn MessagingTransport>) -> Self {
        Self {
            store,
            transport,
            retry_policy: RetryPolicy::default(),
            pace: Duration::ZERO,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// Deliver `content` to every user and report the tallies
    pub async fn run(&self, content: &Content) -> EngineResult<BroadcastReport> {
        let recipients = self.store.list_user_ids()?;
        let mut report = BroadcastReport {
            total: recipients.len(),
            ..Default::default()
        };
        info!("Broadcasting to {} users", report.total);

        for (index, user_id) in recipients.into_iter().enumerate() {
            let outcome =
                send_with_retry(self.transport.as_ref(), user_id, content, &self.retry_policy).await;
            if outcome.retried() {
                report.rate_limited_retried += 1;
            }

            // A retry that ends blocked or deactivated is still permanent: the
            // user is pruned and counted there, on top of rate_limited_retried.
            match outcome {
                DeliveryOutcome::Delivered { .. } => report.delivered += 1,
                DeliveryOutcome::Failed { error: TransportError::Blocked, .. } => {
                    debug!("User {} blocked the bot, removing", user_id);
                    self.store.remove(user_id)?;
                    report.permanently_blocked += 1;
                }
                DeliveryOutcome::Failed { error: TransportError::Deactivated, .. } => {
                    debug!("User {} is deactivated, removing", user_id);
                    self.store.remove(user_id)?;
                    report.permanently_deactivated += 1;
                }
                DeliveryOutcome::Failed { error, .. } => {
                    error!("Failed to broadcast to {}: {}", user_id, error);
                    report.other_failures += 1;
                }
            }

            if (index + 1) % PROGRESS_EVERY == 0 {
                info!("Broadcast progress: {}/{}", index + 1, report.total);
            }
            if !self.pace.is_zero() {
                sleep(self.pace).await;
            }
        }

        if report.pruned() > 0 {
            warn!("Broadcast pruned {} unreachable users", report.pruned());
        }
        info!(
            "Broadcast done: {} delivered, {} blocked, {} deactivated, {} failed of {}",
            report.delivered,
            report.permanently_blocked,
            report.permanently_deactivated,
            report.other_failures,
            report.total
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryLedger;
    use crate::types::{EngineError, UserId};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Returns a scripted result per recipient; everyone else succeeds
    #[derive(Default)]
    struct ScriptedTransport {
        results: Mutex<HashMap<UserId, Vec<Result<(), TransportError>>>>,
    }

    impl ScriptedTransport {
        fn script(self, user_id: UserId, results: Vec<Result<(), TransportError>>) -> Self {
            self.results.lock().unwrap().insert(user_id, results);
            self
        }
    }

    #[async_trait]
    impl MessagingTransport for ScriptedTransport {
        async fn send(&self, recipient: UserId, _content: &Content) -> Result<(), TransportError> {
            let mut results = self.results.lock().unwrap();
            match results.get_mut(&recipient) {
                Some(script) if !script.is_empty() => script.remove(0),
                _ => Ok(()),
            }
        }
    }

    fn limited() -> Result<(), TransportError> {
        Err(TransportError::RateLimited {
            retry_after: Duration::from_millis(1),
        })
    }

    fn seeded(count: i64) -> Arc<MemoryLedger> {
        let store = Arc::new(MemoryLedger::new());
        for id in 1..=count {
            store.get_or_create(id, 0).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_prunes_blocked_and_deactivated() {
        let store = seeded(100);
        let mut transport = ScriptedTransport::default();
        for id in 1..=10 {
            transport = transport.script(id, vec![Err(TransportError::Blocked)]);
        }
        for id in 11..=15 {
            transport = transport.script(id, vec![Err(TransportError::Deactivated)]);
        }

        let dispatcher = BroadcastDispatcher::new(store.clone(), Arc::new(transport));
        let report = dispatcher.run(&Content::text("maintenance tonight")).await.unwrap();

        assert_eq!(report.total, 100);
        assert_eq!(report.delivered, 85);
        assert_eq!(report.permanently_blocked, 10);
        assert_eq!(report.permanently_deactivated, 5);
        assert_eq!(report.other_failures, 0);
        assert!(report.is_consistent());

        assert_eq!(store.list_user_ids().unwrap().len(), 85);
        assert!(store.get(3).unwrap().is_none());
        assert!(store.get(14).unwrap().is_none());
        assert!(store.get(16).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rate_limit_retry_outcomes() {
        let store = seeded(4);
        let transport = ScriptedTransport::default()
            .script(1, vec![limited(), Ok(())])
            .script(2, vec![limited(), limited()])
            .script(3, vec![limited(), Err(TransportError::Blocked)])
            .script(4, vec![Err(TransportError::Other("chat not found".into()))]);

        let dispatcher = BroadcastDispatcher::new(store.clone(), Arc::new(transport));
        let report = dispatcher.run(&Content::text("hi")).await.unwrap();

        assert_eq!(
            report,
            BroadcastReport {
                total: 4,
                delivered: 1,
                rate_limited_retried: 3,
                permanently_blocked: 1,
                permanently_deactivated: 0,
                other_failures: 2,
            }
        );
        assert!(report.is_consistent());
        // other failures keep the account
        assert!(store.get(4).unwrap().is_some());
        assert!(store.get(3).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_user_set() {
        let dispatcher = BroadcastDispatcher::new(
            Arc::new(MemoryLedger::new()),
            Arc::new(ScriptedTransport::default()),
        );
        let report = dispatcher.run(&Content::text("hi")).await.unwrap();
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_store_outage_propagates() {
        let store = seeded(2);
        store.set_available(false);
        let dispatcher = BroadcastDispatcher::new(store, Arc::new(ScriptedTransport::default()));
        assert!(matches!(
            dispatcher.run(&Content::text("hi")).await,
            Err(EngineError::StoreUnavailable(_))
        ));
    }
}
