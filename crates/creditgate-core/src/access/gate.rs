//! ============================================================================
//! Access Gate - Per-request credit debit with delivery and refund
//! ============================================================================
//! Answers "may this user consume content now, and at what cost":
//! - active premium accounts are served without a debit
//! - other accounts pay one credit per request
//! - an empty balance is denied with the verification link to top up
//!
//! The debit is committed before delivery. If any item fails to arrive the
//! credit is handed back, so a user never pays for content they did not get.
//! ============================================================================

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::subscription::SubscriptionManager;
use super::types::{AccessOutcome, Tier};
use crate::clock::Clock;
use crate::db::LedgerStore;
use crate::token::TokenManager;
use crate::transport::{send_with_retry, MessagingTransport, RetryPolicy};
use crate::types::{Content, EngineError, EngineResult, UserId};

/// Credits debited per content request
pub const CREDITS_PER_REQUEST: u64 = 1;

/// What the atomic admission step decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Premium(Tier),
    Charged { balance: u64 },
    Denied,
}

pub struct AccessGate {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn MessagingTransport>,
    subscriptions: Arc<SubscriptionManager>,
    tokens: Arc<TokenManager>,
    retry_policy: RetryPolicy,
}

impl AccessGate {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn MessagingTransport>,
        subscriptions: Arc<SubscriptionManager>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            store,
            clock,
            transport,
            subscriptions,
            tokens,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Premium bypass check, then debit, as one atomic ledger step.
    /// A stale tier (expired, or under the floor) is dropped before the check.
    pub fn admit(&self, user_id: UserId) -> EngineResult<Admission> {
        let now = self.clock.now();
        let mut admission = Admission::Denied;

        self.store.update(user_id, now, &mut |account| {
            self.subscriptions.reevaluate_in(account, now);

            if account.is_premium_active(now) {
                admission = Admission::Premium(account.tier);
                return;
            }
            if account.balance < CREDITS_PER_REQUEST {
                admission = Admission::Denied;
                return;
            }

            account.apply_delta(-(CREDITS_PER_REQUEST as i64));
            admission = Admission::Charged {
                balance: account.balance,
            };
        })?;

        debug!("Admission for user {}: {:?}", user_id, admission);
        Ok(admission)
    }

    /// Admit the request and deliver every item of it
    pub async fn serve(&self, user_id: UserId, items: &[Content]) -> EngineResult<AccessOutcome> {
        if items.is_empty() {
            return Err(EngineError::InvalidAmount(
                "content request has no items".to_string(),
            ));
        }

        match self.admit(user_id)? {
            Admission::Denied => {
                info!("User {} has no credits, sending verification link", user_id);
                let verify_link = self.tokens.get_or_issue_link(user_id).await?;
                Ok(AccessOutcome::Denied { verify_link })
            }
            Admission::Premium(tier) => {
                let delivered = self.deliver(user_id, items).await;
                if delivered == items.len() {
                    return Ok(AccessOutcome::Premium { tier, delivered });
                }
                let balance = self
                    .store
                    .get(user_id)?
                    .map_or(0, |account| account.balance);
                Ok(AccessOutcome::DeliveryFailed {
                    balance,
                    refunded: false,
                })
            }
            Admission::Charged { balance } => {
                let delivered = self.deliver(user_id, items).await;
                if delivered == items.len() {
                    return Ok(AccessOutcome::Charged { balance, delivered });
                }
                // The account may have been pruned while we were sending
                if self.store.get(user_id)?.is_none() {
                    warn!("User {} was removed before the refund, skipping it", user_id);
                    return Ok(AccessOutcome::DeliveryFailed {
                        balance: 0,
                        refunded: false,
                    });
                }
                let change = self.store.adjust_balance(
                    user_id,
                    CREDITS_PER_REQUEST as i64,
                    self.clock.now(),
                )?;
                info!("Refunded {} credit to user {}", CREDITS_PER_REQUEST, user_id);
                Ok(AccessOutcome::DeliveryFailed {
                    balance: change.balance,
                    refunded: true,
                })
            }
        }
    }

    /// Number of items that arrived
    async fn deliver(&self, user_id: UserId, items: &[Content]) -> usize {
        let mut delivered = 0;
        for item in items {
            let outcome =
                send_with_retry(self.transport.as_ref(), user_id, item, &self.retry_policy).await;
            if outcome.is_delivered() {
                delivered += 1;
            }
        }
        if delivered < items.len() {
            warn!("Delivered {}/{} items to user {}", delivered, items.len(), user_id);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{EngineConfig, DAY_SECS};
    use crate::db::MemoryLedger;
    use crate::shortener::PassthroughShortener;
    use crate::transport::TransportError;
    use async_trait::async_trait;

    /// Fails every send whose message id is listed
    #[derive(Default)]
    struct FlakyTransport {
        failing: Vec<i64>,
    }

    #[async_trait]
    impl MessagingTransport for FlakyTransport {
        async fn send(&self, recipient: UserId, content: &Content) -> Result<(), TransportError> {
            if let Content::Copy { message_id, .. } = content {
                if self.failing.contains(message_id) {
                    return Err(TransportError::Other("message to copy not found".into()));
                }
            }
            debug!("fake delivery to {}", recipient);
            Ok(())
        }
    }

    struct Fixture {
        clock: ManualClock,
        store: Arc<MemoryLedger>,
        subscriptions: Arc<SubscriptionManager>,
        gate: AccessGate,
    }

    /// Drops the recipient from the ledger, then reports it blocked
    struct PruningTransport {
        store: Arc<MemoryLedger>,
    }

    #[async_trait]
    impl MessagingTransport for PruningTransport {
        async fn send(&self, recipient: UserId, _content: &Content) -> Result<(), TransportError> {
            self.store.remove(recipient).unwrap();
            Err(TransportError::Blocked)
        }
    }

    fn fixture(start: u64, transport: FlakyTransport) -> Fixture {
        fixture_on(
            Arc::new(MemoryLedger::with_starting_balance(start)),
            Arc::new(transport),
        )
    }

    fn fixture_on(store: Arc<MemoryLedger>, transport: Arc<dyn MessagingTransport>) -> Fixture {
        let clock = ManualClock::new(1_700_000_000);
        let config = EngineConfig::default();
        let subscriptions = Arc::new(SubscriptionManager::new(
            store.clone(),
            Arc::new(clock.clone()),
            config.premium_floor,
        ));
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(PassthroughShortener),
            subscriptions.clone(),
            &config,
        ));
        let gate = AccessGate::new(
            store.clone(),
            Arc::new(clock.clone()),
            transport,
            subscriptions.clone(),
            tokens,
        );
        Fixture {
            clock,
            store,
            subscriptions,
            gate,
        }
    }

    fn file(message_id: i64) -> Content {
        Content::Copy {
            from_chat: -1001,
            message_id,
        }
    }

    #[tokio::test]
    async fn test_regular_user_pays_one_credit() {
        let f = fixture(2, FlakyTransport::default());
        let outcome = f.gate.serve(1, &[file(1), file(2)]).await.unwrap();
        assert_eq!(outcome, AccessOutcome::Charged { balance: 1, delivered: 2 });
        assert_eq!(f.store.get(1).unwrap().unwrap().balance, 1);
    }

    #[tokio::test]
    async fn test_empty_balance_is_denied_with_link() {
        let f = fixture(0, FlakyTransport::default());
        match f.gate.serve(1, &[file(1)]).await.unwrap() {
            AccessOutcome::Denied { verify_link } => {
                assert!(verify_link.contains("?start=verify_"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(f.store.get(1).unwrap().unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_premium_bypasses_debit() {
        let f = fixture(0, FlakyTransport::default());
        f.subscriptions.grant(1, Tier::Silver, 100, None).unwrap();

        let outcome = f.gate.serve(1, &[file(1)]).await.unwrap();
        assert_eq!(outcome, AccessOutcome::Premium { tier: Tier::Silver, delivered: 1 });
        assert_eq!(f.store.get(1).unwrap().unwrap().balance, 100);
    }

    #[tokio::test]
    async fn test_expired_premium_pays_again() {
        let f = fixture(0, FlakyTransport::default());
        f.subscriptions
            .grant(1, Tier::Bronze, 50, Some(chrono::Duration::days(1)))
            .unwrap();
        f.clock.advance(DAY_SECS);

        let outcome = f.gate.serve(1, &[file(1)]).await.unwrap();
        assert_eq!(outcome, AccessOutcome::Charged { balance: 49, delivered: 1 });
        assert_eq!(f.store.get(1).unwrap().unwrap().tier, Tier::None);
    }

    #[tokio::test]
    async fn test_failed_item_refunds_debit() {
        let transport = FlakyTransport { failing: vec![2] };
        let f = fixture(3, transport);

        let outcome = f.gate.serve(1, &[file(1), file(2)]).await.unwrap();
        assert_eq!(outcome, AccessOutcome::DeliveryFailed { balance: 3, refunded: true });
        assert_eq!(f.store.get(1).unwrap().unwrap().balance, 3);
    }

    #[tokio::test]
    async fn test_refund_skips_pruned_account() {
        let store = Arc::new(MemoryLedger::with_starting_balance(3));
        let transport = PruningTransport { store: store.clone() };
        let f = fixture_on(store, Arc::new(transport));

        let outcome = f.gate.serve(1, &[file(1)]).await.unwrap();
        assert_eq!(outcome, AccessOutcome::DeliveryFailed { balance: 0, refunded: false });
        assert!(f.store.get(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_request_is_rejected() {
        let f = fixture(3, FlakyTransport::default());
        assert!(matches!(
            f.gate.serve(1, &[]).await,
            Err(EngineError::InvalidAmount(_))
        ));
        assert!(f.store.get(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_outage_aborts_before_delivery() {
        let f = fixture(3, FlakyTransport::default());
        f.store.set_available(false);
        assert!(matches!(
            f.gate.serve(1, &[file(1)]).await,
            Err(EngineError::StoreUnavailable(_))
        ));
    }
}
