//! In-memory ledger used by tests and throwaway deployments.
//!
//! A single mutex guards all accounts, so each `update` call is trivially one
//! critical section. Availability can be toggled to exercise outage paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::LedgerStore;
use crate::config::DEFAULT_START_CREDITS;
use crate::types::{EngineError, EngineResult, UserAccount, UserId, VerificationRecord};

#[derive(Default)]
struct MemoryState {
    accounts: BTreeMap<UserId, UserAccount>,
    verifications: Vec<VerificationRecord>,
}

pub struct MemoryLedger {
    state: Mutex<MemoryState>,
    available: AtomicBool,
    starting_balance: u64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_starting_balance(DEFAULT_START_CREDITS)
    }

    pub fn with_starting_balance(starting_balance: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
            starting_balance,
        }
    }

    /// Simulate the backing store going away (every call fails while false)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, MemoryState>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(EngineError::StoreUnavailable("ledger offline".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("ledger lock poisoned".to_string()))
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore for MemoryLedger {
    fn get(&self, user_id: UserId) -> EngineResult<Option<UserAccount>> {
        Ok(self.lock()?.accounts.get(&user_id).cloned())
    }

    fn update(
        &self,
        user_id: UserId,
        now: i64,
        apply: &mut dyn FnMut(&mut UserAccount),
    ) -> EngineResult<UserAccount> {
        let mut state = self.lock()?;
        let starting_balance = self.starting_balance;
        let account = state.accounts.entry(user_id).or_insert_with(|| {
            debug!("Creating account {}", user_id);
            UserAccount::new(user_id, starting_balance, now)
        });
        apply(account);
        Ok(account.clone())
    }

    fn list_user_ids(&self) -> EngineResult<Vec<UserId>> {
        Ok(self.lock()?.accounts.keys().copied().collect())
    }

    fn list_accounts(&self) -> EngineResult<Vec<UserAccount>> {
        Ok(self.lock()?.accounts.values().cloned().collect())
    }

    fn remove(&self, user_id: UserId) -> EngineResult<bool> {
        Ok(self.lock()?.accounts.remove(&user_id).is_some())
    }

    fn append_verification(&self, record: &VerificationRecord) -> EngineResult<()> {
        self.lock()?.verifications.push(record.clone());
        Ok(())
    }

    fn list_verifications(&self) -> EngineResult<Vec<VerificationRecord>> {
        Ok(self.lock()?.verifications.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_offline_ledger_reports_unavailable() {
        let ledger = MemoryLedger::new();
        ledger.set_available(false);

        let err = ledger.adjust_balance(1, 5, 0).unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));

        ledger.set_available(true);
        assert_eq!(ledger.adjust_balance(1, 5, 0).unwrap().balance, DEFAULT_START_CREDITS + 5);
    }

    #[test]
    fn test_sequential_deltas_clamp_at_every_step() {
        let ledger = MemoryLedger::with_starting_balance(2);
        let deltas = [-1, -5, 3, -1, 10, -20, 4];

        let mut expected: i64 = 2;
        for delta in deltas {
            expected = (expected + delta).max(0);
            let change = ledger.adjust_balance(1, delta, 0).unwrap();
            assert_eq!(change.balance as i64, expected);
        }
        assert_eq!(ledger.get(1).unwrap().unwrap().balance, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_lose_no_updates() {
        let ledger = Arc::new(MemoryLedger::with_starting_balance(10));

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move {
                    let delta = if i % 2 == 0 { 3 } else { 1 };
                    ledger.adjust_balance(7, delta, 0).unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // 25 * 3 + 25 * 1 on top of the starting 10
        assert_eq!(ledger.get(7).unwrap().unwrap().balance, 110);
    }
}
