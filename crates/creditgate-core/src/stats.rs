//! ============================================================================
//! Statistics - Operator reporting over the ledger
//! ============================================================================
//! Read-only views for the operator: redemption counts (today in the
//! operator's local day, trailing 24h, all time), per-user counts and
//! leaderboards. Nothing here mutates the ledger.
//! ============================================================================

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::DAY_SECS;
use crate::db::LedgerStore;
use crate::types::{EngineError, EngineResult, UserId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStats {
    /// Since local midnight
    pub today: usize,
    pub last_24h: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub value: u64,
}

pub struct StatsReporter {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
}

impl StatsReporter {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        utc_offset_minutes: i32,
    ) -> EngineResult<Self> {
        let offset = utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "UTC offset out of range: {} minutes",
                    utc_offset_minutes
                ))
            })?;
        Ok(Self { store, clock, offset })
    }

    /// Unix time of the most recent local midnight at or before `now`
    pub fn start_of_local_day(&self, now: i64) -> i64 {
        let shift = self.offset.local_minus_utc() as i64;
        let local = now + shift;
        local - local.rem_euclid(DAY_SECS) - shift
    }

    pub fn verification_stats(&self) -> EngineResult<VerificationStats> {
        let now = self.clock.now();
        let midnight = self.start_of_local_day(now);
        let records = self.store.list_verifications()?;

        Ok(VerificationStats {
            today: records.iter().filter(|r| r.at >= midnight).count(),
            last_24h: records.iter().filter(|r| r.at > now - DAY_SECS).count(),
            total: records.len(),
        })
    }

    /// All-time redemptions by one user
    pub fn redemptions_for(&self, user_id: UserId) -> EngineResult<usize> {
        Ok(self
            .store
            .list_verifications()?
            .iter()
            .filter(|r| r.user_id == user_id)
            .count())
    }

    /// Users with the most redemptions, ties broken by user id
    pub fn top_redeemers(&self, limit: usize) -> EngineResult<Vec<LeaderboardEntry>> {
        let mut counts: HashMap<UserId, u64> = HashMap::new();
        for record in self.store.list_verifications()? {
            *counts.entry(record.user_id).or_insert(0) += 1;
        }

        let entries = counts
            .into_iter()
            .map(|(user_id, value)| LeaderboardEntry { user_id, value })
            .collect();
        Ok(rank(entries, limit))
    }

    /// Users with the largest balances, ties broken by user id
    pub fn top_balances(&self, limit: usize) -> EngineResult<Vec<LeaderboardEntry>> {
        let entries = self
            .store
            .list_accounts()?
            .into_iter()
            .map(|account| LeaderboardEntry {
                user_id: account.id,
                value: account.balance,
            })
            .collect();
        Ok(rank(entries, limit))
    }

    pub fn user_count(&self) -> EngineResult<usize> {
        Ok(self.store.list_user_ids()?.len())
    }
}

fn rank(mut entries: Vec<LeaderboardEntry>, limit: usize) -> Vec<LeaderboardEntry> {
    entries.sort_by(|a, b| b.value.cmp(&a.value).then(a.user_id.cmp(&b.user_id)));
    entries.truncate(limit);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::MemoryLedger;
    use crate::types::VerificationRecord;

    // 2023-11-15 06:00:00 UTC = 11:30 at UTC+05:30
    const NOW: i64 = 1_700_028_000;

    fn reporter(offset_minutes: i32) -> (Arc<MemoryLedger>, StatsReporter) {
        let store = Arc::new(MemoryLedger::new());
        let reporter = StatsReporter::new(
            store.clone(),
            Arc::new(ManualClock::new(NOW)),
            offset_minutes,
        )
        .unwrap();
        (store, reporter)
    }

    fn verified(store: &MemoryLedger, user_id: UserId, at: i64) {
        store
            .append_verification(&VerificationRecord { user_id, at, credits: 10 })
            .unwrap();
    }

    #[test]
    fn test_local_midnight() {
        let (_store, utc) = reporter(0);
        assert_eq!(utc.start_of_local_day(NOW), NOW - 6 * 3600);

        let (_store, ist) = reporter(330);
        assert_eq!(ist.start_of_local_day(NOW), NOW - (11 * 3600 + 1800));

        let (_store, west) = reporter(-300);
        let midnight = west.start_of_local_day(NOW);
        assert!(midnight <= NOW && NOW - midnight < DAY_SECS);
        assert_eq!((midnight - 5 * 3600).rem_euclid(DAY_SECS), 0);
    }

    #[test]
    fn test_verification_windows() {
        let (store, reporter) = reporter(330);
        let midnight = reporter.start_of_local_day(NOW);

        verified(&store, 1, midnight + 60);
        verified(&store, 2, midnight - 60);
        verified(&store, 1, NOW - DAY_SECS);
        verified(&store, 3, NOW - 3 * DAY_SECS);

        assert_eq!(
            reporter.verification_stats().unwrap(),
            VerificationStats { today: 1, last_24h: 2, total: 4 }
        );
        assert_eq!(reporter.redemptions_for(1).unwrap(), 2);
        assert_eq!(reporter.redemptions_for(9).unwrap(), 0);
    }

    #[test]
    fn test_leaderboards() {
        let (store, reporter) = reporter(0);
        for (id, delta) in [(1, 5), (2, 40), (3, 40), (4, -15)] {
            store.adjust_balance(id, delta, NOW).unwrap();
        }
        verified(&store, 3, NOW);
        verified(&store, 3, NOW);
        verified(&store, 1, NOW);

        let balances = reporter.top_balances(2).unwrap();
        assert_eq!(
            balances,
            vec![
                LeaderboardEntry { user_id: 2, value: 55 },
                LeaderboardEntry { user_id: 3, value: 55 },
            ]
        );

        let redeemers = reporter.top_redeemers(5).unwrap();
        assert_eq!(redeemers[0], LeaderboardEntry { user_id: 3, value: 2 });
        assert_eq!(redeemers.len(), 2);
        assert_eq!(reporter.user_count().unwrap(), 4);
    }

    #[test]
    fn test_rejects_bad_offset() {
        let store = Arc::new(MemoryLedger::new());
        assert!(StatsReporter::new(store.clone(), Arc::new(ManualClock::new(0)), 24 * 60).is_err());
        assert!(matches!(
            StatsReporter::new(store.clone(), Arc::new(ManualClock::new(0)), i32::MAX),
            Err(EngineError::Config(_))
        ));
        assert!(StatsReporter::new(store, Arc::new(ManualClock::new(0)), i32::MIN).is_err());
    }
}
