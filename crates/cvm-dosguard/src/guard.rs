// cvm-dosguard/src/guard.rs

use crate::{
    GuardError, GuardResult, BASE_BAN_SECONDS, DEPLOY_RATE_LIMIT_WINDOW_SECS, MAX_VIOLATION_COUNT,
    RATE_LIMIT_WINDOW_SECS,
};
use cvm_crypto::{Address, Amount, Timestamp};
use cvm_store::{keys, KvStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Reputation tiers gating the per-window limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationTier {
    /// Reputation >= 90
    Excellent,
    /// Reputation >= 70
    Good,
    /// Reputation >= 50
    Fair,
    /// Everyone else
    Low,
}

impl ReputationTier {
    pub fn from_reputation(reputation: i16) -> Self {
        if reputation >= 90 {
            ReputationTier::Excellent
        } else if reputation >= 70 {
            ReputationTier::Good
        } else if reputation >= 50 {
            ReputationTier::Fair
        } else {
            ReputationTier::Low
        }
    }

    /// Transactions per 60 s window
    fn tx_limit(self) -> usize {
        match self {
            ReputationTier::Excellent => 100,
            ReputationTier::Good => 50,
            ReputationTier::Fair => 20,
            ReputationTier::Low => 10,
        }
    }

    /// Deployments per 3600 s window
    fn deploy_limit(self) -> usize {
        match self {
            ReputationTier::Excellent => 20,
            ReputationTier::Good => 10,
            ReputationTier::Fair => 5,
            ReputationTier::Low => 2,
        }
    }

    /// RPC calls per 60 s window
    fn rpc_limit(self) -> usize {
        match self {
            ReputationTier::Excellent => 600,
            ReputationTier::Good => 300,
            ReputationTier::Fair => 120,
            ReputationTier::Low => 60,
        }
    }

    /// P2P messages per 60 s window
    fn p2p_limit(self) -> usize {
        match self {
            ReputationTier::Excellent => 1200,
            ReputationTier::Good => 600,
            ReputationTier::Fair => 300,
            ReputationTier::Low => 120,
        }
    }

    /// Minimum mempool fee in base units; low reputation pays more
    pub fn min_fee(self) -> Amount {
        match self {
            ReputationTier::Excellent => 1_000,
            ReputationTier::Good => 2_000,
            ReputationTier::Fair => 5_000,
            ReputationTier::Low => 10_000,
        }
    }
}

/// Operation classes with independent counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Transaction,
    Deployment,
    Rpc,
    P2p,
}

impl OpKind {
    fn window_secs(self) -> u64 {
        match self {
            OpKind::Deployment => DEPLOY_RATE_LIMIT_WINDOW_SECS,
            _ => RATE_LIMIT_WINDOW_SECS,
        }
    }

    fn limit(self, tier: ReputationTier) -> usize {
        match self {
            OpKind::Transaction => tier.tx_limit(),
            OpKind::Deployment => tier.deploy_limit(),
            OpKind::Rpc => tier.rpc_limit(),
            OpKind::P2p => tier.p2p_limit(),
        }
    }
}

/// Persisted ban state; survives restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub ban_until: Timestamp,
    pub violation_count: u32,
}

/// The reputation-gated rate limiter
///
/// Counters live in memory with periodic cleanup; bans persist through the
/// store so a restart does not lift them.
pub struct DosGuard {
    store: Arc<KvStore>,
    counters: Mutex<HashMap<(Address, OpKind), VecDeque<Timestamp>>>,
    violations: Mutex<HashMap<Address, u32>>,
    last_cleanup: Mutex<Timestamp>,
}

/// In-memory counter cleanup cadence, in seconds
const CLEANUP_INTERVAL_SECS: u64 = 300;

impl DosGuard {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self {
            store,
            counters: Mutex::new(HashMap::new()),
            violations: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(0),
        }
    }

    /// Admit or reject one operation for an address
    ///
    /// Checks the ban list first, then the per-kind sliding window for the
    /// caller's reputation tier. A rejected operation counts as a
    /// violation; past `MAX_VIOLATION_COUNT` the address is banned for
    /// `BASE_BAN_SECONDS x violation_count`.
    pub fn check(
        &self,
        address: &Address,
        kind: OpKind,
        reputation: i16,
        now: Timestamp,
    ) -> GuardResult<()> {
        self.maybe_cleanup(now);

        if let Some(remaining) = self.ban_remaining(address, now)? {
            return Err(GuardError::Banned { remaining_secs: remaining });
        }

        let tier = ReputationTier::from_reputation(reputation);
        let limit = kind.limit(tier);
        let window = kind.window_secs();

        let admitted = {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            let entries = counters.entry((*address, kind)).or_default();
            while let Some(front) = entries.front() {
                if now.saturating_sub(*front) >= window {
                    entries.pop_front();
                } else {
                    break;
                }
            }
            if entries.len() < limit {
                entries.push_back(now);
                true
            } else {
                false
            }
        };

        if admitted {
            return Ok(());
        }

        let count = self.record_violation(address, now)?;
        tracing::debug!(
            address = %address, ?kind, ?tier, violations = count,
            "Rate limit exceeded"
        );
        Err(GuardError::RateLimited { retry_after_secs: window })
    }

    /// Mempool admission: rate plus the tiered minimum fee
    pub fn check_mempool_admission(
        &self,
        address: &Address,
        reputation: i16,
        fee: Amount,
        now: Timestamp,
    ) -> GuardResult<()> {
        let tier = ReputationTier::from_reputation(reputation);
        if fee < tier.min_fee() {
            return Err(GuardError::InsufficientFee { minimum: tier.min_fee() });
        }
        self.check(address, OpKind::Transaction, reputation, now)
    }

    fn record_violation(&self, address: &Address, now: Timestamp) -> GuardResult<u32> {
        let count = {
            let mut violations = self.violations.lock().unwrap_or_else(|e| e.into_inner());
            let count = violations.entry(*address).or_insert(0);
            *count += 1;
            *count
        };

        if count >= MAX_VIOLATION_COUNT {
            let record = BanRecord {
                ban_until: now + BASE_BAN_SECONDS * count as u64,
                violation_count: count,
            };
            self.store.put(&keys::ban_key(address), &record)?;
            tracing::warn!(
                address = %address, violations = count,
                until = record.ban_until,
                "Address banned"
            );
        }

        Ok(count)
    }

    /// Remaining ban seconds, or `None` when not banned
    pub fn ban_remaining(&self, address: &Address, now: Timestamp) -> GuardResult<Option<u64>> {
        match self.store.get::<BanRecord>(&keys::ban_key(address))? {
            Some(record) if record.ban_until > now => Ok(Some(record.ban_until - now)),
            _ => Ok(None),
        }
    }

    pub fn violation_count(&self, address: &Address) -> u32 {
        let violations = self.violations.lock().unwrap_or_else(|e| e.into_inner());
        violations.get(address).copied().unwrap_or(0)
    }

    /// Lift an expired ban and reset the violation slate
    pub fn clear_expired_ban(&self, address: &Address, now: Timestamp) -> GuardResult<bool> {
        match self.store.get::<BanRecord>(&keys::ban_key(address))? {
            Some(record) if record.ban_until <= now => {
                self.store.delete(&keys::ban_key(address))?;
                let mut violations = self.violations.lock().unwrap_or_else(|e| e.into_inner());
                violations.remove(address);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn maybe_cleanup(&self, now: Timestamp) {
        {
            let mut last = self.last_cleanup.lock().unwrap_or_else(|e| e.into_inner());
            if now.saturating_sub(*last) < CLEANUP_INTERVAL_SECS {
                return;
            }
            *last = now;
        }

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.retain(|(_, kind), entries| {
            while let Some(front) = entries.front() {
                if now.saturating_sub(*front) >= kind.window_secs() {
                    entries.pop_front();
                } else {
                    break;
                }
            }
            !entries.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NOW: Timestamp = 1_700_000_000;

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn setup() -> (DosGuard, Arc<KvStore>, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(KvStore::open_at(temp.path()).unwrap());
        (DosGuard::new(store.clone()), store, temp)
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(ReputationTier::from_reputation(95), ReputationTier::Excellent);
        assert_eq!(ReputationTier::from_reputation(90), ReputationTier::Excellent);
        assert_eq!(ReputationTier::from_reputation(89), ReputationTier::Good);
        assert_eq!(ReputationTier::from_reputation(70), ReputationTier::Good);
        assert_eq!(ReputationTier::from_reputation(50), ReputationTier::Fair);
        assert_eq!(ReputationTier::from_reputation(20), ReputationTier::Low);
        assert_eq!(ReputationTier::from_reputation(0), ReputationTier::Low);
    }

    #[test]
    fn test_min_fee_inverse_to_reputation() {
        assert!(ReputationTier::Low.min_fee() > ReputationTier::Fair.min_fee());
        assert!(ReputationTier::Fair.min_fee() > ReputationTier::Good.min_fee());
        assert!(ReputationTier::Good.min_fee() > ReputationTier::Excellent.min_fee());
    }

    #[test]
    fn test_low_tier_eleventh_tx_rejected() {
        let (guard, _store, _temp) = setup();

        // S6: reputation 20, tier limit 10
        for i in 0..10u64 {
            guard.check(&addr(1), OpKind::Transaction, 20, NOW + i).unwrap();
        }
        let result = guard.check(&addr(1), OpKind::Transaction, 20, NOW + 10);
        assert!(matches!(result, Err(GuardError::RateLimited { .. })));
        assert_eq!(guard.violation_count(&addr(1)), 1);
    }

    #[test]
    fn test_window_slides() {
        let (guard, _store, _temp) = setup();

        for i in 0..10u64 {
            guard.check(&addr(1), OpKind::Transaction, 20, NOW + i).unwrap();
        }
        // After the window passes, capacity is back
        guard
            .check(&addr(1), OpKind::Transaction, 20, NOW + RATE_LIMIT_WINDOW_SECS + 5)
            .unwrap();
    }

    #[test]
    fn test_rate_limit_upper_bound_per_tier() {
        // P10: accepted ops in a window never exceed the tier limit
        for (rep, limit) in [(95i16, 100usize), (75, 50), (55, 20), (10, 10)] {
            let (guard, _store, _temp) = setup();
            let mut accepted = 0;
            for i in 0..200u64 {
                if guard.check(&addr(1), OpKind::Transaction, rep, NOW + i / 10).is_ok() {
                    accepted += 1;
                }
            }
            assert!(accepted <= limit, "tier rep {rep} accepted {accepted} > {limit}");
        }
    }

    #[test]
    fn test_ban_after_repeated_violations() {
        let (guard, _store, _temp) = setup();

        // Fill the window, then keep hammering until the ban lands
        for i in 0..10u64 {
            guard.check(&addr(1), OpKind::Transaction, 20, NOW + i).unwrap();
        }
        for _ in 0..MAX_VIOLATION_COUNT {
            let _ = guard.check(&addr(1), OpKind::Transaction, 20, NOW + 11);
        }

        // S6: banned for BASE_BAN_SECONDS x violation_count, with a
        // retry-after hint
        let result = guard.check(&addr(1), OpKind::Transaction, 20, NOW + 12);
        match result {
            Err(GuardError::Banned { remaining_secs }) => {
                assert!(remaining_secs > 0);
                assert!(remaining_secs <= BASE_BAN_SECONDS * MAX_VIOLATION_COUNT as u64);
            }
            other => panic!("expected ban, got {other:?}"),
        }
    }

    #[test]
    fn test_ban_survives_restart() {
        let temp = TempDir::new().unwrap();
        {
            let store = Arc::new(KvStore::open_at(temp.path()).unwrap());
            let guard = DosGuard::new(store);
            for i in 0..10u64 {
                guard.check(&addr(1), OpKind::Transaction, 20, NOW + i).unwrap();
            }
            for _ in 0..MAX_VIOLATION_COUNT {
                let _ = guard.check(&addr(1), OpKind::Transaction, 20, NOW + 11);
            }
        }

        // Fresh guard over the same store still sees the ban
        let store = Arc::new(KvStore::open_at(temp.path()).unwrap());
        let guard = DosGuard::new(store);
        assert!(guard.ban_remaining(&addr(1), NOW + 12).unwrap().is_some());
    }

    #[test]
    fn test_ban_expires_and_clears() {
        let (guard, _store, _temp) = setup();

        for i in 0..10u64 {
            guard.check(&addr(1), OpKind::Transaction, 20, NOW + i).unwrap();
        }
        for _ in 0..MAX_VIOLATION_COUNT {
            let _ = guard.check(&addr(1), OpKind::Transaction, 20, NOW + 11);
        }

        let far_future = NOW + BASE_BAN_SECONDS * (MAX_VIOLATION_COUNT as u64 + 2);
        assert!(guard.ban_remaining(&addr(1), far_future).unwrap().is_none());
        assert!(guard.clear_expired_ban(&addr(1), far_future).unwrap());
        guard.check(&addr(1), OpKind::Transaction, 20, far_future).unwrap();
    }

    #[test]
    fn test_mempool_fee_gate() {
        let (guard, _store, _temp) = setup();

        let low_fee = guard.check_mempool_admission(&addr(1), 20, 500, NOW);
        assert!(matches!(low_fee, Err(GuardError::InsufficientFee { minimum: 10_000 })));

        guard.check_mempool_admission(&addr(1), 20, 10_000, NOW).unwrap();
        // High reputation pays less
        guard.check_mempool_admission(&addr(2), 95, 1_000, NOW).unwrap();
    }

    #[test]
    fn test_kinds_have_independent_counters() {
        let (guard, _store, _temp) = setup();

        for i in 0..10u64 {
            guard.check(&addr(1), OpKind::Transaction, 20, NOW + i).unwrap();
        }
        // Transaction window is full; deployment window is not
        assert!(guard.check(&addr(1), OpKind::Transaction, 20, NOW + 11).is_err());
        guard.check(&addr(1), OpKind::Deployment, 20, NOW + 11).unwrap();
        guard.check(&addr(1), OpKind::Rpc, 20, NOW + 11).unwrap();
    }
}
