//! At-risk accounts ordered by liquidation deadline.
//!
//! The tracker is the working set of the at-risk pass. Entries are keyed by
//! address (no duplicates) and iterated by ascending deadline, so the pass can
//! stop at the first entry that is not yet due. Accounts without a deadline
//! sort last and are never due.

use std::collections::{BTreeSet, HashMap};

use dashmap::DashSet;
use parking_lot::RwLock;
use solana_sdk::clock::Slot;
use solana_sdk::pubkey::Pubkey;
use tracing::{debug, info};

use liquidator_chain::DEADLINE_UNSET;

/// Liquidation deadline of a tracked account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    /// Eligible once the current slot reaches this value
    At(Slot),
    /// Not flagged on-chain yet
    Unset,
}

impl Deadline {
    /// Interpret the raw on-chain deadline field.
    pub fn from_raw(raw: u64) -> Self {
        if raw == DEADLINE_UNSET {
            Self::Unset
        } else {
            Self::At(raw)
        }
    }

    pub fn is_due(&self, slot: Slot) -> bool {
        matches!(self, Self::At(deadline) if *deadline <= slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskEntry {
    pub address: Pubkey,
    pub deadline: Deadline,
    /// Slot at which `deadline` was read
    pub observed_slot: Slot,
    /// Failed liquidation attempts since the entry was added
    pub attempts: u32,
}

impl RiskEntry {
    pub fn new(address: Pubkey, deadline: Deadline, observed_slot: Slot) -> Self {
        Self {
            address,
            deadline,
            observed_slot,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
    /// Tracked records kept because they were fresher than the scan's
    pub kept: usize,
    pub pruned: usize,
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Retry { attempts: u32 },
    /// Attempt budget exhausted; removed until the next full scan
    Dropped,
    Untracked,
}

#[derive(Default)]
struct Inner {
    order: BTreeSet<(Deadline, Pubkey)>,
    entries: HashMap<Pubkey, RiskEntry>,
}

impl Inner {
    fn insert(&mut self, entry: RiskEntry) {
        if let Some(old) = self.entries.get(&entry.address) {
            self.order.remove(&(old.deadline, old.address));
        }
        self.order.insert((entry.deadline, entry.address));
        self.entries.insert(entry.address, entry);
    }

    fn remove(&mut self, address: &Pubkey) -> Option<RiskEntry> {
        let entry = self.entries.remove(address)?;
        self.order.remove(&(entry.deadline, entry.address));
        Some(entry)
    }
}

/// Marks an account as having a liquidation attempt in progress.
/// Released on drop.
pub struct AttemptGuard<'a> {
    in_flight: &'a DashSet<Pubkey>,
    address: Pubkey,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.address);
    }
}

pub struct DeadlineTracker {
    inner: RwLock<Inner>,
    in_flight: DashSet<Pubkey>,
    max_attempts: u32,
}

impl DeadlineTracker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            in_flight: DashSet::new(),
            max_attempts,
        }
    }

    /// Merge full-scan results.
    ///
    /// New addresses are added. A tracked address takes the scanned deadline
    /// only if the scan observed it no earlier than the tracked record; its
    /// attempt count is kept. Addresses in `healthy` are removed.
    pub fn merge(&self, entries: &[RiskEntry], healthy: &[Pubkey]) -> MergeStats {
        let mut stats = MergeStats::default();
        let mut inner = self.inner.write();

        for entry in entries {
            match inner.entries.get(&entry.address) {
                None => {
                    inner.insert(entry.clone());
                    stats.added += 1;
                }
                Some(existing) if entry.observed_slot >= existing.observed_slot => {
                    let attempts = existing.attempts;
                    inner.insert(RiskEntry {
                        attempts,
                        ..entry.clone()
                    });
                    stats.updated += 1;
                }
                Some(_) => stats.kept += 1,
            }
        }

        for address in healthy {
            if inner.remove(address).is_some() {
                stats.pruned += 1;
            }
        }

        info!(
            added = stats.added,
            updated = stats.updated,
            kept = stats.kept,
            pruned = stats.pruned,
            tracked = inner.entries.len(),
            "Merged scan into deadline tracker"
        );
        stats
    }

    /// Entries due at `slot`: the prefix of the ordering with a deadline at
    /// or before `slot`.
    pub fn due(&self, slot: Slot) -> Vec<RiskEntry> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .take_while(|(deadline, _)| deadline.is_due(slot))
            .filter_map(|(_, address)| inner.entries.get(address).cloned())
            .collect()
    }

    /// All entries in deadline order.
    pub fn snapshot(&self) -> Vec<RiskEntry> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|(_, address)| inner.entries.get(address).cloned())
            .collect()
    }

    /// Earliest tracked deadline.
    pub fn next_deadline(&self) -> Option<Deadline> {
        self.inner.read().order.first().map(|(deadline, _)| *deadline)
    }

    pub fn get(&self, address: &Pubkey) -> Option<RiskEntry> {
        self.inner.read().entries.get(address).cloned()
    }

    pub fn contains(&self, address: &Pubkey) -> bool {
        self.inner.read().entries.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a freshly read deadline. Ignored if the tracked record was
    /// observed later or the address is not tracked.
    pub fn update_deadline(&self, address: &Pubkey, deadline: Deadline, observed_slot: Slot) -> bool {
        let mut inner = self.inner.write();
        let Some(existing) = inner.entries.get(address) else {
            return false;
        };
        if observed_slot < existing.observed_slot {
            return false;
        }
        let entry = RiskEntry {
            deadline,
            observed_slot,
            ..existing.clone()
        };
        inner.insert(entry);
        true
    }

    pub fn remove(&self, address: &Pubkey) -> Option<RiskEntry> {
        self.inner.write().remove(address)
    }

    /// Count a failed attempt, dropping the entry once `max_attempts` is reached.
    pub fn record_failure(&self, address: &Pubkey) -> RetryState {
        let mut inner = self.inner.write();
        let Some(entry) = inner.entries.get_mut(address) else {
            return RetryState::Untracked;
        };
        entry.attempts += 1;
        let attempts = entry.attempts;

        if attempts >= self.max_attempts {
            inner.remove(address);
            debug!(address = %address, attempts, "Attempt budget exhausted, dropping account");
            RetryState::Dropped
        } else {
            RetryState::Retry { attempts }
        }
    }

    /// Reset the attempt count after a submitted liquidation.
    pub fn record_success(&self, address: &Pubkey) {
        if let Some(entry) = self.inner.write().entries.get_mut(address) {
            entry.attempts = 0;
        }
    }

    /// Claim `address` for one attempt. `None` if an attempt is already running.
    pub fn try_begin(&self, address: Pubkey) -> Option<AttemptGuard<'_>> {
        self.in_flight.insert(address).then_some(AttemptGuard {
            in_flight: &self.in_flight,
            address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(deadline: Deadline, observed_slot: Slot) -> RiskEntry {
        RiskEntry::new(Pubkey::new_unique(), deadline, observed_slot)
    }

    fn deadlines(tracker: &DeadlineTracker) -> Vec<Deadline> {
        tracker.snapshot().iter().map(|e| e.deadline).collect()
    }

    #[test]
    fn test_deadline_ordering() {
        assert!(Deadline::At(5) < Deadline::At(6));
        assert!(Deadline::At(u64::MAX - 1) < Deadline::Unset);
        assert_eq!(Deadline::from_raw(DEADLINE_UNSET), Deadline::Unset);
        assert_eq!(Deadline::from_raw(10), Deadline::At(10));
        assert!(Deadline::At(10).is_due(10));
        assert!(!Deadline::At(11).is_due(10));
        assert!(!Deadline::Unset.is_due(u64::MAX));
    }

    #[test]
    fn test_merge_orders_and_deduplicates() {
        let tracker = DeadlineTracker::new(3);
        let a = entry(Deadline::At(30), 1);
        let b = entry(Deadline::Unset, 1);
        let c = entry(Deadline::At(10), 1);

        let stats = tracker.merge(&[a.clone(), b, c.clone(), a.clone()], &[]);
        assert_eq!(stats.added, 3);
        assert_eq!(tracker.len(), 3);
        assert_eq!(
            deadlines(&tracker),
            vec![Deadline::At(10), Deadline::At(30), Deadline::Unset]
        );

        // Re-merge with a new deadline for `a`
        let moved = RiskEntry {
            deadline: Deadline::At(5),
            observed_slot: 2,
            ..a.clone()
        };
        tracker.merge(&[moved], &[]);
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.snapshot()[0].address, a.address);
        let listed = deadlines(&tracker);
        assert!(listed.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_merge_keeps_fresher_record() {
        let tracker = DeadlineTracker::new(3);
        let a = entry(Deadline::Unset, 100);
        tracker.merge(&[a.clone()], &[]);

        // Liquidation pass saw the real deadline at slot 150
        assert!(tracker.update_deadline(&a.address, Deadline::At(160), 150));

        // A scan that observed the account earlier must not clobber it
        let stale = RiskEntry {
            observed_slot: 120,
            ..a.clone()
        };
        let stats = tracker.merge(&[stale], &[]);
        assert_eq!(stats.kept, 1);
        assert_eq!(tracker.get(&a.address).unwrap().deadline, Deadline::At(160));
    }

    #[test]
    fn test_merge_prunes_healthy_accounts() {
        let tracker = DeadlineTracker::new(3);
        let a = entry(Deadline::At(1), 1);
        let b = entry(Deadline::At(2), 1);
        tracker.merge(&[a.clone(), b.clone()], &[]);

        let stats = tracker.merge(&[], &[a.address, Pubkey::new_unique()]);
        assert_eq!(stats.pruned, 1);
        assert!(!tracker.contains(&a.address));
        assert!(tracker.contains(&b.address));
    }

    #[test]
    fn test_due_is_prefix() {
        let tracker = DeadlineTracker::new(3);
        let entries = vec![
            entry(Deadline::At(5), 1),
            entry(Deadline::At(10), 1),
            entry(Deadline::At(10), 1),
            entry(Deadline::At(11), 1),
            entry(Deadline::Unset, 1),
        ];
        tracker.merge(&entries, &[]);

        assert!(tracker.due(4).is_empty());
        assert_eq!(tracker.due(5).len(), 1);
        let due = tracker.due(10);
        assert_eq!(due.len(), 3);
        assert!(due.iter().all(|e| e.deadline.is_due(10)));
        // Unset entries are never due
        assert_eq!(tracker.due(u64::MAX).len(), 4);
    }

    #[test]
    fn test_update_deadline_reorders() {
        let tracker = DeadlineTracker::new(3);
        let a = entry(Deadline::At(5), 1);
        let b = entry(Deadline::At(6), 1);
        tracker.merge(&[a.clone(), b.clone()], &[]);

        assert!(tracker.update_deadline(&a.address, Deadline::At(50), 2));
        assert_eq!(tracker.snapshot()[0].address, b.address);
        assert_eq!(tracker.next_deadline(), Some(Deadline::At(6)));

        // Older observation ignored
        assert!(!tracker.update_deadline(&a.address, Deadline::At(1), 1));
        assert!(!tracker.update_deadline(&Pubkey::new_unique(), Deadline::At(1), 9));
    }

    #[test]
    fn test_record_failure_drops_after_budget() {
        let tracker = DeadlineTracker::new(2);
        let a = entry(Deadline::At(1), 1);
        tracker.merge(&[a.clone()], &[]);

        assert_eq!(tracker.record_failure(&a.address), RetryState::Retry { attempts: 1 });
        assert_eq!(tracker.record_failure(&a.address), RetryState::Dropped);
        assert!(!tracker.contains(&a.address));
        assert_eq!(tracker.record_failure(&a.address), RetryState::Untracked);

        // A later scan re-adds it with a fresh counter
        tracker.merge(&[a.clone()], &[]);
        assert_eq!(tracker.get(&a.address).unwrap().attempts, 0);
    }

    #[test]
    fn test_record_success_resets_attempts() {
        let tracker = DeadlineTracker::new(5);
        let a = entry(Deadline::At(1), 1);
        tracker.merge(&[a.clone()], &[]);
        tracker.record_failure(&a.address);
        tracker.record_success(&a.address);
        assert_eq!(tracker.get(&a.address).unwrap().attempts, 0);
    }

    #[test]
    fn test_attempt_guard_serializes_per_account() {
        let tracker = DeadlineTracker::new(3);
        let address = Pubkey::new_unique();

        let guard = tracker.try_begin(address);
        assert!(guard.is_some());
        assert!(tracker.try_begin(address).is_none());
        assert!(tracker.try_begin(Pubkey::new_unique()).is_some());

        drop(guard);
        assert!(tracker.try_begin(address).is_some());
    }
}
