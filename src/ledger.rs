use std::collections::{BTreeSet, HashMap, hash_map::Entry};

use serde::Serialize;

use crate::error::EngineError;
use crate::identity::ParticipantKey;

/// A vote mutation, already validated out of its raw store row. Events are
/// delivered at-least-once and possibly out of order; `seq` is the monotonic
/// write counter that makes reconciliation order-independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteEvent {
    Insert {
        key: ParticipantKey,
        selected: BTreeSet<usize>,
        seq: u64,
    },
    Update {
        key: ParticipantKey,
        selected: BTreeSet<usize>,
        seq: u64,
    },
    Delete {
        key: ParticipantKey,
        seq: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRecord {
    pub selected: BTreeSet<usize>,
    pub last_write_seq: u64,
}

/// Immutable per-option tally derived from the ledger. A fresh snapshot is
/// produced on every effective change and handed to consumers as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TallySnapshot {
    counts: Vec<u64>,
    total: u64,
}

impl TallySnapshot {
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn count(&self, index: usize) -> u64 {
        self.counts.get(index).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Percentage of the total mass on one option, 0.0 when nobody has voted.
    pub fn percentage(&self, index: usize) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.count(index) as f64 * 100.0 / self.total as f64
    }

    pub fn percentages(&self) -> Vec<f64> {
        (0..self.counts.len()).map(|i| self.percentage(i)).collect()
    }
}

/// The per-poll set of current vote records, one per participant key.
/// Conflict resolution is last-writer-wins by `seq`; duplicates and stale
/// events are discarded. Deleted keys keep a tombstone seq so an out-of-order
/// insert cannot resurrect a retracted vote.
#[derive(Debug)]
pub struct VoteLedger {
    option_count: usize,
    records: HashMap<ParticipantKey, VoteRecord>,
    tombstones: HashMap<ParticipantKey, u64>,
}

impl VoteLedger {
    pub fn new(option_count: usize) -> Self {
        Self {
            option_count,
            records: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    /// Apply one event. Returns `Ok(true)` when the ledger changed, `Ok(false)`
    /// for stale or duplicate deliveries, and `Err` for malformed events that
    /// must be dropped by the caller without being applied.
    pub fn apply(&mut self, event: VoteEvent) -> Result<bool, EngineError> {
        match event {
            VoteEvent::Insert { key, selected, seq } | VoteEvent::Update { key, selected, seq } => {
                self.upsert(key, selected, seq)
            }
            VoteEvent::Delete { key, seq } => Ok(self.remove(key, seq)),
        }
    }

    fn upsert(
        &mut self,
        key: ParticipantKey,
        selected: BTreeSet<usize>,
        seq: u64,
    ) -> Result<bool, EngineError> {
        if let Some(&out_of_range) = selected.iter().find(|&&i| i >= self.option_count) {
            return Err(EngineError::MalformedEvent(format!(
                "option index {out_of_range} out of range for {} options",
                self.option_count
            )));
        }

        if let Some(&deleted_seq) = self.tombstones.get(&key) {
            if seq <= deleted_seq {
                return Ok(false);
            }
            self.tombstones.remove(&key);
        }

        match self.records.entry(key) {
            Entry::Occupied(mut entry) => {
                if seq > entry.get().last_write_seq {
                    *entry.get_mut() = VoteRecord {
                        selected,
                        last_write_seq: seq,
                    };
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(VoteRecord {
                    selected,
                    last_write_seq: seq,
                });
                Ok(true)
            }
        }
    }

    fn remove(&mut self, key: ParticipantKey, seq: u64) -> bool {
        let tombstone = self.tombstones.entry(key.clone()).or_insert(0);
        *tombstone = (*tombstone).max(seq);

        match self.records.get(&key) {
            Some(record) if seq >= record.last_write_seq => {
                self.records.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Drop all state, for wholesale snapshot replacement on resync.
    pub fn reset(&mut self) {
        self.records.clear();
        self.tombstones.clear();
    }

    pub fn selection_of(&self, key: &ParticipantKey) -> Option<&BTreeSet<usize>> {
        self.records.get(key).map(|record| &record.selected)
    }

    pub fn has_vote(&self, key: &ParticipantKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn participant_count(&self) -> usize {
        self.records.len()
    }

    /// Recompute the tally by summing selection membership across all records.
    /// O(participants x selections), acceptable for crowd-sized polls.
    pub fn tally(&self) -> TallySnapshot {
        let mut counts = vec![0u64; self.option_count];
        let mut total = 0u64;
        for record in self.records.values() {
            for &index in &record.selected {
                counts[index] += 1;
                total += 1;
            }
        }
        TallySnapshot { counts, total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ParticipantKey {
        ParticipantKey::Anonymous(name.to_string())
    }

    fn selected(indices: &[usize]) -> BTreeSet<usize> {
        indices.iter().copied().collect()
    }

    fn insert(name: &str, indices: &[usize], seq: u64) -> VoteEvent {
        VoteEvent::Insert {
            key: key(name),
            selected: selected(indices),
            seq,
        }
    }

    fn update(name: &str, indices: &[usize], seq: u64) -> VoteEvent {
        VoteEvent::Update {
            key: key(name),
            selected: selected(indices),
            seq,
        }
    }

    fn delete(name: &str, seq: u64) -> VoteEvent {
        VoteEvent::Delete {
            key: key(name),
            seq,
        }
    }

    fn assert_conserved(ledger: &VoteLedger) {
        // Total tally mass must equal the sum of selection sizes.
        let tally = ledger.tally();
        let mass: u64 = ledger
            .records
            .values()
            .map(|r| r.selected.len() as u64)
            .sum();
        assert_eq!(tally.total(), mass);
        assert_eq!(tally.counts().iter().sum::<u64>(), mass);
    }

    #[test]
    fn single_choice_insert_and_change() {
        // Options ["Cats", "Dogs"]: two voters, then A changes to Dogs.
        let mut ledger = VoteLedger::new(2);

        assert!(ledger.apply(insert("A", &[0], 1)).unwrap());
        let tally = ledger.tally();
        assert_eq!(tally.counts(), &[1, 0]);
        assert_eq!(tally.total(), 1);

        assert!(ledger.apply(insert("B", &[1], 1)).unwrap());
        let tally = ledger.tally();
        assert_eq!(tally.counts(), &[1, 1]);
        assert_eq!(tally.total(), 2);

        assert!(ledger.apply(update("A", &[1], 2)).unwrap());
        let tally = ledger.tally();
        assert_eq!(tally.counts(), &[0, 2]);
        assert_eq!(tally.total(), 2);
        assert_conserved(&ledger);
    }

    #[test]
    fn multi_choice_counts_each_selection() {
        let mut ledger = VoteLedger::new(3);

        assert!(ledger.apply(insert("C", &[0, 2], 1)).unwrap());
        let tally = ledger.tally();
        assert_eq!(tally.counts(), &[1, 0, 1]);
        assert_eq!(tally.total(), 2);
        assert_eq!(ledger.participant_count(), 1);
    }

    #[test]
    fn delete_removes_record() {
        let mut ledger = VoteLedger::new(2);
        ledger.apply(insert("A", &[0], 1)).unwrap();
        ledger.apply(insert("B", &[1], 1)).unwrap();
        ledger.apply(update("A", &[1], 2)).unwrap();

        assert!(ledger.apply(delete("A", 3)).unwrap());
        let tally = ledger.tally();
        assert_eq!(tally.counts(), &[0, 1]);
        assert_eq!(tally.total(), 1);
        assert!(!ledger.has_vote(&key("A")));
        assert_conserved(&ledger);
    }

    #[test]
    fn stale_update_is_discarded() {
        let mut ledger = VoteLedger::new(2);
        ledger.apply(insert("B", &[1], 1)).unwrap();
        let before = ledger.tally();

        assert!(!ledger.apply(update("B", &[0], 0)).unwrap());
        assert_eq!(ledger.tally(), before);
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let mut ledger = VoteLedger::new(2);
        assert!(ledger.apply(insert("A", &[0], 1)).unwrap());
        let once = ledger.tally();

        assert!(!ledger.apply(insert("A", &[0], 1)).unwrap());
        assert_eq!(ledger.tally(), once);
    }

    #[test]
    fn duplicate_delete_is_idempotent() {
        let mut ledger = VoteLedger::new(2);
        ledger.apply(insert("A", &[0], 1)).unwrap();
        assert!(ledger.apply(delete("A", 2)).unwrap());
        let once = ledger.tally();

        assert!(!ledger.apply(delete("A", 2)).unwrap());
        assert_eq!(ledger.tally(), once);
        assert_eq!(once.total(), 0);
    }

    #[test]
    fn last_writer_wins_in_either_arrival_order() {
        let forward = {
            let mut ledger = VoteLedger::new(2);
            ledger.apply(update("A", &[0], 1)).unwrap();
            ledger.apply(update("A", &[1], 2)).unwrap();
            ledger.selection_of(&key("A")).cloned()
        };
        let reversed = {
            let mut ledger = VoteLedger::new(2);
            ledger.apply(update("A", &[1], 2)).unwrap();
            ledger.apply(update("A", &[0], 1)).unwrap();
            ledger.selection_of(&key("A")).cloned()
        };

        assert_eq!(forward, Some(selected(&[1])));
        assert_eq!(forward, reversed);
    }

    #[test]
    fn insert_newer_than_existing_acts_as_update() {
        let mut ledger = VoteLedger::new(2);
        ledger.apply(insert("A", &[0], 1)).unwrap();

        assert!(ledger.apply(insert("A", &[1], 2)).unwrap());
        assert_eq!(ledger.selection_of(&key("A")), Some(&selected(&[1])));
    }

    #[test]
    fn late_insert_cannot_resurrect_deleted_vote() {
        let mut ledger = VoteLedger::new(2);
        assert!(!ledger.apply(delete("A", 5)).unwrap());

        assert!(!ledger.apply(insert("A", &[0], 4)).unwrap());
        assert!(!ledger.has_vote(&key("A")));
        assert_eq!(ledger.tally().total(), 0);

        // A genuinely newer write is a fresh vote, not a resurrection.
        assert!(ledger.apply(insert("A", &[0], 6)).unwrap());
        assert!(ledger.has_vote(&key("A")));
    }

    #[test]
    fn identity_spaces_stay_separate() {
        let id = "7b6f3a2e";
        let mut ledger = VoteLedger::new(2);
        let user = ParticipantKey::Authenticated(uuid::Uuid::new_v4());
        let anon = ParticipantKey::Anonymous(id.to_string());

        ledger
            .apply(VoteEvent::Insert {
                key: user.clone(),
                selected: selected(&[0]),
                seq: 1,
            })
            .unwrap();
        ledger
            .apply(VoteEvent::Insert {
                key: anon.clone(),
                selected: selected(&[0]),
                seq: 1,
            })
            .unwrap();

        assert_eq!(ledger.participant_count(), 2);
        assert_eq!(ledger.tally().count(0), 2);
    }

    #[test]
    fn out_of_range_option_is_malformed() {
        let mut ledger = VoteLedger::new(2);
        let result = ledger.apply(insert("A", &[2], 1));

        assert!(matches!(result, Err(EngineError::MalformedEvent(_))));
        assert_eq!(ledger.tally().total(), 0);
    }

    #[test]
    fn empty_ledger_percentages_are_zero() {
        let tally = VoteLedger::new(3).tally();

        assert_eq!(tally.total(), 0);
        for i in 0..3 {
            assert_eq!(tally.percentage(i), 0.0);
        }
        assert_eq!(tally.percentages(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn reset_drops_all_state() {
        let mut ledger = VoteLedger::new(2);
        ledger.apply(insert("A", &[0], 1)).unwrap();
        ledger.apply(delete("B", 9)).unwrap();

        ledger.reset();

        assert_eq!(ledger.participant_count(), 0);
        // Tombstones are gone too: the replacement snapshot is authoritative.
        assert!(ledger.apply(insert("B", &[0], 1)).unwrap());
    }
}
