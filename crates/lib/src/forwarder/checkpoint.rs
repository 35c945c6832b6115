//! In-memory view of which ingested offsets are still unsettled.
//!
//! The durable checkpoint may only move to offset N once every message at or below N has a
//! terminal record for each of its targets. With several messages in flight at once, completions
//! arrive out of order; the tracker turns them into the highest contiguous settled offset.

use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Default)]
pub struct CheckpointTracker {
    /// Offset -> targets still unsettled for the message at that offset.
    outstanding: BTreeMap<i64, HashSet<String>>,
    /// Highest offset ever tracked.
    high_water: Option<i64>,
    /// Last value handed out by `commit`.
    committed: Option<i64>,
}

impl CheckpointTracker {
    /// Start from the durable checkpoint.
    pub fn new(committed: Option<i64>) -> Self {
        Self {
            outstanding: BTreeMap::new(),
            high_water: committed,
            committed,
        }
    }

    /// Register a message offset with the targets that still need a terminal record.
    /// An empty set marks the offset as settled on arrival.
    pub fn track(&mut self, offset: i64, targets: impl IntoIterator<Item = String>) {
        let entry = self.outstanding.entry(offset).or_default();
        entry.extend(targets);
        self.high_water = Some(self.high_water.map_or(offset, |h| h.max(offset)));
    }

    /// Mark one target of the message at `offset` as settled.
    pub fn resolve(&mut self, offset: i64, target_id: &str) {
        if let Some(set) = self.outstanding.get_mut(&offset) {
            set.remove(target_id);
        }
    }

    /// Highest offset safe to persist, when it is above the committed one.
    pub fn candidate(&self) -> Option<i64> {
        let lowest_open = self
            .outstanding
            .iter()
            .find(|(_, targets)| !targets.is_empty())
            .map(|(offset, _)| *offset);
        let safe = match lowest_open {
            Some(open) => {
                let below = open - 1;
                // Nothing tracked below the open offset and no durable checkpoint yet: no progress.
                if self.committed.is_none() && !self.outstanding.keys().any(|k| *k < open) {
                    return None;
                }
                below
            }
            None => self.high_water?,
        };
        match self.committed {
            Some(c) if safe <= c => None,
            _ => Some(safe),
        }
    }

    /// Record that `offset` was persisted and drop fully settled entries at or below it.
    pub fn commit(&mut self, offset: i64) {
        if self.committed.map_or(false, |c| offset <= c) {
            return;
        }
        self.committed = Some(offset);
        self.outstanding
            .retain(|k, targets| *k > offset || !targets.is_empty());
    }

    /// Number of messages with unsettled targets.
    pub fn open_messages(&self) -> usize {
        self.outstanding.values().filter(|t| !t.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn out_of_order_completion_holds_checkpoint() {
        let mut t = CheckpointTracker::new(Some(10));
        t.track(11, ids(&["a"]));
        t.track(12, ids(&["a", "b"]));
        t.resolve(12, "a");
        t.resolve(12, "b");
        assert_eq!(t.candidate(), None);
        t.resolve(11, "a");
        assert_eq!(t.candidate(), Some(12));
        t.commit(12);
        assert_eq!(t.candidate(), None);
        assert_eq!(t.open_messages(), 0);
    }

    #[test]
    fn partial_progress_stops_below_open_message() {
        let mut t = CheckpointTracker::new(None);
        t.track(1, ids(&["a"]));
        t.track(2, ids(&["a"]));
        t.track(3, ids(&["a"]));
        t.resolve(1, "a");
        t.resolve(3, "a");
        assert_eq!(t.candidate(), Some(1));
        t.commit(1);
        assert_eq!(t.candidate(), None);
        t.resolve(2, "a");
        assert_eq!(t.candidate(), Some(3));
    }

    #[test]
    fn first_message_open_with_no_checkpoint_gives_nothing() {
        let mut t = CheckpointTracker::new(None);
        t.track(5, ids(&["a"]));
        assert_eq!(t.candidate(), None);
    }

    #[test]
    fn messages_without_targets_advance_immediately() {
        let mut t = CheckpointTracker::new(Some(3));
        t.track(4, Vec::new());
        assert_eq!(t.candidate(), Some(4));
    }

    #[test]
    fn commit_never_moves_backwards() {
        let mut t = CheckpointTracker::new(Some(9));
        t.commit(4);
        assert_eq!(t.candidate(), None);
        t.track(10, Vec::new());
        assert_eq!(t.candidate(), Some(10));
        t.commit(10);
        t.track(2, ids(&["late"]));
        t.resolve(2, "late");
        assert_eq!(t.candidate(), None);
    }
}
