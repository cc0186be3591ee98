//! Read position tracking per consumer identity.

use crate::identifier::ResourceIdentifier;
use crate::model::Consumer;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Key of one tracked read position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub stream: ResourceIdentifier,
    pub topic: ResourceIdentifier,
    pub partition_id: u32,
    pub consumer: Consumer,
}

impl PositionKey {
    /// Create a key.
    pub fn new(
        stream: ResourceIdentifier,
        topic: ResourceIdentifier,
        partition_id: u32,
        consumer: Consumer,
    ) -> Self {
        Self {
            stream,
            topic,
            partition_id,
            consumer,
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.stream, self.topic, self.partition_id, self.consumer
        )
    }
}

/// Tracks the next offset to read for each (stream, topic, partition, consumer).
///
/// Positions only move forward through [`advance`](Self::advance) and
/// [`resync`](Self::resync). [`reposition`](Self::reposition) is the one way
/// to move a position backwards and is reserved for bound clamping.
pub struct OffsetTracker {
    positions: DashMap<PositionKey, AtomicU64>,
}

impl OffsetTracker {
    /// Create a new offset tracker.
    pub fn new() -> Self {
        Self {
            positions: DashMap::new(),
        }
    }

    /// Get the tracked position, if any.
    pub fn get(&self, key: &PositionKey) -> Option<u64> {
        self.positions.get(key).map(|v| v.load(Ordering::SeqCst))
    }

    /// Get the next offset to read; untracked positions read from 0.
    pub fn current(&self, key: &PositionKey) -> u64 {
        self.get(key).unwrap_or(0)
    }

    /// Whether a position has been seeded for this key.
    pub fn is_tracked(&self, key: &PositionKey) -> bool {
        self.positions.contains_key(key)
    }

    /// Set the starting position of an untracked key. An already tracked
    /// position is left alone. Returns the effective position.
    pub fn seed(&self, key: &PositionKey, offset: u64) -> u64 {
        self.positions
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(position = %key, offset, "Position seeded");
                AtomicU64::new(offset)
            })
            .load(Ordering::SeqCst)
    }

    /// Move the position forward by `count` processed messages. Returns the
    /// new position.
    pub fn advance(&self, key: &PositionKey, count: u64) -> u64 {
        let entry = self
            .positions
            .entry(key.clone())
            .or_insert_with(|| AtomicU64::new(0));
        entry.fetch_add(count, Ordering::SeqCst) + count
    }

    /// Adopt the broker's committed position. A committed position behind
    /// the local one is ignored. Returns the resulting position.
    pub fn resync(&self, key: &PositionKey, committed: u64) -> u64 {
        let entry = self
            .positions
            .entry(key.clone())
            .or_insert_with(|| AtomicU64::new(committed));
        let previous = entry.fetch_max(committed, Ordering::SeqCst);
        if committed < previous {
            warn!(
                position = %key,
                local = previous,
                committed,
                "Committed offset is behind the local position, keeping local"
            );
        }
        previous.max(committed)
    }

    /// Overwrite the position, in either direction.
    pub fn reposition(&self, key: &PositionKey, offset: u64) {
        self.positions
            .entry(key.clone())
            .and_modify(|v| v.store(offset, Ordering::SeqCst))
            .or_insert_with(|| AtomicU64::new(offset));
    }

    /// Stop tracking a position. Returns the last value.
    pub fn remove(&self, key: &PositionKey) -> Option<u64> {
        self.positions
            .remove(key)
            .map(|(_, v)| v.load(Ordering::SeqCst))
    }

    /// Get all tracked positions.
    pub fn positions(&self) -> Vec<(PositionKey, u64)> {
        self.positions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::SeqCst)))
            .collect()
    }

    /// Clear all tracked positions.
    pub fn clear(&self) {
        self.positions.clear();
    }
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(consumer: u32) -> PositionKey {
        PositionKey::new(
            ResourceIdentifier::Named("sample-stream".into()),
            ResourceIdentifier::Named("sample-topic".into()),
            1,
            Consumer::new(ResourceIdentifier::Numeric(consumer)),
        )
    }

    #[test]
    fn test_untracked_position_reads_zero() {
        let tracker = OffsetTracker::new();
        assert_eq!(tracker.current(&key(1)), 0);
        assert!(!tracker.is_tracked(&key(1)));
        assert_eq!(tracker.get(&key(1)), None);
    }

    #[test]
    fn test_seed_only_applies_once() {
        let tracker = OffsetTracker::new();
        assert_eq!(tracker.seed(&key(1), 5), 5);
        assert_eq!(tracker.seed(&key(1), 0), 5);
        assert_eq!(tracker.current(&key(1)), 5);
    }

    #[test]
    fn test_advance_by_exact_count() {
        let tracker = OffsetTracker::new();
        tracker.seed(&key(1), 0);

        assert_eq!(tracker.advance(&key(1), 10), 10);
        assert_eq!(tracker.advance(&key(1), 0), 10);
        assert_eq!(tracker.advance(&key(1), 3), 13);
        assert_eq!(tracker.current(&key(1)), 13);
    }

    #[test]
    fn test_resync_never_moves_backwards() {
        let tracker = OffsetTracker::new();
        tracker.seed(&key(1), 10);

        assert_eq!(tracker.resync(&key(1), 15), 15);
        assert_eq!(tracker.resync(&key(1), 12), 15);
        assert_eq!(tracker.current(&key(1)), 15);

        // Resync of an untracked key adopts the committed value
        assert_eq!(tracker.resync(&key(2), 7), 7);
    }

    #[test]
    fn test_positions_scoped_per_consumer() {
        let tracker = OffsetTracker::new();
        tracker.seed(&key(1), 0);
        tracker.seed(&key(2), 0);

        tracker.advance(&key(1), 10);
        assert_eq!(tracker.current(&key(1)), 10);
        assert_eq!(tracker.current(&key(2)), 0);

        let group = PositionKey {
            consumer: Consumer::group(ResourceIdentifier::Numeric(1)),
            ..key(1)
        };
        assert_eq!(tracker.current(&group), 0);
        assert_eq!(tracker.positions().len(), 2);
    }

    #[test]
    fn test_reposition_and_remove() {
        let tracker = OffsetTracker::new();
        tracker.seed(&key(1), 20);
        tracker.reposition(&key(1), 4);
        assert_eq!(tracker.current(&key(1)), 4);

        assert_eq!(tracker.remove(&key(1)), Some(4));
        assert!(!tracker.is_tracked(&key(1)));

        tracker.seed(&key(2), 1);
        tracker.clear();
        assert!(tracker.positions().is_empty());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(
            key(1).to_string(),
            "sample-stream/sample-topic/1@consumer:1"
        );
    }
}
