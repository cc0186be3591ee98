//! Turns a polling intent into a concrete fetch start.

use crate::broker::PartitionBounds;
use crate::model::PollingStrategy;
use std::fmt;

/// Why a read position was moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentReason {
    /// Messages before the position were removed by retention
    BelowLowWaterMark,
    /// The position points past the last assigned offset
    BeyondHighWaterMark,
}

impl fmt::Display for AdjustmentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustmentReason::BelowLowWaterMark => f.write_str("below_low_water_mark"),
            AdjustmentReason::BeyondHighWaterMark => f.write_str("beyond_high_water_mark"),
        }
    }
}

/// A tracked position that fell outside the readable range and was clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionAdjustment {
    /// Position the consumer asked for
    pub requested: u64,
    /// Position actually used
    pub adjusted: u64,
    /// Why the position moved
    pub reason: AdjustmentReason,
}

/// Outcome of resolving a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFetch {
    /// Offset the fetch starts at
    pub offset: u64,
    /// Set when the tracked position had to be clamped
    pub adjustment: Option<PositionAdjustment>,
}

impl ResolvedFetch {
    /// Strategy to put on the wire.
    pub fn strategy(&self) -> PollingStrategy {
        PollingStrategy::Offset(self.offset)
    }

    /// Whether the position was clamped.
    pub fn is_adjusted(&self) -> bool {
        self.adjustment.is_some()
    }
}

/// Resolves polling strategies against a tracked position and the
/// partition's bounds.
///
/// - `Offset(v)` resolves to `v`, whatever the tracked position.
/// - `Next` resolves to the tracked position, clamped to the low-water mark
///   when it falls outside `[low, high]`.
/// - `First` resolves to the low-water mark.
/// - `Last` resolves to the start of the last `count` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyResolver {
    count: u32,
}

impl StrategyResolver {
    /// Resolver for polls of `count` messages.
    pub fn new(count: u32) -> Self {
        Self { count }
    }

    /// Messages per poll.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Resolve `strategy` given the tracked `current` position.
    pub fn resolve(
        &self,
        strategy: PollingStrategy,
        current: u64,
        bounds: &PartitionBounds,
    ) -> ResolvedFetch {
        match strategy {
            PollingStrategy::Offset(value) => ResolvedFetch {
                offset: value,
                adjustment: None,
            },
            PollingStrategy::Next => Self::clamp(current, bounds),
            PollingStrategy::First => ResolvedFetch {
                offset: bounds.low_water_mark,
                adjustment: None,
            },
            PollingStrategy::Last => ResolvedFetch {
                offset: bounds
                    .high_water_mark
                    .saturating_sub(self.count as u64)
                    .max(bounds.low_water_mark),
                adjustment: None,
            },
        }
    }

    fn clamp(current: u64, bounds: &PartitionBounds) -> ResolvedFetch {
        let reason = if current < bounds.low_water_mark {
            Some(AdjustmentReason::BelowLowWaterMark)
        } else if current > bounds.high_water_mark {
            Some(AdjustmentReason::BeyondHighWaterMark)
        } else {
            None
        };

        match reason {
            Some(reason) => ResolvedFetch {
                offset: bounds.low_water_mark,
                adjustment: Some(PositionAdjustment {
                    requested: current,
                    adjusted: bounds.low_water_mark,
                    reason,
                }),
            },
            None => ResolvedFetch {
                offset: current,
                adjustment: None,
            },
        }
    }
}
