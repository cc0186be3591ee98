//! Consumption side of the engine.
//!
//! This module provides:
//! - Read position tracking per consumer identity
//! - Polling strategy resolution with bound clamping
//! - The message handler callback
//! - The consume loop

mod consume_loop;
mod handler;
mod offset;
mod strategy;

pub use consume_loop::{ConsumeLoop, ConsumeSummary, CycleOutcome};
pub use handler::{DeliveryMode, FnHandler, LoggingHandler, MessageHandler};
pub use offset::{OffsetTracker, PositionKey};
pub use strategy::{AdjustmentReason, PositionAdjustment, ResolvedFetch, StrategyResolver};
