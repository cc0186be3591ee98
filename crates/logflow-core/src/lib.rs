//! logflow core - produce/consume engine for partitioned log brokers
//!
//! This library drives a stream → topic → partition log broker from the
//! client side:
//!
//! - Idempotent stream and topic provisioning (lookup, then create)
//! - Bounded batch production with pass-through partitioning
//! - Polling with offset, next, first and last strategies
//! - Read position tracking per consumer identity, local or broker-committed
//! - Produce and consume loops with explicit failure policies
//!
//! The broker itself sits behind the [`broker::BrokerClient`] trait.
//! [`broker::InMemoryBroker`] implements it in-process.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod identifier;
pub mod metrics;
pub mod model;
pub mod producer;
pub mod provisioner;
pub mod retry;
pub mod session;

// Re-export commonly used types
pub use config::Config;
pub use error::{BoxError, Error, ErrorKind, Result};
pub use identifier::ResourceIdentifier;
