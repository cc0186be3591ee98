//! Production side of the engine.

mod batch;
mod payload;
mod produce_loop;

pub use batch::{BatchProducer, DispatchReport};
pub use payload::{FinitePayloads, PayloadSource, SequentialPayloads};
pub use produce_loop::{BatchOutcome, ProduceLoop, ProduceSummary};
