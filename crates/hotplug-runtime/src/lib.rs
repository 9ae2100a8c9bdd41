#![doc = "Lifecycle engine for hot-plug validation runs."]

pub mod aggregator;
pub mod budget;
pub mod orchestrator;
pub mod recovery;

pub use aggregator::*;
pub use budget::*;
pub use orchestrator::*;
pub use recovery::*;
