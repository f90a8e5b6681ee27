//! Infrastructure layer: queue and store clients, the batching pipeline and
//! the background workers built on top of them.

pub mod analyzer;
pub mod config;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod workers;

mod integration_tests;
