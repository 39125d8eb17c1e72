//! Per-process nodes configuration manager for a strand cluster.
//!
//! Every process (client, storage node, sequencer, operator tool) runs one
//! [`NodesConfigurationManager`]. It observes the canonical configuration in
//! a durable compare-and-swap store, proposes updates when its
//! [`OperationMode`] allows, and publishes accepted versions to every worker
//! in the process in strictly non-decreasing version order.

pub mod deps;
pub mod error;
pub mod manager;
pub mod mode;
pub mod processor;
pub mod stats;
pub mod store;
pub mod tracer;
pub mod tracker;

pub use deps::{Dependencies, NcmSettings};
pub use error::NcmError;
pub use manager::NodesConfigurationManager;
pub use mode::OperationMode;
pub use processor::{ConfigUpdateHook, Processor, WorkerContext};
pub use stats::{NcmStats, NcmStatsSnapshot};
pub use store::{
    FjallNodesConfigurationStore, InMemoryNodesConfigurationStore, NodesConfigurationStore,
    StoreError, StoreWriteOutcome,
};
pub use tracer::{ConfigTraceSample, NodesConfigurationTracer, TraceSource};
pub use tracker::ShardStateTracker;
