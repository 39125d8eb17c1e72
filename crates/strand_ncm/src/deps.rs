//! Dependency bundle handed to the manager at construction.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::processor::Processor;
use crate::stats::NcmStats;
use crate::store::NodesConfigurationStore;
use crate::tracer::NodesConfigurationTracer;

/// Tunables for one manager instance.
#[derive(Debug, Clone)]
pub struct NcmSettings {
    /// How often the manager polls the store and re-evaluates timeouts.
    pub heartbeat_interval: Duration,
    /// How long a shard may sit in an intermediary membership state before a
    /// proposer forces it out.
    pub intermediary_shard_state_timeout: Duration,
    /// Upper bound on `init(wait = true)`.
    pub init_timeout: Duration,
    /// Server processes run the consistency self-check on every heartbeat.
    pub server: bool,
}

impl Default for NcmSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            intermediary_shard_state_timeout: Duration::from_secs(180),
            init_timeout: Duration::from_secs(10),
            server: false,
        }
    }
}

/// External collaborators of the manager: the durable store, the worker
/// pool, telemetry sinks, and settings. Also owns the background task
/// handles (heartbeat, store subscription pump) so shutdown can stop them.
pub struct Dependencies {
    pub store: Arc<dyn NodesConfigurationStore>,
    pub processor: Arc<Processor>,
    pub stats: Arc<NcmStats>,
    pub tracer: NodesConfigurationTracer,
    pub settings: NcmSettings,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Dependencies {
    pub fn new(
        store: Arc<dyn NodesConfigurationStore>,
        processor: Arc<Processor>,
        settings: NcmSettings,
    ) -> Self {
        Self {
            store,
            processor,
            stats: Arc::new(NcmStats::default()),
            tracer: NodesConfigurationTracer::default(),
            settings,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tracer(mut self, tracer: NodesConfigurationTracer) -> Self {
        self.tracer = tracer;
        self
    }

    pub(crate) fn register_background(&self, handle: JoinHandle<()>) {
        self.background.lock().unwrap().push(handle);
    }

    /// Stop the heartbeat and subscription tasks. Safe to call more than
    /// once.
    pub(crate) fn shutdown(&self) {
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}
