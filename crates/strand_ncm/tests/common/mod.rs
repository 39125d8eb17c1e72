//! Shared helpers for manager integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use strand_membership::{
    codec, NodeDescriptor, NodesConfigUpdate, NodesConfiguration, RoleSet, StorageState,
};
use strand_ncm::{
    ConfigUpdateHook, Dependencies, InMemoryNodesConfigurationStore, NcmSettings,
    NodesConfigurationManager, OperationMode, Processor,
};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Records every `(worker, version)` hook invocation across the pool.
#[derive(Clone, Default)]
pub struct HookLog {
    entries: Arc<Mutex<Vec<(usize, u64)>>>,
}

impl HookLog {
    pub fn record(&self, worker: usize, version: u64) {
        self.entries.lock().unwrap().push((worker, version));
    }

    pub fn all(&self) -> Vec<(usize, u64)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn versions_for(&self, worker: usize) -> Vec<u64> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(w, _)| *w == worker)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn saw_version(&self, version: u64) -> bool {
        self.entries.lock().unwrap().iter().any(|(_, v)| *v == version)
    }
}

/// Reusable open/close barrier for wedging a worker inside its update hook.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn release(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock().unwrap() = true;
        condvar.notify_all();
    }

    pub fn wait(&self) {
        let (flag, condvar) = &*self.inner;
        let mut open = flag.lock().unwrap();
        while !*open {
            open = condvar.wait(open).unwrap();
        }
    }
}

/// One-node storage configuration at an explicit version, with node 1
/// shard 0 in `state`.
pub fn storage_config(version: u64, state: StorageState) -> Arc<NodesConfiguration> {
    let nc = NodesConfiguration::empty()
        .apply_update(
            &NodesConfigUpdate::AddNode {
                node: 1,
                descriptor: NodeDescriptor::new("node-1", "10.9.0.1:4440", RoleSet::storage_only())
                    .with_shard(0, state),
            },
            1_000,
        )
        .expect("build config")
        .with_version(version);
    Arc::new(nc)
}

pub fn config_v(version: u64) -> Arc<NodesConfiguration> {
    storage_config(version, StorageState::ReadWrite)
}

pub fn blob_for(config: &NodesConfiguration) -> Bytes {
    codec::serialize(config).expect("serialize config")
}

pub struct TestNcm {
    pub manager: NodesConfigurationManager,
    pub store: Arc<InMemoryNodesConfigurationStore>,
    pub processor: Arc<Processor>,
    pub hook_log: HookLog,
}

/// Route manager logs through the test harness; `RUST_LOG=debug` shows the
/// pipeline transitions.
fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn build(mode: OperationMode, workers: usize, settings: NcmSettings) -> TestNcm {
    build_with_gate(mode, workers, settings, None)
}

/// Build a manager over an in-memory store and a recording hook. When a
/// gate is given, worker 0 blocks inside the hook for `gate.1` (the gated
/// version) until the gate is released.
pub fn build_with_gate(
    mode: OperationMode,
    workers: usize,
    settings: NcmSettings,
    gate: Option<(Gate, u64)>,
) -> TestNcm {
    init_test_logging();
    let store = Arc::new(InMemoryNodesConfigurationStore::new());
    let hook_log = HookLog::default();
    let log = hook_log.clone();
    let hook: ConfigUpdateHook = Arc::new(move |ctx, nc| {
        log.record(ctx.index(), nc.version());
        if let Some((gate, gated_version)) = &gate {
            if ctx.index() == 0 && nc.version() == *gated_version {
                gate.wait();
            }
        }
    });
    let processor = Processor::with_update_hook(workers, Some(hook));
    let deps = Dependencies::new(store.clone(), processor.clone(), settings);
    let manager = NodesConfigurationManager::new(mode, deps);
    TestNcm {
        manager,
        store,
        processor,
        hook_log,
    }
}

/// Poll `cond` every few milliseconds until it holds or the deadline
/// passes; returns the final evaluation.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

pub fn proposer_storage_mode() -> OperationMode {
    let mut mode = OperationMode::for_roles(&RoleSet::storage_only());
    mode.upgrade_to_proposer();
    mode
}

pub fn quick_settings() -> NcmSettings {
    NcmSettings {
        heartbeat_interval: Duration::from_millis(50),
        ..NcmSettings::default()
    }
}

/// Settings whose heartbeat effectively never fires, for tests that need
/// full control over what reaches the manager.
pub fn manual_settings() -> NcmSettings {
    NcmSettings {
        heartbeat_interval: Duration::from_secs(3_600),
        ..NcmSettings::default()
    }
}
