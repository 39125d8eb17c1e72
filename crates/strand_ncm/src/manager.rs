//! The nodes configuration manager state machine.
//!
//! One manager runs per process. It observes the canonical configuration in
//! the store, proposes updates through compare-and-swap when locally
//! authorized, and publishes accepted versions to every worker so the whole
//! process observes configurations in strictly non-decreasing version order.
//!
//! All state transitions run on a single dedicated task draining a serial
//! mailbox; `staged` and `pending` are only ever written there. Store and
//! fan-out completions execute on arbitrary tasks, hold only weak manager
//! references, and re-post into the mailbox before touching state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};

use strand_membership::update::summarize_updates;
use strand_membership::{
    codec, ConfigVersion, NodesConfigUpdate, NodesConfiguration, EMPTY_VERSION,
};

use crate::deps::Dependencies;
use crate::error::NcmError;
use crate::mode::OperationMode;
use crate::stats::NcmStatsSnapshot;
use crate::store::{StoreError, StoreWriteOutcome};
use crate::tracer::{ConfigTraceSample, NodesConfigurationTracer, TraceSource};
use crate::tracker::ShardStateTracker;

const ADVANCE_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(10);
const CONSISTENCY_WARN_INTERVAL: Duration = Duration::from_secs(10);

type ReplySender = oneshot::Sender<Result<Arc<NodesConfiguration>, NcmError>>;

enum NcmRequest {
    Init {
        config: Arc<NodesConfiguration>,
    },
    NewBlob(Bytes),
    NewConfig(Arc<NodesConfiguration>),
    Update {
        updates: Vec<NodesConfigUpdate>,
        summary: String,
        reply: ReplySender,
    },
    ProcessingFinished(Arc<NodesConfiguration>),
    HeartBeat,
    Shutdown,
}

/// Handle to a running manager. Cheap to clone; the manager itself lives on
/// its mailbox task until shutdown.
#[derive(Clone)]
pub struct NodesConfigurationManager {
    inner: Arc<NcmInner>,
}

struct NcmInner {
    mode: RwLock<OperationMode>,
    deps: Dependencies,
    staged: RwLock<Option<Arc<NodesConfiguration>>>,
    pending: RwLock<Option<Arc<NodesConfiguration>>>,
    local: RwLock<Option<Arc<NodesConfiguration>>>,
    tx: mpsc::UnboundedSender<NcmRequest>,
    shutdown_signaled: AtomicBool,
    initialized: watch::Sender<bool>,
    shutdown_completed: watch::Sender<bool>,
    advance_error_last_logged: Mutex<Option<Instant>>,
}

impl NodesConfigurationManager {
    pub fn new(mode: OperationMode, deps: Dependencies) -> Self {
        assert!(mode.is_valid(), "invalid operation mode: {mode:?}");
        let (tx, rx) = mpsc::unbounded_channel();
        let (initialized, _) = watch::channel(false);
        let (shutdown_completed, _) = watch::channel(false);
        let inner = Arc::new(NcmInner {
            mode: RwLock::new(mode),
            deps,
            staged: RwLock::new(None),
            pending: RwLock::new(None),
            local: RwLock::new(None),
            tx,
            shutdown_signaled: AtomicBool::new(false),
            initialized,
            shutdown_completed,
            advance_error_last_logged: Mutex::new(None),
        });
        let task = NcmTask {
            inner: inner.clone(),
            tracker: ShardStateTracker::new(),
            started: false,
            lagging_beats: 0,
            last_consistency_warn: None,
        };
        tokio::spawn(task.run(rx));
        Self { inner }
    }

    /// Hand over the initial configuration (typically loaded synchronously
    /// from the store) and optionally wait for the first publish.
    ///
    /// Returns `false` only when `wait_until_initialized` was set and the
    /// first publish did not complete within the configured timeout. Must
    /// not be awaited from inside a worker-mailbox task: the wait would
    /// block the very acknowledgement it depends on.
    pub async fn init(
        &self,
        initial: Arc<NodesConfiguration>,
        wait_until_initialized: bool,
    ) -> bool {
        if self.shutdown_signaled() {
            return true;
        }
        self.inner.post(NcmRequest::Init { config: initial });
        if !wait_until_initialized {
            return true;
        }
        let mut initialized = self.inner.initialized.subscribe();
        let result = tokio::time::timeout(
            self.inner.deps.settings.init_timeout,
            initialized.wait_for(|ready| *ready),
        )
        .await;
        matches!(result, Ok(Ok(_)))
    }

    /// Propose a single update. See [`Self::update_batch`].
    pub async fn update(
        &self,
        update: NodesConfigUpdate,
    ) -> Result<Arc<NodesConfiguration>, NcmError> {
        self.update_batch(vec![update]).await
    }

    /// Propose an update batch on top of the latest known configuration.
    ///
    /// On success the returned configuration is the one accepted by the
    /// store; it flows through the publish pipeline like any other incoming
    /// version. A lost compare-and-swap surfaces as
    /// [`NcmError::VersionMismatch`] carrying the winning configuration so
    /// the caller can rebase; retries are the caller's business.
    pub async fn update_batch(
        &self,
        updates: Vec<NodesConfigUpdate>,
    ) -> Result<Arc<NodesConfiguration>, NcmError> {
        if self.shutdown_signaled() {
            return Err(NcmError::Shutdown);
        }
        if !self.inner.mode().is_proposer() {
            return Err(NcmError::Access);
        }
        if updates.is_empty() {
            return Err(NcmError::InvalidParam);
        }
        self.inner.deps.stats.record_update_requested();

        let summary = summarize_updates(&updates);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.post(NcmRequest::Update {
            updates,
            summary,
            reply: reply_tx,
        });
        match reply_rx.await {
            Ok(result) => result,
            // The mailbox task went away under us.
            Err(_) => Err(NcmError::Shutdown),
        }
    }

    /// Unconditionally replace the stored configuration. Tooling only;
    /// meant for disaster recovery, bypasses `apply_update` and the
    /// base-version check entirely.
    pub async fn overwrite(
        &self,
        config: Arc<NodesConfiguration>,
    ) -> Result<Arc<NodesConfiguration>, NcmError> {
        if self.shutdown_signaled() {
            return Err(NcmError::Shutdown);
        }
        if !self.inner.mode().is_tooling() {
            return Err(NcmError::Access);
        }
        if config.version() == EMPTY_VERSION {
            return Err(NcmError::InvalidParam);
        }
        self.inner.deps.stats.record_overwrite_requested();

        let blob = match codec::serialize(&config) {
            Ok(blob) => blob,
            Err(err) => {
                self.inner.deps.stats.record_serialization_error();
                return Err(NcmError::Serialization(err));
            }
        };

        match self.inner.deps.store.update_config(blob, None).await {
            Ok(StoreWriteOutcome::Written { version }) => {
                debug_assert_eq!(version, config.version());
                let weak = Arc::downgrade(&self.inner);
                notify_ncm_of_new_config(&weak, config.clone());
                if !self.shutdown_signaled() {
                    self.inner.deps.tracer.trace(ConfigTraceSample {
                        source: TraceSource::NcmOverwrite,
                        published: Some(config.clone()),
                        update_summary: Some(NodesConfigurationTracer::debug_json(&config)),
                    });
                }
                Ok(config)
            }
            Ok(StoreWriteOutcome::VersionMismatch { .. }) => Err(NcmError::Store(anyhow!(
                "store rejected an unconditional write"
            ))),
            Err(StoreError::Again(err)) => Err(NcmError::Again(err)),
            Err(StoreError::Other(err)) => Err(NcmError::Store(err)),
        }
    }

    /// Snapshot of the last fully published configuration.
    pub fn get_config(&self) -> Option<Arc<NodesConfiguration>> {
        self.inner.local.read().unwrap().clone()
    }

    /// Highest-version configuration known to this manager, published or
    /// not. The empty configuration when nothing has arrived yet.
    pub fn get_latest_known_config(&self) -> Arc<NodesConfiguration> {
        self.inner.latest_known_config()
    }

    pub fn upgrade_to_proposer(&self) {
        self.inner.mode.write().unwrap().upgrade_to_proposer();
    }

    pub fn operation_mode(&self) -> OperationMode {
        self.inner.mode()
    }

    pub fn shutdown_signaled(&self) -> bool {
        self.inner.shutdown_signaled()
    }

    /// Stop the manager. Idempotent; safe to call from multiple tasks.
    /// Blocks until the mailbox task has acknowledged the shutdown.
    pub async fn shutdown(&self) {
        if !self.inner.shutdown_signaled.swap(true, Ordering::SeqCst) {
            tracing::info!("nodes configuration manager shutting down");
            self.inner.deps.shutdown();
            self.inner.post(NcmRequest::Shutdown);
        }
        // Wait out a potentially in-flight init first, then the shutdown
        // acknowledgement. Both latches are released at the latest by the
        // Shutdown request, which is FIFO behind any pending init.
        let mut initialized = self.inner.initialized.subscribe();
        let _ = initialized.wait_for(|ready| *ready).await;
        let mut completed = self.inner.shutdown_completed.subscribe();
        let _ = completed.wait_for(|done| *done).await;
    }

    pub fn stats(&self) -> NcmStatsSnapshot {
        self.inner.deps.stats.snapshot()
    }
}

impl NcmInner {
    fn post(&self, request: NcmRequest) {
        if self.tx.send(request).is_err() && !self.shutdown_signaled() {
            tracing::warn!("manager mailbox closed before shutdown was signaled");
        }
    }

    fn shutdown_signaled(&self) -> bool {
        self.shutdown_signaled.load(Ordering::SeqCst)
    }

    fn mode(&self) -> OperationMode {
        *self.mode.read().unwrap()
    }

    fn local_version(&self) -> ConfigVersion {
        self.local
            .read()
            .unwrap()
            .as_ref()
            .map(|nc| nc.version())
            .unwrap_or(EMPTY_VERSION)
    }

    fn latest_known_config(&self) -> Arc<NodesConfiguration> {
        let mut best = self.local.read().unwrap().clone();
        for slot in [&self.pending, &self.staged] {
            let candidate = slot.read().unwrap().clone();
            if let Some(candidate) = candidate {
                best = match best {
                    Some(current) if current.version() >= candidate.version() => Some(current),
                    _ => Some(candidate),
                };
            }
        }
        best.unwrap_or_else(NodesConfiguration::shared_empty)
    }

    fn has_processed(&self, version: ConfigVersion) -> bool {
        self.local_version() >= version
    }

    fn is_processing_equal_or_higher(&self, version: ConfigVersion) -> bool {
        self.pending
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|nc| nc.version() >= version)
    }

    fn should_stage(&self, version: ConfigVersion) -> bool {
        let above_staged = self
            .staged
            .read()
            .unwrap()
            .as_ref()
            .map_or(true, |nc| nc.version() < version);
        above_staged && !self.is_processing_equal_or_higher(version) && !self.has_processed(version)
    }

    fn log_advance_failure(&self, err: &NcmError) {
        let mut last = self.advance_error_last_logged.lock().unwrap();
        let due = last.map_or(true, |at| at.elapsed() >= ADVANCE_ERROR_LOG_INTERVAL);
        if due {
            *last = Some(Instant::now());
            tracing::error!(error = %err, "attempt to advance intermediary shard states failed");
        }
    }
}

/// The mailbox task. Owns the shard-state tracker and everything else that
/// must only be touched from the manager's serial execution context.
struct NcmTask {
    inner: Arc<NcmInner>,
    tracker: ShardStateTracker,
    started: bool,
    lagging_beats: u32,
    last_consistency_warn: Option<Instant>,
}

impl NcmTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<NcmRequest>) {
        while let Some(request) = rx.recv().await {
            match request {
                NcmRequest::Init { config } => self.on_init(config),
                NcmRequest::NewBlob(blob) => self.on_new_blob(&blob),
                NcmRequest::NewConfig(config) => self.on_new_config(config),
                NcmRequest::Update {
                    updates,
                    summary,
                    reply,
                } => self.on_update_request(updates, summary, reply),
                NcmRequest::ProcessingFinished(config) => self.on_processing_finished(config),
                NcmRequest::HeartBeat => self.on_heart_beat(),
                NcmRequest::Shutdown => {
                    self.on_shutdown();
                    break;
                }
            }
        }
    }

    fn on_init(&mut self, config: Arc<NodesConfiguration>) {
        if self.inner.shutdown_signaled() {
            return;
        }
        if !self.started {
            self.started = true;
            self.start_background();
            self.inner.deps.stats.set_started();
        }
        self.on_new_config(config);
    }

    fn start_background(&self) {
        let interval = self.inner.deps.settings.heartbeat_interval;
        let weak = Arc::downgrade(&self.inner);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.shutdown_signaled() {
                    break;
                }
                inner.post(NcmRequest::HeartBeat);
            }
        });
        self.inner.deps.register_background(heartbeat);

        let mut subscription = self.inner.deps.store.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(blob) = subscription.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if inner.shutdown_signaled() {
                    break;
                }
                inner.post(NcmRequest::NewBlob(blob));
            }
        });
        self.inner.deps.register_background(pump);
    }

    fn on_new_blob(&mut self, blob: &[u8]) {
        self.inner.deps.stats.record_config_received();
        if self.inner.shutdown_signaled() {
            return;
        }

        let Some(version) = codec::extract_version(blob) else {
            self.inner.deps.stats.record_serialization_error();
            tracing::warn!("discarding configuration blob with unparsable header");
            return;
        };
        if self.inner.has_processed(version) {
            // Saves the full parse for blobs we already published.
            return;
        }
        match codec::deserialize(blob) {
            Ok(config) => self.on_new_config(Arc::new(config)),
            Err(err) => {
                self.inner.deps.stats.record_serialization_error();
                tracing::warn!(error = ?err, version, "discarding undecodable configuration blob");
            }
        }
    }

    fn on_new_config(&mut self, config: Arc<NodesConfiguration>) {
        if self.inner.shutdown_signaled() {
            return;
        }
        let version = config.version();
        if !self.inner.should_stage(version) {
            return;
        }
        tracing::debug!(version, "staging nodes configuration");
        *self.inner.staged.write().unwrap() = Some(config.clone());

        self.tracker.on_new_config(&config, SystemTime::now());
        self.advance_intermediary_shard_states();

        self.inner.deps.stats.set_staged_version(version);
        self.maybe_process_staged();
    }

    fn maybe_process_staged(&mut self) {
        if self.inner.pending.read().unwrap().is_some() {
            return;
        }
        let Some(config) = self.inner.staged.write().unwrap().take() else {
            return;
        };
        let version = config.version();
        assert!(
            !self.inner.has_processed(version),
            "staged configuration {version} was already published"
        );
        tracing::debug!(version, "processing staged nodes configuration");
        *self.inner.pending.write().unwrap() = Some(config.clone());
        self.inner.deps.stats.set_pending_version(version);

        // Non-worker consumers read the process-wide slot.
        self.inner
            .deps
            .processor
            .publish_nodes_configuration(config.clone());

        let hook = self.inner.deps.processor.update_hook();
        let fan_out_config = config.clone();
        let acks = self.inner.deps.processor.fulfill_on_all_workers(move |ctx| {
            ctx.set_nodes_configuration(fan_out_config.clone());
            if let Some(hook) = &hook {
                hook(ctx, &fan_out_config);
            }
            tracing::debug!(
                worker = ctx.index(),
                version = fan_out_config.version(),
                "applied nodes configuration on worker"
            );
        });

        // There is deliberately no per-worker timeout here: no future
        // configuration can be published anywhere until every worker took
        // this one, so a stuck worker stalls the pipeline either way.
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let results = join_all(acks).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.shutdown_signaled() {
                return;
            }
            // Workers may not fail to accept a configuration.
            assert!(
                results.iter().all(|ack| ack.is_ok()),
                "a worker dropped the configuration fan-out task for version {version}"
            );
            tracing::debug!(version, "fan-out complete");
            inner.post(NcmRequest::ProcessingFinished(config));
        });
    }

    fn on_processing_finished(&mut self, config: Arc<NodesConfiguration>) {
        let version = config.version();
        let pending = self.inner.pending.write().unwrap().take();
        let Some(pending) = pending else {
            panic!("fan-out finished for version {version} with no pending configuration");
        };
        assert_eq!(
            pending.version(),
            version,
            "fan-out finished for a version that is not pending"
        );
        assert!(
            !self.inner.has_processed(version),
            "fan-out finished for an already published version {version}"
        );

        *self.inner.local.write().unwrap() = Some(pending);
        self.inner.initialized.send_replace(true);

        tracing::info!(version, "published nodes configuration");
        self.inner.deps.stats.record_config_published();
        self.inner.deps.stats.set_published_version(version);

        self.maybe_process_staged();
    }

    fn on_update_request(
        &mut self,
        updates: Vec<NodesConfigUpdate>,
        summary: String,
        reply: ReplySender,
    ) {
        if !self.inner.mode().is_proposer() {
            let _ = reply.send(Err(NcmError::Access));
            return;
        }

        let base = self.inner.latest_known_config();
        let base_version = base.version();
        let applied = match base.apply_updates(&updates, unix_time_ms()) {
            Ok(config) => config,
            Err(err) => {
                let _ = reply.send(Err(NcmError::FailedUpdate(err)));
                return;
            }
        };
        // Application bumps the version once per batch element; the
        // published sequence advances by exactly one per accepted write.
        let new_config = Arc::new(applied.with_version(base_version + 1));

        let blob = match codec::serialize(&new_config) {
            Ok(blob) => blob,
            Err(err) => {
                self.inner.deps.stats.record_serialization_error();
                let _ = reply.send(Err(NcmError::Serialization(err)));
                return;
            }
        };

        // The compare-and-swap runs off the mailbox task; its completion
        // re-posts the accepted configuration.
        let store = self.inner.deps.store.clone();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let outcome = store.update_config(blob, Some(base_version)).await;
            let result = complete_store_write(&weak, outcome, new_config, summary);
            let _ = reply.send(result);
        });
    }

    fn on_heart_beat(&mut self) {
        if self.inner.shutdown_signaled() {
            return;
        }
        self.read_from_store();
        self.advance_intermediary_shard_states();
        if self.inner.deps.settings.server {
            self.check_and_report_consistency();
        }
    }

    fn read_from_store(&self) {
        let consistent = self.should_do_consistent_fetch();
        let store = self.inner.deps.store.clone();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            match store.get_config(consistent).await {
                Ok(Some(blob)) => {
                    let Some(inner) = weak.upgrade() else { return };
                    if inner.shutdown_signaled() {
                        return;
                    }
                    inner.post(NcmRequest::NewBlob(blob));
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(error = %err, "store poll failed"),
            }
        });
    }

    /// Storage members must not serve local storage code a stale view on
    /// startup; until the first publish their polls bypass store caches.
    fn should_do_consistent_fetch(&self) -> bool {
        self.inner.mode().is_storage_member() && self.inner.local.read().unwrap().is_none()
    }

    fn advance_intermediary_shard_states(&mut self) {
        if !self.inner.mode().is_proposer() || self.inner.shutdown_signaled() {
            return;
        }
        let timeout = self.inner.deps.settings.intermediary_shard_state_timeout;
        let Some(till) = SystemTime::now().checked_sub(timeout) else {
            return;
        };
        let latest = self.inner.latest_known_config();
        let Some(updates) = self.tracker.extract_nc_update(&latest, till) else {
            return;
        };
        tracing::info!(
            count = updates.len(),
            "proposing transitions out of timed-out intermediary shard states"
        );
        self.inner.deps.stats.record_update_requested();

        let summary = summarize_updates(&updates);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.post(NcmRequest::Update {
            updates,
            summary,
            reply: reply_tx,
        });

        // Losing the race or landing the write are both fine; the next
        // heartbeat re-evaluates. Anything else is reported.
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let result = match reply_rx.await {
                Ok(result) => result,
                Err(_) => return,
            };
            match result {
                Ok(_) => {}
                Err(err) if err.is_version_mismatch() => {}
                Err(err) => {
                    let Some(inner) = weak.upgrade() else { return };
                    if inner.shutdown_signaled() {
                        return;
                    }
                    inner.log_advance_failure(&err);
                    inner.deps.stats.record_advance_intermediary_failed();
                }
            }
        });
    }

    fn check_and_report_consistency(&mut self) {
        let local_version = self.inner.local_version();
        let latest_version = self.inner.latest_known_config().version();
        if local_version >= latest_version {
            self.lagging_beats = 0;
            return;
        }
        // One beat behind is normal while a fan-out is in flight.
        self.lagging_beats += 1;
        if self.lagging_beats < 2 {
            return;
        }
        let due = self
            .last_consistency_warn
            .map_or(true, |at| at.elapsed() >= CONSISTENCY_WARN_INTERVAL);
        if due {
            self.last_consistency_warn = Some(Instant::now());
            tracing::warn!(
                published = local_version,
                latest = latest_version,
                beats = self.lagging_beats,
                "published configuration is lagging the latest known version"
            );
        }
    }

    fn on_shutdown(&mut self) {
        // Release init waiters even when the first publish never happened.
        self.inner.initialized.send_replace(true);
        self.inner.shutdown_completed.send_replace(true);
    }
}

fn notify_ncm_of_new_config(weak: &Weak<NcmInner>, config: Arc<NodesConfiguration>) {
    let Some(inner) = weak.upgrade() else { return };
    if inner.shutdown_signaled() {
        return;
    }
    tracing::info!(
        version = config.version(),
        "notifying manager of stored configuration"
    );
    inner.post(NcmRequest::NewConfig(config));
}

fn complete_store_write(
    weak: &Weak<NcmInner>,
    outcome: Result<StoreWriteOutcome, StoreError>,
    new_config: Arc<NodesConfiguration>,
    summary: String,
) -> Result<Arc<NodesConfiguration>, NcmError> {
    match outcome {
        Ok(StoreWriteOutcome::Written { version }) => {
            debug_assert_eq!(version, new_config.version());
            if let Some(inner) = weak.upgrade() {
                if !inner.shutdown_signaled() {
                    inner.deps.tracer.trace(ConfigTraceSample {
                        source: TraceSource::NcmUpdate,
                        published: Some(new_config.clone()),
                        update_summary: Some(summary),
                    });
                }
            }
            notify_ncm_of_new_config(weak, new_config.clone());
            Ok(new_config)
        }
        Ok(StoreWriteOutcome::VersionMismatch {
            version,
            blob: Some(stored_blob),
        }) if version != EMPTY_VERSION => match codec::deserialize(&stored_blob) {
            Ok(stored) => {
                debug_assert_eq!(stored.version(), version);
                debug_assert!(stored.version() > new_config.version());
                let stored = Arc::new(stored);
                notify_ncm_of_new_config(weak, stored.clone());
                Err(NcmError::VersionMismatch(Some(stored)))
            }
            Err(err) => {
                tracing::error!(error = ?err, version, "winning configuration blob failed to decode");
                Err(NcmError::Store(err))
            }
        },
        Ok(StoreWriteOutcome::VersionMismatch { .. }) => Err(NcmError::VersionMismatch(None)),
        Err(StoreError::Again(err)) => Err(NcmError::Again(err)),
        Err(StoreError::Other(err)) => Err(NcmError::Store(err)),
    }
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
