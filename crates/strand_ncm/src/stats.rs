//! Manager telemetry counters and gauges.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter/gauge block for one manager instance. All fields are updated with
/// relaxed atomics; `snapshot` gives a consistent-enough view for logging
/// and tests.
#[derive(Default)]
pub struct NcmStats {
    config_received: AtomicU64,
    updates_requested: AtomicU64,
    overwrites_requested: AtomicU64,
    serialization_errors: AtomicU64,
    config_published: AtomicU64,
    advance_intermediary_failed: AtomicU64,
    staged_version: AtomicU64,
    pending_version: AtomicU64,
    published_version: AtomicU64,
    started: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NcmStatsSnapshot {
    pub config_received: u64,
    pub updates_requested: u64,
    pub overwrites_requested: u64,
    pub serialization_errors: u64,
    pub config_published: u64,
    pub advance_intermediary_failed: u64,
    pub staged_version: u64,
    pub pending_version: u64,
    pub published_version: u64,
    pub started: u64,
}

impl NcmStats {
    pub fn record_config_received(&self) {
        self.config_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update_requested(&self) {
        self.updates_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overwrite_requested(&self) {
        self.overwrites_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_serialization_error(&self) {
        self.serialization_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_config_published(&self) {
        self.config_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_advance_intermediary_failed(&self) {
        self.advance_intermediary_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_staged_version(&self, version: u64) {
        self.staged_version.store(version, Ordering::Relaxed);
    }

    pub fn set_pending_version(&self, version: u64) {
        self.pending_version.store(version, Ordering::Relaxed);
    }

    pub fn set_published_version(&self, version: u64) {
        self.published_version.store(version, Ordering::Relaxed);
    }

    pub fn set_started(&self) {
        self.started.store(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NcmStatsSnapshot {
        NcmStatsSnapshot {
            config_received: self.config_received.load(Ordering::Relaxed),
            updates_requested: self.updates_requested.load(Ordering::Relaxed),
            overwrites_requested: self.overwrites_requested.load(Ordering::Relaxed),
            serialization_errors: self.serialization_errors.load(Ordering::Relaxed),
            config_published: self.config_published.load(Ordering::Relaxed),
            advance_intermediary_failed: self.advance_intermediary_failed.load(Ordering::Relaxed),
            staged_version: self.staged_version.load(Ordering::Relaxed),
            pending_version: self.pending_version.load(Ordering::Relaxed),
            published_version: self.published_version.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
        }
    }
}
