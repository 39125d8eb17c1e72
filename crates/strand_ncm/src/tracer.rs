//! Sampled tracing of accepted configuration changes.

use std::sync::Arc;

use strand_membership::{codec, NodesConfiguration, EMPTY_VERSION};

/// Where a traced configuration change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSource {
    NcmUpdate,
    NcmOverwrite,
    Unknown,
}

impl TraceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceSource::NcmUpdate => "ncm_update",
            TraceSource::NcmOverwrite => "ncm_overwrite",
            TraceSource::Unknown => "unknown",
        }
    }
}

/// One accepted change, captured for sampling.
pub struct ConfigTraceSample {
    pub source: TraceSource,
    pub published: Option<Arc<NodesConfiguration>>,
    /// Compact rendering of the update batch (or the overwritten document).
    pub update_summary: Option<String>,
}

/// Emits a fraction of accepted changes as structured log events.
#[derive(Debug, Clone)]
pub struct NodesConfigurationTracer {
    sample_rate: f64,
}

pub const DEFAULT_SAMPLE_RATE: f64 = 0.1;

impl Default for NodesConfigurationTracer {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl NodesConfigurationTracer {
    pub fn with_sample_rate(sample_rate: f64) -> Self {
        Self {
            sample_rate: sample_rate.clamp(0.0, 1.0),
        }
    }

    pub fn trace(&self, sample: ConfigTraceSample) {
        if self.sample_rate < 1.0 && rand::random::<f64>() >= self.sample_rate {
            return;
        }

        let (version, ctime_ms) = match &sample.published {
            Some(nc) => (nc.version(), nc.last_change_at_ms()),
            None => {
                // An accepted change always carries the published document.
                tracing::error!(
                    source = sample.source.as_str(),
                    "published configuration missing from trace sample"
                );
                (EMPTY_VERSION, 0)
            }
        };

        tracing::info!(
            target: "strand_ncm::tracer",
            source = sample.source.as_str(),
            published_version = version,
            published_ctime_ms = ctime_ms,
            update = sample.update_summary.as_deref().unwrap_or(""),
            "nodes configuration change"
        );
    }

    /// Render a configuration the way overwrite samples report it.
    pub fn debug_json(config: &NodesConfiguration) -> String {
        codec::debug_json(config)
    }
}
