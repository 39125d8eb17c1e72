//! Durable nodes-configuration store interface and implementations.
//!
//! The store holds the canonical serialized configuration and arbitrates
//! concurrent proposers through compare-and-swap on the frame's version
//! header. Two implementations are provided: an in-memory store used by
//! tests and single-process deployments, and a fjall-backed store that
//! persists the blob across restarts. ZooKeeper or other remote backends
//! plug in through the same trait.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tokio::sync::mpsc;

use strand_membership::{codec, ConfigVersion, EMPTY_VERSION};

/// Result of a successful `update_config` round-trip.
#[derive(Debug, Clone)]
pub enum StoreWriteOutcome {
    /// The blob was accepted and is now the canonical configuration.
    Written { version: ConfigVersion },
    /// The compare-and-swap lost. Carries the canonical version and, when
    /// the backend can provide it cheaply, the canonical blob so the caller
    /// can catch up without another read.
    VersionMismatch {
        version: ConfigVersion,
        blob: Option<Bytes>,
    },
}

/// Store failures, split by whether retrying the same request may succeed.
#[derive(Debug)]
pub enum StoreError {
    Again(anyhow::Error),
    Other(anyhow::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Again(err) => write!(f, "transient store failure: {err}"),
            StoreError::Other(err) => write!(f, "store failure: {err}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Compare-and-swap key/value interface over the canonical configuration
/// blob.
#[async_trait]
pub trait NodesConfigurationStore: Send + Sync + 'static {
    /// Read the canonical blob. `consistent` forbids serving from stale
    /// caches; backends without caches may ignore it.
    async fn get_config(&self, consistent: bool) -> Result<Option<Bytes>, StoreError>;

    /// Write `blob` if the canonical version still equals `base_version`.
    /// `None` skips the version check (tooling overwrite);
    /// `Some(EMPTY_VERSION)` means "expect no prior value".
    async fn update_config(
        &self,
        blob: Bytes,
        base_version: Option<ConfigVersion>,
    ) -> Result<StoreWriteOutcome, StoreError>;

    /// Asynchronous delivery of newly written blobs. Every subscriber sees
    /// every accepted write from subscription time on.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes>;
}

fn blob_version(blob: &[u8]) -> Result<ConfigVersion, StoreError> {
    codec::extract_version(blob)
        .ok_or_else(|| StoreError::Other(anyhow!("stored blob has no parsable version header")))
}

/// Shared subscriber bookkeeping for the local store implementations.
#[derive(Default)]
struct Subscribers {
    senders: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
}

impl Subscribers {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    fn notify(&self, blob: &Bytes) {
        self.senders
            .lock()
            .unwrap()
            .retain(|tx| tx.send(blob.clone()).is_ok());
    }
}

/// In-memory store. Doubles as the test backend: writes can be failed on
/// demand and blobs can be re-delivered to subscribers.
#[derive(Default)]
pub struct InMemoryNodesConfigurationStore {
    current: Mutex<Option<Bytes>>,
    subscribers: Subscribers,
    read_attempts: AtomicU64,
    write_attempts: AtomicU64,
    fail_next_write: AtomicBool,
}

impl InMemoryNodesConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get_config` calls observed.
    pub fn read_attempts(&self) -> u64 {
        self.read_attempts.load(Ordering::Relaxed)
    }

    /// Number of `update_config` calls observed, including failed ones.
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::Relaxed)
    }

    /// Make the next `update_config` fail with a transient error.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::Relaxed);
    }

    /// Push a blob to subscribers without writing it, as a remote watch
    /// would on (re-)delivery.
    pub fn publish(&self, blob: Bytes) {
        self.subscribers.notify(&blob);
    }

    /// Install a blob without notifying subscribers, as if it had been
    /// written before this process subscribed.
    pub fn seed(&self, blob: Bytes) {
        *self.current.lock().unwrap() = Some(blob);
    }

    /// Canonical version currently held, for assertions.
    pub fn current_version(&self) -> ConfigVersion {
        self.current
            .lock()
            .unwrap()
            .as_deref()
            .and_then(codec::extract_version)
            .unwrap_or(EMPTY_VERSION)
    }
}

#[async_trait]
impl NodesConfigurationStore for InMemoryNodesConfigurationStore {
    async fn get_config(&self, _consistent: bool) -> Result<Option<Bytes>, StoreError> {
        self.read_attempts.fetch_add(1, Ordering::Relaxed);
        Ok(self.current.lock().unwrap().clone())
    }

    async fn update_config(
        &self,
        blob: Bytes,
        base_version: Option<ConfigVersion>,
    ) -> Result<StoreWriteOutcome, StoreError> {
        self.write_attempts.fetch_add(1, Ordering::Relaxed);
        if self.fail_next_write.swap(false, Ordering::Relaxed) {
            return Err(StoreError::Again(anyhow!("injected write failure")));
        }

        let new_version = blob_version(&blob)?;
        let mut current = self.current.lock().unwrap();
        let current_version = current
            .as_deref()
            .and_then(codec::extract_version)
            .unwrap_or(EMPTY_VERSION);

        if let Some(base) = base_version {
            if base != current_version {
                return Ok(StoreWriteOutcome::VersionMismatch {
                    version: current_version,
                    blob: current.clone(),
                });
            }
        }

        *current = Some(blob.clone());
        drop(current);
        self.subscribers.notify(&blob);
        Ok(StoreWriteOutcome::Written {
            version: new_version,
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.subscribers.subscribe()
    }
}

const CONFIG_KEY: &[u8] = b"current";

/// Fjall-backed store: one partition, one key, synced on every accepted
/// write. Suitable for single-writer-per-host deployments and operator
/// tooling working against a local copy.
pub struct FjallNodesConfigurationStore {
    keyspace: Keyspace,
    partition: PartitionHandle,
    // Serializes read-compare-write cycles; fjall itself only orders
    // individual operations.
    write_lock: Mutex<()>,
    subscribers: Subscribers,
}

impl FjallNodesConfigurationStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open nodes configuration keyspace")?;
        let partition = keyspace
            .open_partition("nodes_configuration", PartitionCreateOptions::default())
            .context("open nodes configuration partition")?;
        Ok(Self {
            keyspace,
            partition,
            write_lock: Mutex::new(()),
            subscribers: Subscribers::default(),
        })
    }

    fn read_current(&self) -> Result<Option<Bytes>, StoreError> {
        match self.partition.get(CONFIG_KEY) {
            Ok(Some(slice)) => Ok(Some(Bytes::copy_from_slice(&slice))),
            Ok(None) => Ok(None),
            Err(err) => Err(StoreError::Other(
                anyhow::Error::new(err).context("read nodes configuration blob"),
            )),
        }
    }
}

#[async_trait]
impl NodesConfigurationStore for FjallNodesConfigurationStore {
    async fn get_config(&self, _consistent: bool) -> Result<Option<Bytes>, StoreError> {
        // Local disk reads are always authoritative for this backend.
        self.read_current()
    }

    async fn update_config(
        &self,
        blob: Bytes,
        base_version: Option<ConfigVersion>,
    ) -> Result<StoreWriteOutcome, StoreError> {
        let new_version = blob_version(&blob)?;

        let _guard = self.write_lock.lock().unwrap();
        let current = self.read_current()?;
        let current_version = current
            .as_deref()
            .and_then(codec::extract_version)
            .unwrap_or(EMPTY_VERSION);

        if let Some(base) = base_version {
            if base != current_version {
                return Ok(StoreWriteOutcome::VersionMismatch {
                    version: current_version,
                    blob: current,
                });
            }
        }

        self.partition
            .insert(CONFIG_KEY, blob.as_ref())
            .map_err(|err| {
                StoreError::Other(anyhow::Error::new(err).context("write nodes configuration blob"))
            })?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|err| {
                StoreError::Again(anyhow::Error::new(err).context("sync nodes configuration blob"))
            })?;

        self.subscribers.notify(&blob);
        Ok(StoreWriteOutcome::Written {
            version: new_version,
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
        self.subscribers.subscribe()
    }
}
