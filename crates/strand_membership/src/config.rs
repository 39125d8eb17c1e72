//! The cluster-wide nodes configuration document.
//!
//! A `NodesConfiguration` is an immutable snapshot describing every node's
//! identity, roles, and per-shard storage membership state. Snapshots carry a
//! strictly monotonic version; version 0 is reserved for the empty document.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

/// Logical node identifier within the cluster.
pub type NodeIndex = u64;
/// Index of a storage shard within one node.
pub type ShardIndex = u32;
/// Monotonic version of the nodes configuration document.
pub type ConfigVersion = u64;

/// Version reserved for "no configuration".
pub const EMPTY_VERSION: ConfigVersion = 0;

/// Globally unique shard address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    pub node: NodeIndex,
    pub shard: ShardIndex,
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}:S{}", self.node, self.shard)
    }
}

/// Roles a node may serve in the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet {
    pub storage: bool,
    pub sequencer: bool,
}

impl RoleSet {
    pub fn storage_only() -> Self {
        Self {
            storage: true,
            sequencer: false,
        }
    }

    pub fn sequencer_only() -> Self {
        Self {
            storage: false,
            sequencer: true,
        }
    }

    pub fn both() -> Self {
        Self {
            storage: true,
            sequencer: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.storage && !self.sequencer
    }
}

/// Per-shard storage membership state.
///
/// The `JoiningReadOnly`, `PromotingReadWrite`, and `DrainingReadOnly` states
/// are intermediary: a shard is expected to leave them within a bounded time,
/// either because the transition completes or because a proposer forces it
/// out after a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageState {
    /// Not a member of the storage set.
    None,
    /// Being added to the storage set; readable once the copyset rebuild
    /// completes.
    JoiningReadOnly,
    /// Serves reads only.
    ReadOnly,
    /// Being promoted to full read/write membership.
    PromotingReadWrite,
    /// Full read/write member.
    ReadWrite,
    /// Being drained back to read-only before removal or maintenance.
    DrainingReadOnly,
}

impl StorageState {
    pub fn is_intermediary(&self) -> bool {
        matches!(
            self,
            StorageState::JoiningReadOnly
                | StorageState::PromotingReadWrite
                | StorageState::DrainingReadOnly
        )
    }

    /// The state an intermediary state resolves to when its transition
    /// completes (or is forced to complete).
    pub fn transition_target(&self) -> Option<StorageState> {
        match self {
            StorageState::JoiningReadOnly => Some(StorageState::ReadOnly),
            StorageState::PromotingReadWrite => Some(StorageState::ReadWrite),
            StorageState::DrainingReadOnly => Some(StorageState::ReadOnly),
            _ => None,
        }
    }

    /// Whether `target` is a legal next state from `self`.
    pub fn can_transition_to(&self, target: StorageState) -> bool {
        use StorageState::*;
        matches!(
            (self, target),
            (None, JoiningReadOnly)
                | (JoiningReadOnly, ReadOnly)
                | (JoiningReadOnly, None)
                | (ReadOnly, PromotingReadWrite)
                | (ReadOnly, None)
                | (PromotingReadWrite, ReadWrite)
                | (PromotingReadWrite, ReadOnly)
                | (ReadWrite, DrainingReadOnly)
                | (DrainingReadOnly, ReadOnly)
                | (DrainingReadOnly, ReadWrite)
        )
    }
}

impl fmt::Display for StorageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageState::None => "none",
            StorageState::JoiningReadOnly => "joining-read-only",
            StorageState::ReadOnly => "read-only",
            StorageState::PromotingReadWrite => "promoting-read-write",
            StorageState::ReadWrite => "read-write",
            StorageState::DrainingReadOnly => "draining-read-only",
        };
        f.write_str(s)
    }
}

/// Membership record for one shard of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMembership {
    pub state: StorageState,
    /// Configuration version in which the shard entered `state`.
    pub since_version: ConfigVersion,
}

/// Descriptor for one cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub address: String,
    pub roles: RoleSet,
    /// Bumped when a node is replaced in place (same index, new instance).
    pub generation: u32,
    /// Whether the sequencer on this node may place new records. Only
    /// meaningful when `roles.sequencer` is set.
    pub sequencer_enabled: bool,
    pub shards: BTreeMap<ShardIndex, ShardMembership>,
}

impl NodeDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>, roles: RoleSet) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            roles,
            generation: 1,
            sequencer_enabled: roles.sequencer,
            shards: BTreeMap::new(),
        }
    }

    pub fn with_shard(mut self, shard: ShardIndex, state: StorageState) -> Self {
        self.shards.insert(
            shard,
            ShardMembership {
                state,
                since_version: EMPTY_VERSION,
            },
        );
        self
    }
}

/// Immutable, shareable snapshot of the cluster's nodes configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodesConfiguration {
    version: ConfigVersion,
    /// Wall-clock time (unix millis) of the last accepted mutation.
    last_change_at_ms: u64,
    nodes: BTreeMap<NodeIndex, NodeDescriptor>,
}

impl NodesConfiguration {
    /// The empty document at `EMPTY_VERSION`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Shared handle to the empty document.
    pub fn shared_empty() -> Arc<NodesConfiguration> {
        static EMPTY: OnceLock<Arc<NodesConfiguration>> = OnceLock::new();
        EMPTY.get_or_init(|| Arc::new(NodesConfiguration::empty())).clone()
    }

    pub fn version(&self) -> ConfigVersion {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.version == EMPTY_VERSION && self.nodes.is_empty()
    }

    pub fn last_change_at_ms(&self) -> u64 {
        self.last_change_at_ms
    }

    /// Copy of this document at an explicit version.
    pub fn with_version(&self, version: ConfigVersion) -> NodesConfiguration {
        let mut copy = self.clone();
        copy.version = version;
        copy
    }

    pub fn node(&self, index: NodeIndex) -> Option<&NodeDescriptor> {
        self.nodes.get(&index)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &NodeDescriptor)> {
        self.nodes.iter().map(|(index, desc)| (*index, desc))
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn shard_state(&self, shard: ShardId) -> Option<StorageState> {
        self.nodes
            .get(&shard.node)
            .and_then(|desc| desc.shards.get(&shard.shard))
            .map(|membership| membership.state)
    }

    /// Iterate every shard in the document.
    pub fn shards(&self) -> impl Iterator<Item = (ShardId, &ShardMembership)> {
        self.nodes.iter().flat_map(|(node, desc)| {
            desc.shards.iter().map(move |(shard, membership)| {
                (
                    ShardId {
                        node: *node,
                        shard: *shard,
                    },
                    membership,
                )
            })
        })
    }

    pub(crate) fn version_mut(&mut self) -> &mut ConfigVersion {
        &mut self.version
    }

    pub(crate) fn last_change_at_ms_mut(&mut self) -> &mut u64 {
        &mut self.last_change_at_ms
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut BTreeMap<NodeIndex, NodeDescriptor> {
        &mut self.nodes
    }
}
