//! Update operations applied to a nodes configuration.
//!
//! Updates are pure: applying one to a snapshot yields a new snapshot with
//! the version bumped by one, or a typed error. Batches apply left-to-right
//! and fail atomically on the first rejected element (the partial result is
//! simply discarded).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{
    NodeDescriptor, NodeIndex, NodesConfiguration, ShardId, ShardMembership, StorageState,
};

/// One mutation of the nodes configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodesConfigUpdate {
    AddNode {
        node: NodeIndex,
        descriptor: NodeDescriptor,
    },
    RemoveNode {
        node: NodeIndex,
    },
    TransitionShardState {
        shard: ShardId,
        target: StorageState,
    },
    SetSequencerEnabled {
        node: NodeIndex,
        enabled: bool,
    },
}

/// Why an update was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    NodeExists(NodeIndex),
    UnknownNode(NodeIndex),
    UnknownShard(ShardId),
    /// A node may only be removed once all of its shards are `None`.
    ShardsStillServing(NodeIndex),
    IllegalTransition {
        shard: ShardId,
        from: StorageState,
        to: StorageState,
    },
    NotASequencer(NodeIndex),
    EmptyRoleSet(NodeIndex),
}

impl fmt::Display for MembershipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipError::NodeExists(node) => {
                write!(f, "node {node} already exists")
            }
            MembershipError::UnknownNode(node) => write!(f, "unknown node {node}"),
            MembershipError::UnknownShard(shard) => write!(f, "unknown shard {shard}"),
            MembershipError::ShardsStillServing(node) => {
                write!(f, "node {node} still has shards in the storage set")
            }
            MembershipError::IllegalTransition { shard, from, to } => {
                write!(f, "illegal transition for shard {shard}: {from} -> {to}")
            }
            MembershipError::NotASequencer(node) => {
                write!(f, "node {node} has no sequencer role")
            }
            MembershipError::EmptyRoleSet(node) => {
                write!(f, "node {node} must carry at least one role")
            }
        }
    }
}

impl std::error::Error for MembershipError {}

impl NodesConfiguration {
    /// Apply a single update, producing a new snapshot at `version + 1`.
    ///
    /// `now_ms` stamps the new snapshot's change time; passing it explicitly
    /// keeps application deterministic for a given input.
    pub fn apply_update(
        &self,
        update: &NodesConfigUpdate,
        now_ms: u64,
    ) -> Result<NodesConfiguration, MembershipError> {
        let mut next = self.clone();
        let new_version = next.version() + 1;

        match update {
            NodesConfigUpdate::AddNode { node, descriptor } => {
                if next.node(*node).is_some() {
                    return Err(MembershipError::NodeExists(*node));
                }
                if descriptor.roles.is_empty() {
                    return Err(MembershipError::EmptyRoleSet(*node));
                }
                let mut descriptor = descriptor.clone();
                for membership in descriptor.shards.values_mut() {
                    membership.since_version = new_version;
                }
                next.nodes_mut().insert(*node, descriptor);
            }
            NodesConfigUpdate::RemoveNode { node } => {
                let desc = next
                    .node(*node)
                    .ok_or(MembershipError::UnknownNode(*node))?;
                if desc
                    .shards
                    .values()
                    .any(|membership| membership.state != StorageState::None)
                {
                    return Err(MembershipError::ShardsStillServing(*node));
                }
                next.nodes_mut().remove(node);
            }
            NodesConfigUpdate::TransitionShardState { shard, target } => {
                let current = self
                    .shard_state(*shard)
                    .ok_or(MembershipError::UnknownShard(*shard))?;
                if !current.can_transition_to(*target) {
                    return Err(MembershipError::IllegalTransition {
                        shard: *shard,
                        from: current,
                        to: *target,
                    });
                }
                let membership = next
                    .nodes_mut()
                    .get_mut(&shard.node)
                    .and_then(|desc| desc.shards.get_mut(&shard.shard))
                    .ok_or(MembershipError::UnknownShard(*shard))?;
                *membership = ShardMembership {
                    state: *target,
                    since_version: new_version,
                };
            }
            NodesConfigUpdate::SetSequencerEnabled { node, enabled } => {
                let desc = next
                    .nodes_mut()
                    .get_mut(node)
                    .ok_or(MembershipError::UnknownNode(*node))?;
                if !desc.roles.sequencer {
                    return Err(MembershipError::NotASequencer(*node));
                }
                desc.sequencer_enabled = *enabled;
            }
        }

        *next.version_mut() = new_version;
        *next.last_change_at_ms_mut() = now_ms;
        Ok(next)
    }

    /// Apply a batch left-to-right; the first rejected element fails the
    /// whole batch.
    pub fn apply_updates(
        &self,
        updates: &[NodesConfigUpdate],
        now_ms: u64,
    ) -> Result<NodesConfiguration, MembershipError> {
        let mut current = self.clone();
        for update in updates {
            current = current.apply_update(update, now_ms)?;
        }
        Ok(current)
    }
}

/// Compact one-line rendering of an update batch for trace samples.
pub fn summarize_updates(updates: &[NodesConfigUpdate]) -> String {
    let parts: Vec<String> = updates
        .iter()
        .map(|update| match update {
            NodesConfigUpdate::AddNode { node, .. } => format!("add-node({node})"),
            NodesConfigUpdate::RemoveNode { node } => format!("remove-node({node})"),
            NodesConfigUpdate::TransitionShardState { shard, target } => {
                format!("transition({shard} -> {target})")
            }
            NodesConfigUpdate::SetSequencerEnabled { node, enabled } => {
                format!("sequencer-enabled({node}, {enabled})")
            }
        })
        .collect();
    parts.join(", ")
}
