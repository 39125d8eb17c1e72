//! Tracks how long shards have been sitting in intermediary membership
//! states.
//!
//! A shard that enters an intermediary state (joining, promoting, draining)
//! is expected to complete the transition externally. If it does not, a
//! proposer forces it out after a configurable timeout; this tracker records
//! when each shard entered its current intermediary state and produces the
//! forcing update batch.

use std::collections::BTreeMap;
use std::time::SystemTime;

use strand_membership::{NodesConfigUpdate, NodesConfiguration, ShardId, StorageState};

#[derive(Debug, Clone, Copy)]
struct TrackedShard {
    state: StorageState,
    entered_at: SystemTime,
}

#[derive(Debug, Default)]
pub struct ShardStateTracker {
    entries: BTreeMap<ShardId, TrackedShard>,
}

impl ShardStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh the tracked set from a newly staged configuration.
    ///
    /// A shard keeps its original timestamp as long as it stays in the same
    /// intermediary state; changing to a different intermediary state
    /// restarts the clock, and leaving intermediary state (or disappearing
    /// from the configuration) drops the entry.
    pub fn on_new_config(&mut self, config: &NodesConfiguration, now: SystemTime) {
        let mut next = BTreeMap::new();
        for (shard, membership) in config.shards() {
            if !membership.state.is_intermediary() {
                continue;
            }
            let entered_at = match self.entries.get(&shard) {
                Some(tracked) if tracked.state == membership.state => tracked.entered_at,
                _ => now,
            };
            next.insert(
                shard,
                TrackedShard {
                    state: membership.state,
                    entered_at,
                },
            );
        }
        self.entries = next;
    }

    /// Produce one transition per tracked shard that entered its state at or
    /// before `till` and still holds that state in `config`. Returns `None`
    /// when nothing qualifies.
    pub fn extract_nc_update(
        &self,
        config: &NodesConfiguration,
        till: SystemTime,
    ) -> Option<Vec<NodesConfigUpdate>> {
        let mut updates = Vec::new();
        for (shard, tracked) in &self.entries {
            if tracked.entered_at > till {
                continue;
            }
            if config.shard_state(*shard) != Some(tracked.state) {
                // The staged view moved on; the next on_new_config will
                // reconcile the entry.
                continue;
            }
            let Some(target) = tracked.state.transition_target() else {
                continue;
            };
            updates.push(NodesConfigUpdate::TransitionShardState {
                shard: *shard,
                target,
            });
        }
        if updates.is_empty() {
            None
        } else {
            Some(updates)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strand_membership::{NodeDescriptor, RoleSet};

    fn config_with_states(states: &[(u64, u32, StorageState)]) -> NodesConfiguration {
        let mut nc = NodesConfiguration::empty();
        let mut version = 0;
        for (node, shard, state) in states {
            let update = match nc.node(*node) {
                Some(_) => NodesConfigUpdate::TransitionShardState {
                    shard: ShardId {
                        node: *node,
                        shard: *shard,
                    },
                    target: *state,
                },
                None => NodesConfigUpdate::AddNode {
                    node: *node,
                    descriptor: NodeDescriptor::new(
                        format!("node-{node}"),
                        "10.2.0.1:4440",
                        RoleSet::storage_only(),
                    )
                    .with_shard(*shard, *state),
                },
            };
            nc = nc.apply_update(&update, 1_000).expect("build config");
            version += 1;
        }
        nc.with_version(version + 4)
    }

    fn at(base: SystemTime, secs: u64) -> SystemTime {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn tracks_only_intermediary_shards() {
        let t0 = SystemTime::UNIX_EPOCH;
        let mut tracker = ShardStateTracker::new();
        let nc = config_with_states(&[
            (1, 0, StorageState::JoiningReadOnly),
            (2, 0, StorageState::ReadWrite),
        ]);
        tracker.on_new_config(&nc, t0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn keeps_timestamp_while_state_unchanged() {
        let t0 = SystemTime::UNIX_EPOCH;
        let mut tracker = ShardStateTracker::new();
        let nc = config_with_states(&[(1, 0, StorageState::JoiningReadOnly)]);
        tracker.on_new_config(&nc, t0);
        // Re-staging the same state later must not restart the clock.
        tracker.on_new_config(&nc.with_version(nc.version() + 1), at(t0, 60));

        let updates = tracker
            .extract_nc_update(&nc, at(t0, 30))
            .expect("timed out entry");
        assert_eq!(
            updates,
            vec![NodesConfigUpdate::TransitionShardState {
                shard: ShardId { node: 1, shard: 0 },
                target: StorageState::ReadOnly,
            }]
        );
    }

    #[test]
    fn leaving_intermediary_state_drops_the_entry() {
        let t0 = SystemTime::UNIX_EPOCH;
        let mut tracker = ShardStateTracker::new();
        let joining = config_with_states(&[(1, 0, StorageState::JoiningReadOnly)]);
        tracker.on_new_config(&joining, t0);
        assert_eq!(tracker.len(), 1);

        let settled = config_with_states(&[(1, 0, StorageState::ReadOnly)]);
        tracker.on_new_config(&settled, at(t0, 5));
        assert!(tracker.is_empty());
        assert!(tracker.extract_nc_update(&settled, at(t0, 600)).is_none());
    }

    #[test]
    fn extraction_respects_the_deadline() {
        let t0 = SystemTime::UNIX_EPOCH;
        let mut tracker = ShardStateTracker::new();
        let nc = config_with_states(&[(1, 0, StorageState::JoiningReadOnly)]);
        tracker.on_new_config(&nc, at(t0, 100));

        assert!(tracker.extract_nc_update(&nc, at(t0, 99)).is_none());
        assert!(tracker.extract_nc_update(&nc, at(t0, 100)).is_some());
    }

    #[test]
    fn extraction_is_deterministic_and_sorted() {
        let t0 = SystemTime::UNIX_EPOCH;
        let mut tracker = ShardStateTracker::new();
        let nc = config_with_states(&[
            (2, 0, StorageState::DrainingReadOnly),
            (1, 0, StorageState::JoiningReadOnly),
        ]);
        tracker.on_new_config(&nc, t0);

        let first = tracker.extract_nc_update(&nc, at(t0, 1)).expect("batch");
        let second = tracker.extract_nc_update(&nc, at(t0, 1)).expect("batch");
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                NodesConfigUpdate::TransitionShardState {
                    shard: ShardId { node: 1, shard: 0 },
                    target: StorageState::ReadOnly,
                },
                NodesConfigUpdate::TransitionShardState {
                    shard: ShardId { node: 2, shard: 0 },
                    target: StorageState::ReadOnly,
                },
            ]
        );
    }
}
