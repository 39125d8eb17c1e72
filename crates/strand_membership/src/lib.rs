//! Membership model for a strand cluster.
//!
//! This crate defines the versioned nodes-configuration document shared by
//! every process in the cluster, the per-shard storage membership state
//! machine, the update operations that mutate the document, and the wire
//! codec used to move serialized documents through the configuration store.

pub mod codec;
pub mod config;
pub mod update;

pub use config::{
    ConfigVersion, NodeDescriptor, NodeIndex, NodesConfiguration, RoleSet, ShardId, ShardIndex,
    ShardMembership, StorageState, EMPTY_VERSION,
};
pub use update::{MembershipError, NodesConfigUpdate};
