//! Role-derived permission model for the nodes configuration manager.

use std::fmt;

use strand_membership::RoleSet;

/// Capability bitset controlling which manager operations are permitted.
///
/// Storage nodes and sequencers start out as observers; they may be upgraded
/// to proposers later. Tooling is a proposer from the start so operator
/// tools can push emergency changes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OperationMode(u8);

impl OperationMode {
    const IS_PROPOSER: u8 = 1 << 0;
    const IS_COORDINATOR: u8 = 1 << 1;
    const IS_CLIENT: u8 = 1 << 2;
    const IS_TOOLING: u8 = 1 << 3;
    const IS_STORAGE_MEMBER: u8 = 1 << 4;
    const IS_SEQUENCER: u8 = 1 << 5;

    pub fn for_client() -> Self {
        Self(Self::IS_CLIENT)
    }

    pub fn for_tooling() -> Self {
        Self(Self::IS_TOOLING | Self::IS_PROPOSER)
    }

    pub fn for_roles(roles: &RoleSet) -> Self {
        let mut flags = 0;
        if roles.sequencer {
            flags |= Self::IS_SEQUENCER;
        }
        if roles.storage {
            flags |= Self::IS_STORAGE_MEMBER;
        }
        Self(flags)
    }

    /// Monotonic: the proposer capability may be granted but never revoked.
    pub fn upgrade_to_proposer(&mut self) {
        self.0 |= Self::IS_PROPOSER;
    }

    pub fn is_client(&self) -> bool {
        self.has(Self::IS_CLIENT)
    }

    pub fn is_client_only(&self) -> bool {
        self.0 == Self::IS_CLIENT
    }

    pub fn is_tooling(&self) -> bool {
        self.has(Self::IS_TOOLING)
    }

    pub fn is_storage_member(&self) -> bool {
        self.has(Self::IS_STORAGE_MEMBER)
    }

    pub fn is_sequencer(&self) -> bool {
        self.has(Self::IS_SEQUENCER)
    }

    pub fn is_proposer(&self) -> bool {
        self.has(Self::IS_PROPOSER)
    }

    pub fn is_coordinator(&self) -> bool {
        self.has(Self::IS_COORDINATOR)
    }

    pub fn is_valid(&self) -> bool {
        if self.is_client() && self.is_coordinator() {
            return false;
        }
        if !self.is_client() && !self.is_tooling() && !self.is_storage_member() && !self.is_sequencer()
        {
            return false;
        }
        true
    }

    fn has(&self, flags: u8) -> bool {
        (self.0 & flags) != 0
    }
}

impl fmt::Debug for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        for (flag, name) in [
            (Self::IS_PROPOSER, "proposer"),
            (Self::IS_COORDINATOR, "coordinator"),
            (Self::IS_CLIENT, "client"),
            (Self::IS_TOOLING, "tooling"),
            (Self::IS_STORAGE_MEMBER, "storage-member"),
            (Self::IS_SEQUENCER, "sequencer"),
        ] {
            if self.has(flag) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_mode_is_valid_and_observer_only() {
        let mode = OperationMode::for_client();
        assert!(mode.is_valid());
        assert!(mode.is_client_only());
        assert!(!mode.is_proposer());
    }

    #[test]
    fn tooling_implies_proposer() {
        let mode = OperationMode::for_tooling();
        assert!(mode.is_valid());
        assert!(mode.is_tooling());
        assert!(mode.is_proposer());
        assert!(!mode.is_client());
    }

    #[test]
    fn role_modes_start_as_observers() {
        let mode = OperationMode::for_roles(&RoleSet::both());
        assert!(mode.is_valid());
        assert!(mode.is_storage_member());
        assert!(mode.is_sequencer());
        assert!(!mode.is_proposer());
    }

    #[test]
    fn empty_role_set_is_invalid() {
        let mode = OperationMode::for_roles(&RoleSet::default());
        assert!(!mode.is_valid());
    }

    #[test]
    fn proposer_upgrade_is_monotonic() {
        let mut mode = OperationMode::for_roles(&RoleSet::storage_only());
        assert!(!mode.is_proposer());
        mode.upgrade_to_proposer();
        assert!(mode.is_proposer());
        mode.upgrade_to_proposer();
        assert!(mode.is_proposer());
        assert!(mode.is_storage_member());
    }
}
