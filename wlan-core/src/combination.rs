//! Concurrency combinations: the legal simultaneous-role configurations of a radio.

use serde::{Deserialize, Serialize};

use crate::role::{InterfaceRole, RoleSet};

/// At most `max` interfaces whose role is in `roles` may exist at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRoleLimit {
    pub roles: RoleSet,
    pub max: u32,
}

impl InterfaceRoleLimit {
    pub fn new(roles: &[InterfaceRole], max: u32) -> Self {
        Self {
            roles: RoleSet::of(roles),
            max,
        }
    }

    fn count_matching(&self, roles: &[InterfaceRole]) -> usize {
        roles.iter().filter(|r| self.roles.contains(**r)).count()
    }
}

/// One combination reported by the driver. Role sets of different limits may overlap;
/// a role counts against every limit that names it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyCombination {
    pub limits: Vec<InterfaceRoleLimit>,
    pub max_total: u32,
    pub num_channels: u32,
}

impl ConcurrencyCombination {
    /// True if the role multiset fits every limit and the total.
    pub fn supports(&self, roles: &[InterfaceRole]) -> bool {
        if roles.len() > self.max_total as usize {
            return false;
        }
        self.limits
            .iter()
            .all(|limit| limit.count_matching(roles) <= limit.max as usize)
    }
}

/// All combinations a radio reports. Replaced as a whole when fresh capability data arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinationSet {
    combinations: Vec<ConcurrencyCombination>,
}

impl CombinationSet {
    pub fn new(combinations: Vec<ConcurrencyCombination>) -> Self {
        Self { combinations }
    }

    pub fn is_empty(&self) -> bool {
        self.combinations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.combinations.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConcurrencyCombination> {
        self.combinations.iter()
    }

    /// Greatest channel count among the combinations supporting `roles`, or None.
    pub fn best_channels(&self, roles: &[InterfaceRole]) -> Option<u32> {
        self.combinations
            .iter()
            .filter(|c| c.supports(roles))
            .map(|c| c.num_channels)
            .max()
    }
}
