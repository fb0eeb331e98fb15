//! Per-radio concurrency arbiter: admission and eviction over the active-interface registry.
//!
//! Admission is a search over removal candidates (subsets of the active interfaces) in
//! preference order. The power set is enumerated eagerly, so admission is refused once a
//! radio holds `MAX_ACTIVE_INTERFACES`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capability::{PhyCapabilities, PhyIndex};
use crate::role::InterfaceRole;

pub type Priority = i32;

pub const PRIORITY_MIN: Priority = 0;
pub const PRIORITY_MAX: Priority = 100;

/// Upper bound on registrations per radio; keeps the removal-candidate search bounded.
pub const MAX_ACTIVE_INTERFACES: usize = 16;

/// Clamp a requested priority into the valid range.
pub fn clamp_priority(p: Priority) -> Priority {
    p.clamp(PRIORITY_MIN, PRIORITY_MAX)
}

/// Arbiter-assigned identifier of an active interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceId(pub u64);

/// An interface currently holding radio resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveInterface {
    pub id: InterfaceId,
    pub role: InterfaceRole,
    pub priority: Priority,
}

/// Interfaces hypothetically torn down to make room. Members are kept in descending priority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalCandidate {
    members: Vec<ActiveInterface>,
}

impl RemovalCandidate {
    pub fn new(mut members: Vec<ActiveInterface>) -> Self {
        members.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { members }
    }

    pub fn members(&self) -> &[ActiveInterface] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: InterfaceId) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    /// Highest priority among members; None for the empty candidate.
    pub fn max_priority(&self) -> Option<Priority> {
        self.members.first().map(|m| m.priority)
    }

    /// Lexicographic comparison of the descending priority sequences. `Less` means
    /// `self` is more preferable to evict. The empty candidate sorts first and a prefix
    /// sorts before any longer sequence it starts.
    pub fn preference_cmp(&self, other: &Self) -> Ordering {
        let a = self.members.iter().map(|m| m.priority);
        let b = other.members.iter().map(|m| m.priority);
        a.cmp(b)
    }
}

/// Every subset of `active`, sorted most preferable first. Ties keep enumeration order.
/// Only the first `MAX_ACTIVE_INTERFACES` entries are considered.
pub fn removal_candidates(active: &[ActiveInterface]) -> Vec<RemovalCandidate> {
    let active = &active[..active.len().min(MAX_ACTIVE_INTERFACES)];
    let n = active.len();
    let mut out: Vec<RemovalCandidate> = (0u64..(1u64 << n))
        .map(|mask| {
            RemovalCandidate::new(
                active
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, a)| *a)
                    .collect(),
            )
        })
        .collect();
    out.sort_by(|a, b| a.preference_cmp(b));
    out
}

/// Admission result carrying the interfaces that must be evicted first (possibly none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub role: InterfaceRole,
    pub priority: Priority,
    pub evictions: Vec<ActiveInterface>,
    /// Channel count of the best combination supporting the resulting configuration.
    pub channels: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// No capability data yet; retry once the radio reports.
    #[error("capability data unavailable")]
    CapabilityUnavailable,
    /// Admissible only by evicting an equal or more important interface.
    #[error("refused: would evict an equal or higher priority interface")]
    RefusedByPolicy,
    /// No combination can host the role even with every interface evicted, or the radio
    /// already holds `MAX_ACTIVE_INTERFACES`.
    #[error("refused: radio cannot host this role")]
    RefusedByHardware,
    /// The registry changed between admission and commit.
    #[error("grant went stale before commit")]
    Stale,
}

impl AllocationError {
    /// Whether the same request may succeed later without changing it.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            AllocationError::CapabilityUnavailable | AllocationError::RefusedByPolicy
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    #[error("grant is stale: interface {0:?} is no longer active")]
    StaleGrant(InterfaceId),
}

/// Owns the combination set and the active-interface registry of one radio.
#[derive(Debug)]
pub struct Arbiter {
    capabilities: PhyCapabilities,
    active: Vec<ActiveInterface>,
    next_id: u64,
}

impl Arbiter {
    pub fn new(phy: PhyIndex) -> Self {
        Self {
            capabilities: PhyCapabilities {
                phy,
                ..Default::default()
            },
            active: Vec::new(),
            next_id: 1,
        }
    }

    pub fn phy(&self) -> PhyIndex {
        self.capabilities.phy
    }

    pub fn capabilities(&self) -> &PhyCapabilities {
        &self.capabilities
    }

    /// False until a non-empty combination set has been reported.
    pub fn is_capable(&self) -> bool {
        !self.capabilities.combinations.is_empty()
    }

    pub fn active(&self) -> &[ActiveInterface] {
        &self.active
    }

    pub fn active_roles(&self) -> Vec<InterfaceRole> {
        self.active.iter().map(|a| a.role).collect()
    }

    /// Replace the capability data wholesale. Current allocations stay registered.
    pub fn report_capability(&mut self, caps: PhyCapabilities) {
        let phy = self.phy();
        info!(
            phy,
            roles = %caps.supported_roles,
            combinations = caps.combinations.len(),
            "capabilities updated"
        );
        self.capabilities = PhyCapabilities { phy, ..caps };
    }

    /// Best channel count over the combinations supporting `roles` (a multiset).
    pub fn supports_concurrency(&self, roles: &[InterfaceRole]) -> Option<u32> {
        self.capabilities.combinations.best_channels(roles)
    }

    pub fn request_allocation(
        &self,
        role: InterfaceRole,
        priority: Priority,
    ) -> Result<Grant, AllocationError> {
        let priority = clamp_priority(priority);
        if !self.is_capable() {
            return Err(AllocationError::CapabilityUnavailable);
        }
        let roles_known = !self.capabilities.supported_roles.is_empty();
        if roles_known && !self.capabilities.supports_role(role) {
            debug!(phy = self.phy(), %role, "role not supported by radio");
            return Err(AllocationError::RefusedByHardware);
        }
        if self.active.len() >= MAX_ACTIVE_INTERFACES {
            warn!(phy = self.phy(), active = self.active.len(), "interface registry full");
            return Err(AllocationError::RefusedByHardware);
        }

        for candidate in removal_candidates(&self.active) {
            if candidate.max_priority().is_some_and(|p| p >= priority) {
                continue;
            }
            let mut roles: Vec<InterfaceRole> = self
                .active
                .iter()
                .filter(|a| !candidate.contains(a.id))
                .map(|a| a.role)
                .collect();
            roles.push(role);
            if let Some(channels) = self.supports_concurrency(&roles) {
                debug!(
                    phy = self.phy(),
                    %role,
                    priority,
                    evictions = candidate.members().len(),
                    "allocation admissible"
                );
                return Ok(Grant {
                    role,
                    priority,
                    evictions: candidate.members().to_vec(),
                    channels,
                });
            }
        }

        // Limits are upper bounds, so evicting everything is the most permissive option.
        if self.supports_concurrency(&[role]).is_some() {
            Err(AllocationError::RefusedByPolicy)
        } else {
            Err(AllocationError::RefusedByHardware)
        }
    }

    /// Apply a grant: drop its evictions and register the new interface.
    pub fn commit(&mut self, grant: &Grant) -> Result<ActiveInterface, CommitError> {
        if let Some(gone) = grant
            .evictions
            .iter()
            .find(|e| !self.active.iter().any(|a| a.id == e.id))
        {
            return Err(CommitError::StaleGrant(gone.id));
        }
        self.active
            .retain(|a| !grant.evictions.iter().any(|e| e.id == a.id));
        let iface = ActiveInterface {
            id: InterfaceId(self.next_id),
            role: grant.role,
            priority: grant.priority,
        };
        self.next_id += 1;
        self.active.push(iface);
        debug!(phy = self.phy(), id = iface.id.0, role = %iface.role, "interface committed");
        Ok(iface)
    }

    pub fn release(&mut self, id: InterfaceId) -> Option<ActiveInterface> {
        let pos = self.active.iter().position(|a| a.id == id)?;
        let iface = self.active.remove(pos);
        debug!(phy = self.phy(), id = id.0, role = %iface.role, "interface released");
        Some(iface)
    }

    /// Drop every registration; used when the radio disappears.
    pub fn drain(&mut self) -> Vec<ActiveInterface> {
        std::mem::take(&mut self.active)
    }
}
