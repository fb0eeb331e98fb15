//! Radio fleet: one arbiter per phy, allocation routing, and the retry queue for requests
//! that could not be admitted yet.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info, warn};

use crate::arbiter::{ActiveInterface, AllocationError, Arbiter, Grant, InterfaceId, Priority};
use crate::capability::{
    CapabilityAssembler, CapabilityError, CapabilityMessage, CapabilityUpdate, PhyIndex,
};
use crate::role::InterfaceRole;

/// Caller-chosen key for a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestTicket(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedRequest {
    pub ticket: RequestTicket,
    pub role: InterfaceRole,
    pub priority: Priority,
    /// Radio the request is pinned to; any radio when unset.
    pub phy: Option<PhyIndex>,
}

/// A committed grant on a specific radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub phy: PhyIndex,
    pub interface: ActiveInterface,
    /// Interfaces the owner must tear down; already removed from the registry.
    pub evicted: Vec<ActiveInterface>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetUpdate {
    /// Dump part merged; nothing changed yet.
    Pending,
    /// Fresh capabilities are effective for the phy.
    Reported(PhyIndex),
    /// The phy and all its registrations are gone.
    Removed {
        phy: PhyIndex,
        interfaces: Vec<ActiveInterface>,
    },
}

#[derive(Debug, Default)]
pub struct Fleet {
    assembler: CapabilityAssembler,
    arbiters: BTreeMap<PhyIndex, Arbiter>,
    queue: VecDeque<QueuedRequest>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arbiter(&self, phy: PhyIndex) -> Option<&Arbiter> {
        self.arbiters.get(&phy)
    }

    pub fn phys(&self) -> impl Iterator<Item = PhyIndex> + '_ {
        self.arbiters.keys().copied()
    }

    pub fn handle_capability(
        &mut self,
        msg: CapabilityMessage,
    ) -> Result<FleetUpdate, CapabilityError> {
        match self.assembler.feed(msg)? {
            CapabilityUpdate::Pending => Ok(FleetUpdate::Pending),
            CapabilityUpdate::Complete(caps) => {
                let phy = caps.phy;
                self.arbiters
                    .entry(phy)
                    .or_insert_with(|| Arbiter::new(phy))
                    .report_capability(caps);
                Ok(FleetUpdate::Reported(phy))
            }
            CapabilityUpdate::Removed(phy) => {
                let interfaces = self
                    .arbiters
                    .remove(&phy)
                    .map(|mut a| a.drain())
                    .unwrap_or_default();
                info!(phy, interfaces = interfaces.len(), "radio removed");
                Ok(FleetUpdate::Removed { phy, interfaces })
            }
        }
    }

    pub fn supports_concurrency(&self, phy: PhyIndex, roles: &[InterfaceRole]) -> Option<u32> {
        self.arbiters.get(&phy)?.supports_concurrency(roles)
    }

    /// Admit on a specific radio and commit immediately.
    pub fn allocate_on(
        &mut self,
        phy: PhyIndex,
        role: InterfaceRole,
        priority: Priority,
    ) -> Result<Allocation, AllocationError> {
        let arbiter = self
            .arbiters
            .get_mut(&phy)
            .ok_or(AllocationError::CapabilityUnavailable)?;
        let grant = arbiter.request_allocation(role, priority)?;
        Self::commit_on(arbiter, grant)
    }

    /// Admit on the best radio and commit immediately. Radios that need no eviction win;
    /// otherwise the lowest phy index that can admit the request.
    pub fn allocate(
        &mut self,
        role: InterfaceRole,
        priority: Priority,
    ) -> Result<Allocation, AllocationError> {
        let mut best: Option<(PhyIndex, Grant)> = None;
        let mut policy_refused = false;
        let mut any_capable = false;
        for (phy, arbiter) in &self.arbiters {
            match arbiter.request_allocation(role, priority) {
                Ok(grant) => {
                    let better = match &best {
                        None => true,
                        Some((_, b)) => !b.evictions.is_empty() && grant.evictions.is_empty(),
                    };
                    if better {
                        best = Some((*phy, grant));
                    }
                    any_capable = true;
                }
                Err(AllocationError::RefusedByPolicy) => {
                    policy_refused = true;
                    any_capable = true;
                }
                Err(AllocationError::RefusedByHardware) => any_capable = true,
                Err(AllocationError::CapabilityUnavailable | AllocationError::Stale) => {}
            }
        }
        let Some((phy, grant)) = best else {
            return Err(if policy_refused {
                AllocationError::RefusedByPolicy
            } else if any_capable {
                AllocationError::RefusedByHardware
            } else {
                AllocationError::CapabilityUnavailable
            });
        };
        match self.arbiters.get_mut(&phy) {
            Some(arbiter) => Self::commit_on(arbiter, grant),
            None => Err(AllocationError::CapabilityUnavailable),
        }
    }

    fn commit_on(arbiter: &mut Arbiter, grant: Grant) -> Result<Allocation, AllocationError> {
        let interface = arbiter.commit(&grant).map_err(|e| {
            warn!(phy = arbiter.phy(), error = %e, "commit failed");
            AllocationError::Stale
        })?;
        Ok(Allocation {
            phy: arbiter.phy(),
            interface,
            evicted: grant.evictions,
        })
    }

    pub fn release(&mut self, phy: PhyIndex, id: InterfaceId) -> Option<ActiveInterface> {
        self.arbiters.get_mut(&phy)?.release(id)
    }

    /// Park a request until resources free up or capabilities arrive.
    pub fn enqueue(&mut self, request: QueuedRequest) {
        debug!(ticket = request.ticket.0, role = %request.role, "allocation queued");
        self.queue.push_back(request);
    }

    pub fn cancel(&mut self, ticket: RequestTicket) -> bool {
        let before = self.queue.len();
        self.queue.retain(|q| q.ticket != ticket);
        before != self.queue.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Retry queued requests in FIFO order. Admitted requests leave the queue; a request
    /// whose error is not transient is dropped and reported with it.
    pub fn retry_queued(
        &mut self,
    ) -> Vec<(RequestTicket, Result<Allocation, AllocationError>)> {
        let mut out = Vec::new();
        let pending: Vec<QueuedRequest> = self.queue.drain(..).collect();
        for request in pending {
            let allocated = match request.phy {
                Some(phy) => self.allocate_on(phy, request.role, request.priority),
                None => self.allocate(request.role, request.priority),
            };
            match allocated {
                Err(e) if e.is_transient() => self.queue.push_back(request),
                result => out.push((request.ticket, result)),
            }
        }
        out
    }
}
