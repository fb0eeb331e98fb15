//! Host-driven API: the host passes capability dumps, supplicant signals, helper
//! completions and feature requests; the service drives the fleet and devices and
//! queues actions (timers, queue outcomes) for the host to carry out.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::arbiter::{clamp_priority, ActiveInterface, AllocationError, InterfaceId, Priority};
use crate::capability::{CapabilityError, CapabilityMessage, PhyIndex};
use crate::control::{
    ApConfig, CallToken, ControlError, DeviceHandle, DownstreamNetwork, GroupConfig,
    GroupCredentials, NetworkLease, Ports,
};
use crate::device::{
    Device, DeviceError, DeviceInfo, DeviceState, Feature, HotspotDevice, P2pDevice, P2pState,
};
use crate::fleet::{Allocation, Fleet, FleetUpdate, QueuedRequest, RequestTicket};
use crate::role::InterfaceRole;

/// Default time a group formation or join may take before it is abandoned.
pub const DEFAULT_FORMATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub formation_timeout: Duration,
    /// Overrides of `Feature::default_priority`.
    pub priorities: HashMap<Feature, Priority>,
    /// Upstream interface for tethering; local-only hotspots never use one.
    pub upstream: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            formation_timeout: DEFAULT_FORMATION_TIMEOUT,
            priorities: HashMap::new(),
            upstream: None,
        }
    }
}

impl ServiceConfig {
    pub fn priority_for(&self, feature: Feature) -> Priority {
        clamp_priority(
            self.priorities
                .get(&feature)
                .copied()
                .unwrap_or_else(|| feature.default_priority()),
        )
    }
}

/// Signals the supplicant emits on a device's control link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupplicantSignal {
    GroupStarted {
        interface_path: String,
        group_path: String,
    },
    GroupFinished {
        interface_path: String,
        group_path: String,
    },
    PeerJoined {
        peer_path: String,
    },
    PeerDisconnected {
        peer_path: String,
    },
    InterfaceStateChanged {
        state: String,
    },
    ApEnabled,
    ApDisabled,
    StationCount {
        count: u32,
    },
}

#[derive(Debug)]
pub enum ServiceEvent {
    Capability(CapabilityMessage),
    Supplicant {
        link: String,
        signal: SupplicantSignal,
    },
    /// Helper finished creating a downstream network.
    NetworkStarted {
        token: CallToken,
        lease: Option<NetworkLease>,
        network: Option<DownstreamNetwork>,
    },
    /// Client-side addressing finished; ifindex 0 means it failed.
    ConnectionUpdated {
        token: CallToken,
        ifindex: u32,
    },
    NetworkStopped {
        link: String,
        ifindex: u32,
        is_failure: bool,
    },
    FormationTimeout(CallToken),
    /// The supplicant rejected a request for `link` after accepting it.
    ControlFailed {
        link: String,
    },
    UpstreamChanged {
        available: bool,
    },
}

/// Work the host must perform on the service's behalf.
#[derive(Debug)]
pub enum HostAction {
    /// Deliver `ServiceEvent::FormationTimeout(token)` after the delay. Bounds group
    /// formation, access-point start and teardown of either.
    ScheduleFormationTimeout { token: CallToken, after: Duration },
    /// A queued request was admitted and its device started.
    RequestAdmitted {
        ticket: RequestTicket,
        handle: DeviceHandle,
    },
    /// A queued request can never be admitted or its device failed to start.
    RequestFailed {
        ticket: RequestTicket,
        error: ServiceError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureRequest {
    pub owner: Feature,
    pub role: InterfaceRole,
    /// Pin to one radio; otherwise the fleet picks.
    pub phy: Option<PhyIndex>,
    /// Overrides the configured priority of `owner`.
    pub priority: Option<Priority>,
    /// Park the request when it cannot be admitted right now.
    pub queue: bool,
}

impl FeatureRequest {
    pub fn new(owner: Feature, role: InterfaceRole) -> Self {
        Self {
            owner,
            role,
            phy: None,
            priority: None,
            queue: false,
        }
    }
}

/// Interface managed outside the service (station connectivity, discovery) that holds a
/// slot in the radio registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalInterface {
    pub phy: PhyIndex,
    pub interface: InterfaceId,
    pub role: InterfaceRole,
    pub owner: Feature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started(DeviceHandle),
    Queued(RequestTicket),
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),
    #[error("control request failed: {0}")]
    Control(#[from] ControlError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("bad capability message: {0}")]
    Capability(#[from] CapabilityError),
    #[error("unknown device {0}")]
    UnknownDevice(DeviceHandle),
    #[error("device {0} does not support this operation")]
    WrongDeviceKind(DeviceHandle),
    #[error("radio cannot start a network on {0} MHz")]
    UnsupportedFrequency(u32),
}

pub struct RadioService {
    config: ServiceConfig,
    fleet: Fleet,
    devices: BTreeMap<DeviceHandle, Device>,
    pending: HashMap<RequestTicket, Feature>,
    external: Vec<ExternalInterface>,
    next_handle: u64,
    next_ticket: u64,
    actions: Vec<HostAction>,
}

impl RadioService {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            fleet: Fleet::new(),
            devices: BTreeMap::new(),
            pending: HashMap::new(),
            external: Vec::new(),
            next_handle: 1,
            next_ticket: 1,
            actions: Vec::new(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn device(&self, handle: DeviceHandle) -> Option<&Device> {
        self.devices.get(&handle)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn external_interfaces(&self) -> &[ExternalInterface] {
        &self.external
    }

    /// Take the actions queued since the last call.
    pub fn drain_actions(&mut self) -> Vec<HostAction> {
        std::mem::take(&mut self.actions)
    }

    fn request_priority(&self, request: &FeatureRequest) -> Priority {
        clamp_priority(
            request
                .priority
                .unwrap_or_else(|| self.config.priority_for(request.owner)),
        )
    }

    /// Create a device for `request.role`. Roles without a device kind are rejected before
    /// the radio is consulted, so nothing is evicted for them.
    pub fn request_device(
        &mut self,
        ports: &mut Ports<'_>,
        request: FeatureRequest,
    ) -> Result<Admission, ServiceError> {
        if !Device::supports_role(request.role) {
            info!(owner = ?request.owner, role = %request.role, "no device kind for role");
            return Err(DeviceError::UnsupportedRole(request.role).into());
        }
        let priority = self.request_priority(&request);
        let allocated = match request.phy {
            Some(phy) => self.fleet.allocate_on(phy, request.role, priority),
            None => self.fleet.allocate(request.role, priority),
        };
        let error = match allocated {
            Ok(allocation) => {
                let handle = self.launch(ports, allocation, request.owner)?;
                return Ok(Admission::Started(handle));
            }
            Err(e) => e,
        };
        if !request.queue || !error.is_transient() {
            info!(owner = ?request.owner, role = %request.role, error = %error, "device request refused");
            return Err(error.into());
        }
        let ticket = RequestTicket(self.next_ticket);
        self.next_ticket += 1;
        self.pending.insert(ticket, request.owner);
        self.fleet.enqueue(QueuedRequest {
            ticket,
            role: request.role,
            priority,
            phy: request.phy,
        });
        Ok(Admission::Queued(ticket))
    }

    /// Record an interface that lives outside the service so devices cannot evict it
    /// unless they outrank its owner. Lower priority devices it displaces are torn down.
    pub fn register_external(
        &mut self,
        ports: &mut Ports<'_>,
        request: FeatureRequest,
    ) -> Result<ExternalInterface, ServiceError> {
        let priority = self.request_priority(&request);
        let allocation = match request.phy {
            Some(phy) => self.fleet.allocate_on(phy, request.role, priority),
            None => self.fleet.allocate(request.role, priority),
        }?;
        self.evict(ports, allocation.phy, &allocation.evicted);
        let external = ExternalInterface {
            phy: allocation.phy,
            interface: allocation.interface.id,
            role: request.role,
            owner: request.owner,
        };
        info!(phy = external.phy, role = %external.role, owner = ?external.owner, priority, "external interface registered");
        self.external.push(external);
        Ok(external)
    }

    /// Forget an external interface and admit queued requests it was blocking.
    pub fn release_external(
        &mut self,
        ports: &mut Ports<'_>,
        phy: PhyIndex,
        interface: InterfaceId,
    ) -> bool {
        let before = self.external.len();
        self.external
            .retain(|e| !(e.phy == phy && e.interface == interface));
        if self.external.len() == before {
            return false;
        }
        self.fleet.release(phy, interface);
        debug!(phy, id = interface.0, "external interface released");
        self.retry_queue(ports);
        true
    }

    pub fn cancel_request(&mut self, ticket: RequestTicket) -> bool {
        self.pending.remove(&ticket);
        self.fleet.cancel(ticket)
    }

    /// Stop a device, remove its interface and free its slot on the radio.
    pub fn stop_device(
        &mut self,
        ports: &mut Ports<'_>,
        handle: DeviceHandle,
    ) -> Result<(), ServiceError> {
        let info = self
            .teardown(ports, handle)
            .ok_or(ServiceError::UnknownDevice(handle))?;
        self.fleet.release(info.phy, info.interface);
        self.retry_queue(ports);
        Ok(())
    }

    pub fn create_group(
        &mut self,
        ports: &mut Ports<'_>,
        handle: DeviceHandle,
        config: &GroupConfig,
    ) -> Result<bool, ServiceError> {
        let phy = self.p2p(handle)?.info().phy;
        self.check_frequency(phy, config.frequency_mhz)?;
        let device = self.p2p(handle)?;
        if !device.create_group(ports, config) {
            return Ok(false);
        }
        let token = device.token();
        self.schedule_formation_timeout(token);
        Ok(true)
    }

    pub fn connect(
        &mut self,
        ports: &mut Ports<'_>,
        handle: DeviceHandle,
        credentials: &GroupCredentials,
    ) -> Result<bool, ServiceError> {
        let device = self.p2p(handle)?;
        if !device.connect(ports, credentials) {
            return Ok(false);
        }
        let token = device.token();
        self.schedule_formation_timeout(token);
        Ok(true)
    }

    pub fn remove_group(
        &mut self,
        ports: &mut Ports<'_>,
        handle: DeviceHandle,
    ) -> Result<bool, ServiceError> {
        let device = self.p2p(handle)?;
        if !device.remove_group(ports) {
            return Ok(false);
        }
        let token = device.token();
        self.schedule_formation_timeout(token);
        Ok(true)
    }

    pub fn disconnect(
        &mut self,
        ports: &mut Ports<'_>,
        handle: DeviceHandle,
    ) -> Result<bool, ServiceError> {
        let device = self.p2p(handle)?;
        if !device.disconnect(ports) {
            return Ok(false);
        }
        let token = device.token();
        self.schedule_formation_timeout(token);
        Ok(true)
    }

    /// Start the access point. Tethering devices use the configured upstream; every
    /// other owner gets a local-only network.
    pub fn start_access_point(
        &mut self,
        ports: &mut Ports<'_>,
        handle: DeviceHandle,
        config: &ApConfig,
    ) -> Result<bool, ServiceError> {
        let info = self.hotspot(handle)?.info();
        let (owner, phy) = (info.owner, info.phy);
        let upstream = match owner {
            Feature::Tethering => self.config.upstream.clone(),
            _ => None,
        };
        self.check_frequency(phy, config.frequency_mhz)?;
        let hotspot = self.hotspot(handle)?;
        if !hotspot.start_access_point(ports, config, upstream) {
            return Ok(false);
        }
        let token = hotspot.token();
        self.schedule_formation_timeout(token);
        Ok(true)
    }

    pub fn stop_access_point(
        &mut self,
        ports: &mut Ports<'_>,
        handle: DeviceHandle,
    ) -> Result<bool, ServiceError> {
        let hotspot = self.hotspot(handle)?;
        if !hotspot.stop_access_point(ports) {
            return Ok(false);
        }
        let token = hotspot.token();
        self.schedule_formation_timeout(token);
        Ok(true)
    }

    pub fn handle_event(
        &mut self,
        ports: &mut Ports<'_>,
        event: ServiceEvent,
    ) -> Result<(), ServiceError> {
        match event {
            ServiceEvent::Capability(msg) => match self.fleet.handle_capability(msg)? {
                FleetUpdate::Pending => {}
                FleetUpdate::Reported(phy) => {
                    debug!(phy, "capabilities effective");
                    self.retry_queue(ports);
                }
                FleetUpdate::Removed { phy, .. } => {
                    self.external.retain(|e| e.phy != phy);
                    let gone: Vec<DeviceHandle> = self
                        .devices
                        .iter()
                        .filter(|(_, d)| d.info().phy == phy)
                        .map(|(h, _)| *h)
                        .collect();
                    for handle in gone {
                        self.teardown(ports, handle);
                    }
                }
            },
            ServiceEvent::Supplicant { link, signal } => self.on_signal(ports, &link, signal),
            ServiceEvent::NetworkStarted {
                token,
                lease,
                network,
            } => match self.devices.get_mut(&token.handle) {
                Some(Device::P2p(d)) => {
                    d.on_group_network_started(ports, token, lease, network);
                }
                Some(Device::Hotspot(d)) => {
                    d.on_tethered_network_started(ports, token, lease, network);
                }
                None => debug!(device = %token.handle, "network started for unknown device"),
            },
            ServiceEvent::ConnectionUpdated { token, ifindex } => {
                if let Some(Device::P2p(d)) = self.devices.get_mut(&token.handle) {
                    d.on_connection_updated(ports, token, ifindex);
                }
            }
            ServiceEvent::NetworkStopped {
                link,
                ifindex,
                is_failure,
            } => match self.device_for_link(&link) {
                Some(Device::P2p(d)) => {
                    d.on_network_stopped(ports, ifindex, is_failure);
                }
                Some(Device::Hotspot(d)) => {
                    d.on_network_stopped(ports, is_failure);
                }
                None => debug!(link = %link, "network stopped on unknown link"),
            },
            ServiceEvent::FormationTimeout(token) => match self.devices.get_mut(&token.handle) {
                Some(Device::P2p(d)) => {
                    d.on_formation_timeout(ports, token);
                }
                Some(Device::Hotspot(d)) => {
                    d.on_request_timeout(ports, token);
                }
                None => {}
            },
            ServiceEvent::ControlFailed { link } => match self.device_for_link(&link) {
                Some(Device::P2p(d)) => {
                    d.on_control_failure(ports);
                }
                Some(Device::Hotspot(d)) => {
                    d.on_control_failure(ports);
                }
                None => debug!(link = %link, "control failure on unknown link"),
            },
            ServiceEvent::UpstreamChanged { available } => {
                for device in self.devices.values_mut() {
                    if let Device::Hotspot(d) = device {
                        d.on_upstream_changed(ports, available);
                    }
                }
            }
        }
        Ok(())
    }

    fn on_signal(&mut self, ports: &mut Ports<'_>, link: &str, signal: SupplicantSignal) {
        let Some(device) = self.device_for_link(link) else {
            debug!(link, ?signal, "signal for unknown link");
            return;
        };
        match (device, signal) {
            (
                Device::P2p(d),
                SupplicantSignal::GroupStarted {
                    interface_path,
                    group_path,
                },
            ) => {
                d.on_group_started(ports, &interface_path, &group_path);
            }
            (
                Device::P2p(d),
                SupplicantSignal::GroupFinished {
                    interface_path,
                    group_path,
                },
            ) => {
                d.on_group_finished(ports, &interface_path, &group_path);
            }
            (Device::P2p(d), SupplicantSignal::PeerJoined { peer_path }) => {
                d.on_peer_joined(ports, &peer_path);
            }
            (Device::P2p(d), SupplicantSignal::PeerDisconnected { peer_path }) => {
                d.on_peer_disconnected(ports, &peer_path);
            }
            (Device::P2p(d), SupplicantSignal::InterfaceStateChanged { state }) => {
                d.on_interface_state_changed(&state);
            }
            (Device::Hotspot(d), SupplicantSignal::ApEnabled) => {
                d.on_access_point_enabled(ports);
            }
            (Device::Hotspot(d), SupplicantSignal::ApDisabled) => {
                d.on_access_point_disabled(ports);
            }
            (Device::Hotspot(d), SupplicantSignal::StationCount { count }) => {
                d.on_station_count(count);
            }
            (device, signal) => {
                debug!(device = %device.info().handle, ?signal, "signal not handled by device kind");
            }
        }
    }

    /// Device whose control link or P2P group link is `link`.
    fn device_for_link(&mut self, link: &str) -> Option<&mut Device> {
        self.devices.values_mut().find(|d| match d {
            Device::P2p(p) => p.info().link == link || p.group_link() == Some(link),
            Device::Hotspot(h) => h.info().link == link,
        })
    }

    fn p2p(&mut self, handle: DeviceHandle) -> Result<&mut P2pDevice, ServiceError> {
        self.devices
            .get_mut(&handle)
            .ok_or(ServiceError::UnknownDevice(handle))?
            .as_p2p_mut()
            .ok_or(ServiceError::WrongDeviceKind(handle))
    }

    fn hotspot(&mut self, handle: DeviceHandle) -> Result<&mut HotspotDevice, ServiceError> {
        self.devices
            .get_mut(&handle)
            .ok_or(ServiceError::UnknownDevice(handle))?
            .as_hotspot_mut()
            .ok_or(ServiceError::WrongDeviceKind(handle))
    }

    /// A requested frequency must be one the radio may beacon on. Radios that reported no
    /// channels accept any frequency.
    fn check_frequency(&self, phy: PhyIndex, mhz: Option<u32>) -> Result<(), ServiceError> {
        let Some(mhz) = mhz else {
            return Ok(());
        };
        let Some(arbiter) = self.fleet.arbiter(phy) else {
            return Ok(());
        };
        let usable = arbiter.capabilities().initiating_frequencies();
        if usable.is_empty() || usable.contains(&mhz) {
            Ok(())
        } else {
            info!(phy, mhz, "frequency not usable for beaconing");
            Err(ServiceError::UnsupportedFrequency(mhz))
        }
    }

    fn schedule_formation_timeout(&mut self, token: CallToken) {
        self.actions.push(HostAction::ScheduleFormationTimeout {
            token,
            after: self.config.formation_timeout,
        });
    }

    /// Tear down devices and drop external registrations whose slots a grant took.
    fn evict(&mut self, ports: &mut Ports<'_>, phy: PhyIndex, evicted: &[ActiveInterface]) {
        for victim in evicted {
            if let Some(pos) = self
                .external
                .iter()
                .position(|e| e.phy == phy && e.interface == victim.id)
            {
                let gone = self.external.remove(pos);
                info!(phy, role = %gone.role, owner = ?gone.owner, "evicting external interface");
            }
            let handle = self
                .devices
                .iter()
                .find(|(_, d)| d.info().phy == phy && d.info().interface == victim.id)
                .map(|(h, _)| *h);
            if let Some(handle) = handle {
                info!(device = %handle, phy, role = %victim.role, "evicting device");
                self.teardown(ports, handle);
            }
        }
    }

    /// Tear down evicted devices, then create the interface and start the new device.
    /// Callers only pass roles `Device::supports_role` accepts. On failure the allocation
    /// is released again.
    fn launch(
        &mut self,
        ports: &mut Ports<'_>,
        allocation: Allocation,
        owner: Feature,
    ) -> Result<DeviceHandle, ServiceError> {
        let Allocation {
            phy,
            interface,
            evicted,
        } = allocation;
        self.evict(ports, phy, &evicted);

        let link = match ports.supplicant.create_interface(phy, interface.role) {
            Ok(link) => link,
            Err(e) => {
                warn!(phy, role = %interface.role, error = %e, "interface creation failed");
                self.fleet.release(phy, interface.id);
                return Err(e.into());
            }
        };
        let handle = DeviceHandle(self.next_handle);
        self.next_handle += 1;
        let info = DeviceInfo {
            handle,
            link: link.clone(),
            phy,
            interface: interface.id,
            role: interface.role,
            priority: interface.priority,
            owner,
            state: DeviceState::P2p(P2pState::Uninitialized),
        };
        let mut device = match Device::new(info) {
            Ok(device) => device,
            Err(e) => {
                if let Err(e) = ports.supplicant.remove_interface(&link) {
                    debug!(link = %link, error = %e, "interface removal failed");
                }
                self.fleet.release(phy, interface.id);
                return Err(e.into());
            }
        };
        info!(device = %handle, phy, link = %link, role = %interface.role, priority = interface.priority, "device created");
        device.start(ports);
        self.devices.insert(handle, device);
        Ok(handle)
    }

    /// Stop and forget a device without touching the radio registry.
    fn teardown(&mut self, ports: &mut Ports<'_>, handle: DeviceHandle) -> Option<DeviceInfo> {
        let mut device = self.devices.remove(&handle)?;
        device.stop(ports);
        let info = device.info().clone();
        if let Err(e) = ports.supplicant.remove_interface(&info.link) {
            debug!(link = %info.link, error = %e, "interface removal failed");
        }
        Some(info)
    }

    fn retry_queue(&mut self, ports: &mut Ports<'_>) {
        for (ticket, result) in self.fleet.retry_queued() {
            let owner = self.pending.remove(&ticket).unwrap_or(Feature::Other(0));
            let action = match result.map_err(ServiceError::from) {
                Ok(allocation) => match self.launch(ports, allocation, owner) {
                    Ok(handle) => HostAction::RequestAdmitted { ticket, handle },
                    Err(error) => HostAction::RequestFailed { ticket, error },
                },
                Err(error) => HostAction::RequestFailed { ticket, error },
            };
            self.actions.push(action);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{RawFrequency, FREQ_FLAG_RADAR};
    use crate::combination::{ConcurrencyCombination, InterfaceRoleLimit};
    use crate::device::{DeviceEvent, HotspotState};
    use crate::testing::{self, Harness, GROUP_IFACE_PATH, GROUP_LINK, GROUP_PATH};
    use InterfaceRole::{AccessPoint, Adhoc, P2pClient, P2pGroupOwner, Station};

    const ALL_ROLES: [InterfaceRole; 5] = [
        Station,
        AccessPoint,
        P2pGroupOwner,
        P2pClient,
        InterfaceRole::P2pDevice,
    ];

    fn report(service: &mut RadioService, h: &mut Harness, phy: PhyIndex) {
        let combination = ConcurrencyCombination {
            limits: vec![
                InterfaceRoleLimit::new(&[InterfaceRole::P2pDevice], 1),
                InterfaceRoleLimit::new(&[AccessPoint, P2pGroupOwner, P2pClient], 1),
            ],
            max_total: 2,
            num_channels: 1,
        };
        report_with(service, h, phy, &ALL_ROLES, combination, vec![]);
    }

    /// One interface of any data role at a time.
    fn report_single_slot(service: &mut RadioService, h: &mut Harness, phy: PhyIndex) {
        let combination = ConcurrencyCombination {
            limits: vec![InterfaceRoleLimit::new(
                &[Station, AccessPoint, P2pGroupOwner, P2pClient],
                1,
            )],
            max_total: 1,
            num_channels: 1,
        };
        report_with(service, h, phy, &ALL_ROLES, combination, vec![]);
    }

    fn report_with(
        service: &mut RadioService,
        h: &mut Harness,
        phy: PhyIndex,
        roles: &[InterfaceRole],
        combination: ConcurrencyCombination,
        frequencies: Vec<RawFrequency>,
    ) {
        service
            .handle_event(
                &mut h.ports(),
                ServiceEvent::Capability(CapabilityMessage::Wiphy {
                    phy,
                    name: Some(format!("phy{}", phy)),
                    supported_roles: roles.to_vec(),
                    combinations: vec![combination],
                    frequencies,
                }),
            )
            .unwrap();
        service
            .handle_event(
                &mut h.ports(),
                ServiceEvent::Capability(CapabilityMessage::DumpComplete { phy }),
            )
            .unwrap();
    }

    fn started(admission: Admission) -> DeviceHandle {
        match admission {
            Admission::Started(handle) => handle,
            other => panic!("expected Started, got {:?}", other),
        }
    }

    fn p2p_state(service: &RadioService, handle: DeviceHandle) -> P2pState {
        match service.device(handle) {
            Some(Device::P2p(d)) => d.state(),
            other => panic!("expected p2p device, got {:?}", other),
        }
    }

    fn signal(link: &str, signal: SupplicantSignal) -> ServiceEvent {
        ServiceEvent::Supplicant {
            link: link.to_string(),
            signal,
        }
    }

    fn network() -> Option<DownstreamNetwork> {
        Some(DownstreamNetwork {
            network_id: 1,
            interface: GROUP_LINK.to_string(),
        })
    }

    #[test]
    fn group_owner_flow() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report(&mut service, &mut h, 0);
        let go = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::WifiDirect, P2pGroupOwner))
                .unwrap(),
        );
        assert_eq!(p2p_state(&service, go), P2pState::Ready);
        let link = service.device(go).unwrap().info().link.clone();
        assert_eq!(link, "wlan0-1");

        assert!(service
            .create_group(&mut h.ports(), go, &GroupConfig::default())
            .unwrap());
        let actions = service.drain_actions();
        assert!(matches!(
            actions.as_slice(),
            [HostAction::ScheduleFormationTimeout { after, .. }] if *after == DEFAULT_FORMATION_TIMEOUT
        ));

        service
            .handle_event(
                &mut h.ports(),
                signal(
                    &link,
                    SupplicantSignal::GroupStarted {
                        interface_path: GROUP_IFACE_PATH.to_string(),
                        group_path: GROUP_PATH.to_string(),
                    },
                ),
            )
            .unwrap();
        assert_eq!(p2p_state(&service, go), P2pState::GoConfiguring);

        let token = h.helper.requests[0].1;
        service
            .handle_event(
                &mut h.ports(),
                ServiceEvent::NetworkStarted {
                    token,
                    lease: Some(testing::lease()),
                    network: network(),
                },
            )
            .unwrap();
        assert_eq!(p2p_state(&service, go), P2pState::GoActive);

        service
            .handle_event(
                &mut h.ports(),
                signal(
                    GROUP_LINK,
                    SupplicantSignal::PeerJoined {
                        peer_path: "/peers/1".to_string(),
                    },
                ),
            )
            .unwrap();
        assert_eq!(
            h.sink.count(|e| matches!(e, DeviceEvent::PeerConnected(_))),
            1
        );

        service
            .handle_event(&mut h.ports(), ServiceEvent::FormationTimeout(token))
            .unwrap();
        assert_eq!(p2p_state(&service, go), P2pState::GoActive);
    }

    #[test]
    fn tethering_evicts_wifi_direct() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report(&mut service, &mut h, 0);
        let go = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::WifiDirect, P2pGroupOwner))
                .unwrap(),
        );
        let ap = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::Tethering, AccessPoint))
                .unwrap(),
        );
        assert!(service.device(go).is_none());
        assert!(service.device(ap).is_some());
        assert_eq!(h.supplicant.called("remove_interface"), 1);
        assert!(h
            .sink
            .events
            .iter()
            .any(|(e, handle, _)| *e == DeviceEvent::InterfaceDisabled && *handle == go));
        let active = service.fleet().arbiter(0).unwrap().active_roles();
        assert_eq!(active, vec![AccessPoint]);
    }

    #[test]
    fn lower_priority_request_waits_for_release() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report(&mut service, &mut h, 0);
        let ap = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::Tethering, AccessPoint))
                .unwrap(),
        );
        let mut request = FeatureRequest::new(Feature::WifiDirect, P2pGroupOwner);
        assert!(matches!(
            service.request_device(&mut h.ports(), request),
            Err(ServiceError::Allocation(AllocationError::RefusedByPolicy))
        ));
        request.queue = true;
        let ticket = match service.request_device(&mut h.ports(), request).unwrap() {
            Admission::Queued(ticket) => ticket,
            other => panic!("expected Queued, got {:?}", other),
        };

        service.stop_device(&mut h.ports(), ap).unwrap();
        let actions = service.drain_actions();
        let handle = match actions.as_slice() {
            [HostAction::RequestAdmitted { ticket: t, handle }] if *t == ticket => *handle,
            other => panic!("unexpected actions {:?}", other),
        };
        assert_eq!(p2p_state(&service, handle), P2pState::Ready);
        assert_eq!(service.fleet().queued(), 0);
    }

    #[test]
    fn hardware_refusal_is_never_queued() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        let combination = ConcurrencyCombination {
            limits: vec![InterfaceRoleLimit::new(&[Station], 1)],
            max_total: 1,
            num_channels: 1,
        };
        report_with(&mut service, &mut h, 0, &[Station], combination, vec![]);
        let mut request = FeatureRequest::new(Feature::Other(1), AccessPoint);
        request.queue = true;
        assert!(matches!(
            service.request_device(&mut h.ports(), request),
            Err(ServiceError::Allocation(AllocationError::RefusedByHardware))
        ));
        assert_eq!(service.fleet().queued(), 0);
    }

    #[test]
    fn queued_until_capabilities_arrive() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        let mut request = FeatureRequest::new(Feature::LocalOnlyHotspot, AccessPoint);
        request.queue = true;
        assert!(matches!(
            service.request_device(&mut h.ports(), request).unwrap(),
            Admission::Queued(_)
        ));
        report(&mut service, &mut h, 3);
        let actions = service.drain_actions();
        assert!(matches!(actions.as_slice(), [HostAction::RequestAdmitted { .. }]));
        assert_eq!(service.devices().count(), 1);
        assert_eq!(service.devices().next().unwrap().info().phy, 3);
    }

    #[test]
    fn cancelled_request_not_admitted() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        let mut request = FeatureRequest::new(Feature::WifiDirect, P2pClient);
        request.queue = true;
        let ticket = match service.request_device(&mut h.ports(), request).unwrap() {
            Admission::Queued(ticket) => ticket,
            other => panic!("expected Queued, got {:?}", other),
        };
        assert!(service.cancel_request(ticket));
        report(&mut service, &mut h, 0);
        assert!(service.drain_actions().is_empty());
        assert_eq!(service.devices().count(), 0);
    }

    #[test]
    fn radio_removal_tears_down_devices() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report(&mut service, &mut h, 0);
        let go = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::WifiDirect, P2pGroupOwner))
                .unwrap(),
        );
        service
            .handle_event(
                &mut h.ports(),
                ServiceEvent::Capability(CapabilityMessage::Removed { phy: 0 }),
            )
            .unwrap();
        assert!(service.device(go).is_none());
        assert!(service.fleet().arbiter(0).is_none());
        assert_eq!(h.sink.count(|e| *e == DeviceEvent::InterfaceDisabled), 1);
        assert!(matches!(
            service.request_device(&mut h.ports(), FeatureRequest::new(Feature::WifiDirect, P2pGroupOwner)),
            Err(ServiceError::Allocation(AllocationError::CapabilityUnavailable))
        ));
    }

    #[test]
    fn interface_creation_failure_releases_slot() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report(&mut service, &mut h, 0);
        h.supplicant.fail("create_interface");
        assert!(matches!(
            service.request_device(&mut h.ports(), FeatureRequest::new(Feature::Tethering, AccessPoint)),
            Err(ServiceError::Control(_))
        ));
        assert!(service.fleet().arbiter(0).unwrap().active().is_empty());
        assert_eq!(service.devices().count(), 0);
    }

    #[test]
    fn unmanaged_role_rejected_before_allocation() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report(&mut service, &mut h, 0);
        for role in [Station, InterfaceRole::P2pDevice, Adhoc] {
            let mut request = FeatureRequest::new(Feature::Other(2), role);
            request.queue = true;
            assert!(matches!(
                service.request_device(&mut h.ports(), request),
                Err(ServiceError::Device(DeviceError::UnsupportedRole(r))) if r == role
            ));
        }
        assert!(service.fleet().arbiter(0).unwrap().active().is_empty());
        assert_eq!(service.fleet().queued(), 0);
        assert_eq!(h.supplicant.called("create_interface"), 0);
    }

    #[test]
    fn unmanaged_role_never_evicts_live_device() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report_single_slot(&mut service, &mut h, 0);
        let ap = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::Tethering, AccessPoint))
                .unwrap(),
        );
        assert!(matches!(
            service.request_device(&mut h.ports(), FeatureRequest::new(Feature::Station, Station)),
            Err(ServiceError::Device(DeviceError::UnsupportedRole(Station)))
        ));
        assert!(service.device(ap).is_some());
        assert_eq!(h.supplicant.called("remove_interface"), 0);
        assert_eq!(
            service.fleet().arbiter(0).unwrap().active_roles(),
            vec![AccessPoint]
        );
    }

    #[test]
    fn pinned_queued_request_stays_on_its_radio() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report_single_slot(&mut service, &mut h, 0);
        report_single_slot(&mut service, &mut h, 1);
        let mut ap_request = FeatureRequest::new(Feature::Tethering, AccessPoint);
        ap_request.phy = Some(1);
        let ap = started(service.request_device(&mut h.ports(), ap_request).unwrap());

        let mut request = FeatureRequest::new(Feature::WifiDirect, P2pGroupOwner);
        request.phy = Some(1);
        request.queue = true;
        let ticket = match service.request_device(&mut h.ports(), request).unwrap() {
            Admission::Queued(ticket) => ticket,
            other => panic!("expected Queued, got {:?}", other),
        };
        report_single_slot(&mut service, &mut h, 0);
        assert!(service.drain_actions().is_empty());
        assert_eq!(service.fleet().queued(), 1);

        service.stop_device(&mut h.ports(), ap).unwrap();
        let handle = match service.drain_actions().as_slice() {
            [HostAction::RequestAdmitted { ticket: t, handle }] if *t == ticket => *handle,
            other => panic!("unexpected actions {:?}", other),
        };
        assert_eq!(service.device(handle).unwrap().info().phy, 1);
        assert!(service.fleet().arbiter(0).unwrap().active().is_empty());
    }

    #[test]
    fn external_station_cannot_be_evicted_by_lower_features() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report_single_slot(&mut service, &mut h, 0);
        let station = service
            .register_external(&mut h.ports(), FeatureRequest::new(Feature::Station, Station))
            .unwrap();
        assert_eq!(station.phy, 0);
        for (owner, role) in [
            (Feature::Tethering, AccessPoint),
            (Feature::WifiDirect, P2pGroupOwner),
        ] {
            assert!(matches!(
                service.request_device(&mut h.ports(), FeatureRequest::new(owner, role)),
                Err(ServiceError::Allocation(AllocationError::RefusedByPolicy))
            ));
        }
        assert_eq!(service.external_interfaces(), &[station]);

        let mut request = FeatureRequest::new(Feature::Tethering, AccessPoint);
        request.queue = true;
        let ticket = match service.request_device(&mut h.ports(), request).unwrap() {
            Admission::Queued(ticket) => ticket,
            other => panic!("expected Queued, got {:?}", other),
        };
        assert!(service.release_external(&mut h.ports(), station.phy, station.interface));
        assert!(!service.release_external(&mut h.ports(), station.phy, station.interface));
        assert!(matches!(
            service.drain_actions().as_slice(),
            [HostAction::RequestAdmitted { ticket: t, .. }] if *t == ticket
        ));
        assert!(service.external_interfaces().is_empty());
    }

    #[test]
    fn external_registration_evicts_lower_priority_device() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report_single_slot(&mut service, &mut h, 0);
        let go = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::WifiDirect, P2pGroupOwner))
                .unwrap(),
        );
        service
            .register_external(&mut h.ports(), FeatureRequest::new(Feature::Station, Station))
            .unwrap();
        assert!(service.device(go).is_none());
        assert_eq!(h.sink.count(|e| *e == DeviceEvent::InterfaceDisabled), 1);
        assert_eq!(
            service.fleet().arbiter(0).unwrap().active_roles(),
            vec![Station]
        );
    }

    #[test]
    fn configured_station_priority_applies_to_external_interfaces() {
        let mut h = Harness::default();
        let mut priorities = HashMap::new();
        priorities.insert(Feature::Station, 20);
        let mut service = RadioService::new(ServiceConfig {
            priorities,
            ..ServiceConfig::default()
        });
        report_single_slot(&mut service, &mut h, 0);
        service
            .register_external(&mut h.ports(), FeatureRequest::new(Feature::Station, Station))
            .unwrap();
        let ap = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::Tethering, AccessPoint))
                .unwrap(),
        );
        assert!(service.device(ap).is_some());
        assert!(service.external_interfaces().is_empty());
    }

    #[test]
    fn control_failure_reaches_device() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report(&mut service, &mut h, 0);
        let go = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::WifiDirect, P2pGroupOwner))
                .unwrap(),
        );
        let link = service.device(go).unwrap().info().link.clone();
        assert!(service
            .create_group(&mut h.ports(), go, &GroupConfig::default())
            .unwrap());
        service
            .handle_event(&mut h.ports(), ServiceEvent::ControlFailed { link })
            .unwrap();
        assert_eq!(p2p_state(&service, go), P2pState::Ready);
        assert_eq!(h.sink.count(|e| *e == DeviceEvent::LinkFailure), 1);
        service
            .handle_event(
                &mut h.ports(),
                ServiceEvent::ControlFailed {
                    link: "wlan9-9".to_string(),
                },
            )
            .unwrap();
    }

    #[test]
    fn access_point_start_is_bounded_by_timeout() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report(&mut service, &mut h, 0);
        let ap = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::LocalOnlyHotspot, AccessPoint))
                .unwrap(),
        );
        let config = ApConfig {
            ssid: "local".to_string(),
            passphrase: None,
            frequency_mhz: None,
            hidden: false,
        };
        assert!(service.start_access_point(&mut h.ports(), ap, &config).unwrap());
        let token = match service.drain_actions().as_slice() {
            [HostAction::ScheduleFormationTimeout { token, .. }] => *token,
            other => panic!("unexpected actions {:?}", other),
        };
        service
            .handle_event(&mut h.ports(), ServiceEvent::FormationTimeout(token))
            .unwrap();
        match service.device(ap) {
            Some(Device::Hotspot(d)) => assert_eq!(d.state(), HotspotState::Idle),
            other => panic!("expected hotspot, got {:?}", other),
        }
        assert_eq!(h.sink.count(|e| *e == DeviceEvent::LinkFailure), 1);
        assert_eq!(h.supplicant.called("stop_access_point"), 1);
    }

    #[test]
    fn beacon_frequency_checked_against_radio() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        let combination = ConcurrencyCombination {
            limits: vec![InterfaceRoleLimit::new(&[AccessPoint, P2pGroupOwner], 2)],
            max_total: 2,
            num_channels: 2,
        };
        let frequencies = vec![
            RawFrequency { mhz: 2412, flags: 0 },
            RawFrequency {
                mhz: 5260,
                flags: FREQ_FLAG_RADAR,
            },
        ];
        report_with(&mut service, &mut h, 0, &ALL_ROLES, combination, frequencies);
        let go = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::WifiDirect, P2pGroupOwner))
                .unwrap(),
        );
        let radar = GroupConfig {
            frequency_mhz: Some(5260),
            ..GroupConfig::default()
        };
        assert!(matches!(
            service.create_group(&mut h.ports(), go, &radar),
            Err(ServiceError::UnsupportedFrequency(5260))
        ));
        assert_eq!(h.supplicant.called("group_add"), 0);
        let usable = GroupConfig {
            frequency_mhz: Some(2412),
            ..GroupConfig::default()
        };
        assert!(service.create_group(&mut h.ports(), go, &usable).unwrap());

        let ap = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::Tethering, AccessPoint))
                .unwrap(),
        );
        let config = ApConfig {
            ssid: "x".to_string(),
            passphrase: None,
            frequency_mhz: Some(2484),
            hidden: false,
        };
        assert!(matches!(
            service.start_access_point(&mut h.ports(), ap, &config),
            Err(ServiceError::UnsupportedFrequency(2484))
        ));
    }

    #[test]
    fn operations_check_device_kind() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig::default());
        report(&mut service, &mut h, 0);
        let go = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::WifiDirect, P2pGroupOwner))
                .unwrap(),
        );
        let config = ApConfig {
            ssid: "x".to_string(),
            passphrase: None,
            frequency_mhz: None,
            hidden: false,
        };
        assert!(matches!(
            service.start_access_point(&mut h.ports(), go, &config),
            Err(ServiceError::WrongDeviceKind(_))
        ));
        assert!(matches!(
            service.disconnect(&mut h.ports(), DeviceHandle(99)),
            Err(ServiceError::UnknownDevice(DeviceHandle(99)))
        ));
        assert!(!service.disconnect(&mut h.ports(), go).unwrap());
    }

    #[test]
    fn tethered_hotspot_follows_upstream() {
        let mut h = Harness::default();
        let mut service = RadioService::new(ServiceConfig {
            upstream: Some("eth0".to_string()),
            ..ServiceConfig::default()
        });
        report(&mut service, &mut h, 0);
        let ap = started(
            service
                .request_device(&mut h.ports(), FeatureRequest::new(Feature::Tethering, AccessPoint))
                .unwrap(),
        );
        let link = service.device(ap).unwrap().info().link.clone();
        let config = ApConfig {
            ssid: "tether".to_string(),
            passphrase: Some("password1".to_string()),
            frequency_mhz: Some(2412),
            hidden: false,
        };
        assert!(service.start_access_point(&mut h.ports(), ap, &config).unwrap());
        service
            .handle_event(&mut h.ports(), signal(&link, SupplicantSignal::ApEnabled))
            .unwrap();
        let token = h.helper.requests[0].1;
        service
            .handle_event(
                &mut h.ports(),
                ServiceEvent::NetworkStarted {
                    token,
                    lease: Some(testing::lease()),
                    network: network(),
                },
            )
            .unwrap();
        service
            .handle_event(&mut h.ports(), ServiceEvent::UpstreamChanged { available: false })
            .unwrap();
        service
            .handle_event(&mut h.ports(), signal(&link, SupplicantSignal::StationCount { count: 2 }))
            .unwrap();
        match service.device(ap) {
            Some(Device::Hotspot(d)) => {
                assert_eq!(d.state(), HotspotState::Active);
                assert!(d.is_tethered());
                assert_eq!(d.station_count(), 2);
            }
            other => panic!("expected hotspot, got {:?}", other),
        }
        assert_eq!(h.sink.count(|e| *e == DeviceEvent::ServiceUp), 1);
        assert_eq!(h.sink.count(|e| *e == DeviceEvent::ServiceDown), 1);
    }

    #[test]
    fn configured_priority_overrides_default() {
        let mut priorities = HashMap::new();
        priorities.insert(Feature::WifiDirect, 500);
        let config = ServiceConfig {
            priorities,
            ..ServiceConfig::default()
        };
        assert_eq!(config.priority_for(Feature::WifiDirect), crate::arbiter::PRIORITY_MAX);
        assert_eq!(config.priority_for(Feature::Tethering), 50);
    }
}
