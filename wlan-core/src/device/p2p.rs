//! Wi-Fi-Direct local device, acting either as group owner or as client.
//!
//! The supplicant gives no correlation id beyond the device's current state, so every
//! signal is checked against the state that would have produced it. Helper completions
//! and timers additionally carry a `CallToken`; a generation mismatch marks them stale.

use std::fmt;

use tracing::{debug, info, warn};

use crate::control::{
    CallToken, DownstreamNetwork, GroupAttachment, GroupConfig, GroupCredentials,
    GroupDescriptor, NetworkLease, NetworkRequest, PeerProperties, Ports,
};
use crate::device::{DeviceError, DeviceEvent, DeviceInfo, DeviceState, PeerTable};
use crate::role::InterfaceRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2pState {
    Uninitialized,
    Ready,
    GoStarting,
    GoConfiguring,
    GoActive,
    GoStopping,
    ClientAssociating,
    ClientConfiguring,
    ClientConnected,
    ClientDisconnecting,
}

impl P2pState {
    /// Waiting for the supplicant to report the group as started.
    pub fn is_forming(self) -> bool {
        matches!(self, P2pState::GoStarting | P2pState::ClientAssociating)
    }

    /// Link is up, network not (yet) usable.
    pub fn is_configuring(self) -> bool {
        matches!(self, P2pState::GoConfiguring | P2pState::ClientConfiguring)
    }

    pub fn is_established(self) -> bool {
        matches!(self, P2pState::GoActive | P2pState::ClientConnected)
    }

    pub fn is_leaving(self) -> bool {
        matches!(self, P2pState::GoStopping | P2pState::ClientDisconnecting)
    }

    fn has_attempt(self) -> bool {
        self.is_forming() || self.is_configuring() || self.is_established()
    }
}

impl fmt::Display for P2pState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
struct Group {
    interface_path: String,
    group_path: String,
    attachment: GroupAttachment,
}

#[derive(Debug)]
pub struct P2pDevice {
    info: DeviceInfo,
    group_owner: bool,
    state: P2pState,
    generation: u64,
    group: Option<Group>,
    persistent_network: Option<String>,
    lease: Option<NetworkLease>,
    network: Option<DownstreamNetwork>,
    peers: PeerTable,
    leave_requested: bool,
    supplicant_state: Option<String>,
}

impl P2pDevice {
    pub fn new(mut info: DeviceInfo) -> Result<Self, DeviceError> {
        let group_owner = match info.role {
            InterfaceRole::P2pGroupOwner => true,
            InterfaceRole::P2pClient => false,
            other => return Err(DeviceError::UnsupportedRole(other)),
        };
        info.state = DeviceState::P2p(P2pState::Uninitialized);
        Ok(Self {
            info,
            group_owner,
            state: P2pState::Uninitialized,
            generation: 0,
            group: None,
            persistent_network: None,
            lease: None,
            network: None,
            peers: PeerTable::new(),
            leave_requested: false,
            supplicant_state: None,
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn state(&self) -> P2pState {
        self.state
    }

    pub fn is_group_owner(&self) -> bool {
        self.group_owner
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Token for requests issued by the current attempt.
    pub fn token(&self) -> CallToken {
        CallToken {
            handle: self.info.handle,
            generation: self.generation,
        }
    }

    pub fn group(&self) -> Option<&GroupDescriptor> {
        self.group.as_ref().map(|g| &g.attachment.group)
    }

    pub fn group_link(&self) -> Option<&str> {
        self.group.as_ref().map(|g| g.attachment.link_name.as_str())
    }

    pub fn network(&self) -> Option<&DownstreamNetwork> {
        self.network.as_ref()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn supplicant_state(&self) -> Option<&str> {
        self.supplicant_state.as_deref()
    }

    fn set_state(&mut self, next: P2pState) {
        debug!(device = %self.info.handle, from = %self.state, to = %next, "p2p state");
        self.state = next;
        self.info.state = DeviceState::P2p(next);
    }

    fn emit(&self, ports: &mut Ports<'_>, event: DeviceEvent) {
        ports.sink.on_event(event, &self.info);
    }

    pub fn start(&mut self, ports: &mut Ports<'_>) -> bool {
        if self.state != P2pState::Uninitialized {
            debug!(device = %self.info.handle, state = %self.state, "start ignored");
            return false;
        }
        self.set_state(P2pState::Ready);
        self.emit(ports, DeviceEvent::InterfaceEnabled);
        true
    }

    /// Tear down any group or connection and return to Uninitialized.
    pub fn stop(&mut self, ports: &mut Ports<'_>) -> bool {
        if self.state == P2pState::Uninitialized {
            return false;
        }
        if self.state.has_attempt() {
            if let Err(e) = ports.supplicant.disconnect(&self.info.link) {
                warn!(device = %self.info.handle, error = %e, "disconnect on stop failed");
            }
        }
        self.release_group(ports, DeviceEvent::LinkDown);
        self.generation += 1;
        self.set_state(P2pState::Uninitialized);
        self.emit(ports, DeviceEvent::InterfaceDisabled);
        true
    }

    pub fn create_group(&mut self, ports: &mut Ports<'_>, config: &GroupConfig) -> bool {
        if !self.group_owner || self.state != P2pState::Ready {
            debug!(device = %self.info.handle, state = %self.state, "create_group ignored");
            return false;
        }
        if let Err(e) = ports.supplicant.group_add(&self.info.link, config) {
            warn!(device = %self.info.handle, error = %e, "group add failed");
            return false;
        }
        self.generation += 1;
        self.set_state(P2pState::GoStarting);
        true
    }

    pub fn connect(&mut self, ports: &mut Ports<'_>, credentials: &GroupCredentials) -> bool {
        if self.group_owner || self.state != P2pState::Ready {
            debug!(device = %self.info.handle, state = %self.state, "connect ignored");
            return false;
        }
        let link = self.info.link.clone();
        let network_path = match ports.supplicant.persistent_group_add(&link, credentials) {
            Ok(path) => path,
            Err(e) => {
                warn!(device = %self.info.handle, error = %e, "persistent group add failed");
                return false;
            }
        };
        if let Err(e) = ports.supplicant.group_join(&link, &network_path) {
            warn!(device = %self.info.handle, error = %e, "group join failed");
            if let Err(e) = ports.supplicant.persistent_group_remove(&link, &network_path) {
                debug!(device = %self.info.handle, error = %e, "persistent group cleanup failed");
            }
            return false;
        }
        self.persistent_network = Some(network_path);
        self.generation += 1;
        self.set_state(P2pState::ClientAssociating);
        true
    }

    pub fn remove_group(&mut self, ports: &mut Ports<'_>) -> bool {
        if !self.group_owner {
            return false;
        }
        self.leave(ports)
    }

    pub fn disconnect(&mut self, ports: &mut Ports<'_>) -> bool {
        if self.group_owner {
            return false;
        }
        self.leave(ports)
    }

    fn leave(&mut self, ports: &mut Ports<'_>) -> bool {
        if !self.state.has_attempt() {
            debug!(device = %self.info.handle, state = %self.state, "no group to leave");
            return false;
        }
        if let Err(e) = ports.supplicant.disconnect(&self.info.link) {
            warn!(device = %self.info.handle, error = %e, "disconnect failed");
            return false;
        }
        self.leave_requested = true;
        self.generation += 1;
        self.set_state(self.leaving_state());
        true
    }

    fn leaving_state(&self) -> P2pState {
        if self.group_owner {
            P2pState::GoStopping
        } else {
            P2pState::ClientDisconnecting
        }
    }

    pub fn on_group_started(
        &mut self,
        ports: &mut Ports<'_>,
        interface_path: &str,
        group_path: &str,
    ) -> bool {
        if !self.state.is_forming() {
            debug!(
                device = %self.info.handle,
                state = %self.state,
                group = group_path,
                "unexpected group start ignored"
            );
            return false;
        }
        let attachment = match ports.supplicant.attach_group(interface_path, group_path) {
            Ok(a) => a,
            Err(e) => {
                warn!(device = %self.info.handle, error = %e, "could not attach to started group");
                self.emit(ports, DeviceEvent::LinkFailure);
                if let Err(e) = ports.supplicant.disconnect(&self.info.link) {
                    debug!(device = %self.info.handle, error = %e, "disconnect after attach failure");
                }
                self.leave_requested = true;
                self.set_state(self.leaving_state());
                return true;
            }
        };
        info!(
            device = %self.info.handle,
            link = %attachment.link_name,
            ssid = %attachment.group.ssid,
            freq = attachment.group.frequency_mhz,
            "group started"
        );
        let group_link = attachment.link_name.clone();
        self.group = Some(Group {
            interface_path: interface_path.to_string(),
            group_path: group_path.to_string(),
            attachment,
        });
        self.set_state(if self.group_owner {
            P2pState::GoConfiguring
        } else {
            P2pState::ClientConfiguring
        });
        self.emit(ports, DeviceEvent::LinkUp);

        let token = self.token();
        let requested = if self.group_owner {
            let request = NetworkRequest {
                downstream: group_link,
                upstream: None,
            };
            ports.helper.create_network(&request, token)
        } else {
            ports.helper.request_client_network(&group_link, token)
        };
        if let Err(e) = requested {
            warn!(device = %self.info.handle, error = %e, "network request failed");
            self.emit(ports, DeviceEvent::NetworkFailure);
        }
        true
    }

    /// Group-owner network is up. A missing lease or descriptor is a failure; the link stays.
    pub fn on_group_network_started(
        &mut self,
        ports: &mut Ports<'_>,
        token: CallToken,
        lease: Option<NetworkLease>,
        network: Option<DownstreamNetwork>,
    ) -> bool {
        if !self.group_owner || !self.accepts(token, P2pState::GoConfiguring) {
            return false;
        }
        match (lease, network) {
            (Some(lease), Some(network)) => {
                info!(device = %self.info.handle, network = network.network_id, "group network up");
                self.lease = Some(lease);
                self.network = Some(network);
                self.set_state(P2pState::GoActive);
                self.emit(ports, DeviceEvent::NetworkUp);
            }
            _ => {
                warn!(device = %self.info.handle, "group network started without a valid descriptor");
                self.emit(ports, DeviceEvent::NetworkFailure);
            }
        }
        true
    }

    /// Client addressing finished on `ifindex`; zero means the helper gave up.
    pub fn on_connection_updated(
        &mut self,
        ports: &mut Ports<'_>,
        token: CallToken,
        ifindex: u32,
    ) -> bool {
        if self.group_owner || !self.accepts(token, P2pState::ClientConfiguring) {
            return false;
        }
        let Some(group) = &self.group else {
            return false;
        };
        if ifindex == 0 {
            warn!(device = %self.info.handle, "client network failed");
            self.emit(ports, DeviceEvent::NetworkFailure);
            return true;
        }
        if ifindex != group.attachment.ifindex {
            debug!(device = %self.info.handle, ifindex, "connection update for another interface");
            return false;
        }
        self.network = Some(DownstreamNetwork {
            network_id: u64::from(ifindex),
            interface: group.attachment.link_name.clone(),
        });
        self.set_state(P2pState::ClientConnected);
        self.emit(ports, DeviceEvent::NetworkUp);
        true
    }

    fn accepts(&self, token: CallToken, expected: P2pState) -> bool {
        if token.handle != self.info.handle || token.generation != self.generation {
            debug!(
                device = %self.info.handle,
                generation = self.generation,
                stale = token.generation,
                "stale completion ignored"
            );
            return false;
        }
        if self.state != expected {
            debug!(device = %self.info.handle, state = %self.state, "unexpected completion ignored");
            return false;
        }
        true
    }

    pub fn on_group_finished(
        &mut self,
        ports: &mut Ports<'_>,
        interface_path: &str,
        group_path: &str,
    ) -> bool {
        if self.state.is_forming() {
            // Cannot tell a late finish of an older group from a failure of this one.
            debug!(device = %self.info.handle, state = %self.state, "group finished before start ignored");
            return false;
        }
        if !(self.state.is_configuring() || self.state.is_established() || self.state.is_leaving())
        {
            debug!(device = %self.info.handle, state = %self.state, "unexpected group finish ignored");
            return false;
        }
        if let Some(group) = &self.group {
            if group.group_path != group_path || group.interface_path != interface_path {
                debug!(device = %self.info.handle, group = group_path, "finish for unrelated group ignored");
                return false;
            }
        }
        let event = if self.leave_requested {
            DeviceEvent::LinkDown
        } else {
            warn!(device = %self.info.handle, state = %self.state, "group lost");
            DeviceEvent::LinkFailure
        };
        self.release_group(ports, event);
        self.set_state(P2pState::Ready);
        true
    }

    pub fn on_peer_joined(&mut self, ports: &mut Ports<'_>, peer_path: &str) -> bool {
        if !self.owns_active_network() {
            debug!(device = %self.info.handle, peer = peer_path, "peer join ignored");
            return false;
        }
        if self.peers.contains(peer_path) {
            return false;
        }
        let props = ports
            .supplicant
            .peer_properties(peer_path)
            .unwrap_or_else(|e| {
                debug!(peer = peer_path, error = %e, "peer properties unavailable");
                PeerProperties::default()
            });
        self.peers.insert(peer_path, props);
        self.emit(ports, DeviceEvent::PeerConnected(peer_path.to_string()));
        true
    }

    pub fn on_peer_disconnected(&mut self, ports: &mut Ports<'_>, peer_path: &str) -> bool {
        if !self.owns_active_network() {
            debug!(device = %self.info.handle, peer = peer_path, "peer disconnect ignored");
            return false;
        }
        match self.peers.remove(peer_path) {
            Some(peer) => {
                self.emit(ports, DeviceEvent::PeerDisconnected(peer.path));
                true
            }
            None => false,
        }
    }

    fn owns_active_network(&self) -> bool {
        self.group_owner && self.state == P2pState::GoActive && self.network.is_some()
    }

    /// Downstream network on the group interface stopped. Never touches the link.
    pub fn on_network_stopped(
        &mut self,
        ports: &mut Ports<'_>,
        ifindex: u32,
        is_failure: bool,
    ) -> bool {
        if self.group.as_ref().map(|g| g.attachment.ifindex) != Some(ifindex) {
            return false;
        }
        if self.state.is_configuring() {
            if is_failure {
                self.emit(ports, DeviceEvent::NetworkFailure);
                return true;
            }
            return false;
        }
        if !self.state.is_established() {
            return false;
        }
        for peer in self.peers.drain() {
            self.emit(ports, DeviceEvent::PeerDisconnected(peer.path));
        }
        self.network = None;
        self.lease = None;
        self.set_state(if self.group_owner {
            P2pState::GoConfiguring
        } else {
            P2pState::ClientConfiguring
        });
        self.emit(
            ports,
            if is_failure {
                DeviceEvent::NetworkFailure
            } else {
                DeviceEvent::NetworkDown
            },
        );
        true
    }

    /// Formation or leave timer expired. Abandons an attempt that never produced a group,
    /// and finishes a leave whose GroupFinished never arrived.
    pub fn on_formation_timeout(&mut self, ports: &mut Ports<'_>, token: CallToken) -> bool {
        if token.handle != self.info.handle || token.generation != self.generation {
            return false;
        }
        if self.state.is_forming() {
            warn!(device = %self.info.handle, state = %self.state, "group formation timed out");
            if let Err(e) = ports.supplicant.disconnect(&self.info.link) {
                debug!(device = %self.info.handle, error = %e, "disconnect after timeout failed");
            }
            self.abandon(ports, DeviceEvent::LinkFailure);
            return true;
        }
        if self.state.is_leaving() {
            warn!(device = %self.info.handle, state = %self.state, "group teardown timed out");
            self.abandon(ports, DeviceEvent::LinkDown);
            return true;
        }
        false
    }

    /// The supplicant rejected a request it had accepted: a group add, a join or a leave.
    pub fn on_control_failure(&mut self, ports: &mut Ports<'_>) -> bool {
        if !(self.state.is_forming() || self.state.is_leaving()) {
            debug!(device = %self.info.handle, state = %self.state, "control failure ignored");
            return false;
        }
        warn!(device = %self.info.handle, state = %self.state, "group request failed");
        self.abandon(ports, DeviceEvent::LinkFailure);
        true
    }

    /// Drop the group and return to Ready. A forming attempt has no link yet and always
    /// reports LinkFailure; otherwise `link_event` closes the link if one is up.
    fn abandon(&mut self, ports: &mut Ports<'_>, link_event: DeviceEvent) {
        let forming = self.state.is_forming();
        self.release_group(ports, link_event);
        self.generation += 1;
        self.set_state(P2pState::Ready);
        if forming {
            self.emit(ports, DeviceEvent::LinkFailure);
        }
    }

    pub fn on_interface_state_changed(&mut self, state: &str) {
        debug!(device = %self.info.handle, supplicant_state = state, "interface state");
        self.supplicant_state = Some(state.to_string());
    }

    fn release_group(&mut self, ports: &mut Ports<'_>, link_event: DeviceEvent) {
        for peer in self.peers.drain() {
            self.emit(ports, DeviceEvent::PeerDisconnected(peer.path));
        }
        if self.network.take().is_some() {
            if let Some(link) = self.group_link() {
                let link = link.to_string();
                ports.helper.stop_network(&link);
            }
            self.emit(ports, DeviceEvent::NetworkDown);
        }
        self.lease = None;
        if let Some(group) = self.group.take() {
            ports.supplicant.detach_group(&group.interface_path);
            self.emit(ports, link_event);
        }
        if let Some(path) = self.persistent_network.take() {
            if let Err(e) = ports.supplicant.persistent_group_remove(&self.info.link, &path) {
                debug!(device = %self.info.handle, error = %e, "persistent group removal failed");
            }
        }
        self.leave_requested = false;
    }
}
