//! Access-point device for tethering and local-only hotspots.

use std::fmt;

use tracing::{debug, info, warn};

use crate::control::{ApConfig, CallToken, DownstreamNetwork, NetworkLease, NetworkRequest, Ports};
use crate::device::{DeviceEvent, DeviceInfo, DeviceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotspotState {
    /// Interface exists but the device has not been started.
    Disabled,
    Idle,
    Starting,
    Configuring,
    Active,
    Stopping,
}

impl fmt::Display for HotspotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub struct HotspotDevice {
    info: DeviceInfo,
    state: HotspotState,
    generation: u64,
    upstream: Option<String>,
    upstream_available: Option<bool>,
    lease: Option<NetworkLease>,
    network: Option<DownstreamNetwork>,
    station_count: u32,
    stop_requested: bool,
    /// LinkUp was reported and no link event has closed it yet.
    link_up: bool,
}

impl HotspotDevice {
    pub fn new(mut info: DeviceInfo) -> Self {
        info.state = DeviceState::Hotspot(HotspotState::Disabled);
        Self {
            info,
            state: HotspotState::Disabled,
            generation: 0,
            upstream: None,
            upstream_available: None,
            lease: None,
            network: None,
            station_count: 0,
            stop_requested: false,
            link_up: false,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn state(&self) -> HotspotState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> CallToken {
        CallToken {
            handle: self.info.handle,
            generation: self.generation,
        }
    }

    pub fn station_count(&self) -> u32 {
        self.station_count
    }

    pub fn network(&self) -> Option<&DownstreamNetwork> {
        self.network.as_ref()
    }

    /// Local-only when no upstream was given at start.
    pub fn is_tethered(&self) -> bool {
        self.upstream.is_some()
    }

    fn set_state(&mut self, next: HotspotState) {
        debug!(device = %self.info.handle, from = %self.state, to = %next, "hotspot state");
        self.state = next;
        self.info.state = DeviceState::Hotspot(next);
    }

    fn emit(&self, ports: &mut Ports<'_>, event: DeviceEvent) {
        ports.sink.on_event(event, &self.info);
    }

    pub fn start(&mut self, ports: &mut Ports<'_>) -> bool {
        if self.state != HotspotState::Disabled {
            return false;
        }
        self.set_state(HotspotState::Idle);
        self.emit(ports, DeviceEvent::InterfaceEnabled);
        true
    }

    pub fn stop(&mut self, ports: &mut Ports<'_>) -> bool {
        if self.state == HotspotState::Disabled {
            return false;
        }
        if self.state != HotspotState::Idle {
            if let Err(e) = ports.supplicant.stop_access_point(&self.info.link) {
                warn!(device = %self.info.handle, error = %e, "access point stop failed");
            }
            self.release_network(ports, DeviceEvent::NetworkDown);
            self.close_link(ports, DeviceEvent::LinkDown);
        }
        self.generation += 1;
        self.stop_requested = false;
        self.set_state(HotspotState::Disabled);
        self.emit(ports, DeviceEvent::InterfaceDisabled);
        true
    }

    pub fn start_access_point(
        &mut self,
        ports: &mut Ports<'_>,
        config: &ApConfig,
        upstream: Option<String>,
    ) -> bool {
        if self.state != HotspotState::Idle {
            debug!(device = %self.info.handle, state = %self.state, "start_access_point ignored");
            return false;
        }
        if let Err(e) = ports.supplicant.start_access_point(&self.info.link, config) {
            warn!(device = %self.info.handle, error = %e, "access point start failed");
            return false;
        }
        info!(device = %self.info.handle, ssid = %config.ssid, tethered = upstream.is_some(), "starting access point");
        self.upstream = upstream;
        self.upstream_available = None;
        self.generation += 1;
        self.set_state(HotspotState::Starting);
        true
    }

    pub fn on_access_point_enabled(&mut self, ports: &mut Ports<'_>) -> bool {
        if self.state != HotspotState::Starting {
            debug!(device = %self.info.handle, state = %self.state, "unexpected ap enable ignored");
            return false;
        }
        self.set_state(HotspotState::Configuring);
        self.link_up = true;
        self.emit(ports, DeviceEvent::LinkUp);
        let request = NetworkRequest {
            downstream: self.info.link.clone(),
            upstream: self.upstream.clone(),
        };
        if let Err(e) = ports.helper.create_network(&request, self.token()) {
            warn!(device = %self.info.handle, error = %e, "network request failed");
            self.emit(ports, DeviceEvent::NetworkFailure);
        }
        true
    }

    pub fn on_tethered_network_started(
        &mut self,
        ports: &mut Ports<'_>,
        token: CallToken,
        lease: Option<NetworkLease>,
        network: Option<DownstreamNetwork>,
    ) -> bool {
        if token != self.token() {
            debug!(device = %self.info.handle, stale = token.generation, "stale completion ignored");
            return false;
        }
        if self.state != HotspotState::Configuring {
            return false;
        }
        match (lease, network) {
            (Some(lease), Some(network)) => {
                self.lease = Some(lease);
                self.network = Some(network);
                self.set_state(HotspotState::Active);
                self.emit(ports, DeviceEvent::NetworkUp);
                if self.upstream.is_some() {
                    self.upstream_available = Some(true);
                    self.emit(ports, DeviceEvent::ServiceUp);
                }
            }
            _ => {
                warn!(device = %self.info.handle, "tethered network without a valid descriptor");
                self.emit(ports, DeviceEvent::NetworkFailure);
            }
        }
        true
    }

    pub fn on_station_count(&mut self, count: u32) {
        if count != self.station_count {
            debug!(device = %self.info.handle, count, "station count");
        }
        self.station_count = count;
    }

    /// Upstream connectivity changed. Only reported for an active tethered network.
    pub fn on_upstream_changed(&mut self, ports: &mut Ports<'_>, available: bool) -> bool {
        if self.state != HotspotState::Active || self.upstream.is_none() {
            return false;
        }
        if self.upstream_available == Some(available) {
            return false;
        }
        self.upstream_available = Some(available);
        self.emit(
            ports,
            if available {
                DeviceEvent::ServiceUp
            } else {
                DeviceEvent::ServiceDown
            },
        );
        true
    }

    pub fn stop_access_point(&mut self, ports: &mut Ports<'_>) -> bool {
        if !matches!(
            self.state,
            HotspotState::Starting | HotspotState::Configuring | HotspotState::Active
        ) {
            return false;
        }
        if let Err(e) = ports.supplicant.stop_access_point(&self.info.link) {
            warn!(device = %self.info.handle, error = %e, "access point stop failed");
            return false;
        }
        self.stop_requested = true;
        self.generation += 1;
        self.set_state(HotspotState::Stopping);
        true
    }

    /// The access point went down. Before LinkUp this is a failed start, reported as
    /// LinkFailure unless a stop was requested.
    pub fn on_access_point_disabled(&mut self, ports: &mut Ports<'_>) -> bool {
        if matches!(self.state, HotspotState::Disabled | HotspotState::Idle) {
            return false;
        }
        if !self.stop_requested {
            warn!(device = %self.info.handle, state = %self.state, "access point lost");
        }
        self.reset(ports);
        true
    }

    /// The supplicant rejected a start or stop it had accepted.
    pub fn on_control_failure(&mut self, ports: &mut Ports<'_>) -> bool {
        if !matches!(self.state, HotspotState::Starting | HotspotState::Stopping) {
            debug!(device = %self.info.handle, state = %self.state, "control failure ignored");
            return false;
        }
        warn!(device = %self.info.handle, state = %self.state, "access point request failed");
        self.reset(ports);
        true
    }

    /// A start or stop did not complete in time.
    pub fn on_request_timeout(&mut self, ports: &mut Ports<'_>, token: CallToken) -> bool {
        if token != self.token() {
            return false;
        }
        match self.state {
            HotspotState::Starting => {
                warn!(device = %self.info.handle, "access point start timed out");
                if let Err(e) = ports.supplicant.stop_access_point(&self.info.link) {
                    debug!(device = %self.info.handle, error = %e, "stop after timeout failed");
                }
            }
            HotspotState::Stopping => {
                warn!(device = %self.info.handle, "access point stop timed out");
            }
            _ => return false,
        }
        self.reset(ports);
        true
    }

    /// Return to Idle from any started state, closing the network and the link.
    fn reset(&mut self, ports: &mut Ports<'_>) {
        let requested = self.stop_requested;
        self.release_network(ports, DeviceEvent::NetworkDown);
        let reported = self.close_link(
            ports,
            if requested {
                DeviceEvent::LinkDown
            } else {
                DeviceEvent::LinkFailure
            },
        );
        if !reported && !requested {
            self.emit(ports, DeviceEvent::LinkFailure);
        }
        self.generation += 1;
        self.stop_requested = false;
        self.station_count = 0;
        self.set_state(HotspotState::Idle);
    }

    /// Emit `event` if LinkUp is outstanding.
    fn close_link(&mut self, ports: &mut Ports<'_>, event: DeviceEvent) -> bool {
        if !std::mem::take(&mut self.link_up) {
            return false;
        }
        self.emit(ports, event);
        true
    }

    /// Helper-side network went away; the access point itself stays up.
    pub fn on_network_stopped(&mut self, ports: &mut Ports<'_>, is_failure: bool) -> bool {
        match self.state {
            HotspotState::Active => {
                let event = if is_failure {
                    DeviceEvent::NetworkFailure
                } else {
                    DeviceEvent::NetworkDown
                };
                self.network = None;
                self.lease = None;
                self.upstream_available = None;
                self.set_state(HotspotState::Configuring);
                self.emit(ports, event);
                true
            }
            HotspotState::Configuring if is_failure => {
                self.emit(ports, DeviceEvent::NetworkFailure);
                true
            }
            _ => false,
        }
    }

    fn release_network(&mut self, ports: &mut Ports<'_>, event: DeviceEvent) {
        self.lease = None;
        self.upstream_available = None;
        if self.network.take().is_some() {
            ports.helper.stop_network(&self.info.link);
            self.emit(ports, event);
        }
    }
}
