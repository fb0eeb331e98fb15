//! Recording doubles for the supplicant, network helper and event sink.

use std::collections::HashSet;
use std::fs::File;

use crate::arbiter::InterfaceId;
use crate::capability::PhyIndex;
use crate::control::{
    ApConfig, CallToken, ControlError, DeviceHandle, EventSink, GroupAttachment, GroupConfig,
    GroupCredentials, GroupDescriptor, MacAddr, NetworkHelper, NetworkLease, NetworkRequest,
    PeerProperties, Ports, Supplicant,
};
use crate::device::{DeviceEvent, DeviceInfo, DeviceState, Feature, P2pState};
use crate::role::InterfaceRole;

pub const GROUP_IFINDEX: u32 = 7;
pub const GROUP_LINK: &str = "p2p-wlan0-0";
pub const GROUP_IFACE_PATH: &str = "/fi/w1/wpa_supplicant1/Interfaces/3";
pub const GROUP_PATH: &str = "/fi/w1/wpa_supplicant1/Groups/1";

#[derive(Debug, Default)]
pub struct FakeSupplicant {
    pub calls: Vec<String>,
    /// Method names that return an error.
    pub failing: HashSet<&'static str>,
    next_link: u32,
}

impl FakeSupplicant {
    pub fn fail(&mut self, method: &'static str) {
        self.failing.insert(method);
    }

    pub fn called(&self, method: &str) -> usize {
        self.calls.iter().filter(|c| c.starts_with(method)).count()
    }

    fn record(&mut self, method: &'static str, arg: &str) -> Result<(), ControlError> {
        self.calls.push(format!("{} {}", method, arg));
        if self.failing.contains(method) {
            return Err(ControlError::Rejected(method.to_string()));
        }
        Ok(())
    }
}

pub fn attachment() -> GroupAttachment {
    GroupAttachment {
        link_name: GROUP_LINK.to_string(),
        ifindex: GROUP_IFINDEX,
        group: GroupDescriptor {
            ssid: "DIRECT-xy-test".to_string(),
            passphrase: "secretpass".to_string(),
            frequency_mhz: 2437,
            bssid: MacAddr([0x02, 0, 0, 0, 0, 1]),
        },
    }
}

impl Supplicant for FakeSupplicant {
    fn create_interface(
        &mut self,
        phy: PhyIndex,
        role: InterfaceRole,
    ) -> Result<String, ControlError> {
        self.record("create_interface", &format!("phy{} {}", phy, role))?;
        self.next_link += 1;
        Ok(format!("wlan{}-{}", phy, self.next_link))
    }

    fn remove_interface(&mut self, link: &str) -> Result<(), ControlError> {
        self.record("remove_interface", link)
    }

    fn group_add(&mut self, link: &str, _config: &GroupConfig) -> Result<(), ControlError> {
        self.record("group_add", link)
    }

    fn persistent_group_add(
        &mut self,
        link: &str,
        credentials: &GroupCredentials,
    ) -> Result<String, ControlError> {
        self.record("persistent_group_add", link)?;
        Ok(format!("/networks/{}", credentials.ssid))
    }

    fn persistent_group_remove(
        &mut self,
        _link: &str,
        network_path: &str,
    ) -> Result<(), ControlError> {
        self.record("persistent_group_remove", network_path)
    }

    fn group_join(&mut self, _link: &str, network_path: &str) -> Result<(), ControlError> {
        self.record("group_join", network_path)
    }

    fn disconnect(&mut self, link: &str) -> Result<(), ControlError> {
        self.record("disconnect", link)
    }

    fn attach_group(
        &mut self,
        interface_path: &str,
        _group_path: &str,
    ) -> Result<GroupAttachment, ControlError> {
        self.record("attach_group", interface_path)?;
        Ok(attachment())
    }

    fn detach_group(&mut self, interface_path: &str) {
        let _ = self.record("detach_group", interface_path);
    }

    fn peer_properties(&mut self, peer_path: &str) -> Result<PeerProperties, ControlError> {
        self.record("peer_properties", peer_path)?;
        Ok(PeerProperties {
            device_address: Some(MacAddr([0x02, 0, 0, 0, 0, 9])),
            device_name: format!("peer {}", peer_path),
        })
    }

    fn start_access_point(&mut self, link: &str, _config: &ApConfig) -> Result<(), ControlError> {
        self.record("start_access_point", link)
    }

    fn stop_access_point(&mut self, link: &str) -> Result<(), ControlError> {
        self.record("stop_access_point", link)
    }
}

#[derive(Debug, Default)]
pub struct FakeHelper {
    pub requests: Vec<(String, CallToken)>,
    pub stopped: Vec<String>,
    pub failing: bool,
}

impl NetworkHelper for FakeHelper {
    fn create_network(
        &mut self,
        request: &NetworkRequest,
        token: CallToken,
    ) -> Result<(), ControlError> {
        if self.failing {
            return Err(ControlError::Unavailable);
        }
        self.requests.push((request.downstream.clone(), token));
        Ok(())
    }

    fn request_client_network(
        &mut self,
        link: &str,
        token: CallToken,
    ) -> Result<(), ControlError> {
        if self.failing {
            return Err(ControlError::Unavailable);
        }
        self.requests.push((link.to_string(), token));
        Ok(())
    }

    fn stop_network(&mut self, link: &str) {
        self.stopped.push(link.to_string());
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<(DeviceEvent, DeviceHandle, DeviceState)>,
}

impl RecordingSink {
    pub fn count(&self, f: impl Fn(&DeviceEvent) -> bool) -> usize {
        self.events.iter().filter(|(e, _, _)| f(e)).count()
    }

    pub fn kinds(&self) -> Vec<DeviceEvent> {
        self.events.iter().map(|(e, _, _)| e.clone()).collect()
    }
}

impl EventSink for RecordingSink {
    fn on_event(&mut self, event: DeviceEvent, device: &DeviceInfo) {
        self.events.push((event, device.handle, device.state));
    }
}

#[derive(Debug, Default)]
pub struct Harness {
    pub supplicant: FakeSupplicant,
    pub helper: FakeHelper,
    pub sink: RecordingSink,
}

impl Harness {
    pub fn ports(&mut self) -> Ports<'_> {
        Ports {
            supplicant: &mut self.supplicant,
            helper: &mut self.helper,
            sink: &mut self.sink,
        }
    }
}

pub fn device_info(role: InterfaceRole) -> DeviceInfo {
    DeviceInfo {
        handle: DeviceHandle(1),
        link: "p2p-dev-wlan0".to_string(),
        phy: 0,
        interface: InterfaceId(1),
        role,
        priority: 30,
        owner: Feature::WifiDirect,
        state: DeviceState::P2p(P2pState::Uninitialized),
    }
}

/// A valid descriptor the device can hold on to.
pub fn lease() -> NetworkLease {
    NetworkLease::new(File::open("/dev/null").expect("open /dev/null").into())
}
