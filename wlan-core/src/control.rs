//! Seams to the external control processes: the supplicant (station/AP/P2P control daemon)
//! and the privileged network helper. Requests are dispatched synchronously and report
//! only whether they were accepted; completions come back later as service events.

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use serde::{Deserialize, Serialize};

use crate::capability::PhyIndex;
use crate::device::{DeviceEvent, DeviceInfo};
use crate::role::InterfaceRole;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("control process unavailable")]
    Unavailable,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("request timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Parameters of a group this device should own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub network_name: Option<String>,
    pub passphrase: Option<String>,
    pub frequency_mhz: Option<u32>,
    pub persistent: bool,
}

/// Credentials of an existing group to join as a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCredentials {
    pub ssid: String,
    pub passphrase: String,
    pub frequency_mhz: Option<u32>,
    pub bssid: Option<MacAddr>,
}

/// Learned once a group has actually started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub ssid: String,
    pub passphrase: String,
    pub frequency_mhz: u32,
    pub bssid: MacAddr,
}

/// Result of binding role-scoped supplicant proxies to a freshly started group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAttachment {
    /// Kernel name of the group interface, e.g. `p2p-wlan0-0`.
    pub link_name: String,
    pub ifindex: u32,
    pub group: GroupDescriptor,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProperties {
    pub device_address: Option<MacAddr>,
    pub device_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApConfig {
    pub ssid: String,
    pub passphrase: Option<String>,
    pub frequency_mhz: Option<u32>,
    pub hidden: bool,
}

/// Network the helper set up behind a downstream interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamNetwork {
    pub network_id: u64,
    pub interface: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub downstream: String,
    /// None requests a local-only network.
    pub upstream: Option<String>,
}

/// File descriptor that keeps a helper-created network alive. Dropping it tears the
/// network down.
#[derive(Debug)]
pub struct NetworkLease(OwnedFd);

impl NetworkLease {
    pub fn new(fd: OwnedFd) -> Self {
        Self(fd)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Identifies the device and attempt that issued an asynchronous request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallToken {
    pub handle: DeviceHandle,
    pub generation: u64,
}

/// Service-level key of a live device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle(pub u64);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

pub trait Supplicant {
    /// Create the control interface for a role on a radio; returns its link name.
    fn create_interface(&mut self, phy: PhyIndex, role: InterfaceRole)
        -> Result<String, ControlError>;
    fn remove_interface(&mut self, link: &str) -> Result<(), ControlError>;
    fn group_add(&mut self, link: &str, config: &GroupConfig) -> Result<(), ControlError>;
    /// Store credentials as a persistent network; returns the network object path.
    fn persistent_group_add(
        &mut self,
        link: &str,
        credentials: &GroupCredentials,
    ) -> Result<String, ControlError>;
    fn persistent_group_remove(&mut self, link: &str, network_path: &str)
        -> Result<(), ControlError>;
    fn group_join(&mut self, link: &str, network_path: &str) -> Result<(), ControlError>;
    fn disconnect(&mut self, link: &str) -> Result<(), ControlError>;
    /// Bind group- and interface-scoped proxies to a started group.
    fn attach_group(
        &mut self,
        interface_path: &str,
        group_path: &str,
    ) -> Result<GroupAttachment, ControlError>;
    fn detach_group(&mut self, interface_path: &str);
    fn peer_properties(&mut self, peer_path: &str) -> Result<PeerProperties, ControlError>;
    fn start_access_point(&mut self, link: &str, config: &ApConfig) -> Result<(), ControlError>;
    fn stop_access_point(&mut self, link: &str) -> Result<(), ControlError>;
}

pub trait NetworkHelper {
    /// Tethered when `request.upstream` is set, local-only otherwise. Completion arrives
    /// as a network-started event carrying `token`.
    fn create_network(&mut self, request: &NetworkRequest, token: CallToken)
        -> Result<(), ControlError>;
    /// Ask for client-side addressing on a joined group. Completion arrives as a
    /// connection-updated event carrying `token`.
    fn request_client_network(&mut self, link: &str, token: CallToken)
        -> Result<(), ControlError>;
    fn stop_network(&mut self, link: &str);
}

/// Upward callback; every device has exactly one owner.
pub trait EventSink {
    fn on_event(&mut self, event: DeviceEvent, device: &DeviceInfo);
}

/// Everything a device may touch while handling one operation or signal.
pub struct Ports<'a> {
    pub supplicant: &'a mut dyn Supplicant,
    pub helper: &'a mut dyn NetworkHelper,
    pub sink: &'a mut dyn EventSink,
}
