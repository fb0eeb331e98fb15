//! Local devices: one per live interface role. Each kind is its own state machine; they
//! share identity, priority and the upward event contract.

pub mod hotspot;
pub mod p2p;
pub mod peer;

use serde::{Deserialize, Serialize};

use crate::arbiter::{InterfaceId, Priority};
use crate::capability::PhyIndex;
use crate::control::{DeviceHandle, Ports};
use crate::role::InterfaceRole;

pub use hotspot::{HotspotDevice, HotspotState};
pub use p2p::{P2pDevice, P2pState};
pub use peer::{Peer, PeerTable};

/// Role-agnostic lifecycle events reported to a device's owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    InterfaceEnabled,
    InterfaceDisabled,
    LinkUp,
    LinkDown,
    LinkFailure,
    NetworkUp,
    NetworkDown,
    NetworkFailure,
    PeerConnected(String),
    PeerDisconnected(String),
    ServiceUp,
    ServiceDown,
}

/// Feature that owns a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    Station,
    Tethering,
    LocalOnlyHotspot,
    WifiDirect,
    Other(u32),
}

impl Feature {
    pub fn default_priority(self) -> Priority {
        match self {
            Feature::Station => 60,
            Feature::Tethering => 50,
            Feature::LocalOnlyHotspot => 40,
            Feature::WifiDirect => 30,
            Feature::Other(_) => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    P2p(P2pState),
    Hotspot(HotspotState),
}

/// Identity shared by every device kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub handle: DeviceHandle,
    /// Control interface created for this device.
    pub link: String,
    pub phy: PhyIndex,
    pub interface: InterfaceId,
    pub role: InterfaceRole,
    pub priority: Priority,
    pub owner: Feature,
    pub state: DeviceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("role {0} has no device implementation")]
    UnsupportedRole(InterfaceRole),
}

/// Device kinds, selected at construction.
#[derive(Debug)]
pub enum Device {
    P2p(P2pDevice),
    Hotspot(HotspotDevice),
}

impl Device {
    /// Roles that have a device kind. Interfaces of other roles are managed elsewhere.
    pub fn supports_role(role: InterfaceRole) -> bool {
        matches!(
            role,
            InterfaceRole::P2pGroupOwner | InterfaceRole::P2pClient | InterfaceRole::AccessPoint
        )
    }

    pub fn new(info: DeviceInfo) -> Result<Self, DeviceError> {
        match info.role {
            InterfaceRole::P2pGroupOwner | InterfaceRole::P2pClient => {
                Ok(Device::P2p(P2pDevice::new(info)?))
            }
            InterfaceRole::AccessPoint => Ok(Device::Hotspot(HotspotDevice::new(info))),
            other => Err(DeviceError::UnsupportedRole(other)),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        match self {
            Device::P2p(d) => d.info(),
            Device::Hotspot(d) => d.info(),
        }
    }

    pub fn start(&mut self, ports: &mut Ports<'_>) -> bool {
        match self {
            Device::P2p(d) => d.start(ports),
            Device::Hotspot(d) => d.start(ports),
        }
    }

    pub fn stop(&mut self, ports: &mut Ports<'_>) -> bool {
        match self {
            Device::P2p(d) => d.stop(ports),
            Device::Hotspot(d) => d.stop(ports),
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            Device::P2p(d) => d.generation(),
            Device::Hotspot(d) => d.generation(),
        }
    }

    pub fn as_p2p_mut(&mut self) -> Option<&mut P2pDevice> {
        match self {
            Device::P2p(d) => Some(d),
            Device::Hotspot(_) => None,
        }
    }

    pub fn as_hotspot_mut(&mut self) -> Option<&mut HotspotDevice> {
        match self {
            Device::Hotspot(d) => Some(d),
            Device::P2p(_) => None,
        }
    }
}
