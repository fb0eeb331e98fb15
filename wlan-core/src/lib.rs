//! Wi-Fi radio-resource layer: decides which interface roles a radio may host at once
//! and drives the devices that consume those decisions.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod arbiter;
pub mod capability;
pub mod combination;
pub mod control;
pub mod device;
pub mod fleet;
pub mod protocol;
pub mod role;
pub mod service;
pub mod wire;

#[cfg(test)]
mod testing;

pub use arbiter::{ActiveInterface, AllocationError, Arbiter, CommitError, Grant, InterfaceId, Priority};
pub use capability::{CapabilityAssembler, CapabilityMessage, PhyCapabilities, PhyIndex};
pub use combination::{CombinationSet, ConcurrencyCombination, InterfaceRoleLimit};
pub use control::{
    CallToken, ControlError, DeviceHandle, EventSink, NetworkHelper, NetworkLease, Ports, Supplicant,
};
pub use device::{Device, DeviceEvent, DeviceInfo, Feature, HotspotDevice, P2pDevice};
pub use fleet::{Fleet, RequestTicket};
pub use protocol::{BridgeMessage, BridgeRequest, Command, CommandReply, PROTOCOL_VERSION};
pub use role::{InterfaceRole, RoleSet};
pub use service::{
    Admission, ExternalInterface, FeatureRequest, HostAction, RadioService, ServiceConfig,
    ServiceError, ServiceEvent, SupplicantSignal,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
