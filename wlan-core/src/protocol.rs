//! Bridge protocol: messages exchanged with the process that fronts the kernel radio
//! interface, the supplicant and the network helper.

use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityMessage, PhyIndex};
use crate::control::{
    ApConfig, CallToken, DeviceHandle, DownstreamNetwork, GroupAttachment, GroupConfig,
    GroupCredentials, NetworkRequest, PeerProperties,
};
use crate::device::{DeviceEvent, Feature};
use crate::role::InterfaceRole;
use crate::service::SupplicantSignal;

/// Sent in `Hello`; the bridge drops the connection on mismatch.
pub const PROTOCOL_VERSION: u8 = 1;

/// Daemon to bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeRequest {
    Hello {
        protocol_version: u8,
    },
    /// Ask for a full capability dump of every radio.
    DumpCapabilities,
    CreateInterface {
        phy: PhyIndex,
        role: InterfaceRole,
        link: String,
    },
    RemoveInterface {
        link: String,
    },
    GroupAdd {
        link: String,
        config: GroupConfig,
    },
    PersistentGroupAdd {
        link: String,
        network_path: String,
        credentials: GroupCredentials,
    },
    PersistentGroupRemove {
        link: String,
        network_path: String,
    },
    GroupJoin {
        link: String,
        network_path: String,
    },
    Disconnect {
        link: String,
    },
    DetachGroup {
        interface_path: String,
    },
    StartAccessPoint {
        link: String,
        config: ApConfig,
    },
    StopAccessPoint {
        link: String,
    },
    CreateNetwork {
        request: NetworkRequest,
        token: CallToken,
    },
    RequestClientNetwork {
        link: String,
        token: CallToken,
    },
    StopNetwork {
        link: String,
    },
    /// Device lifecycle event for the device's owner.
    DeviceEvent {
        handle: DeviceHandle,
        owner: Feature,
        event: DeviceEvent,
    },
    /// Result of a `BridgeMessage::Command`.
    Outcome {
        id: u64,
        result: Result<CommandReply, String>,
    },
}

/// Bridge to daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeMessage {
    Capability(CapabilityMessage),
    Signal {
        link: String,
        signal: SupplicantSignal,
    },
    /// Group proxies are bound; always precedes the matching `GroupStarted` signal.
    GroupAttached {
        interface_path: String,
        group_path: String,
        attachment: GroupAttachment,
    },
    PeerInfo {
        peer_path: String,
        properties: PeerProperties,
    },
    /// The lease itself is collected from the helper's lease socket.
    NetworkStarted {
        token: CallToken,
        network: Option<DownstreamNetwork>,
    },
    ConnectionUpdated {
        token: CallToken,
        ifindex: u32,
    },
    NetworkStopped {
        link: String,
        ifindex: u32,
        is_failure: bool,
    },
    UpstreamChanged {
        available: bool,
    },
    /// A bridge-side request for `link` failed after it was accepted.
    RequestFailed {
        link: String,
        reason: String,
    },
    Command {
        id: u64,
        command: Command,
    },
}

/// Feature-level commands from the daemon's clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    RequestDevice {
        owner: Feature,
        role: InterfaceRole,
        phy: Option<PhyIndex>,
        queue: bool,
    },
    CancelRequest {
        ticket: u64,
    },
    StopDevice {
        handle: DeviceHandle,
    },
    CreateGroup {
        handle: DeviceHandle,
        config: GroupConfig,
    },
    Connect {
        handle: DeviceHandle,
        credentials: GroupCredentials,
    },
    RemoveGroup {
        handle: DeviceHandle,
    },
    Disconnect {
        handle: DeviceHandle,
    },
    StartAccessPoint {
        handle: DeviceHandle,
        config: ApConfig,
    },
    StopAccessPoint {
        handle: DeviceHandle,
    },
    SupportsConcurrency {
        phy: PhyIndex,
        roles: Vec<InterfaceRole>,
    },
    /// Reserve a slot for an interface managed by the bridge itself (e.g. station).
    RegisterExternal {
        owner: Feature,
        role: InterfaceRole,
        phy: Option<PhyIndex>,
    },
    ReleaseExternal {
        phy: PhyIndex,
        interface: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandReply {
    Started(DeviceHandle),
    Queued(u64),
    /// Whether the operation was accepted by the device.
    Accepted(bool),
    Channels(Option<u32>),
    /// A queued request completed later.
    Admitted { ticket: u64, handle: DeviceHandle },
    Registered { phy: PhyIndex, interface: u64 },
}
