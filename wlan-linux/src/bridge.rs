//! Bridge connection: framed socket to the process fronting the kernel radio interface,
//! the supplicant and the network helper, plus the event loop that drives the service.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use wlan_core::capability::PhyIndex;
use wlan_core::control::{
    ApConfig, GroupAttachment, GroupConfig, GroupCredentials, NetworkRequest, PeerProperties,
};
use wlan_core::service::SupplicantSignal;
use wlan_core::wire::{decode_frame, encode_frame, FrameDecodeError};
use wlan_core::{
    Admission, BridgeMessage, BridgeRequest, CallToken, Command, CommandReply, ControlError,
    DeviceEvent, DeviceInfo, EventSink, FeatureRequest, HostAction, InterfaceId, InterfaceRole,
    NetworkHelper,
    NetworkLease, Ports, RadioService, RequestTicket, ServiceError, ServiceEvent, Supplicant,
    PROTOCOL_VERSION,
};

use crate::config::Config;

/// Everything the event loop reacts to.
#[derive(Debug)]
pub enum Inbound {
    Bridge(BridgeMessage),
    FormationTimeout(CallToken),
}

/// Supplicant seam over the bridge. Requests are fire-and-forget; values the service
/// needs synchronously (group attachment, peer properties) arrive ahead of the signals
/// that use them and are cached here.
pub struct BridgeSupplicant {
    tx: UnboundedSender<BridgeRequest>,
    attachments: HashMap<String, GroupAttachment>,
    peers: HashMap<String, PeerProperties>,
    next_link: u32,
    next_network: u64,
}

impl BridgeSupplicant {
    pub fn new(tx: UnboundedSender<BridgeRequest>) -> Self {
        Self {
            tx,
            attachments: HashMap::new(),
            peers: HashMap::new(),
            next_link: 0,
            next_network: 0,
        }
    }

    fn send(&self, request: BridgeRequest) -> Result<(), ControlError> {
        self.tx.send(request).map_err(|_| ControlError::Unavailable)
    }

    pub fn group_attached(&mut self, group_path: String, attachment: GroupAttachment) {
        self.attachments.insert(group_path, attachment);
    }

    pub fn peer_info(&mut self, peer_path: String, properties: PeerProperties) {
        self.peers.insert(peer_path, properties);
    }
}

fn role_tag(role: InterfaceRole) -> &'static str {
    match role {
        InterfaceRole::Station => "sta",
        InterfaceRole::AccessPoint => "ap",
        InterfaceRole::P2pGroupOwner => "go",
        InterfaceRole::P2pClient => "gc",
        InterfaceRole::P2pDevice => "dev",
        InterfaceRole::Adhoc => "ibss",
    }
}

impl Supplicant for BridgeSupplicant {
    fn create_interface(
        &mut self,
        phy: PhyIndex,
        role: InterfaceRole,
    ) -> Result<String, ControlError> {
        self.next_link += 1;
        let link = format!("wl{}-{}{}", phy, role_tag(role), self.next_link);
        self.send(BridgeRequest::CreateInterface {
            phy,
            role,
            link: link.clone(),
        })?;
        Ok(link)
    }

    fn remove_interface(&mut self, link: &str) -> Result<(), ControlError> {
        self.send(BridgeRequest::RemoveInterface {
            link: link.to_string(),
        })
    }

    fn group_add(&mut self, link: &str, config: &GroupConfig) -> Result<(), ControlError> {
        self.send(BridgeRequest::GroupAdd {
            link: link.to_string(),
            config: config.clone(),
        })
    }

    fn persistent_group_add(
        &mut self,
        link: &str,
        credentials: &GroupCredentials,
    ) -> Result<String, ControlError> {
        self.next_network += 1;
        let network_path = format!("/{}/networks/{}", link, self.next_network);
        self.send(BridgeRequest::PersistentGroupAdd {
            link: link.to_string(),
            network_path: network_path.clone(),
            credentials: credentials.clone(),
        })?;
        Ok(network_path)
    }

    fn persistent_group_remove(
        &mut self,
        link: &str,
        network_path: &str,
    ) -> Result<(), ControlError> {
        self.send(BridgeRequest::PersistentGroupRemove {
            link: link.to_string(),
            network_path: network_path.to_string(),
        })
    }

    fn group_join(&mut self, link: &str, network_path: &str) -> Result<(), ControlError> {
        self.send(BridgeRequest::GroupJoin {
            link: link.to_string(),
            network_path: network_path.to_string(),
        })
    }

    fn disconnect(&mut self, link: &str) -> Result<(), ControlError> {
        self.send(BridgeRequest::Disconnect {
            link: link.to_string(),
        })
    }

    fn attach_group(
        &mut self,
        _interface_path: &str,
        group_path: &str,
    ) -> Result<GroupAttachment, ControlError> {
        self.attachments
            .remove(group_path)
            .ok_or_else(|| ControlError::Rejected(format!("group {} not attached", group_path)))
    }

    fn detach_group(&mut self, interface_path: &str) {
        let _ = self.send(BridgeRequest::DetachGroup {
            interface_path: interface_path.to_string(),
        });
    }

    fn peer_properties(&mut self, peer_path: &str) -> Result<PeerProperties, ControlError> {
        self.peers
            .get(peer_path)
            .cloned()
            .ok_or_else(|| ControlError::Rejected(format!("no properties for {}", peer_path)))
    }

    fn start_access_point(&mut self, link: &str, config: &ApConfig) -> Result<(), ControlError> {
        self.send(BridgeRequest::StartAccessPoint {
            link: link.to_string(),
            config: config.clone(),
        })
    }

    fn stop_access_point(&mut self, link: &str) -> Result<(), ControlError> {
        self.send(BridgeRequest::StopAccessPoint {
            link: link.to_string(),
        })
    }
}

pub struct BridgeHelper {
    tx: UnboundedSender<BridgeRequest>,
}

impl NetworkHelper for BridgeHelper {
    fn create_network(
        &mut self,
        request: &NetworkRequest,
        token: CallToken,
    ) -> Result<(), ControlError> {
        self.tx
            .send(BridgeRequest::CreateNetwork {
                request: request.clone(),
                token,
            })
            .map_err(|_| ControlError::Unavailable)
    }

    fn request_client_network(
        &mut self,
        link: &str,
        token: CallToken,
    ) -> Result<(), ControlError> {
        self.tx
            .send(BridgeRequest::RequestClientNetwork {
                link: link.to_string(),
                token,
            })
            .map_err(|_| ControlError::Unavailable)
    }

    fn stop_network(&mut self, link: &str) {
        let _ = self.tx.send(BridgeRequest::StopNetwork {
            link: link.to_string(),
        });
    }
}

/// Forwards device events to their owner through the bridge.
pub struct BridgeSink {
    tx: UnboundedSender<BridgeRequest>,
}

impl EventSink for BridgeSink {
    fn on_event(&mut self, event: DeviceEvent, device: &DeviceInfo) {
        info!(device = %device.handle, link = %device.link, ?event, "device event");
        let _ = self.tx.send(BridgeRequest::DeviceEvent {
            handle: device.handle,
            owner: device.owner,
            event,
        });
    }
}

/// Service plus its control seams. Lives on the event-loop task only.
pub struct Daemon {
    service: RadioService,
    supplicant: BridgeSupplicant,
    helper: BridgeHelper,
    sink: BridgeSink,
    requests: UnboundedSender<BridgeRequest>,
    timers: UnboundedSender<Inbound>,
    lease_socket: PathBuf,
    /// Queued request ticket -> id of the command that queued it.
    tickets: HashMap<u64, u64>,
}

impl Daemon {
    pub fn new(
        config: &Config,
        requests: UnboundedSender<BridgeRequest>,
        timers: UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            service: RadioService::new(config.service_config()),
            supplicant: BridgeSupplicant::new(requests.clone()),
            helper: BridgeHelper {
                tx: requests.clone(),
            },
            sink: BridgeSink {
                tx: requests.clone(),
            },
            requests,
            timers,
            lease_socket: config.lease_socket.clone(),
            tickets: HashMap::new(),
        }
    }

    pub fn service(&self) -> &RadioService {
        &self.service
    }

    fn dispatch(&mut self, event: ServiceEvent) {
        let mut ports = Ports {
            supplicant: &mut self.supplicant,
            helper: &mut self.helper,
            sink: &mut self.sink,
        };
        if let Err(e) = self.service.handle_event(&mut ports, event) {
            warn!(error = %e, "event rejected");
        }
    }

    pub async fn handle(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::FormationTimeout(token) => {
                self.dispatch(ServiceEvent::FormationTimeout(token))
            }
            Inbound::Bridge(msg) => self.handle_message(msg).await,
        }
        self.run_actions();
    }

    async fn handle_message(&mut self, msg: BridgeMessage) {
        match msg {
            BridgeMessage::Capability(msg) => self.dispatch(ServiceEvent::Capability(msg)),
            BridgeMessage::Signal { link, signal } => {
                if let SupplicantSignal::PeerDisconnected { peer_path } = &signal {
                    self.supplicant.peers.remove(peer_path);
                }
                self.dispatch(ServiceEvent::Supplicant { link, signal })
            }
            BridgeMessage::GroupAttached {
                interface_path,
                group_path,
                attachment,
            } => {
                debug!(interface = %interface_path, group = %group_path, "group attached");
                self.supplicant.group_attached(group_path, attachment);
            }
            BridgeMessage::PeerInfo {
                peer_path,
                properties,
            } => self.supplicant.peer_info(peer_path, properties),
            BridgeMessage::NetworkStarted { token, network } => {
                let lease = match &network {
                    Some(n) => collect_lease(&self.lease_socket, n.network_id).await,
                    None => None,
                };
                self.dispatch(ServiceEvent::NetworkStarted {
                    token,
                    lease,
                    network,
                });
            }
            BridgeMessage::ConnectionUpdated { token, ifindex } => {
                self.dispatch(ServiceEvent::ConnectionUpdated { token, ifindex })
            }
            BridgeMessage::NetworkStopped {
                link,
                ifindex,
                is_failure,
            } => self.dispatch(ServiceEvent::NetworkStopped {
                link,
                ifindex,
                is_failure,
            }),
            BridgeMessage::UpstreamChanged { available } => {
                self.dispatch(ServiceEvent::UpstreamChanged { available })
            }
            BridgeMessage::RequestFailed { link, reason } => {
                warn!(link = %link, reason = %reason, "bridge request failed");
                self.dispatch(ServiceEvent::ControlFailed { link })
            }
            BridgeMessage::Command { id, command } => {
                let result = self.run_command(id, command).map_err(|e| e.to_string());
                let _ = self.requests.send(BridgeRequest::Outcome { id, result });
            }
        }
    }

    fn run_command(&mut self, id: u64, command: Command) -> Result<CommandReply, ServiceError> {
        let mut ports = Ports {
            supplicant: &mut self.supplicant,
            helper: &mut self.helper,
            sink: &mut self.sink,
        };
        let service = &mut self.service;
        let reply = match command {
            Command::RequestDevice {
                owner,
                role,
                phy,
                queue,
            } => {
                let request = FeatureRequest {
                    phy,
                    queue,
                    ..FeatureRequest::new(owner, role)
                };
                match service.request_device(&mut ports, request)? {
                    Admission::Started(handle) => CommandReply::Started(handle),
                    Admission::Queued(ticket) => {
                        self.tickets.insert(ticket.0, id);
                        CommandReply::Queued(ticket.0)
                    }
                }
            }
            Command::CancelRequest { ticket } => {
                self.tickets.remove(&ticket);
                CommandReply::Accepted(service.cancel_request(RequestTicket(ticket)))
            }
            Command::StopDevice { handle } => {
                service.stop_device(&mut ports, handle)?;
                CommandReply::Accepted(true)
            }
            Command::CreateGroup { handle, config } => {
                CommandReply::Accepted(service.create_group(&mut ports, handle, &config)?)
            }
            Command::Connect {
                handle,
                credentials,
            } => CommandReply::Accepted(service.connect(&mut ports, handle, &credentials)?),
            Command::RemoveGroup { handle } => {
                CommandReply::Accepted(service.remove_group(&mut ports, handle)?)
            }
            Command::Disconnect { handle } => {
                CommandReply::Accepted(service.disconnect(&mut ports, handle)?)
            }
            Command::StartAccessPoint { handle, config } => {
                CommandReply::Accepted(service.start_access_point(&mut ports, handle, &config)?)
            }
            Command::StopAccessPoint { handle } => {
                CommandReply::Accepted(service.stop_access_point(&mut ports, handle)?)
            }
            Command::SupportsConcurrency { phy, roles } => {
                CommandReply::Channels(service.fleet().supports_concurrency(phy, &roles))
            }
            Command::RegisterExternal { owner, role, phy } => {
                let request = FeatureRequest {
                    phy,
                    ..FeatureRequest::new(owner, role)
                };
                let external = service.register_external(&mut ports, request)?;
                CommandReply::Registered {
                    phy: external.phy,
                    interface: external.interface.0,
                }
            }
            Command::ReleaseExternal { phy, interface } => CommandReply::Accepted(
                service.release_external(&mut ports, phy, InterfaceId(interface)),
            ),
        };
        Ok(reply)
    }

    fn run_actions(&mut self) {
        for action in self.service.drain_actions() {
            match action {
                HostAction::ScheduleFormationTimeout { token, after } => {
                    let timers = self.timers.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = timers.send(Inbound::FormationTimeout(token));
                    });
                }
                HostAction::RequestAdmitted { ticket, handle } => {
                    let id = self.tickets.remove(&ticket.0).unwrap_or_default();
                    let _ = self.requests.send(BridgeRequest::Outcome {
                        id,
                        result: Ok(CommandReply::Admitted {
                            ticket: ticket.0,
                            handle,
                        }),
                    });
                }
                HostAction::RequestFailed { ticket, error } => {
                    let id = self.tickets.remove(&ticket.0).unwrap_or_default();
                    let _ = self.requests.send(BridgeRequest::Outcome {
                        id,
                        result: Err(error.to_string()),
                    });
                }
            }
        }
    }
}

/// Connect to the helper's lease socket and keep the connection as the lease.
async fn collect_lease(path: &Path, network_id: u64) -> Option<NetworkLease> {
    let mut stream = match UnixStream::connect(path).await {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "lease socket unavailable");
            return None;
        }
    };
    if let Err(e) = stream.write_all(&network_id.to_le_bytes()).await {
        warn!(network = network_id, error = %e, "lease request failed");
        return None;
    }
    let std_stream = stream.into_std().ok()?;
    Some(NetworkLease::new(OwnedFd::from(std_stream)))
}

/// Read frames until EOF, forwarding each message to the event loop.
async fn read_loop(
    mut reader: tokio::net::unix::OwnedReadHalf,
    tx: UnboundedSender<Inbound>,
) -> anyhow::Result<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(64 * 1024);
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            info!("bridge closed the connection");
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        loop {
            match decode_frame::<BridgeMessage>(&buf) {
                Ok((msg, used)) => {
                    buf.drain(..used);
                    if tx.send(Inbound::Bridge(msg)).is_err() {
                        return Ok(());
                    }
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => return Err(e).context("bad frame from bridge"),
            }
        }
    }
}

async fn write_loop(
    mut writer: tokio::net::unix::OwnedWriteHalf,
    mut rx: UnboundedReceiver<BridgeRequest>,
) -> anyhow::Result<()> {
    while let Some(request) = rx.recv().await {
        let frame = encode_frame(&request)?;
        writer.write_all(&frame).await?;
    }
    Ok(())
}

/// Connect to the bridge and run the event loop until the bridge goes away.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let stream = UnixStream::connect(&config.bridge_socket)
        .await
        .with_context(|| format!("connect to bridge at {}", config.bridge_socket.display()))?;
    info!(socket = %config.bridge_socket.display(), "connected to bridge");
    let (reader, writer) = stream.into_split();

    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();

    let writer_task = tokio::spawn(write_loop(writer, request_rx));
    let reader_task = tokio::spawn(read_loop(reader, inbound_tx.clone()));

    request_tx.send(BridgeRequest::Hello {
        protocol_version: PROTOCOL_VERSION,
    })?;
    request_tx.send(BridgeRequest::DumpCapabilities)?;

    let mut daemon = Daemon::new(&config, request_tx, inbound_tx);
    tokio::select! {
        _ = async {
            while let Some(inbound) = inbound_rx.recv().await {
                daemon.handle(inbound).await;
            }
        } => {}
        r = reader_task => r??,
    }
    writer_task.abort();
    Ok(())
}
