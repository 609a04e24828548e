//! The host security and channel core.
//!
//! [`SecHost`] wires the device store, service registry, link and channel
//! pools and the pairing state machine together behind one dispatch surface.
//! The caller owns the storage (through [`HostResources`]), feeds decoded
//! controller events into [`SecHost::handle_event`], drives time through
//! [`SecHost::poll_timers`], drains [`Command`]s to the controller and
//! [`SecurityEvent`]s to the application.
//!
//! Nothing in here blocks or reads a clock; every entry point that needs
//! time takes it as an argument.

use bt_hci::param::{BdAddr, ConnHandle};
use embassy_time::Instant;

use crate::channel_manager::{ChanHandle, ChannelManager, ChannelState, ChannelStorage};
use crate::command::{Command, CommandSink};
use crate::config::LINK_DISCONNECT_TIMEOUT;
use crate::dev_rec::{DeviceRecord, DeviceStore, PendingAccess, SecState};
use crate::event::{EventSink, HciEvent, SecurityEvent};
use crate::link_manager::{LinkHandle, LinkManager, LinkState, LinkStorage};
use crate::packet_pool::PacketPool;
use crate::security_manager::{exec, AuthOutcome, PendingRequest, SecurityManager};
use crate::service::{ServiceRecord, ServiceRegistry};
use crate::types::l2cap::{ConfigReq, ConfigRsp, ConfigVerdict};
use crate::types::security::{IoCapability, SecurityMode, SecurityRequirements, TransportSecFlags};
use crate::types::status::{HciStatus, SecStatus};
use crate::types::Transport;
use crate::Error;

/// L2CAP connect response result codes.
const CONN_RESULT_OK: u16 = 0x0000;
const CONN_RESULT_PENDING: u16 = 0x0001;
const CONN_RESULT_NO_PSM: u16 = 0x0002;
const CONN_RESULT_SECURITY_BLOCK: u16 = 0x0003;
const CONN_RESULT_NO_RESOURCES: u16 = 0x0004;

/// Extended features information request type.
const INFO_TYPE_EXTENDED_FEATURES: u16 = 0x0002;

/// Runtime configuration of the core.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub security_mode: SecurityMode,
    pub io_capability: IoCapability,
    /// Link idle timeout in seconds applied to links this core raises.
    pub default_idle_timeout: u16,
    /// ACL transmit buffers on the controller, per transport.
    pub classic_buffers: u16,
    pub le_buffers: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            security_mode: SecurityMode::SimplePairing,
            io_capability: IoCapability::DisplayYesNo,
            default_idle_timeout: crate::config::DEFAULT_IDLE_TIMEOUT,
            classic_buffers: 8,
            le_buffers: 4,
        }
    }
}

/// Storage for every pool the core needs, sized by the caller and borrowed
/// for the host's lifetime.
pub struct HostResources<const DEVS: usize, const LINKS: usize, const CHANNELS: usize, const SERVICES: usize> {
    devices: [DeviceRecord; DEVS],
    links: [LinkStorage; LINKS],
    channels: [ChannelStorage; CHANNELS],
    services: [ServiceRecord; SERVICES],
}

impl<const DEVS: usize, const LINKS: usize, const CHANNELS: usize, const SERVICES: usize> Default
    for HostResources<DEVS, LINKS, CHANNELS, SERVICES>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const DEVS: usize, const LINKS: usize, const CHANNELS: usize, const SERVICES: usize>
    HostResources<DEVS, LINKS, CHANNELS, SERVICES>
{
    pub const fn new() -> Self {
        Self {
            devices: [DeviceRecord::NEW; DEVS],
            links: [LinkStorage::DISCONNECTED; LINKS],
            channels: [ChannelStorage::CLOSED; CHANNELS],
            services: [ServiceRecord::NEW; SERVICES],
        }
    }
}

/// The assembled core.
pub struct SecHost<'d, const MTU: usize = 672, const TX_BUFS: usize = 8> {
    config: Config,
    commands: CommandSink,
    events: EventSink,
    devices: DeviceStore<'d>,
    services: ServiceRegistry<'d>,
    links: LinkManager<'d>,
    channels: ChannelManager<'d>,
    sm: SecurityManager,
    pool: PacketPool<MTU, TX_BUFS>,
}

impl<'d, const MTU: usize, const TX_BUFS: usize> SecHost<'d, MTU, TX_BUFS> {
    pub fn new<const DEVS: usize, const LINKS: usize, const CHANNELS: usize, const SERVICES: usize>(
        resources: &'d mut HostResources<DEVS, LINKS, CHANNELS, SERVICES>,
        config: Config,
    ) -> Self {
        Self {
            commands: CommandSink::new(),
            events: EventSink::new(),
            devices: DeviceStore::new(&mut resources.devices),
            services: ServiceRegistry::new(&mut resources.services),
            links: LinkManager::new(&mut resources.links, config.classic_buffers, config.le_buffers),
            channels: ChannelManager::new(&mut resources.channels),
            sm: SecurityManager::new(config.security_mode, config.io_capability),
            pool: PacketPool::new(),
            config,
        }
    }

    /// Outbound controller command queue; the dispatch context drains this
    /// after every call into the core.
    pub fn commands(&self) -> &CommandSink {
        &self.commands
    }

    /// Upward notification queue.
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    // --- service registration ---

    #[allow(clippy::too_many_arguments)]
    pub fn set_security_level(
        &self,
        is_originator: bool,
        name: &str,
        service_id: u8,
        level: SecurityRequirements,
        psm: u16,
        mx_proto_id: u32,
        mx_chan_id: u32,
    ) -> bool {
        self.services.set_security_level(
            self.config.security_mode,
            is_originator,
            name,
            service_id,
            level,
            psm,
            mx_proto_id,
            mx_chan_id,
        )
    }

    pub fn clear_security(&self, service_id: Option<u8>) {
        self.services.clear(service_id)
    }

    // --- bonding and user replies ---

    pub fn bond(&self, now: Instant, addr: BdAddr, pin: Option<&[u8]>) -> SecStatus {
        self.sm.bond(&self.devices, &self.links, &self.commands, now, addr, pin)
    }

    pub fn bond_cancel(&self, now: Instant, addr: BdAddr) -> SecStatus {
        self.sm
            .bond_cancel(&self.links, &self.commands, &self.events, now, addr)
    }

    pub fn pin_code_reply(&self, now: Instant, addr: BdAddr, pin: Option<&[u8]>) -> SecStatus {
        self.sm.pin_code_reply(&self.devices, &self.commands, now, addr, pin)
    }

    pub fn confirm_req_reply(&self, now: Instant, addr: BdAddr, accept: bool) -> SecStatus {
        self.sm.confirm_req_reply(&self.commands, now, addr, accept)
    }

    pub fn passkey_req_reply(&self, now: Instant, addr: BdAddr, passkey: Option<u32>) -> SecStatus {
        self.sm.passkey_reply(&self.commands, now, addr, passkey)
    }

    pub fn remote_oob_data_reply(&self, now: Instant, addr: BdAddr, data: Option<([u8; 16], [u8; 16])>) -> SecStatus {
        self.sm.oob_reply(&self.commands, now, addr, data)
    }

    /// Answer an [`AuthorizeRequest`](SecurityEvent::AuthorizeRequest) and
    /// resume whatever was waiting on it.
    pub fn authorize_reply(&self, now: Instant, addr: BdAddr, granted: bool, trust: bool) {
        self.sm.authorize_reply(&self.devices, addr, granted, trust);
        if let Some(idx) = self.devices.find(addr) {
            if granted {
                self.continue_security(idx, now);
            } else {
                self.fail_security(idx, SecStatus::FailedOnSecurity);
            }
        }
    }

    pub fn get_security_flags(&self, addr: BdAddr, transport: Transport) -> Option<TransportSecFlags> {
        let idx = self.devices.find(addr)?;
        Some(self.devices.with(idx, |rec| *rec.flags(transport)))
    }

    // --- gated access requests ---

    /// Gate an L2CAP access against the security registered for `psm`.
    /// `Success` grants immediately; `CmdStarted` defers to an
    /// [`AccessComplete`](SecurityEvent::AccessComplete) event carrying
    /// `token`.
    pub fn l2cap_access_req(&self, now: Instant, addr: BdAddr, psm: u16, is_originator: bool, token: u32) -> SecStatus {
        let service = self.services.find_first(is_originator, psm);
        self.access_request(now, addr, psm, token, is_originator, service, None)
    }

    /// Same gate for a multiplexed protocol sharing a PSM.
    #[allow(clippy::too_many_arguments)]
    pub fn mx_access_request(
        &self,
        now: Instant,
        addr: BdAddr,
        psm: u16,
        is_originator: bool,
        mx_proto_id: u32,
        mx_chan_id: u32,
        token: u32,
    ) -> SecStatus {
        let service = self.services.find_mx(is_originator, psm, mx_proto_id, mx_chan_id);
        self.access_request(now, addr, psm, token, is_originator, service, Some((mx_proto_id, mx_chan_id)))
    }

    /// Demand encryption on an existing link, reporting through `token`.
    pub fn set_encryption(&self, now: Instant, addr: BdAddr, token: u32) -> SecStatus {
        let _ = now;
        let Some(idx) = self.devices.find(addr) else {
            return SecStatus::UnknownAddr;
        };
        let mode = self.config.security_mode;
        let status = self.devices.with(idx, |rec| {
            if rec.classic.encrypted {
                return SecStatus::Success;
            }
            rec.is_originator = true;
            rec.security_required
                .insert(SecurityRequirements::OUT_AUTHENTICATE.union(SecurityRequirements::OUT_ENCRYPT));
            exec::execute(rec, &self.commands, &self.events, mode)
        });
        if status == SecStatus::CmdStarted {
            self.devices.with(idx, |rec| {
                rec.pending = Some(PendingAccess {
                    token,
                    service_id: rec.cur_service_id.unwrap_or(0),
                    psm: 0,
                })
            });
        }
        status
    }

    #[allow(clippy::too_many_arguments)]
    fn access_request(
        &self,
        now: Instant,
        addr: BdAddr,
        psm: u16,
        token: u32,
        is_originator: bool,
        service: Option<ServiceRecord>,
        mx: Option<(u32, u32)>,
    ) -> SecStatus {
        let _ = now;
        // No registered security for this service means nothing to enforce.
        let Some(service) = service else {
            return SecStatus::Success;
        };

        // A live pairing session owns the controller's security machinery;
        // park the request and replay it when the session ends.
        if !self.sm.is_idle() {
            if !self.sm.push_pending(PendingRequest {
                addr,
                token,
                service_id: service.service_id,
                psm,
                is_originator,
                mx,
            }) {
                return SecStatus::NoResources;
            }
            debug!("[sec][access] deferred behind pairing, token {}", token);
            return SecStatus::CmdStarted;
        }

        let Some(idx) = self.devices.find_or_alloc(addr) else {
            return SecStatus::NoResources;
        };
        let required = service.security.masked(if is_originator {
            SecurityRequirements::OUT_MASK
        } else {
            SecurityRequirements::IN_MASK
        });
        let mode = self.config.security_mode;
        let connecting = self
            .links
            .find_by_addr(addr, Transport::Classic)
            .map(|h| {
                self.links
                    .with(h, |l| {
                        matches!(l.state, LinkState::Connecting | LinkState::ConnectingWaitSwitch)
                    })
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        let status = self.devices.with(idx, |rec| {
            rec.is_originator = is_originator;
            rec.cur_service_id = Some(service.service_id);
            rec.security_required.insert(required);
            if rec.classic_handle.is_none() {
                // The link is still being raised; the procedure starts at
                // connection complete.
                if connecting {
                    return SecStatus::CmdStarted;
                }
                return SecStatus::WrongMode;
            }
            exec::execute(rec, &self.commands, &self.events, mode)
        });
        if status == SecStatus::CmdStarted {
            self.devices.with(idx, |rec| {
                rec.pending = Some(PendingAccess {
                    token,
                    service_id: service.service_id,
                    psm,
                })
            });
        }
        status
    }

    // --- channels ---

    /// Open a dynamic channel to `addr` on `psm`, raising the ACL link if
    /// needed and gating on the registered service security. Returns the
    /// local CID; progress reports through `token` and channel events,
    /// ending in [`ChannelOpened`](SecurityEvent::ChannelOpened).
    pub fn channel_connect(&self, now: Instant, addr: BdAddr, psm: u16, token: u32) -> Result<u16, SecStatus> {
        let link = match self.links.find_by_addr(addr, Transport::Classic) {
            Some(link) => link,
            None => {
                // Over the piconet cap, switch roles on an existing link
                // before paging a new peer.
                let wait_switch = self.links.needs_role_switch();
                if wait_switch {
                    if let Some(peer) = self.links.first_connected_classic() {
                        self.commands.push(Command::SwitchRole(peer));
                    }
                }
                let Some(link) = self.links.allocate(addr, false, Transport::Classic) else {
                    return Err(SecStatus::NoResources);
                };
                self.links.with(link, |l| {
                    l.idle_timeout = self.config.default_idle_timeout;
                    l.state = if wait_switch {
                        LinkState::ConnectingWaitSwitch
                    } else {
                        LinkState::Connecting
                    };
                });
                self.commands.push(Command::CreateConnection(addr));
                link
            }
        };
        let Some(chan) = self.channels.alloc(&self.links, link, psm, true) else {
            return Err(SecStatus::NoResources);
        };
        let cid = self.channels.cid_of(chan);
        let status = self.l2cap_access_req(now, addr, psm, true, token);
        match status {
            SecStatus::Success => {
                self.advance_sec_channels(link, true);
                Ok(cid)
            }
            SecStatus::CmdStarted => Ok(cid),
            fail => {
                self.channels.release(chan, &self.links, |id| self.pool.free(id));
                Err(fail)
            }
        }
    }

    /// Tear down a dynamic channel by local CID.
    pub fn channel_disconnect(&self, now: Instant, cid: u16) -> bool {
        let Some(chan) = self.channels.find_by_cid(cid) else {
            return false;
        };
        let link = self.chan_link(chan);
        let ok = self
            .channels
            .disconnect_chnl(chan, &self.links, &self.commands, &self.events, |id| {
                self.pool.free(id)
            });
        if let Some(link) = link {
            self.maybe_idle(link, now);
        }
        ok
    }

    /// Queue payload bytes on an open channel.
    pub fn send(&self, cid: u16, data: &[u8]) -> Result<(), Error> {
        let chan = self.channels.find_by_cid(cid).ok_or(Error::NotFound)?;
        let open = self
            .channels
            .with(chan, |c| c.state == ChannelState::Open)
            .unwrap_or(false);
        if !open {
            return Err(Error::InvalidState);
        }
        let id = self.pool.alloc(data).ok_or(Error::OutOfMemory)?;
        self.channels.enqueue_pdu(chan, id, &self.events).map_err(|id| {
            self.pool.free(id);
            Error::OutOfMemory
        })
    }

    /// Hand the next scheduled PDU for `conn` to the controller layer. The
    /// closure sees the channel's local CID and the payload; the buffer is
    /// recycled afterwards and the link's in-flight count bumped.
    pub fn pull_outbound<R>(&self, conn: ConnHandle, f: impl FnOnce(u16, &[u8]) -> R) -> Option<R> {
        let link = self.links.find_by_conn(conn)?;
        let throttled = self
            .links
            .with(link, |l| l.sent_not_acked >= l.link_quota)
            .unwrap_or(true);
        if throttled {
            return None;
        }
        let (chan, id) = self.channels.next_pdu(&self.links, link, &self.events)?;
        let cid = self.channels.cid_of(chan);
        let result = self.pool.with(id, |buf| f(cid, buf));
        self.pool.free(id);
        self.links.with(link, |l| l.sent_not_acked += 1);
        Some(result)
    }

    // --- peer L2CAP signaling ---

    pub fn on_l2cap_connect_req(&self, now: Instant, conn: ConnHandle, psm: u16, scid: u16) {
        let Some(link) = self.links.find_by_conn(conn) else {
            return;
        };
        let Some(addr) = self.links.with(link, |l| l.addr).flatten() else {
            return;
        };
        let service = self.services.find_first(false, psm);
        if service.is_none() && self.services.find_first(true, psm).is_none() {
            // Nothing listens here at all.
            self.commands.push(Command::L2capConnectRsp {
                handle: conn,
                dcid: 0,
                scid,
                result: CONN_RESULT_NO_PSM,
            });
            return;
        }
        let Some(chan) = self.channels.alloc(&self.links, link, psm, false) else {
            self.commands.push(Command::L2capConnectRsp {
                handle: conn,
                dcid: 0,
                scid,
                result: CONN_RESULT_NO_RESOURCES,
            });
            return;
        };
        self.channels.with(chan, |c| c.remote_cid = scid);

        let status = self.access_request(now, addr, psm, 0, false, service, None);
        match status {
            SecStatus::Success => self.advance_sec_channels(link, true),
            SecStatus::CmdStarted => {
                self.commands.push(Command::L2capConnectRsp {
                    handle: conn,
                    dcid: self.channels.cid_of(chan),
                    scid,
                    result: CONN_RESULT_PENDING,
                });
            }
            _ => {
                self.commands.push(Command::L2capConnectRsp {
                    handle: conn,
                    dcid: 0,
                    scid,
                    result: CONN_RESULT_SECURITY_BLOCK,
                });
                self.channels.release(chan, &self.links, |id| self.pool.free(id));
            }
        }
    }

    pub fn on_l2cap_connect_rsp(&self, now: Instant, conn: ConnHandle, scid: u16, dcid: u16, result: u16) {
        let Some(chan) = self.channels.find_by_cid(scid) else {
            return;
        };
        match result {
            CONN_RESULT_OK => {
                self.channels.with(chan, |c| c.remote_cid = dcid);
                if let Some(cfg) = self.channels.process_our_cfg_req(chan) {
                    self.commands.push(Command::L2capConfigReq {
                        handle: conn,
                        dcid,
                        config: cfg,
                    });
                }
            }
            CONN_RESULT_PENDING => {}
            _ => {
                debug!("[l2c][connect] rejected with result {}", result);
                let link = self.chan_link(chan);
                self.channels.release(chan, &self.links, |id| self.pool.free(id));
                self.events.push(SecurityEvent::ChannelDisconnected {
                    cid: scid,
                    confirmed: true,
                });
                if let Some(link) = link {
                    self.maybe_idle(link, now);
                }
            }
        }
    }

    pub fn on_l2cap_config_req(&self, now: Instant, conn: ConnHandle, local_cid: u16, req: &ConfigReq) {
        let Some(chan) = self.channels.find_by_cid(local_cid) else {
            return;
        };
        let remote_cid = self.channels.with(chan, |c| c.remote_cid).unwrap_or(0);
        match self.channels.process_peer_cfg_req(chan, req) {
            ConfigVerdict::Ok(rsp) | ConfigVerdict::Unacceptable(rsp) => {
                self.commands.push(Command::L2capConfigRsp {
                    handle: conn,
                    dcid: remote_cid,
                    config: rsp,
                });
                self.notify_if_open(chan);
            }
            ConfigVerdict::Disconnect => {
                self.channel_disconnect(now, local_cid);
            }
        }
    }

    pub fn on_l2cap_config_rsp(&self, now: Instant, conn: ConnHandle, local_cid: u16, rsp: &ConfigRsp) {
        let Some(chan) = self.channels.find_by_cid(local_cid) else {
            return;
        };
        match self.channels.process_our_cfg_rsp(chan, rsp) {
            ConfigVerdict::Ok(_) => self.notify_if_open(chan),
            ConfigVerdict::Unacceptable(_) => {
                // We adopted the peer's counter-proposal; try again with it.
                let remote_cid = self.channels.with(chan, |c| c.remote_cid).unwrap_or(0);
                if let Some(cfg) = self.channels.process_our_cfg_req(chan) {
                    self.commands.push(Command::L2capConfigReq {
                        handle: conn,
                        dcid: remote_cid,
                        config: cfg,
                    });
                }
            }
            ConfigVerdict::Disconnect => {
                self.channel_disconnect(now, local_cid);
            }
        }
    }

    pub fn on_l2cap_disconnect_req(&self, now: Instant, conn: ConnHandle, local_cid: u16, scid: u16) {
        let Some(chan) = self.channels.find_by_cid(local_cid) else {
            return;
        };
        self.commands.push(Command::L2capDisconnectRsp {
            handle: conn,
            dcid: local_cid,
            scid,
        });
        let link = self.chan_link(chan);
        self.channels.release(chan, &self.links, |id| self.pool.free(id));
        self.events.push(SecurityEvent::ChannelDisconnected {
            cid: local_cid,
            confirmed: true,
        });
        if let Some(link) = link {
            self.maybe_idle(link, now);
        }
    }

    pub fn on_l2cap_disconnect_rsp(&self, _conn: ConnHandle, local_cid: u16) {
        // We release on request, not on response.
        trace!("[l2c][disconnect] late response for cid {:#06x}", local_cid);
    }

    /// Ping the peer over the signaling channel. Completion is reported
    /// through [`EchoComplete`](SecurityEvent::EchoComplete).
    pub fn ping(&self, conn: ConnHandle) -> bool {
        let Some(link) = self.links.find_by_conn(conn) else {
            return false;
        };
        let started = self
            .links
            .with(link, |l| {
                if l.echo_pending {
                    false
                } else {
                    l.echo_pending = true;
                    true
                }
            })
            .unwrap_or(false);
        if started {
            self.commands.push(Command::L2capEchoReq { handle: conn });
        }
        started
    }

    pub fn on_l2cap_echo_req(&self, conn: ConnHandle) {
        self.commands.push(Command::L2capEchoRsp { handle: conn });
    }

    pub fn on_l2cap_echo_rsp(&self, conn: ConnHandle) {
        let Some(link) = self.links.find_by_conn(conn) else {
            return;
        };
        let addr = self
            .links
            .with(link, |l| {
                if l.echo_pending {
                    l.echo_pending = false;
                    l.addr
                } else {
                    None
                }
            })
            .flatten();
        if let Some(addr) = addr {
            self.events.push(SecurityEvent::EchoComplete { addr, ok: true });
        }
    }

    // --- controller event dispatch ---

    pub fn handle_event(&self, event: HciEvent, now: Instant) {
        match event {
            HciEvent::ConnectionComplete { status, handle, addr } => {
                self.on_connection_complete(now, status, handle, addr)
            }
            HciEvent::ConnectionRequest { addr } => {
                if !self.sm.is_idle() && self.sm.pairing_peer() != Some(addr) {
                    // Only one pairing partner at a time.
                    self.commands
                        .push(Command::RejectConnection(addr, HciStatus::HostBusyPairing));
                } else {
                    self.commands.push(Command::AcceptConnection(addr));
                }
            }
            HciEvent::DisconnectionComplete { handle, reason } => self.on_disconnection(now, handle, reason),
            HciEvent::AuthComplete { handle, status } => {
                let outcome = self.sm.on_auth_complete(
                    &self.devices,
                    &self.links,
                    &self.commands,
                    &self.events,
                    now,
                    handle,
                    status,
                );
                if let Some(idx) = self.devices.find_by_handle(handle, Transport::Classic) {
                    match outcome {
                        AuthOutcome::Resume => self.continue_security(idx, now),
                        AuthOutcome::RetryScheduled => {}
                        AuthOutcome::Failed => self.fail_security(idx, SecStatus::Hci(status)),
                    }
                }
            }
            HciEvent::EncryptionChange {
                handle,
                status,
                enabled,
            } => {
                let ok = self
                    .sm
                    .on_encryption_change(&self.devices, &self.events, handle, status, enabled);
                if let Some(idx) = self.devices.find_by_handle(handle, Transport::Classic) {
                    if ok {
                        self.continue_security(idx, now);
                    } else {
                        self.fail_security(idx, SecStatus::Hci(status));
                    }
                }
            }
            HciEvent::LinkKeyRequest { addr } => self.sm.on_link_key_request(&self.devices, &self.commands, addr),
            HciEvent::LinkKeyNotification { addr, key } => {
                self.sm.on_link_key_notification(&self.devices, &self.events, addr, key)
            }
            HciEvent::PinCodeRequest { addr } => {
                self.sm
                    .on_pin_code_request(&self.devices, &self.commands, &self.events, now, addr)
            }
            HciEvent::IoCapRequest { addr } => self.sm.on_io_cap_request(&self.devices, &self.commands, now, addr),
            HciEvent::IoCapResponse { addr, io_cap, .. } => self.sm.on_io_cap_response(&self.devices, addr, io_cap),
            HciEvent::UserConfirmRequest { addr, numeric_value } => {
                self.sm.on_user_confirm_request(&self.events, now, addr, numeric_value)
            }
            HciEvent::UserPasskeyRequest { addr } => self.sm.on_passkey_request(&self.events, now, addr),
            HciEvent::UserPasskeyNotification { addr, passkey } => {
                self.sm.on_passkey_notification(&self.events, addr, passkey)
            }
            HciEvent::SimplePairingComplete { addr, status } => self.sm.on_simple_pairing_complete(
                &self.links,
                &self.commands,
                &self.events,
                now,
                addr,
                status,
            ),
            HciEvent::RemoteOobDataRequest { addr } => self.sm.on_oob_request(&self.events, now, addr),
            HciEvent::RemoteNameComplete { addr, status, name } => {
                self.sm.on_name_complete(
                    &self.devices,
                    &self.links,
                    &self.commands,
                    &self.events,
                    now,
                    addr,
                    status,
                    name.as_str(),
                );
                if let Some(idx) = self.devices.find(addr) {
                    self.continue_security(idx, now);
                }
            }
            HciEvent::NumberOfCompletedPackets { handle, packets } => self.links.on_packets_acked(handle, packets),
        }
        self.replay_pending(now);
    }

    fn on_connection_complete(&self, now: Instant, status: HciStatus, handle: ConnHandle, addr: BdAddr) {
        let link = self.links.find_by_addr(addr, Transport::Classic);
        if status == HciStatus::Success {
            let link = link.or_else(|| self.links.allocate(addr, false, Transport::Classic));
            if let Some(link) = link {
                self.links.set_connected(link, handle, now);
                self.commands.push(Command::L2capInfoReq {
                    handle,
                    info_type: INFO_TYPE_EXTENDED_FEATURES,
                });
            }
            if let Some(idx) = self.devices.find_or_alloc(addr) {
                self.devices.with(idx, |rec| rec.classic_handle = Some(handle));
                self.sm.on_connection_complete(
                    &self.devices,
                    &self.links,
                    &self.commands,
                    &self.events,
                    now,
                    addr,
                    status,
                    handle,
                );
                self.continue_security(idx, now);
            }
        } else {
            self.sm.on_connection_complete(
                &self.devices,
                &self.links,
                &self.commands,
                &self.events,
                now,
                addr,
                status,
                handle,
            );
            if let Some(link) = link {
                self.release_link(link);
            }
            if let Some(idx) = self.devices.find(addr) {
                self.devices
                    .mark_disconnected(idx, Transport::Classic, status, &self.events);
            }
        }
    }

    fn on_disconnection(&self, now: Instant, handle: ConnHandle, reason: HciStatus) {
        let link = self.links.find_by_conn(handle);
        let addr = link.and_then(|h| self.links.with(h, |l| l.addr)).flatten();
        let transport = link
            .and_then(|h| self.links.with(h, |l| l.transport))
            .unwrap_or(Transport::Classic);
        if let Some(link) = link {
            self.release_link(link);
        }
        if let Some(idx) = self.devices.find_by_handle(handle, transport) {
            self.devices.mark_disconnected(idx, transport, reason, &self.events);
        }
        if let Some(addr) = addr {
            self.sm
                .on_disconnect(&self.links, &self.commands, &self.events, now, addr);
        }
    }

    // --- timers ---

    pub fn poll_timers(&self, now: Instant) {
        // Collision backoff ran out; retry the blocked procedure.
        if let Some(addr) = self.sm.poll_timers(&self.links, &self.commands, &self.events, now) {
            if let Some(idx) = self.devices.find(addr) {
                let mode = self.config.security_mode;
                let bond_retry = self.sm.pairing_peer() == Some(addr);
                self.devices.with(idx, |rec| {
                    if rec.sec_state == SecState::Idle && (bond_retry || rec.pending.is_some()) {
                        let _ = exec::execute(rec, &self.commands, &self.events, mode);
                    }
                });
            }
        }

        while let Some((link, state)) = self.links.poll_timers(now) {
            match state {
                LinkState::Connected => {
                    // Idle countdown expired.
                    if let Some(conn) = self.links.with(link, |l| l.handle).flatten() {
                        debug!("[link][idle] expired, disconnecting");
                        self.commands.push(Command::Disconnect(conn, HciStatus::PeerUser));
                        self.links.with(link, |l| {
                            l.state = LinkState::Disconnecting;
                            l.link_timer.set(now, LINK_DISCONNECT_TIMEOUT);
                        });
                    } else {
                        self.release_link(link);
                    }
                }
                // The peer never acknowledged the disconnect; drop our side.
                LinkState::Disconnecting => {
                    warn!("[link] disconnect unacknowledged, forcing teardown");
                    self.release_link(link);
                }
                _ => self.release_link(link),
            }
        }

        self.channels.poll_fcr_timers(now);
        self.replay_pending(now);
    }

    // --- internals ---

    fn notify_if_open(&self, chan: ChanHandle) {
        let opened = self.channels.with(chan, |c| {
            (c.state == ChannelState::Open).then_some((c.local_cid, c.psm))
        });
        if let Some(Some((cid, psm))) = opened {
            self.events.push(SecurityEvent::ChannelOpened { cid, psm });
        }
    }

    fn chan_link(&self, chan: ChanHandle) -> Option<LinkHandle> {
        let idx = self.channels.with(chan, |c| c.link).flatten()?;
        self.links.handle_of(idx)
    }

    fn release_link(&self, link: LinkHandle) {
        let echo_waiter = self
            .links
            .with(link, |l| l.echo_pending.then_some(l.addr).flatten())
            .flatten();
        if let Some(addr) = echo_waiter {
            self.events.push(SecurityEvent::EchoComplete { addr, ok: false });
        }
        self.links.release(link, |chan_idx| {
            if let Some(cid) = self.channels.release_by_index(chan_idx, |id| self.pool.free(id)) {
                self.events.push(SecurityEvent::ChannelDisconnected {
                    cid,
                    confirmed: true,
                });
            }
        });
    }

    /// Re-run the execution procedure for a record whose in-flight step just
    /// finished, then deliver the verdict to whoever was waiting: the
    /// pending access token and any channels parked behind the gate.
    fn continue_security(&self, idx: u8, now: Instant) {
        let _ = now;
        let Some(addr) = self.devices.addr_of(idx) else {
            return;
        };
        let link = self.links.find_by_addr(addr, Transport::Classic);
        let has_waiting_chan = link
            .map(|h| self.channels.next_sec_waiting(h.index).is_some())
            .unwrap_or(false);
        let mode = self.config.security_mode;

        let status = self.devices.with(idx, |rec| {
            if rec.sec_state != SecState::Idle || rec.classic_handle.is_none() {
                return None;
            }
            if rec.pending.is_none() && !has_waiting_chan {
                return None;
            }
            Some(exec::execute(rec, &self.commands, &self.events, mode))
        });
        match status {
            None | Some(SecStatus::CmdStarted) => {}
            Some(status) => {
                let success = status.is_success();
                if let Some(pending) = self.devices.with(idx, |rec| rec.pending.take()) {
                    self.events.push(SecurityEvent::AccessComplete {
                        token: pending.token,
                        addr,
                        status,
                    });
                }
                if let Some(link) = link {
                    self.advance_sec_channels(link, success);
                }
            }
        }
    }

    /// A security step failed hard: fail the pending access and every
    /// channel behind the gate.
    fn fail_security(&self, idx: u8, status: SecStatus) {
        let Some(addr) = self.devices.addr_of(idx) else {
            return;
        };
        if let Some(pending) = self.devices.with(idx, |rec| rec.pending.take()) {
            self.events.push(SecurityEvent::AccessComplete {
                token: pending.token,
                addr,
                status,
            });
        }
        if let Some(link) = self.links.find_by_addr(addr, Transport::Classic) {
            self.advance_sec_channels(link, false);
        }
    }

    /// Move channels parked behind the security gate forward (or tear them
    /// down on a failed gate).
    fn advance_sec_channels(&self, link: LinkHandle, success: bool) {
        let Some(conn) = self.links.with(link, |l| l.handle).flatten() else {
            return;
        };
        while let Some(chan) = self.channels.next_sec_waiting(link.index) {
            let Some((orig, local_cid, remote_cid, psm)) = self.channels.with(chan, |c| {
                (
                    c.state == ChannelState::OrigWaitSecComp,
                    c.local_cid,
                    c.remote_cid,
                    c.psm,
                )
            }) else {
                break;
            };
            if success {
                if orig {
                    self.commands.push(Command::L2capConnectReq {
                        handle: conn,
                        psm,
                        scid: local_cid,
                    });
                    self.channels.with(chan, |c| c.state = ChannelState::WaitConnectRsp);
                } else {
                    self.commands.push(Command::L2capConnectRsp {
                        handle: conn,
                        dcid: local_cid,
                        scid: remote_cid,
                        result: CONN_RESULT_OK,
                    });
                    if let Some(cfg) = self.channels.process_our_cfg_req(chan) {
                        self.commands.push(Command::L2capConfigReq {
                            handle: conn,
                            dcid: remote_cid,
                            config: cfg,
                        });
                    }
                }
            } else {
                if !orig {
                    self.commands.push(Command::L2capConnectRsp {
                        handle: conn,
                        dcid: 0,
                        scid: remote_cid,
                        result: CONN_RESULT_SECURITY_BLOCK,
                    });
                }
                self.channels.release(chan, &self.links, |id| self.pool.free(id));
                self.events.push(SecurityEvent::ChannelDisconnected {
                    cid: local_cid,
                    confirmed: true,
                });
            }
        }
    }

    /// The last dynamic channel on a link closed: consult the fixed-channel
    /// timeouts and arm (or skip) the idle countdown.
    fn maybe_idle(&self, link: LinkHandle, now: Instant) {
        if self.links.dynamic_channel_count(link) > 0 {
            return;
        }
        let Some(fixed) = self.links.with(link, |l| l.fixed) else {
            return;
        };
        let fixed_idle = self.channels.fixed_idle(fixed);
        self.links.idle_check(link, fixed_idle, now, &self.commands);
    }

    /// Replay requests parked behind a pairing session that just ended.
    fn replay_pending(&self, now: Instant) {
        while self.sm.is_idle() {
            let Some(req) = self.sm.take_pending() else {
                break;
            };
            debug!("[sec][access] replaying deferred token {}", req.token);
            // A multiplexed request must land back on the exact service it
            // targeted, not on whichever record owns the PSM.
            let status = match req.mx {
                Some((proto, chan)) => {
                    self.mx_access_request(now, req.addr, req.psm, req.is_originator, proto, chan, req.token)
                }
                None => self.l2cap_access_req(now, req.addr, req.psm, req.is_originator, req.token),
            };
            if status != SecStatus::CmdStarted {
                self.events.push(SecurityEvent::AccessComplete {
                    token: req.token,
                    addr: req.addr,
                    status,
                });
            }
        }
    }
}
