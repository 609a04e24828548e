//! Pairing session state machine.
//!
//! At most one pairing session exists at a time. The session walks a fixed
//! set of states from dedicated-bonding kickoff (or a peer-initiated
//! exchange) through PIN or simple-pairing negotiation to the
//! authentication-complete verdict, with a single timer covering every
//! non-idle state. Requests arriving while a session is live are parked in a
//! FIFO and replayed when the session ends.
//!
//! LMP transaction collisions get a delayed retry inside a bounded window;
//! a missing-key failure gets exactly one retry with the stale key dropped.

pub mod exec;

use core::cell::RefCell;

use bt_hci::param::{BdAddr, ConnHandle};
use embassy_time::Instant;
use heapless::{Deque, Vec};

use crate::alarm::Alarm;
use crate::command::{Command, CommandSink};
use crate::config::{
    COLLISION_RETRY_DELAY, LINK_DISCONNECT_TIMEOUT, MAX_COLLISION_WINDOW, PAIRING_TIMEOUT, PIN_CODE_LEN,
    SEC_PENDING_QUEUE_SIZE,
};
use crate::dev_rec::{DeviceStore, SecState};
use crate::event::{EventSink, SecurityEvent};
use crate::link_manager::{LinkManager, LinkState};
use crate::types::security::{IoCapability, LinkKey, LinkKeyType, SecurityMode, SecurityRequirements};
use crate::types::status::{HciStatus, SecStatus};
use crate::types::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PairingState {
    Idle,
    /// Fetching the peer name before anything user-visible happens.
    GetRemName,
    /// Waiting for the local user to supply a PIN.
    WaitLocalPin,
    /// Waiting for the local user to confirm the numeric comparison value.
    WaitNumericConfirm,
    /// Waiting for the local user to type the passkey.
    KeyEntry,
    /// Waiting for the local OOB data reply.
    WaitLocalOobRsp,
    /// Waiting for the local IO capability reply.
    WaitLocalIoCaps,
    /// Peer-initiated simple pairing in progress.
    IncomingSsp,
    WaitAuthComplete,
    /// Bond finished, waiting for the link to drop.
    WaitDisconnect,
}

/// Session flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PairingFlags(u8);

impl PairingFlags {
    pub const WE_STARTED_DD: PairingFlags = PairingFlags(0x01);
    pub const PEER_STARTED_DD: PairingFlags = PairingFlags(0x02);
    /// Drop the link when the bond completes; set when we raised it just to
    /// pair.
    pub const DISC_WHEN_DONE: PairingFlags = PairingFlags(0x04);
    pub const PIN_REQD: PairingFlags = PairingFlags(0x08);
    /// A PIN was supplied up front with the bond call.
    pub const PRE_FETCH_PIN: PairingFlags = PairingFlags(0x10);
    pub const REJECTED_CONNECT: PairingFlags = PairingFlags(0x20);
    /// Cancellation requested mid-authentication; resolved by the pending
    /// authentication-complete event.
    pub const WE_CANCEL_DD: PairingFlags = PairingFlags(0x40);
    pub const LE_ACTIVE: PairingFlags = PairingFlags(0x80);

    pub const fn contains(self, other: PairingFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PairingFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PairingFlags) {
        self.0 &= !other.0;
    }
}

/// A gated request parked while a pairing session holds the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub addr: BdAddr,
    pub token: u32,
    pub service_id: u8,
    pub psm: u16,
    pub is_originator: bool,
    /// Multiplexer (protocol id, channel id) when the request targeted a
    /// specific service sharing the PSM; replay must hit the same one.
    pub mx: Option<(u32, u32)>,
}

/// What the dispatch context owes the record after an authentication
/// verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuthOutcome {
    /// Authenticated; re-run the security procedure for the record.
    Resume,
    /// A retry is already scheduled (collision delay or key-missing rerun);
    /// leave the record alone.
    RetryScheduled,
    /// Hard failure; anything gated on this record must be failed.
    Failed,
}

struct Session {
    state: PairingState,
    flags: PairingFlags,
    peer: Option<BdAddr>,
    pin: Vec<u8, PIN_CODE_LEN>,
    timer: Alarm,
    /// First collision seen for the current exchange; bounds the retries.
    collision_start: Option<Instant>,
    collision_timer: Alarm,
    collision_addr: Option<BdAddr>,
    pending: Deque<PendingRequest, SEC_PENDING_QUEUE_SIZE>,
}

/// The pairing state machine.
pub struct SecurityManager {
    mode: SecurityMode,
    io_cap: IoCapability,
    session: RefCell<Session>,
}

impl SecurityManager {
    pub fn new(mode: SecurityMode, io_cap: IoCapability) -> Self {
        Self {
            mode,
            io_cap,
            session: RefCell::new(Session {
                state: PairingState::Idle,
                flags: PairingFlags::default(),
                peer: None,
                pin: Vec::new(),
                timer: Alarm::NEW,
                collision_start: None,
                collision_timer: Alarm::NEW,
                collision_addr: None,
                pending: Deque::new(),
            }),
        }
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    pub fn is_idle(&self) -> bool {
        self.session.borrow().state == PairingState::Idle
    }

    pub fn pairing_peer(&self) -> Option<BdAddr> {
        let session = self.session.borrow();
        (session.state != PairingState::Idle).then_some(session.peer).flatten()
    }

    /// Park a request behind the live session. False when the queue is full.
    pub fn push_pending(&self, req: PendingRequest) -> bool {
        self.session.borrow_mut().pending.push_back(req).is_ok()
    }

    /// Requests are replayed in arrival order once the session ends.
    pub fn take_pending(&self) -> Option<PendingRequest> {
        self.session.borrow_mut().pending.pop_front()
    }

    fn change_state(&self, to: PairingState, now: Instant) {
        let mut session = self.session.borrow_mut();
        trace!("[sec][pair] {:?} -> {:?}", session.state, to);
        session.state = to;
        if to == PairingState::Idle {
            session.timer.cancel();
            session.flags = PairingFlags::default();
            session.pin.clear();
            session.peer = None;
        } else {
            // Every non-idle state restarts the one pairing timer.
            session.timer.set(now, PAIRING_TIMEOUT);
        }
    }

    /// End the session: exactly one completion event per bond attempt, link
    /// bonding flag dropped, optional teardown of a link we only raised to
    /// pair.
    fn complete(&self, links: &LinkManager, commands: &CommandSink, events: &EventSink, now: Instant, status: SecStatus) {
        let (addr, disc_when_done, started) = {
            let session = self.session.borrow();
            (
                session.peer,
                session.flags.contains(PairingFlags::DISC_WHEN_DONE),
                session
                    .flags
                    .contains(PairingFlags::WE_STARTED_DD)
                    || session.flags.contains(PairingFlags::PEER_STARTED_DD),
            )
        };
        let Some(addr) = addr else {
            self.change_state(PairingState::Idle, now);
            return;
        };
        if started {
            events.push(SecurityEvent::BondComplete { addr, status });
        }
        links.clear_bonding(addr, Transport::Classic);
        if disc_when_done {
            if let Some(h) = links.find_by_addr(addr, Transport::Classic) {
                if let Some(conn) = links.with(h, |l| l.handle).flatten() {
                    commands.push(Command::Disconnect(conn, HciStatus::PeerUser));
                    links.with(h, |l| {
                        l.state = LinkState::Disconnecting;
                        l.link_timer.set(now, LINK_DISCONNECT_TIMEOUT);
                    });
                    self.change_state(PairingState::WaitDisconnect, now);
                    // The completion already fired; only the teardown is
                    // still outstanding, so the session must never complete
                    // a second time.
                    let mut session = self.session.borrow_mut();
                    session.flags.remove(PairingFlags::WE_STARTED_DD);
                    session.flags.remove(PairingFlags::PEER_STARTED_DD);
                    return;
                }
            }
        }
        self.change_state(PairingState::Idle, now);
    }

    /// Start dedicated bonding with `addr`. A PIN supplied here is replayed
    /// automatically when the controller asks for it.
    pub fn bond(
        &self,
        store: &DeviceStore,
        links: &LinkManager,
        commands: &CommandSink,
        now: Instant,
        addr: BdAddr,
        pin: Option<&[u8]>,
    ) -> SecStatus {
        if !self.is_idle() {
            warn!("[sec][bond] session already active");
            return SecStatus::Busy;
        }
        let Some(idx) = store.find_or_alloc(addr) else {
            return SecStatus::NoResources;
        };
        let name_known = store.with(idx, |rec| {
            rec.is_originator = true;
            rec.security_required.insert(SecurityRequirements::OUT_AUTHENTICATE);
            rec.key_missing_retried = false;
            rec.name_known
        });

        {
            let mut session = self.session.borrow_mut();
            session.peer = Some(addr);
            session.flags = PairingFlags::default();
            session.flags.insert(PairingFlags::WE_STARTED_DD);
            session.pin.clear();
            if let Some(pin) = pin {
                if pin.len() > PIN_CODE_LEN {
                    session.peer = None;
                    return SecStatus::IllegalValue;
                }
                let _ = session.pin.extend_from_slice(pin);
                session.flags.insert(PairingFlags::PRE_FETCH_PIN);
            }
        }

        if links.update_for_bonding(addr, Transport::Classic) {
            if name_known {
                if let Some(handle) = store.with(idx, |rec| rec.classic_handle) {
                    commands.push(Command::AuthRequest(handle));
                    store.with(idx, |rec| rec.sec_state = SecState::Authenticating);
                    self.change_state(PairingState::WaitAuthComplete, now);
                    return SecStatus::CmdStarted;
                }
            }
            commands.push(Command::RemoteNameRequest(addr));
            store.with(idx, |rec| rec.sec_state = SecState::GettingName);
            self.change_state(PairingState::GetRemName, now);
        } else {
            // No link yet: raise one just for the bond and drop it after.
            commands.push(Command::CreateConnection(addr));
            self.session.borrow_mut().flags.insert(PairingFlags::DISC_WHEN_DONE);
            self.change_state(PairingState::GetRemName, now);
        }
        SecStatus::CmdStarted
    }

    /// Cancel an in-flight bond. What that means depends on how far the
    /// session got.
    pub fn bond_cancel(
        &self,
        links: &LinkManager,
        commands: &CommandSink,
        events: &EventSink,
        now: Instant,
        addr: BdAddr,
    ) -> SecStatus {
        let (state, peer, le_active) = {
            let session = self.session.borrow();
            (
                session.state,
                session.peer,
                session.flags.contains(PairingFlags::LE_ACTIVE),
            )
        };
        if peer != Some(addr) {
            return SecStatus::UnknownAddr;
        }
        match state {
            PairingState::Idle => SecStatus::WrongMode,
            PairingState::GetRemName => {
                commands.push(Command::RemoteNameRequestCancel(addr));
                if self.session.borrow().flags.contains(PairingFlags::DISC_WHEN_DONE) {
                    commands.push(Command::CreateConnectionCancel(addr));
                }
                self.complete(links, commands, events, now, SecStatus::Hci(HciStatus::PeerUser));
                SecStatus::Success
            }
            PairingState::WaitLocalPin => {
                commands.push(Command::PinCodeNegReply(addr));
                self.change_state(PairingState::WaitAuthComplete, now);
                SecStatus::CmdStarted
            }
            PairingState::WaitNumericConfirm => {
                commands.push(Command::UserConfirmReply(addr, false));
                self.change_state(PairingState::WaitAuthComplete, now);
                SecStatus::CmdStarted
            }
            PairingState::KeyEntry => {
                commands.push(Command::PasskeyNegReply(addr));
                self.change_state(PairingState::WaitAuthComplete, now);
                SecStatus::CmdStarted
            }
            PairingState::WaitLocalOobRsp => {
                commands.push(Command::RemoteOobNegReply(addr));
                self.change_state(PairingState::WaitAuthComplete, now);
                SecStatus::CmdStarted
            }
            PairingState::WaitLocalIoCaps => {
                commands.push(Command::IoCapNegReply(addr, HciStatus::PairingNotAllowed));
                self.change_state(PairingState::WaitAuthComplete, now);
                SecStatus::CmdStarted
            }
            _ => {
                if le_active {
                    commands.push(Command::CancelLePairing(addr));
                } else {
                    // Nothing to abort directly; flag it and let the pending
                    // authentication-complete deliver the verdict.
                    self.session.borrow_mut().flags.insert(PairingFlags::WE_CANCEL_DD);
                }
                SecStatus::CmdStarted
            }
        }
    }

    // --- controller event handlers, called by the dispatch context ---

    /// Connection outcome for the pairing peer.
    pub fn on_connection_complete(
        &self,
        store: &DeviceStore,
        links: &LinkManager,
        commands: &CommandSink,
        events: &EventSink,
        now: Instant,
        addr: BdAddr,
        status: HciStatus,
        handle: ConnHandle,
    ) {
        if self.pairing_peer() != Some(addr) {
            return;
        }
        if status != HciStatus::Success {
            self.complete(links, commands, events, now, SecStatus::Hci(status));
            return;
        }
        let Some(idx) = store.find(addr) else { return };
        links.update_for_bonding(addr, Transport::Classic);
        let name_known = store.with(idx, |rec| {
            rec.classic_handle = Some(handle);
            rec.name_known
        });
        if name_known {
            commands.push(Command::AuthRequest(handle));
            store.with(idx, |rec| rec.sec_state = SecState::Authenticating);
            self.change_state(PairingState::WaitAuthComplete, now);
        } else {
            commands.push(Command::RemoteNameRequest(addr));
            store.with(idx, |rec| rec.sec_state = SecState::GettingName);
            self.change_state(PairingState::GetRemName, now);
        }
    }

    /// Remote name arrived (or failed). Advances a name-gated session.
    pub fn on_name_complete(
        &self,
        store: &DeviceStore,
        links: &LinkManager,
        commands: &CommandSink,
        events: &EventSink,
        now: Instant,
        addr: BdAddr,
        status: HciStatus,
        name: &str,
    ) {
        if let Some(idx) = store.find(addr) {
            store.with(idx, |rec| {
                if status == HciStatus::Success {
                    rec.name = crate::dev_rec::copy_device_name(name);
                    rec.name_known = true;
                }
                if rec.sec_state == SecState::GettingName {
                    rec.sec_state = SecState::Idle;
                }
            });
        }
        if self.pairing_peer() != Some(addr) || self.session.borrow().state != PairingState::GetRemName {
            return;
        }
        if status != HciStatus::Success {
            self.complete(links, commands, events, now, SecStatus::Hci(status));
            return;
        }
        let handle = store.find(addr).and_then(|idx| store.with(idx, |rec| rec.classic_handle));
        match handle {
            Some(handle) => {
                commands.push(Command::AuthRequest(handle));
                if let Some(idx) = store.find(addr) {
                    store.with(idx, |rec| rec.sec_state = SecState::Authenticating);
                }
                self.change_state(PairingState::WaitAuthComplete, now);
            }
            // Name came over a baseband page without an ACL; wait for the
            // connection we asked for.
            None => self.change_state(PairingState::GetRemName, now),
        }
    }

    /// Controller wants a PIN. A pre-fetched PIN answers immediately,
    /// otherwise the user is asked.
    pub fn on_pin_code_request(
        &self,
        store: &DeviceStore,
        commands: &CommandSink,
        events: &EventSink,
        now: Instant,
        addr: BdAddr,
    ) {
        if self.is_idle() {
            // Peer-initiated legacy pairing.
            let mut session = self.session.borrow_mut();
            session.peer = Some(addr);
            session.flags.insert(PairingFlags::PEER_STARTED_DD);
        }
        let min_16_digit = store
            .find(addr)
            .map(|idx| {
                store.with(idx, |rec| {
                    rec.security_required.contains(SecurityRequirements::IN_MIN_16_DIGIT_PIN)
                })
            })
            .unwrap_or(false);

        let prefetched = {
            let session = self.session.borrow();
            session
                .flags
                .contains(PairingFlags::PRE_FETCH_PIN)
                .then(|| session.pin.clone())
        };
        match prefetched {
            Some(pin) if !pin.is_empty() => {
                if let Some(idx) = store.find(addr) {
                    store.with(idx, |rec| rec.pin_code_len = pin.len() as u8);
                }
                commands.push(Command::PinCodeReply(addr, pin));
                self.change_state(PairingState::WaitAuthComplete, now);
            }
            _ => {
                events.push(SecurityEvent::PinRequest { addr, min_16_digit });
                self.change_state(PairingState::WaitLocalPin, now);
            }
        }
    }

    /// User answered the PIN prompt.
    pub fn pin_code_reply(
        &self,
        store: &DeviceStore,
        commands: &CommandSink,
        now: Instant,
        addr: BdAddr,
        pin: Option<&[u8]>,
    ) -> SecStatus {
        if self.session.borrow().state != PairingState::WaitLocalPin || self.pairing_peer() != Some(addr) {
            return SecStatus::WrongMode;
        }
        match pin {
            Some(pin) if !pin.is_empty() && pin.len() <= PIN_CODE_LEN => {
                if let Some(idx) = store.find(addr) {
                    store.with(idx, |rec| rec.pin_code_len = pin.len() as u8);
                }
                let mut code = Vec::new();
                let _ = code.extend_from_slice(pin);
                commands.push(Command::PinCodeReply(addr, code));
            }
            Some(_) => return SecStatus::IllegalValue,
            None => commands.push(Command::PinCodeNegReply(addr)),
        }
        self.change_state(PairingState::WaitAuthComplete, now);
        SecStatus::Success
    }

    /// Controller wants our IO capabilities for simple pairing.
    pub fn on_io_cap_request(&self, store: &DeviceStore, commands: &CommandSink, now: Instant, addr: BdAddr) {
        if self.is_idle() {
            let mut session = self.session.borrow_mut();
            session.peer = Some(addr);
            session.flags.insert(PairingFlags::PEER_STARTED_DD);
        }
        let mitm = self.mode.implies_mitm()
            || store
                .find(addr)
                .map(|idx| {
                    store.with(idx, |rec| {
                        rec.security_required
                            .intersects(SecurityRequirements::IN_MITM.union(SecurityRequirements::OUT_MITM))
                    })
                })
                .unwrap_or(false);
        commands.push(Command::IoCapReply {
            addr,
            io_cap: self.io_cap,
            oob_present: false,
            mitm,
        });
        let to = if self.session.borrow().flags.contains(PairingFlags::PEER_STARTED_DD) {
            PairingState::IncomingSsp
        } else {
            PairingState::WaitAuthComplete
        };
        self.change_state(to, now);
    }

    pub fn on_io_cap_response(&self, store: &DeviceStore, addr: BdAddr, io_cap: IoCapability) {
        if let Some(idx) = store.find(addr) {
            store.with(idx, |rec| {
                rec.peer_io_cap = Some(io_cap);
                rec.sm4_known = true;
            });
        }
    }

    pub fn on_user_confirm_request(&self, events: &EventSink, now: Instant, addr: BdAddr, numeric_value: u32) {
        events.push(SecurityEvent::ConfirmRequest { addr, numeric_value });
        self.change_state(PairingState::WaitNumericConfirm, now);
    }

    pub fn confirm_req_reply(&self, commands: &CommandSink, now: Instant, addr: BdAddr, accept: bool) -> SecStatus {
        if self.session.borrow().state != PairingState::WaitNumericConfirm {
            return SecStatus::WrongMode;
        }
        commands.push(Command::UserConfirmReply(addr, accept));
        self.change_state(PairingState::WaitAuthComplete, now);
        SecStatus::Success
    }

    pub fn on_passkey_request(&self, events: &EventSink, now: Instant, addr: BdAddr) {
        events.push(SecurityEvent::PasskeyRequest { addr });
        self.change_state(PairingState::KeyEntry, now);
    }

    pub fn passkey_reply(&self, commands: &CommandSink, now: Instant, addr: BdAddr, passkey: Option<u32>) -> SecStatus {
        if self.session.borrow().state != PairingState::KeyEntry {
            return SecStatus::WrongMode;
        }
        match passkey {
            Some(passkey) if passkey <= 999_999 => commands.push(Command::PasskeyReply(addr, passkey)),
            Some(_) => return SecStatus::IllegalValue,
            None => commands.push(Command::PasskeyNegReply(addr)),
        }
        self.change_state(PairingState::WaitAuthComplete, now);
        SecStatus::Success
    }

    pub fn on_passkey_notification(&self, events: &EventSink, addr: BdAddr, passkey: u32) {
        events.push(SecurityEvent::PasskeyNotification { addr, passkey });
    }

    pub fn on_oob_request(&self, events: &EventSink, now: Instant, addr: BdAddr) {
        events.push(SecurityEvent::OobRequest { addr });
        self.change_state(PairingState::WaitLocalOobRsp, now);
    }

    pub fn oob_reply(
        &self,
        commands: &CommandSink,
        now: Instant,
        addr: BdAddr,
        data: Option<([u8; 16], [u8; 16])>,
    ) -> SecStatus {
        if self.session.borrow().state != PairingState::WaitLocalOobRsp {
            return SecStatus::WrongMode;
        }
        match data {
            Some((c, r)) => commands.push(Command::RemoteOobReply(addr, c, r)),
            None => commands.push(Command::RemoteOobNegReply(addr)),
        }
        self.change_state(PairingState::WaitAuthComplete, now);
        SecStatus::Success
    }

    /// Simple pairing ran its course; a failure here aborts the session
    /// without waiting for the authentication verdict.
    pub fn on_simple_pairing_complete(
        &self,
        links: &LinkManager,
        commands: &CommandSink,
        events: &EventSink,
        now: Instant,
        addr: BdAddr,
        status: HciStatus,
    ) {
        if status == HciStatus::Success || self.pairing_peer() != Some(addr) {
            return;
        }
        self.complete(links, commands, events, now, SecStatus::Hci(status));
    }

    /// A new link key materialized. Stored on the record and handed upward
    /// for persistence.
    pub fn on_link_key_notification(&self, store: &DeviceStore, events: &EventSink, addr: BdAddr, key: LinkKey) {
        let Some(idx) = store.find_or_alloc(addr) else {
            warn!("[sec][key] no record space for {:?}", addr);
            return;
        };
        store.with(idx, |rec| {
            rec.link_key = Some(key);
            rec.classic.link_key_known = true;
            rec.classic.link_key_authed = !key.key_type.is_unauthenticated()
                && key.key_type != LinkKeyType::DebugCombination;
            // A combination key from a full-length PIN counts as strong
            // authentication for 16-digit services.
            if key.key_type == LinkKeyType::Combination && rec.pin_code_len as usize >= PIN_CODE_LEN {
                rec.pin16_authed = true;
            }
        });
        events.push(SecurityEvent::LinkKeyUpdate { addr, key });
    }

    /// Controller asked for a stored key.
    pub fn on_link_key_request(&self, store: &DeviceStore, commands: &CommandSink, addr: BdAddr) {
        let key = store
            .find(addr)
            .and_then(|idx| store.with(idx, |rec| rec.link_key.map(|k| k.key)));
        match key {
            Some(key) => commands.push(Command::LinkKeyReply(addr, key)),
            None => commands.push(Command::LinkKeyNegReply(addr)),
        }
    }

    /// The authentication verdict. Success finishes a bond; a collision is
    /// retried after a delay while inside the window; a missing key gets one
    /// clean retry; anything else is a failure.
    #[allow(clippy::too_many_arguments)]
    pub fn on_auth_complete(
        &self,
        store: &DeviceStore,
        links: &LinkManager,
        commands: &CommandSink,
        events: &EventSink,
        now: Instant,
        handle: ConnHandle,
        status: HciStatus,
    ) -> AuthOutcome {
        let Some(idx) = store.find_by_handle(handle, Transport::Classic) else {
            return AuthOutcome::Failed;
        };
        let addr = store.addr_of(idx);
        let pairing = addr.is_some() && self.pairing_peer() == addr;

        if status == HciStatus::Success {
            store.with(idx, |rec| {
                rec.classic.authenticated = true;
                rec.key_missing_retried = false;
                if rec.sec_state == SecState::Authenticating {
                    rec.sec_state = SecState::Idle;
                }
            });
            self.session.borrow_mut().collision_start = None;
            if pairing {
                self.complete(links, commands, events, now, SecStatus::Success);
            }
            return AuthOutcome::Resume;
        }

        if status.is_collision() {
            let mut session = self.session.borrow_mut();
            let start = *session.collision_start.get_or_insert(now);
            if now - start <= MAX_COLLISION_WINDOW {
                debug!("[sec][auth] collision, retrying after delay");
                session.collision_timer.set(now, COLLISION_RETRY_DELAY);
                session.collision_addr = addr;
                drop(session);
                store.with(idx, |rec| {
                    if rec.sec_state == SecState::Authenticating {
                        rec.sec_state = SecState::Idle;
                    }
                });
                return AuthOutcome::RetryScheduled;
            }
            // Out of patience; fall through as a hard failure.
            session.collision_start = None;
            session.collision_timer.cancel();
            session.collision_addr = None;
        }

        if status == HciStatus::PinOrKeyMissing {
            let retry = store.with(idx, |rec| {
                if rec.key_missing_retried {
                    false
                } else {
                    rec.key_missing_retried = true;
                    rec.link_key = None;
                    rec.classic.link_key_known = false;
                    rec.classic.link_key_authed = false;
                    true
                }
            });
            if retry {
                debug!("[sec][auth] peer lost our key, retrying once without it");
                commands.push(Command::AuthRequest(handle));
                return AuthOutcome::RetryScheduled;
            }
        }

        store.with(idx, |rec| {
            rec.classic.authenticated = false;
            if rec.sec_state == SecState::Authenticating {
                rec.sec_state = SecState::Idle;
            }
        });
        if pairing {
            self.complete(links, commands, events, now, SecStatus::Hci(status));
        }
        if let Some(addr) = addr {
            if let Some(fired) = store.with(idx, |rec| rec.pending.take()) {
                events.push(SecurityEvent::AccessComplete {
                    token: fired.token,
                    addr,
                    status: SecStatus::Hci(status),
                });
            }
        }
        AuthOutcome::Failed
    }

    /// Encryption toggled on a link.
    pub fn on_encryption_change(
        &self,
        store: &DeviceStore,
        events: &EventSink,
        handle: ConnHandle,
        status: HciStatus,
        enabled: bool,
    ) -> bool {
        let Some(idx) = store.find_by_handle(handle, Transport::Classic) else {
            return false;
        };
        let addr = store.with(idx, |rec| {
            rec.classic.encrypted = status == HciStatus::Success && enabled;
            if rec.sec_state == SecState::Encrypting {
                rec.sec_state = SecState::Idle;
            }
            rec.addr
        });
        if let Some(addr) = addr {
            events.push(SecurityEvent::EncryptionChanged {
                addr,
                transport: Transport::Classic,
                enabled: status == HciStatus::Success && enabled,
            });
        }
        status == HciStatus::Success
    }

    /// Authorization verdict from the application.
    pub fn authorize_reply(&self, store: &DeviceStore, addr: BdAddr, granted: bool, trust: bool) -> bool {
        let Some(idx) = store.find(addr) else {
            return false;
        };
        store.with(idx, |rec| {
            if rec.sec_state == SecState::Authorizing {
                rec.sec_state = SecState::Idle;
            }
            if granted {
                rec.classic.authorized = true;
                let service_id = rec.cur_service_id.unwrap_or(0);
                rec.last_author_service_id = Some(service_id);
                if trust && service_id < 64 {
                    rec.trusted_mask |= 1u64 << service_id;
                }
            }
        });
        granted
    }

    /// Drive the pairing and collision timers. Returns the peer whose
    /// security procedure should be retried after a collision delay.
    pub fn poll_timers(
        &self,
        links: &LinkManager,
        commands: &CommandSink,
        events: &EventSink,
        now: Instant,
    ) -> Option<BdAddr> {
        let retry = {
            let mut session = self.session.borrow_mut();
            if session.collision_timer.expired(now) {
                session.collision_addr.take()
            } else {
                None
            }
        };
        if retry.is_some() {
            return retry;
        }

        let (expired, state, peer) = {
            let mut session = self.session.borrow_mut();
            (session.timer.expired(now), session.state, session.peer)
        };
        if !expired || state == PairingState::Idle {
            return None;
        }
        warn!("[sec][pair] timeout in {:?}", state);
        if state == PairingState::WaitDisconnect {
            // The bond already completed; stop waiting for the teardown to
            // be acknowledged. The link timer finishes the job.
            self.change_state(PairingState::Idle, now);
            return None;
        }
        if let Some(addr) = peer {
            // The peer (or the user) stopped responding; answer whatever is
            // outstanding in the negative before tearing the session down.
            match state {
                PairingState::WaitLocalPin => commands.push(Command::PinCodeNegReply(addr)),
                PairingState::WaitNumericConfirm => commands.push(Command::UserConfirmReply(addr, false)),
                PairingState::KeyEntry => commands.push(Command::PasskeyNegReply(addr)),
                PairingState::WaitLocalOobRsp => commands.push(Command::RemoteOobNegReply(addr)),
                PairingState::WaitLocalIoCaps => {
                    commands.push(Command::IoCapNegReply(addr, HciStatus::HostBusyPairing))
                }
                PairingState::GetRemName => commands.push(Command::RemoteNameRequestCancel(addr)),
                _ => {}
            }
        }
        self.complete(links, commands, events, now, SecStatus::Hci(HciStatus::ConnectionTimeout));
        None
    }

    /// The pairing peer's link went away.
    pub fn on_disconnect(&self, links: &LinkManager, commands: &CommandSink, events: &EventSink, now: Instant, addr: BdAddr) {
        let state = self.session.borrow().state;
        if self.session.borrow().peer != Some(addr) {
            return;
        }
        match state {
            PairingState::Idle => {}
            PairingState::WaitDisconnect => self.change_state(PairingState::Idle, now),
            _ => self.complete(links, commands, events, now, SecStatus::Hci(HciStatus::ConnectionTimeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_time::Duration;

    use super::*;
    use crate::dev_rec::DeviceRecord;
    use crate::link_manager::LinkStorage;

    const ADDR: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    struct Fixture<'d> {
        store: DeviceStore<'d>,
        links: LinkManager<'d>,
        commands: CommandSink,
        events: EventSink,
        sm: SecurityManager,
    }

    fn fixture<'d>(records: &'d mut [DeviceRecord], links: &'d mut [LinkStorage]) -> Fixture<'d> {
        Fixture {
            store: DeviceStore::new(records),
            links: LinkManager::new(links, 8, 4),
            commands: CommandSink::new(),
            events: EventSink::new(),
            sm: SecurityManager::new(SecurityMode::SimplePairing, IoCapability::DisplayYesNo),
        }
    }

    fn drain_commands(f: &Fixture) {
        while f.commands.try_take().is_some() {}
    }

    /// Bring up a connected, named peer and start a bond on it.
    fn bonded_setup(f: &Fixture, now: Instant) -> ConnHandle {
        let conn = ConnHandle::new(4);
        let link = unwrap!(f.links.allocate(BdAddr::new(ADDR), false, Transport::Classic));
        f.links.set_connected(link, conn, now);
        let idx = unwrap!(f.store.find_or_alloc(BdAddr::new(ADDR)));
        f.store.with(idx, |rec| {
            rec.classic_handle = Some(conn);
            rec.name_known = true;
        });
        assert_eq!(
            f.sm.bond(&f.store, &f.links, &f.commands, now, BdAddr::new(ADDR), None),
            SecStatus::CmdStarted
        );
        assert!(matches!(f.commands.try_take(), Some(Command::AuthRequest(_))));
        conn
    }

    #[test]
    fn second_bond_rejected_while_active() {
        let t0 = Instant::from_ticks(0);
        let mut records = [DeviceRecord::NEW, DeviceRecord::NEW];
        let mut links = [LinkStorage::DISCONNECTED];
        let f = fixture(&mut records, &mut links);

        bonded_setup(&f, t0);
        assert_eq!(
            f.sm.bond(
                &f.store,
                &f.links,
                &f.commands,
                t0,
                BdAddr::new([9, 9, 9, 9, 9, 9]),
                None
            ),
            SecStatus::Busy
        );
    }

    #[test]
    fn bond_completes_exactly_once() {
        let t0 = Instant::from_ticks(0);
        let mut records = [DeviceRecord::NEW];
        let mut links = [LinkStorage::DISCONNECTED];
        let f = fixture(&mut records, &mut links);

        let conn = bonded_setup(&f, t0);
        f.sm.on_auth_complete(&f.store, &f.links, &f.commands, &f.events, t0, conn, HciStatus::Success);

        match f.events.try_take() {
            Some(SecurityEvent::BondComplete { status, .. }) => assert_eq!(status, SecStatus::Success),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(f.events.try_take().is_none());
        assert!(f.sm.is_idle());

        // A stray duplicate verdict must not produce a second completion.
        f.sm.on_auth_complete(&f.store, &f.links, &f.commands, &f.events, t0, conn, HciStatus::Success);
        assert!(f.events.try_take().is_none());
    }

    #[test]
    fn teardown_wait_timeout_completes_once() {
        let t0 = Instant::from_ticks(0);
        let mut records = [DeviceRecord::NEW];
        let mut links = [LinkStorage::DISCONNECTED];
        let f = fixture(&mut records, &mut links);
        let addr = BdAddr::new(ADDR);

        // No link yet: the bond raises one and owes a teardown afterwards.
        assert_eq!(
            f.sm.bond(&f.store, &f.links, &f.commands, t0, addr, None),
            SecStatus::CmdStarted
        );
        drain_commands(&f);

        let conn = ConnHandle::new(4);
        let link = unwrap!(f.links.allocate(addr, false, Transport::Classic));
        f.links.set_connected(link, conn, t0);
        f.sm.on_connection_complete(&f.store, &f.links, &f.commands, &f.events, t0, addr, HciStatus::Success, conn);
        f.sm.on_name_complete(&f.store, &f.links, &f.commands, &f.events, t0, addr, HciStatus::Success, "headset");
        drain_commands(&f);

        f.sm.on_auth_complete(&f.store, &f.links, &f.commands, &f.events, t0, conn, HciStatus::Success);
        match f.events.try_take() {
            Some(SecurityEvent::BondComplete { status, .. }) => assert_eq!(status, SecStatus::Success),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(f.commands.try_take(), Some(Command::Disconnect(_, _))));

        // The peer never acknowledges the teardown. The timeout drops the
        // session without a second completion.
        let late = t0 + PAIRING_TIMEOUT + Duration::from_secs(1);
        assert_eq!(f.sm.poll_timers(&f.links, &f.commands, &f.events, late), None);
        assert!(f.events.try_take().is_none());
        assert!(f.sm.is_idle());
    }

    #[test]
    fn collision_retried_inside_window_only() {
        let t0 = Instant::from_ticks(0);
        let mut records = [DeviceRecord::NEW];
        let mut links = [LinkStorage::DISCONNECTED];
        let f = fixture(&mut records, &mut links);

        let conn = bonded_setup(&f, t0);
        assert_eq!(
            f.sm.on_auth_complete(
                &f.store,
                &f.links,
                &f.commands,
                &f.events,
                t0,
                conn,
                HciStatus::LmpErrTransactionCollision,
            ),
            AuthOutcome::RetryScheduled
        );
        // No verdict yet; a delayed retry is scheduled instead.
        assert!(f.events.try_take().is_none());
        assert!(!f.sm.is_idle());
        assert_eq!(
            f.sm.poll_timers(&f.links, &f.commands, &f.events, t0 + Duration::from_millis(500)),
            None
        );
        assert_eq!(
            f.sm.poll_timers(&f.links, &f.commands, &f.events, t0 + Duration::from_secs(1)),
            Some(BdAddr::new(ADDR))
        );

        // Collisions past the window become a hard failure.
        let late = t0 + Duration::from_secs(6);
        assert_eq!(
            f.sm.on_auth_complete(
                &f.store,
                &f.links,
                &f.commands,
                &f.events,
                late,
                conn,
                HciStatus::DiffTransactionCollision,
            ),
            AuthOutcome::Failed
        );
        match f.events.try_take() {
            Some(SecurityEvent::BondComplete { status, .. }) => {
                assert_eq!(status, SecStatus::Hci(HciStatus::DiffTransactionCollision));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(f.sm.is_idle());
    }

    #[test]
    fn key_missing_retried_exactly_once() {
        let t0 = Instant::from_ticks(0);
        let mut records = [DeviceRecord::NEW];
        let mut links = [LinkStorage::DISCONNECTED];
        let f = fixture(&mut records, &mut links);

        let conn = bonded_setup(&f, t0);
        let idx = unwrap!(f.store.find(BdAddr::new(ADDR)));
        f.store.with(idx, |rec| {
            rec.link_key = Some(LinkKey {
                key: [1; 16],
                key_type: LinkKeyType::Combination,
            });
            rec.classic.link_key_known = true;
        });

        // First failure: key dropped, authentication re-issued, no verdict.
        f.sm.on_auth_complete(
            &f.store,
            &f.links,
            &f.commands,
            &f.events,
            t0,
            conn,
            HciStatus::PinOrKeyMissing,
        );
        assert!(matches!(f.commands.try_take(), Some(Command::AuthRequest(_))));
        assert!(f.events.try_take().is_none());
        f.store.with(idx, |rec| {
            assert!(rec.link_key.is_none());
            assert!(!rec.classic.link_key_known);
        });

        // Second failure is final.
        f.sm.on_auth_complete(
            &f.store,
            &f.links,
            &f.commands,
            &f.events,
            t0,
            conn,
            HciStatus::PinOrKeyMissing,
        );
        match f.events.try_take() {
            Some(SecurityEvent::BondComplete { status, .. }) => {
                assert_eq!(status, SecStatus::Hci(HciStatus::PinOrKeyMissing));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn pairing_timeout_answers_outstanding_prompt() {
        let t0 = Instant::from_ticks(0);
        let mut records = [DeviceRecord::NEW];
        let mut links = [LinkStorage::DISCONNECTED];
        let f = fixture(&mut records, &mut links);

        bonded_setup(&f, t0);
        drain_commands(&f);
        f.sm.on_pin_code_request(&f.store, &f.commands, &f.events, t0, BdAddr::new(ADDR));
        assert!(matches!(f.events.try_take(), Some(SecurityEvent::PinRequest { .. })));

        // Nobody answers for the full timeout.
        let late = t0 + PAIRING_TIMEOUT;
        assert_eq!(f.sm.poll_timers(&f.links, &f.commands, &f.events, late), None);
        assert!(matches!(f.commands.try_take(), Some(Command::PinCodeNegReply(_))));
        match f.events.try_take() {
            Some(SecurityEvent::BondComplete { status, .. }) => {
                assert_eq!(status, SecStatus::Hci(HciStatus::ConnectionTimeout));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(f.sm.is_idle());
    }

    #[test]
    fn prefetched_pin_answers_without_prompting() {
        let t0 = Instant::from_ticks(0);
        let mut records = [DeviceRecord::NEW];
        let mut links = [LinkStorage::DISCONNECTED];
        let f = fixture(&mut records, &mut links);

        let conn = ConnHandle::new(4);
        let link = unwrap!(f.links.allocate(BdAddr::new(ADDR), false, Transport::Classic));
        f.links.set_connected(link, conn, t0);
        let idx = unwrap!(f.store.find_or_alloc(BdAddr::new(ADDR)));
        f.store.with(idx, |rec| {
            rec.classic_handle = Some(conn);
            rec.name_known = true;
        });
        assert_eq!(
            f.sm.bond(&f.store, &f.links, &f.commands, t0, BdAddr::new(ADDR), Some(b"1234")),
            SecStatus::CmdStarted
        );
        drain_commands(&f);

        f.sm.on_pin_code_request(&f.store, &f.commands, &f.events, t0, BdAddr::new(ADDR));
        assert!(f.events.try_take().is_none());
        match f.commands.try_take() {
            Some(Command::PinCodeReply(_, pin)) => assert_eq!(&pin[..], b"1234"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn pending_requests_replay_in_order() {
        let mut records = [DeviceRecord::NEW];
        let mut links = [LinkStorage::DISCONNECTED];
        let f = fixture(&mut records, &mut links);

        for token in 0..3 {
            assert!(f.sm.push_pending(PendingRequest {
                addr: BdAddr::new(ADDR),
                token,
                service_id: 1,
                psm: 3,
                is_originator: true,
                mx: None,
            }));
        }
        assert_eq!(unwrap!(f.sm.take_pending()).token, 0);
        assert_eq!(unwrap!(f.sm.take_pending()).token, 1);
        assert_eq!(unwrap!(f.sm.take_pending()).token, 2);
        assert!(f.sm.take_pending().is_none());
    }
}
