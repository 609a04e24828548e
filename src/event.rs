//! Inbound controller events and upward notifications.
//!
//! [`HciEvent`] is the decoded form of the controller events this core
//! consumes (decoding belongs to the transport layer). [`SecurityEvent`] is
//! what the core reports upward: completions are correlated by the opaque
//! token the caller supplied, which replaces the per-record callback pointer
//! of the original design and fires at most once per request.

use bt_hci::param::{BdAddr, ConnHandle};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use heapless::String;

use crate::config::{DEVICE_NAME_LEN, EVENT_QUEUE_SIZE};
use crate::types::security::{IoCapability, LinkKey};
use crate::types::status::{HciStatus, SecStatus};
use crate::types::Transport;

/// Decoded controller event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciEvent {
    ConnectionComplete {
        status: HciStatus,
        handle: ConnHandle,
        addr: BdAddr,
    },
    ConnectionRequest {
        addr: BdAddr,
    },
    DisconnectionComplete {
        handle: ConnHandle,
        reason: HciStatus,
    },
    AuthComplete {
        handle: ConnHandle,
        status: HciStatus,
    },
    EncryptionChange {
        handle: ConnHandle,
        status: HciStatus,
        enabled: bool,
    },
    LinkKeyRequest {
        addr: BdAddr,
    },
    LinkKeyNotification {
        addr: BdAddr,
        key: LinkKey,
    },
    PinCodeRequest {
        addr: BdAddr,
    },
    IoCapRequest {
        addr: BdAddr,
    },
    IoCapResponse {
        addr: BdAddr,
        io_cap: IoCapability,
        oob_present: bool,
        mitm: bool,
    },
    UserConfirmRequest {
        addr: BdAddr,
        numeric_value: u32,
    },
    UserPasskeyRequest {
        addr: BdAddr,
    },
    UserPasskeyNotification {
        addr: BdAddr,
        passkey: u32,
    },
    SimplePairingComplete {
        addr: BdAddr,
        status: HciStatus,
    },
    RemoteOobDataRequest {
        addr: BdAddr,
    },
    RemoteNameComplete {
        addr: BdAddr,
        status: HciStatus,
        name: String<DEVICE_NAME_LEN>,
    },
    NumberOfCompletedPackets {
        handle: ConnHandle,
        packets: u16,
    },
}

/// Notification surfaced to the profile/application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityEvent {
    /// A `bond` call ran to completion, success or not. Exactly one of these
    /// fires per bond attempt.
    BondComplete {
        addr: BdAddr,
        status: SecStatus,
    },
    /// A gated access request completed. `token` is the value the caller
    /// passed to `l2cap_access_req`/`mx_access_request`/`set_encryption`.
    AccessComplete {
        token: u32,
        addr: BdAddr,
        status: SecStatus,
    },
    /// The application must grant or deny access for this service; answer
    /// with `authorize_reply`.
    AuthorizeRequest {
        addr: BdAddr,
        service_id: u8,
    },
    /// Ask the user for a PIN; answer with `pin_code_reply`.
    PinRequest {
        addr: BdAddr,
        min_16_digit: bool,
    },
    /// Numeric comparison; answer with `confirm_req_reply`.
    ConfirmRequest {
        addr: BdAddr,
        numeric_value: u32,
    },
    /// Passkey entry; answer with `passkey_req_reply`.
    PasskeyRequest {
        addr: BdAddr,
    },
    PasskeyNotification {
        addr: BdAddr,
        passkey: u32,
    },
    /// OOB data wanted; answer with `remote_oob_data_reply`.
    OobRequest {
        addr: BdAddr,
    },
    /// A new link key should be persisted by the storage collaborator.
    LinkKeyUpdate {
        addr: BdAddr,
        key: LinkKey,
    },
    EncryptionChanged {
        addr: BdAddr,
        transport: Transport,
        enabled: bool,
    },
    /// An echo (ping) exchange finished. `ok` is false when the link went
    /// away before the peer answered.
    EchoComplete {
        addr: BdAddr,
        ok: bool,
    },
    /// A dynamic channel finished configuration on both sides.
    ChannelOpened {
        cid: u16,
        psm: u16,
    },
    /// Congestion edge on a channel; fires only on transitions.
    ChannelCongestion {
        cid: u16,
        congested: bool,
    },
    /// A channel went away. `confirmed` is false when we released it without
    /// waiting for the peer's disconnect response.
    ChannelDisconnected {
        cid: u16,
        confirmed: bool,
    },
}

/// Bounded upward event queue.
pub struct EventSink {
    ch: Channel<NoopRawMutex, SecurityEvent, EVENT_QUEUE_SIZE>,
}

impl EventSink {
    pub const fn new() -> Self {
        Self { ch: Channel::new() }
    }

    pub(crate) fn push(&self, event: SecurityEvent) {
        if self.ch.try_send(event).is_err() {
            warn!("[event] upward queue full, event dropped");
        }
    }

    /// Take the next pending notification, if any.
    pub fn try_take(&self) -> Option<SecurityEvent> {
        self.ch.try_receive().ok()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
