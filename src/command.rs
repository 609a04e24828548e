//! Outbound controller actions.
//!
//! The core decides *when* to issue a command and with what parameters; the
//! external controller layer owns the wire encoding. Commands are typed
//! values pushed into a bounded queue drained by the dispatch context.

use bt_hci::param::{BdAddr, ConnHandle};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use heapless::Vec;

use crate::config::{COMMAND_QUEUE_SIZE, PIN_CODE_LEN};
use crate::types::l2cap::{ConfigReq, ConfigRsp};
use crate::types::security::IoCapability;
use crate::types::status::HciStatus;

/// One outbound action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // Link level
    CreateConnection(BdAddr),
    CreateConnectionCancel(BdAddr),
    AcceptConnection(BdAddr),
    RejectConnection(BdAddr, HciStatus),
    Disconnect(ConnHandle, HciStatus),
    SwitchRole(BdAddr),
    RemoteNameRequest(BdAddr),
    RemoteNameRequestCancel(BdAddr),

    // Security
    AuthRequest(ConnHandle),
    SetConnEncryption(ConnHandle, bool),
    LinkKeyReply(BdAddr, [u8; 16]),
    LinkKeyNegReply(BdAddr),
    PinCodeReply(BdAddr, Vec<u8, PIN_CODE_LEN>),
    PinCodeNegReply(BdAddr),
    UserConfirmReply(BdAddr, bool),
    PasskeyReply(BdAddr, u32),
    PasskeyNegReply(BdAddr),
    IoCapReply {
        addr: BdAddr,
        io_cap: IoCapability,
        oob_present: bool,
        mitm: bool,
    },
    IoCapNegReply(BdAddr, HciStatus),
    RemoteOobReply(BdAddr, [u8; 16], [u8; 16]),
    RemoteOobNegReply(BdAddr),
    CancelLePairing(BdAddr),

    // L2CAP signaling
    L2capConnectReq {
        handle: ConnHandle,
        psm: u16,
        scid: u16,
    },
    L2capConnectRsp {
        handle: ConnHandle,
        dcid: u16,
        scid: u16,
        result: u16,
    },
    L2capConfigReq {
        handle: ConnHandle,
        dcid: u16,
        config: ConfigReq,
    },
    L2capConfigRsp {
        handle: ConnHandle,
        dcid: u16,
        config: ConfigRsp,
    },
    L2capDisconnectReq {
        handle: ConnHandle,
        dcid: u16,
        scid: u16,
    },
    L2capDisconnectRsp {
        handle: ConnHandle,
        dcid: u16,
        scid: u16,
    },
    L2capEchoReq {
        handle: ConnHandle,
    },
    L2capEchoRsp {
        handle: ConnHandle,
    },
    L2capInfoReq {
        handle: ConnHandle,
        info_type: u16,
    },
}

/// Bounded outbound command queue.
pub struct CommandSink {
    ch: Channel<NoopRawMutex, Command, COMMAND_QUEUE_SIZE>,
}

impl CommandSink {
    pub const fn new() -> Self {
        Self { ch: Channel::new() }
    }

    pub(crate) fn push(&self, command: Command) {
        if self.ch.try_send(command).is_err() {
            // The dispatch context is expected to drain between events.
            warn!("[cmd] outbound queue full, command dropped");
        }
    }

    /// Take the next queued command, if any.
    pub fn try_take(&self) -> Option<Command> {
        self.ch.try_receive().ok()
    }
}

impl Default for CommandSink {
    fn default() -> Self {
        Self::new()
    }
}
