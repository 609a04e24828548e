//! Status codes crossing the core's boundaries.
//!
//! `HciStatus` is the subset of controller error codes this core consumes or
//! propagates verbatim; encoding and the full code space belong to the
//! controller layer.

/// Controller-reported status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HciStatus {
    Success = 0x00,
    PageTimeout = 0x04,
    AuthFailure = 0x05,
    PinOrKeyMissing = 0x06,
    ConnectionTimeout = 0x08,
    PeerUser = 0x13,
    RepeatedAttempts = 0x17,
    PairingNotAllowed = 0x18,
    UnspecifiedError = 0x1f,
    LmpResponseTimeout = 0x22,
    LmpErrTransactionCollision = 0x23,
    DiffTransactionCollision = 0x2a,
    InsufficientSecurity = 0x2f,
    HostBusyPairing = 0x38,
}

impl HciStatus {
    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Both collision codes get the same delayed-retry treatment.
    pub fn is_collision(self) -> bool {
        matches!(
            self,
            HciStatus::LmpErrTransactionCollision | HciStatus::DiffTransactionCollision
        )
    }
}

/// Outcome of a security operation or access request.
///
/// `CmdStarted` is a deferral, not a failure: the request will complete
/// through an [`AccessComplete`](crate::event::SecurityEvent::AccessComplete)
/// or [`BondComplete`](crate::event::SecurityEvent::BondComplete) event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecStatus {
    Success,
    CmdStarted,
    Busy,
    NoResources,
    WrongMode,
    UnknownAddr,
    IllegalValue,
    FailedOnSecurity,
    Hci(HciStatus),
}

impl SecStatus {
    pub fn is_success(self) -> bool {
        matches!(self, SecStatus::Success)
    }
}
