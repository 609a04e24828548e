//! Security requirement bits, pairing capabilities and link key material.

/// Security required of a connection, split by role. A service registers the
/// levels it demands; the bits accumulate onto the device record when an
/// access request is gated.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SecurityRequirements(u16);

impl SecurityRequirements {
    pub const NONE: SecurityRequirements = SecurityRequirements(0);

    pub const IN_AUTHORIZE: SecurityRequirements = SecurityRequirements(0x0001);
    pub const IN_AUTHENTICATE: SecurityRequirements = SecurityRequirements(0x0002);
    pub const IN_ENCRYPT: SecurityRequirements = SecurityRequirements(0x0004);
    pub const OUT_AUTHORIZE: SecurityRequirements = SecurityRequirements(0x0008);
    pub const OUT_AUTHENTICATE: SecurityRequirements = SecurityRequirements(0x0010);
    pub const OUT_ENCRYPT: SecurityRequirements = SecurityRequirements(0x0020);
    pub const MODE4_LEVEL4: SecurityRequirements = SecurityRequirements(0x0040);
    pub const IN_MITM: SecurityRequirements = SecurityRequirements(0x1000);
    pub const OUT_MITM: SecurityRequirements = SecurityRequirements(0x2000);
    pub const IN_MIN_16_DIGIT_PIN: SecurityRequirements = SecurityRequirements(0x4000);

    /// Every bit an acceptor-side registration may carry.
    pub const IN_MASK: SecurityRequirements = SecurityRequirements(
        Self::IN_AUTHORIZE.0
            | Self::IN_AUTHENTICATE.0
            | Self::IN_ENCRYPT.0
            | Self::IN_MITM.0
            | Self::IN_MIN_16_DIGIT_PIN.0
            | Self::MODE4_LEVEL4.0,
    );

    /// Every bit an originator-side registration may carry.
    pub const OUT_MASK: SecurityRequirements = SecurityRequirements(
        Self::OUT_AUTHORIZE.0 | Self::OUT_AUTHENTICATE.0 | Self::OUT_ENCRYPT.0 | Self::OUT_MITM.0 | Self::MODE4_LEVEL4.0,
    );

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        SecurityRequirements(bits)
    }

    pub const fn contains(self, other: SecurityRequirements) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: SecurityRequirements) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: SecurityRequirements) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SecurityRequirements) {
        self.0 &= !other.0;
    }

    pub const fn union(self, other: SecurityRequirements) -> Self {
        SecurityRequirements(self.0 | other.0)
    }

    pub const fn masked(self, mask: SecurityRequirements) -> Self {
        SecurityRequirements(self.0 & mask.0)
    }
}

impl core::fmt::Debug for SecurityRequirements {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SecurityRequirements({:#06x})", self.0)
    }
}

/// Security mode the stack runs in. Service-level is legacy (mode 2);
/// simple-pairing is mode 4; secure-connections-only is mode 4 level 4 for
/// every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityMode {
    ServiceLevel,
    SimplePairing,
    SecureConnectionsOnly,
}

impl SecurityMode {
    /// In the simple-pairing modes, requesting AUTHENTICATE implies MITM
    /// protection for the same role.
    pub fn implies_mitm(self) -> bool {
        matches!(self, SecurityMode::SimplePairing | SecurityMode::SecureConnectionsOnly)
    }
}

/// IO capabilities exchanged during secure simple pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum IoCapability {
    DisplayOnly = 0,
    DisplayYesNo = 1,
    KeyboardOnly = 2,
    NoInputNoOutput = 3,
}

/// Link key classification reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LinkKeyType {
    Combination = 0x00,
    DebugCombination = 0x03,
    UnauthenticatedP192 = 0x04,
    AuthenticatedP192 = 0x05,
    ChangedCombination = 0x06,
    UnauthenticatedP256 = 0x07,
    AuthenticatedP256 = 0x08,
}

impl LinkKeyType {
    /// The only key type acceptable to a secure-connections-only service.
    pub fn is_secure_connections(self) -> bool {
        matches!(self, LinkKeyType::AuthenticatedP256)
    }

    /// Keys produced without MITM protection.
    pub fn is_unauthenticated(self) -> bool {
        matches!(self, LinkKeyType::UnauthenticatedP192 | LinkKeyType::UnauthenticatedP256)
    }
}

/// Stored link key plus its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkKey {
    pub key: [u8; 16],
    pub key_type: LinkKeyType,
}

/// Per-transport security state of a peer. Classic and LE each get their own
/// copy on the device record instead of sharing one shifted bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransportSecFlags {
    pub authenticated: bool,
    pub encrypted: bool,
    pub authorized: bool,
    pub link_key_known: bool,
    pub link_key_authed: bool,
}

impl TransportSecFlags {
    pub const NEW: TransportSecFlags = TransportSecFlags {
        authenticated: false,
        encrypted: false,
        authorized: false,
        link_key_known: false,
        link_key_authed: false,
    };

    /// Clear what a disconnect invalidates, keeping link key knowledge.
    pub fn clear_session(&mut self) {
        self.authenticated = false;
        self.encrypted = false;
        self.authorized = false;
    }
}
