//! Compile-time configuration.
//!
//! Pool capacities and protocol timing constants. Storage for the pools
//! themselves is provided by the caller through
//! [`HostResources`](crate::host::HostResources); the constants here bound
//! the queues and timers that live inside each control block.

use embassy_time::Duration;

/// Outbound command queue depth.
pub const COMMAND_QUEUE_SIZE: usize = 16;

/// Upward event queue depth.
pub const EVENT_QUEUE_SIZE: usize = 16;

/// Per-channel transmit hold queue depth.
pub const CHANNEL_TX_QUEUE_SIZE: usize = 8;

/// Pending security request queue depth (requests deferred while a pairing
/// session is in flight, replayed in FIFO order when it completes).
pub const SEC_PENDING_QUEUE_SIZE: usize = 8;

/// Dynamic channels per link.
pub const CHANNELS_PER_LINK: usize = 8;

/// Fixed channel slots per link (signaling excluded).
pub const FIXED_CHANNELS: usize = 3;

/// Maximum length of a registered service name.
pub const SERVICE_NAME_LEN: usize = 21;

/// Maximum length of a remote device name we retain.
pub const DEVICE_NAME_LEN: usize = 32;

/// Maximum PIN code length.
pub const PIN_CODE_LEN: usize = 16;

/// How long a pairing session may sit in any non-idle state before the
/// state-specific negative reply is sent and the session is torn down.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(35);

/// Delay before retrying an authentication/encryption request that failed
/// with an LMP transaction collision.
pub const COLLISION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Window after the first collision during which collisions are retried
/// rather than surfaced as failures.
pub const MAX_COLLISION_WINDOW: Duration = Duration::from_secs(5);

/// Grace period for the peer to acknowledge a disconnect request before the
/// link is torn down unilaterally.
pub const LINK_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for an information response before giving up on the
/// extended feature exchange.
pub const INFO_RESPONSE_TIMEOUT: Duration = Duration::from_secs(4);

/// Do not join more than this many piconets; interpose a role switch
/// instead of paging from a slave role past the cap.
pub const MAX_ACTIVE_PICONETS: usize = 3;

/// Idle timeout sentinel meaning the link never expires.
pub const IDLE_TIMEOUT_NEVER: u16 = 0xffff;

/// Default link idle timeout in seconds.
pub const DEFAULT_IDLE_TIMEOUT: u16 = 4;

/// Smallest MTU a peer may configure on a dynamic channel.
pub const L2CAP_MIN_MTU: u16 = 48;

/// Default MTU populated into a fresh channel configuration.
pub const L2CAP_DEFAULT_MTU: u16 = 672;

/// Default flush timeout (0xffff = reliable, never flushed).
pub const L2CAP_DEFAULT_FLUSH_TIMEOUT: u16 = 0xffff;

/// Default per-channel buffer quota used for congestion tracking until
/// configuration fixes the real value.
pub const L2CAP_DEFAULT_BUFF_QUOTA: u16 = 2;

/// First dynamic channel id.
pub const L2CAP_BASE_DYNAMIC_CID: u16 = 0x0040;

/// Scheduling quota per priority group for the round-robin transmit picker.
pub const fn priority_quota(group: u8) -> u8 {
    // High gets three sends per rotation, medium two, low one.
    match group {
        0 => 3,
        1 => 2,
        _ => 1,
    }
}
