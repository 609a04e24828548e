//! L2CAP channel configuration types.
//!
//! These are the *decoded* forms of the configuration options; wire encoding
//! of the signaling PDUs is the controller layer's job.

use crate::config::{L2CAP_DEFAULT_FLUSH_TIMEOUT, L2CAP_DEFAULT_MTU, L2CAP_MIN_MTU};

pub const L2CAP_CID_SIGNALING: u16 = 0x0001;
pub const L2CAP_CID_CONNECTIONLESS: u16 = 0x0002;
pub const L2CAP_CID_ATT: u16 = 0x0004;
pub const L2CAP_CID_LE_SIGNALING: u16 = 0x0005;
pub const L2CAP_CID_SMP: u16 = 0x0006;
pub const L2CAP_CID_SMP_BR: u16 = 0x0007;

/// The PSM SDP runs on; exempt from wildcard security clearing.
pub const PSM_SDP: u16 = 0x0001;

/// Channel scheduling priority. Lower value is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

/// Retransmission and flow control mode of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FcrMode {
    #[default]
    Basic = 0x00,
    Ertm = 0x03,
    Streaming = 0x04,
}

/// Flow control option carried in a configuration request/response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FcrOption {
    pub mode: FcrMode,
    pub tx_win_size: u8,
    pub max_transmit: u8,
    pub retrans_timeout: u16,
    pub monitor_timeout: u16,
    pub mps: u16,
}

impl Default for FcrOption {
    fn default() -> Self {
        FcrOption {
            mode: FcrMode::Basic,
            tx_win_size: 10,
            max_transmit: 3,
            retrans_timeout: 2000,
            monitor_timeout: 12000,
            mps: 1010,
        }
    }
}

/// QoS service category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QosServiceType {
    NoTraffic = 0x00,
    #[default]
    BestEffort = 0x01,
    Guaranteed = 0x02,
}

/// QoS flow specification option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QosOption {
    pub service_type: QosServiceType,
    pub token_rate: u32,
    pub token_bucket_size: u32,
    pub peak_bandwidth: u32,
    pub latency: u32,
    pub delay_variation: u32,
}

impl Default for QosOption {
    fn default() -> Self {
        QosOption {
            service_type: QosServiceType::BestEffort,
            token_rate: 0,
            token_bucket_size: 0,
            peak_bandwidth: 0,
            latency: u32::MAX,
            delay_variation: u32::MAX,
        }
    }
}

/// Decoded configuration request. Absent options mean "keep the default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigReq {
    pub mtu: Option<u16>,
    pub flush_timeout: Option<u16>,
    pub qos: Option<QosOption>,
    pub fcr: Option<FcrOption>,
    pub fcs: Option<bool>,
}

/// Result code on a configuration response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum ConfigResult {
    #[default]
    Ok = 0x0000,
    UnacceptableParams = 0x0001,
    Rejected = 0x0002,
    UnknownOptions = 0x0003,
}

/// Decoded configuration response. Options present here carry the values we
/// would accept instead of the rejected ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigRsp {
    pub result: ConfigResult,
    pub mtu: Option<u16>,
    pub flush_timeout: Option<u16>,
    pub qos: Option<QosOption>,
    pub fcr: Option<FcrOption>,
}

/// Verdict on a peer configuration exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigVerdict {
    /// Parameters accepted; send this response.
    Ok(ConfigRsp),
    /// Parameters rejected; response carries the values we would accept.
    Unacceptable(ConfigRsp),
    /// No compatible mode exists; tear the channel down.
    Disconnect,
}

/// Our local defaults for a freshly allocated channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelConfig {
    pub mtu: u16,
    pub flush_timeout: u16,
    pub qos: QosOption,
    pub fcr: FcrOption,
    pub fcs: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            mtu: L2CAP_DEFAULT_MTU,
            flush_timeout: L2CAP_DEFAULT_FLUSH_TIMEOUT,
            qos: QosOption::default(),
            fcr: FcrOption::default(),
            fcs: true,
        }
    }
}

impl ChannelConfig {
    pub const fn min_mtu() -> u16 {
        L2CAP_MIN_MTU
    }
}
