#![no_std]
#![allow(dead_code)]

//! A BR/EDR security manager and L2CAP link/channel core.
//!
//! This crate implements the policy layer that sits between a Bluetooth
//! controller and the profiles running on top of it: per-peer security
//! records and link keys, service-level security registration and gating,
//! the pairing state machine, and the ACL link / L2CAP channel control
//! blocks with their configuration, scheduling and idle handling.
//!
//! It is transport-agnostic and clock-agnostic by construction: the caller
//! feeds decoded controller events in, drains typed commands out, and passes
//! the current time to every entry point that needs one. See
//! [`host::SecHost`] for the assembled core.

mod fmt;

pub(crate) mod alarm;
pub mod channel_manager;
pub mod command;
pub mod config;
pub mod dev_rec;
pub mod event;
pub mod host;
pub mod link_manager;
pub mod packet_pool;
pub mod security_manager;
pub mod service;
pub mod types;

/// Errors surfaced by the data-path APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    NotFound,
    /// The handle refers to a slot that has been recycled.
    Stale,
    OutOfMemory,
    InvalidState,
    InvalidValue,
    Busy,
}

pub mod prelude {
    //! The commonly needed surface in one import.
    pub use crate::command::Command;
    pub use crate::event::{HciEvent, SecurityEvent};
    pub use crate::host::{Config, HostResources, SecHost};
    pub use crate::types::security::{IoCapability, LinkKey, LinkKeyType, SecurityMode, SecurityRequirements};
    pub use crate::types::status::{HciStatus, SecStatus};
    pub use crate::types::Transport;
    pub use crate::Error;
}
