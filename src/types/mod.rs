pub mod l2cap;
pub mod security;
pub mod status;

/// Transport an ACL link or a security procedure runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transport {
    Classic,
    Le,
}
