//! Per-peer security records.
//!
//! A fixed table of [`DeviceRecord`]s, looked up by address or connection
//! handle. Records are allocated on first reference and recycled
//! least-recently-used when the table fills; a record holding a link key or
//! an open connection is never evicted.

use core::cell::RefCell;

use bt_hci::param::{BdAddr, ConnHandle};
use heapless::String;

use crate::config::DEVICE_NAME_LEN;
use crate::event::{EventSink, SecurityEvent};
use crate::types::security::{IoCapability, LinkKey, SecurityRequirements, TransportSecFlags};
use crate::types::status::{HciStatus, SecStatus};
use crate::types::Transport;

/// Truncating copy of a remote device name into record storage.
pub(crate) fn copy_device_name(name: &str) -> String<DEVICE_NAME_LEN> {
    let mut out = String::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Security procedure currently in flight for a record. Anything other than
/// `Idle` means exactly one completion event will move it back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecState {
    Idle,
    GettingName,
    Authenticating,
    Encrypting,
    Authorizing,
    Disconnecting,
}

/// An access request waiting on this record's security procedure. Taken
/// (and therefore fired) at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PendingAccess {
    pub token: u32,
    pub service_id: u8,
    pub psm: u16,
}

/// Everything we know about one peer.
#[derive(Debug)]
pub struct DeviceRecord {
    pub addr: Option<BdAddr>,
    pub name: String<DEVICE_NAME_LEN>,
    pub name_known: bool,
    /// BR/EDR security state.
    pub classic: TransportSecFlags,
    /// LE security state. Its own field, not a bit-shifted copy.
    pub le: TransportSecFlags,
    /// Set when authentication was performed with a 16-digit PIN or MITM
    /// strength equivalent.
    pub pin16_authed: bool,
    pub classic_handle: Option<ConnHandle>,
    pub le_handle: Option<ConnHandle>,
    pub link_key: Option<LinkKey>,
    /// One bit per service id the user marked trusted.
    pub trusted_mask: u64,
    pub security_required: SecurityRequirements,
    pub is_originator: bool,
    pub sec_state: SecState,
    pub pending: Option<PendingAccess>,
    pub cur_service_id: Option<u8>,
    /// Service id of the last authorization prompt, so a repeat request for
    /// the same service does not prompt again.
    pub last_author_service_id: Option<u8>,
    pub peer_io_cap: Option<IoCapability>,
    pub sm4_known: bool,
    /// One-shot retry flag for a key-missing authentication failure.
    pub key_missing_retried: bool,
    pub pin_code_len: u8,
    pub last_used: u32,
}

impl DeviceRecord {
    pub const NEW: DeviceRecord = DeviceRecord {
        addr: None,
        name: String::new(),
        name_known: false,
        classic: TransportSecFlags::NEW,
        le: TransportSecFlags::NEW,
        pin16_authed: false,
        classic_handle: None,
        le_handle: None,
        link_key: None,
        trusted_mask: 0,
        security_required: SecurityRequirements::NONE,
        is_originator: false,
        sec_state: SecState::Idle,
        pending: None,
        cur_service_id: None,
        last_author_service_id: None,
        peer_io_cap: None,
        sm4_known: false,
        key_missing_retried: false,
        pin_code_len: 0,
        last_used: 0,
    };

    pub fn flags(&self, transport: Transport) -> &TransportSecFlags {
        match transport {
            Transport::Classic => &self.classic,
            Transport::Le => &self.le,
        }
    }

    pub fn flags_mut(&mut self, transport: Transport) -> &mut TransportSecFlags {
        match transport {
            Transport::Classic => &mut self.classic,
            Transport::Le => &mut self.le,
        }
    }

    pub fn handle(&self, transport: Transport) -> Option<ConnHandle> {
        match transport {
            Transport::Classic => self.classic_handle,
            Transport::Le => self.le_handle,
        }
    }

    fn evictable(&self) -> bool {
        self.classic_handle.is_none() && self.le_handle.is_none() && self.link_key.is_none()
    }
}

struct StoreState<'d> {
    records: &'d mut [DeviceRecord],
    tick: u32,
}

/// The fixed device record table.
pub struct DeviceStore<'d> {
    state: RefCell<StoreState<'d>>,
}

impl<'d> DeviceStore<'d> {
    pub fn new(records: &'d mut [DeviceRecord]) -> Self {
        Self {
            state: RefCell::new(StoreState { records, tick: 0 }),
        }
    }

    pub fn find(&self, addr: BdAddr) -> Option<u8> {
        let mut state = self.state.borrow_mut();
        state.tick += 1;
        let tick = state.tick;
        for (idx, rec) in state.records.iter_mut().enumerate() {
            if rec.addr == Some(addr) {
                rec.last_used = tick;
                return Some(idx as u8);
            }
        }
        None
    }

    pub fn find_by_handle(&self, handle: ConnHandle, transport: Transport) -> Option<u8> {
        let state = self.state.borrow();
        for (idx, rec) in state.records.iter().enumerate() {
            if rec.addr.is_some() && rec.handle(transport) == Some(handle) {
                return Some(idx as u8);
            }
        }
        None
    }

    /// Find the record for `addr`, allocating a fresh one if none exists.
    /// Returns `None` only when the table is full of unevictable records;
    /// callers must handle that without partial mutation.
    pub fn find_or_alloc(&self, addr: BdAddr) -> Option<u8> {
        if let Some(idx) = self.find(addr) {
            return Some(idx);
        }
        let mut state = self.state.borrow_mut();
        state.tick += 1;
        let tick = state.tick;

        let mut slot: Option<usize> = None;
        for (idx, rec) in state.records.iter().enumerate() {
            if rec.addr.is_none() {
                slot = Some(idx);
                break;
            }
        }
        if slot.is_none() {
            // Reclaim the least recently touched record not pinned by a
            // connection or a stored key.
            let mut oldest: Option<(usize, u32)> = None;
            for (idx, rec) in state.records.iter().enumerate() {
                if rec.evictable() {
                    match oldest {
                        Some((_, used)) if rec.last_used >= used => {}
                        _ => oldest = Some((idx, rec.last_used)),
                    }
                }
            }
            slot = oldest.map(|(idx, _)| idx);
        }

        let idx = slot?;
        let rec = &mut state.records[idx];
        *rec = DeviceRecord::NEW;
        rec.addr = Some(addr);
        rec.last_used = tick;
        trace!("[dev][alloc] slot {} for {:?}", idx, addr);
        Some(idx as u8)
    }

    pub fn with<R>(&self, idx: u8, f: impl FnOnce(&mut DeviceRecord) -> R) -> R {
        let mut state = self.state.borrow_mut();
        f(&mut state.records[idx as usize])
    }

    pub fn addr_of(&self, idx: u8) -> Option<BdAddr> {
        self.state.borrow().records[idx as usize].addr
    }

    /// Transport-level disconnect bookkeeping: session flags and the handle
    /// for that transport are cleared and a pending access request, if any,
    /// is failed with the disconnect reason. Safe to call twice.
    pub fn mark_disconnected(&self, idx: u8, transport: Transport, reason: HciStatus, events: &EventSink) {
        let fired = self.with(idx, |rec| {
            rec.flags_mut(transport).clear_session();
            match transport {
                Transport::Classic => rec.classic_handle = None,
                Transport::Le => rec.le_handle = None,
            }
            if rec.sec_state != SecState::Idle {
                rec.sec_state = SecState::Idle;
            }
            // Authorization grants last one connection; the next one must
            // prompt again.
            rec.last_author_service_id = None;
            rec.pending.take().map(|pending| (pending, rec.addr))
        });
        if let Some((pending, addr)) = fired {
            if let Some(addr) = addr {
                events.push(SecurityEvent::AccessComplete {
                    token: pending.token,
                    addr,
                    status: SecStatus::Hci(reason),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR_1: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
    const ADDR_2: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
    const ADDR_3: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];

    #[test]
    fn alloc_and_find() {
        let mut storage = [DeviceRecord::NEW, DeviceRecord::NEW];
        let store = DeviceStore::new(&mut storage[..]);

        let a = unwrap!(store.find_or_alloc(BdAddr::new(ADDR_1)));
        let b = unwrap!(store.find_or_alloc(BdAddr::new(ADDR_2)));
        assert_ne!(a, b);
        assert_eq!(store.find(BdAddr::new(ADDR_1)), Some(a));
        assert_eq!(store.find_or_alloc(BdAddr::new(ADDR_2)), Some(b));
    }

    #[test]
    fn table_full_returns_none() {
        let mut storage = [DeviceRecord::NEW, DeviceRecord::NEW];
        let store = DeviceStore::new(&mut storage[..]);

        let a = unwrap!(store.find_or_alloc(BdAddr::new(ADDR_1)));
        let b = unwrap!(store.find_or_alloc(BdAddr::new(ADDR_2)));

        // Pin both records so neither can be evicted.
        store.with(a, |rec| rec.classic_handle = Some(ConnHandle::new(1)));
        store.with(b, |rec| {
            rec.link_key = Some(LinkKey {
                key: [0; 16],
                key_type: crate::types::security::LinkKeyType::Combination,
            })
        });

        assert!(store.find_or_alloc(BdAddr::new(ADDR_3)).is_none());
    }

    #[test]
    fn lru_eviction_prefers_oldest() {
        let mut storage = [DeviceRecord::NEW, DeviceRecord::NEW];
        let store = DeviceStore::new(&mut storage[..]);

        let a = unwrap!(store.find_or_alloc(BdAddr::new(ADDR_1)));
        let _b = unwrap!(store.find_or_alloc(BdAddr::new(ADDR_2)));
        // Touch the first record so the second becomes the LRU victim.
        assert_eq!(store.find(BdAddr::new(ADDR_1)), Some(a));

        let c = unwrap!(store.find_or_alloc(BdAddr::new(ADDR_3)));
        assert_eq!(store.addr_of(c), Some(BdAddr::new(ADDR_3)));
        assert_eq!(store.find(BdAddr::new(ADDR_2)), None);
        assert_eq!(store.find(BdAddr::new(ADDR_1)), Some(a));
    }

    #[test]
    fn mark_disconnected_fires_pending_once() {
        let mut storage = [DeviceRecord::NEW];
        let store = DeviceStore::new(&mut storage[..]);
        let events = EventSink::new();

        let idx = unwrap!(store.find_or_alloc(BdAddr::new(ADDR_1)));
        store.with(idx, |rec| {
            rec.classic_handle = Some(ConnHandle::new(3));
            rec.classic.authenticated = true;
            rec.classic.encrypted = true;
            rec.sec_state = SecState::Encrypting;
            rec.pending = Some(PendingAccess {
                token: 7,
                service_id: 1,
                psm: 3,
            });
        });

        store.mark_disconnected(idx, Transport::Classic, HciStatus::PeerUser, &events);
        match events.try_take() {
            Some(SecurityEvent::AccessComplete { token: 7, status, .. }) => {
                assert_eq!(status, SecStatus::Hci(HciStatus::PeerUser));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Second call is a no-op.
        store.mark_disconnected(idx, Transport::Classic, HciStatus::PeerUser, &events);
        assert!(events.try_take().is_none());

        store.with(idx, |rec| {
            assert!(!rec.classic.authenticated);
            assert!(!rec.classic.encrypted);
            assert_eq!(rec.classic_handle, None);
            assert_eq!(rec.sec_state, SecState::Idle);
        });
    }

    #[test]
    fn authorization_grant_does_not_survive_disconnect() {
        let mut storage = [DeviceRecord::NEW];
        let store = DeviceStore::new(&mut storage[..]);
        let events = EventSink::new();

        let idx = unwrap!(store.find_or_alloc(BdAddr::new(ADDR_1)));
        store.with(idx, |rec| {
            rec.classic_handle = Some(ConnHandle::new(3));
            rec.classic.authorized = true;
            rec.last_author_service_id = Some(7);
        });

        store.mark_disconnected(idx, Transport::Classic, HciStatus::PeerUser, &events);
        store.with(idx, |rec| {
            assert!(!rec.classic.authorized);
            assert_eq!(rec.last_author_service_id, None);
        });
    }
}
