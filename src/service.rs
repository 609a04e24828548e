//! Registered service security levels.
//!
//! Each (PSM, multiplexer protocol, channel) combination a profile registers
//! gets a record holding the security bits it demands from originators and
//! acceptors. Lookup happens on every gated access request, so the last
//! outgoing record is cached to skip the scan on the hot originate path.

use core::cell::RefCell;

use heapless::String;

use crate::config::SERVICE_NAME_LEN;
use crate::types::l2cap::PSM_SDP;
use crate::types::security::{SecurityMode, SecurityRequirements};

#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub in_use: bool,
    pub psm: u16,
    pub mx_proto_id: u32,
    pub orig_mx_chan_id: u32,
    pub term_mx_chan_id: u32,
    pub service_id: u8,
    pub orig_name: String<SERVICE_NAME_LEN>,
    pub term_name: String<SERVICE_NAME_LEN>,
    pub security: SecurityRequirements,
}

impl ServiceRecord {
    pub const NEW: ServiceRecord = ServiceRecord {
        in_use: false,
        psm: 0,
        mx_proto_id: 0,
        orig_mx_chan_id: 0,
        term_mx_chan_id: 0,
        service_id: 0,
        orig_name: String::new(),
        term_name: String::new(),
        security: SecurityRequirements::NONE,
    };
}

fn copy_name(name: &str) -> String<SERVICE_NAME_LEN> {
    let mut out = String::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

struct RegState<'d> {
    records: &'d mut [ServiceRecord],
    /// Record index served by the last originator lookup.
    last_outgoing: Option<u8>,
}

/// The service security registry.
pub struct ServiceRegistry<'d> {
    state: RefCell<RegState<'d>>,
}

impl<'d> ServiceRegistry<'d> {
    pub fn new(records: &'d mut [ServiceRecord]) -> Self {
        Self {
            state: RefCell::new(RegState {
                records,
                last_outgoing: None,
            }),
        }
    }

    /// Register (or update) the security demanded by a service. An existing
    /// record matching (psm, mx_proto_id, service_id) is reused regardless of
    /// the registered name; otherwise the first free slot is taken. Returns
    /// false only when no slot is available.
    #[allow(clippy::too_many_arguments)]
    pub fn set_security_level(
        &self,
        mode: SecurityMode,
        is_originator: bool,
        name: &str,
        service_id: u8,
        level: SecurityRequirements,
        psm: u16,
        mx_proto_id: u32,
        mx_chan_id: u32,
    ) -> bool {
        let mut state = self.state.borrow_mut();

        let mut slot: Option<usize> = None;
        let mut free: Option<usize> = None;
        for (idx, rec) in state.records.iter().enumerate() {
            if rec.in_use {
                if rec.psm == psm && rec.mx_proto_id == mx_proto_id && rec.service_id == service_id {
                    slot = Some(idx);
                    break;
                }
            } else if free.is_none() {
                free = Some(idx);
            }
        }
        let Some(idx) = slot.or(free) else {
            warn!("[svc] out of service records");
            return false;
        };

        let rec = &mut state.records[idx];
        if !rec.in_use {
            *rec = ServiceRecord::NEW;
        }
        rec.in_use = true;
        rec.psm = psm;
        rec.mx_proto_id = mx_proto_id;
        rec.service_id = service_id;

        // An originator registration may only touch outgoing bits, an
        // acceptor registration only incoming ones.
        let mut level = level.masked(if is_originator {
            SecurityRequirements::OUT_MASK
        } else {
            SecurityRequirements::IN_MASK
        });

        // Never encrypt without authenticating, and in the simple-pairing
        // modes authentication implies MITM protection.
        if is_originator {
            if level.contains(SecurityRequirements::OUT_ENCRYPT) {
                level.insert(SecurityRequirements::OUT_AUTHENTICATE);
            }
            if mode.implies_mitm() && level.contains(SecurityRequirements::OUT_AUTHENTICATE) {
                level.insert(SecurityRequirements::OUT_MITM);
            }
            rec.orig_mx_chan_id = mx_chan_id;
            rec.orig_name = copy_name(name);
            rec.security.remove(SecurityRequirements::OUT_MASK);
        } else {
            if level.contains(SecurityRequirements::IN_ENCRYPT) {
                level.insert(SecurityRequirements::IN_AUTHENTICATE);
            }
            if mode.implies_mitm() && level.contains(SecurityRequirements::IN_AUTHENTICATE) {
                level.insert(SecurityRequirements::IN_MITM);
            }
            rec.term_mx_chan_id = mx_chan_id;
            rec.term_name = copy_name(name);
            rec.security.remove(SecurityRequirements::IN_MASK);
        }

        if mode == SecurityMode::SecureConnectionsOnly {
            level.insert(SecurityRequirements::MODE4_LEVEL4);
        }
        rec.security.insert(level);

        debug!(
            "[svc] registered psm {} service {} security {:?}",
            psm, service_id, rec.security
        );
        true
    }

    /// First registered record for a PSM, with the cached fast path for the
    /// outgoing direction.
    pub fn find_first(&self, is_originator: bool, psm: u16) -> Option<ServiceRecord> {
        let mut state = self.state.borrow_mut();
        if is_originator {
            if let Some(last) = state.last_outgoing {
                let rec = &state.records[last as usize];
                if rec.in_use && rec.psm == psm {
                    return Some(rec.clone());
                }
            }
        }
        let idx = state.records.iter().position(|rec| rec.in_use && rec.psm == psm)?;
        if is_originator {
            state.last_outgoing = Some(idx as u8);
        }
        Some(state.records[idx].clone())
    }

    /// Exact-match lookup for a multiplexed service sharing a PSM.
    pub fn find_mx(&self, is_originator: bool, psm: u16, mx_proto_id: u32, mx_chan_id: u32) -> Option<ServiceRecord> {
        let state = self.state.borrow();
        state
            .records
            .iter()
            .find(|rec| {
                rec.in_use
                    && rec.psm == psm
                    && rec.mx_proto_id == mx_proto_id
                    && if is_originator {
                        rec.orig_mx_chan_id == mx_chan_id
                    } else {
                        rec.term_mx_chan_id == mx_chan_id
                    }
            })
            .cloned()
    }

    /// Clear the security of a service, or of all services when `None`.
    /// SDP keeps its registration either way.
    pub fn clear(&self, service_id: Option<u8>) {
        let mut state = self.state.borrow_mut();
        state.last_outgoing = None;
        for rec in state.records.iter_mut() {
            if !rec.in_use || rec.psm == PSM_SDP {
                continue;
            }
            if service_id.is_none() || service_id == Some(rec.service_id) {
                rec.in_use = false;
                rec.security = SecurityRequirements::NONE;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with<const N: usize>(storage: &mut [ServiceRecord; N]) -> ServiceRegistry<'_> {
        ServiceRegistry::new(&mut storage[..])
    }

    #[test]
    fn same_key_reuses_slot() {
        let mut storage = [ServiceRecord::NEW, ServiceRecord::NEW];
        let reg = registry_with(&mut storage);

        assert!(reg.set_security_level(
            SecurityMode::SimplePairing,
            true,
            "svc-a",
            5,
            SecurityRequirements::OUT_AUTHENTICATE,
            3,
            1,
            1,
        ));
        // Same (psm, proto, service_id) but a different name on the acceptor
        // side must land in the same slot.
        assert!(reg.set_security_level(
            SecurityMode::SimplePairing,
            false,
            "svc-a",
            5,
            SecurityRequirements::IN_AUTHENTICATE,
            3,
            1,
            1,
        ));

        let rec = unwrap!(reg.find_first(true, 3));
        assert!(rec.security.contains(SecurityRequirements::OUT_AUTHENTICATE));
        assert!(rec.security.contains(SecurityRequirements::IN_AUTHENTICATE));

        // Second slot must still be free.
        assert!(reg.set_security_level(
            SecurityMode::SimplePairing,
            true,
            "svc-b",
            6,
            SecurityRequirements::NONE,
            17,
            0,
            0,
        ));
        assert!(reg.find_first(true, 17).is_some());
    }

    #[test]
    fn renamed_service_reuses_slot() {
        let mut storage = [ServiceRecord::NEW];
        let reg = registry_with(&mut storage);

        assert!(reg.set_security_level(
            SecurityMode::SimplePairing,
            true,
            "first",
            5,
            SecurityRequirements::OUT_AUTHENTICATE,
            3,
            1,
            1,
        ));
        // Re-registering the same (psm, proto, service_id) under a new name
        // must update the single slot, not demand a second one.
        assert!(reg.set_security_level(
            SecurityMode::SimplePairing,
            true,
            "renamed",
            5,
            SecurityRequirements::OUT_ENCRYPT,
            3,
            1,
            1,
        ));

        let rec = unwrap!(reg.find_first(true, 3));
        assert_eq!(rec.orig_name.as_str(), "renamed");
        assert!(rec.security.contains(SecurityRequirements::OUT_ENCRYPT));
    }

    #[test]
    fn outgoing_lookup_tracks_last_psm() {
        let mut storage = [ServiceRecord::NEW, ServiceRecord::NEW];
        let reg = registry_with(&mut storage);

        assert!(reg.set_security_level(
            SecurityMode::SimplePairing,
            true,
            "svc-a",
            5,
            SecurityRequirements::OUT_AUTHENTICATE,
            3,
            0,
            0,
        ));
        assert!(reg.set_security_level(
            SecurityMode::SimplePairing,
            true,
            "svc-b",
            6,
            SecurityRequirements::NONE,
            17,
            0,
            0,
        ));

        // Alternating lookups keep the cache honest.
        assert_eq!(unwrap!(reg.find_first(true, 3)).service_id, 5);
        assert_eq!(unwrap!(reg.find_first(true, 17)).service_id, 6);
        assert_eq!(unwrap!(reg.find_first(true, 3)).service_id, 5);
        assert!(reg.find_first(true, 99).is_none());
    }

    #[test]
    fn encrypt_forces_authenticate() {
        let mut storage = [ServiceRecord::NEW];
        let reg = registry_with(&mut storage);

        assert!(reg.set_security_level(
            SecurityMode::ServiceLevel,
            true,
            "svc",
            1,
            SecurityRequirements::OUT_ENCRYPT,
            3,
            0,
            0,
        ));
        let rec = unwrap!(reg.find_first(true, 3));
        assert!(rec.security.contains(SecurityRequirements::OUT_AUTHENTICATE));
        // Legacy mode never bumps MITM automatically.
        assert!(!rec.security.contains(SecurityRequirements::OUT_MITM));
    }

    #[test]
    fn simple_pairing_bumps_mitm() {
        let mut storage = [ServiceRecord::NEW];
        let reg = registry_with(&mut storage);

        assert!(reg.set_security_level(
            SecurityMode::SimplePairing,
            false,
            "svc",
            1,
            SecurityRequirements::IN_AUTHENTICATE,
            3,
            0,
            0,
        ));
        let rec = unwrap!(reg.find_first(false, 3));
        assert!(rec.security.contains(SecurityRequirements::IN_MITM));
    }

    #[test]
    fn originator_bits_masked() {
        let mut storage = [ServiceRecord::NEW];
        let reg = registry_with(&mut storage);

        // An originator registration carrying acceptor bits must not store
        // them.
        assert!(reg.set_security_level(
            SecurityMode::ServiceLevel,
            true,
            "svc",
            1,
            SecurityRequirements::IN_AUTHENTICATE.union(SecurityRequirements::OUT_AUTHENTICATE),
            3,
            0,
            0,
        ));
        let rec = unwrap!(reg.find_first(true, 3));
        assert!(rec.security.contains(SecurityRequirements::OUT_AUTHENTICATE));
        assert!(!rec.security.contains(SecurityRequirements::IN_AUTHENTICATE));
    }

    #[test]
    fn clear_spares_sdp() {
        let mut storage = [ServiceRecord::NEW, ServiceRecord::NEW];
        let reg = registry_with(&mut storage);

        assert!(reg.set_security_level(
            SecurityMode::ServiceLevel,
            false,
            "sdp",
            0,
            SecurityRequirements::NONE,
            PSM_SDP,
            0,
            0,
        ));
        assert!(reg.set_security_level(
            SecurityMode::ServiceLevel,
            false,
            "svc",
            4,
            SecurityRequirements::IN_AUTHENTICATE,
            3,
            0,
            0,
        ));

        reg.clear(None);
        assert!(reg.find_first(false, PSM_SDP).is_some());
        assert!(reg.find_first(false, 3).is_none());
    }

    #[test]
    fn mx_lookup_disambiguates() {
        let mut storage = [ServiceRecord::NEW, ServiceRecord::NEW];
        let reg = registry_with(&mut storage);

        assert!(reg.set_security_level(
            SecurityMode::SimplePairing,
            true,
            "rfcomm-a",
            10,
            SecurityRequirements::OUT_AUTHENTICATE,
            3,
            1,
            1,
        ));
        assert!(reg.set_security_level(
            SecurityMode::SimplePairing,
            true,
            "rfcomm-b",
            11,
            SecurityRequirements::OUT_ENCRYPT,
            3,
            1,
            2,
        ));

        let a = unwrap!(reg.find_mx(true, 3, 1, 1));
        let b = unwrap!(reg.find_mx(true, 3, 1, 2));
        assert_eq!(a.service_id, 10);
        assert_eq!(b.service_id, 11);
        assert!(reg.find_mx(true, 3, 2, 1).is_none());
    }
}
