//! The security execution procedure.
//!
//! One pass over a device record decides the next step needed to satisfy the
//! accumulated requirements: fetch the peer name, authenticate, encrypt,
//! authorize, in that order, one controller exchange at a time. Each
//! completion event re-enters the procedure until nothing is left, at which
//! point the satisfied bits are cleared and the gated request is granted.

use crate::command::{Command, CommandSink};
use crate::dev_rec::{DeviceRecord, SecState};
use crate::event::{EventSink, SecurityEvent};
use crate::types::security::{SecurityMode, SecurityRequirements};
use crate::types::status::SecStatus;

fn is_trusted(mask: u64, service_id: u8) -> bool {
    service_id < 64 && mask & (1u64 << service_id) != 0
}

/// Run one step of the procedure for `rec`. Returns `CmdStarted` when a
/// controller exchange (or user prompt) was kicked off, `Success` when every
/// requirement is already satisfied, a failure status when the requirements
/// cannot be met on this link.
///
/// Re-entrant: while a step is in flight the record is left untouched and
/// `CmdStarted` is returned, so concurrent access requests pile up behind
/// the same pass instead of corrupting it.
pub fn execute(rec: &mut DeviceRecord, commands: &CommandSink, events: &EventSink, mode: SecurityMode) -> SecStatus {
    if rec.sec_state != SecState::Idle {
        return SecStatus::CmdStarted;
    }
    let Some(addr) = rec.addr else {
        return SecStatus::UnknownAddr;
    };
    let Some(handle) = rec.classic_handle else {
        return SecStatus::WrongMode;
    };

    let originator = rec.is_originator;
    let required = rec.security_required;

    // The peer name feeds the pairing UI and the legacy-device detection, so
    // it is fetched before anything that might prompt the user.
    if !rec.name_known {
        debug!("[sec][exec] fetching name of {:?}", addr);
        commands.push(Command::RemoteNameRequest(addr));
        rec.sec_state = SecState::GettingName;
        return SecStatus::CmdStarted;
    }

    let auth_bit = if originator {
        SecurityRequirements::OUT_AUTHENTICATE
    } else {
        SecurityRequirements::IN_AUTHENTICATE
    };
    let mut need_auth = required.contains(auth_bit) && !rec.classic.authenticated;

    // A service demanding a 16-digit PIN cannot ride on a key produced from
    // a shorter one. Drop the stale key knowledge and authenticate again.
    if !originator && required.contains(SecurityRequirements::IN_MIN_16_DIGIT_PIN) && !rec.pin16_authed {
        rec.classic.link_key_known = false;
        rec.classic.link_key_authed = false;
        rec.classic.authenticated = false;
        need_auth = true;
    }

    if need_auth {
        debug!("[sec][exec] authenticating {:?}", addr);
        commands.push(Command::AuthRequest(handle));
        rec.sec_state = SecState::Authenticating;
        return SecStatus::CmdStarted;
    }

    // A secure-connections-only service only ever accepts an authenticated
    // P-256 key, whatever else the link has achieved. Checked before the
    // encryption step, not after: a key that cannot satisfy the service must
    // never start encrypting the link.
    let sc_only = mode == SecurityMode::SecureConnectionsOnly || required.contains(SecurityRequirements::MODE4_LEVEL4);
    if sc_only {
        let key_ok = rec
            .link_key
            .map(|key| key.key_type.is_secure_connections())
            .unwrap_or(false);
        if !key_ok {
            warn!("[sec][exec] link key of {:?} not secure-connections grade", addr);
            return SecStatus::FailedOnSecurity;
        }
    }

    let encrypt_bit = if originator {
        SecurityRequirements::OUT_ENCRYPT
    } else {
        SecurityRequirements::IN_ENCRYPT
    };
    if required.contains(encrypt_bit) && !rec.classic.encrypted {
        debug!("[sec][exec] encrypting {:?}", addr);
        commands.push(Command::SetConnEncryption(handle, true));
        rec.sec_state = SecState::Encrypting;
        return SecStatus::CmdStarted;
    }

    let author_bit = if originator {
        SecurityRequirements::OUT_AUTHORIZE
    } else {
        SecurityRequirements::IN_AUTHORIZE
    };
    if required.contains(author_bit) && !rec.classic.authorized {
        let service_id = rec.cur_service_id.unwrap_or(0);
        let trusted = is_trusted(rec.trusted_mask, service_id);
        let repeat = rec.last_author_service_id == Some(service_id);
        if !trusted && !repeat {
            debug!("[sec][exec] authorization prompt for {:?} service {}", addr, service_id);
            events.push(SecurityEvent::AuthorizeRequest { addr, service_id });
            rec.sec_state = SecState::Authorizing;
            return SecStatus::CmdStarted;
        }
    }

    // Done. Clear what this pass satisfied so the next request starts clean.
    rec.security_required.remove(
        auth_bit
            .union(encrypt_bit)
            .union(author_bit)
            .union(SecurityRequirements::IN_MIN_16_DIGIT_PIN),
    );
    SecStatus::Success
}

#[cfg(test)]
mod tests {
    use bt_hci::param::{BdAddr, ConnHandle};

    use super::*;
    use crate::types::security::{LinkKey, LinkKeyType};

    const ADDR: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    fn connected_record() -> DeviceRecord {
        let mut rec = DeviceRecord::NEW;
        rec.addr = Some(BdAddr::new(ADDR));
        rec.classic_handle = Some(ConnHandle::new(4));
        rec.name_known = true;
        rec
    }

    #[test]
    fn steps_in_order() {
        let commands = CommandSink::new();
        let events = EventSink::new();
        let mut rec = connected_record();
        rec.is_originator = true;
        rec.security_required = SecurityRequirements::OUT_AUTHENTICATE.union(SecurityRequirements::OUT_ENCRYPT);

        assert_eq!(
            execute(&mut rec, &commands, &events, SecurityMode::SimplePairing),
            SecStatus::CmdStarted
        );
        assert!(matches!(commands.try_take(), Some(Command::AuthRequest(_))));
        assert_eq!(rec.sec_state, SecState::Authenticating);

        // Authentication done, next pass starts encryption.
        rec.sec_state = SecState::Idle;
        rec.classic.authenticated = true;
        assert_eq!(
            execute(&mut rec, &commands, &events, SecurityMode::SimplePairing),
            SecStatus::CmdStarted
        );
        assert!(matches!(commands.try_take(), Some(Command::SetConnEncryption(_, true))));

        rec.sec_state = SecState::Idle;
        rec.classic.encrypted = true;
        assert_eq!(
            execute(&mut rec, &commands, &events, SecurityMode::SimplePairing),
            SecStatus::Success
        );
        assert!(rec.security_required.is_empty());
    }

    #[test]
    fn reentry_leaves_record_untouched() {
        let commands = CommandSink::new();
        let events = EventSink::new();
        let mut rec = connected_record();
        rec.is_originator = true;
        rec.security_required = SecurityRequirements::OUT_AUTHENTICATE;
        rec.sec_state = SecState::Authenticating;

        assert_eq!(
            execute(&mut rec, &commands, &events, SecurityMode::SimplePairing),
            SecStatus::CmdStarted
        );
        // No second controller exchange, no state change, bits intact.
        assert!(commands.try_take().is_none());
        assert_eq!(rec.sec_state, SecState::Authenticating);
        assert!(rec.security_required.contains(SecurityRequirements::OUT_AUTHENTICATE));
    }

    #[test]
    fn name_fetched_first() {
        let commands = CommandSink::new();
        let events = EventSink::new();
        let mut rec = connected_record();
        rec.name_known = false;
        rec.security_required = SecurityRequirements::OUT_AUTHENTICATE;
        rec.is_originator = true;

        assert_eq!(
            execute(&mut rec, &commands, &events, SecurityMode::SimplePairing),
            SecStatus::CmdStarted
        );
        assert!(matches!(commands.try_take(), Some(Command::RemoteNameRequest(_))));
        assert_eq!(rec.sec_state, SecState::GettingName);
    }

    #[test]
    fn min_16_digit_pin_clears_stale_key() {
        let commands = CommandSink::new();
        let events = EventSink::new();
        let mut rec = connected_record();
        rec.is_originator = false;
        rec.security_required = SecurityRequirements::IN_MIN_16_DIGIT_PIN;
        // Authenticated with a short PIN earlier in the session.
        rec.classic.authenticated = true;
        rec.classic.link_key_known = true;
        rec.classic.link_key_authed = true;

        assert_eq!(
            execute(&mut rec, &commands, &events, SecurityMode::SimplePairing),
            SecStatus::CmdStarted
        );
        assert!(matches!(commands.try_take(), Some(Command::AuthRequest(_))));
        assert!(!rec.classic.link_key_known);
        assert!(!rec.classic.link_key_authed);

        // Once the strong PIN authenticated, the requirement clears.
        rec.sec_state = SecState::Idle;
        rec.classic.authenticated = true;
        rec.pin16_authed = true;
        assert_eq!(
            execute(&mut rec, &commands, &events, SecurityMode::SimplePairing),
            SecStatus::Success
        );
        assert!(!rec.security_required.contains(SecurityRequirements::IN_MIN_16_DIGIT_PIN));
    }

    #[test]
    fn sc_only_rejects_weak_key() {
        let commands = CommandSink::new();
        let events = EventSink::new();
        let mut rec = connected_record();
        rec.is_originator = true;
        rec.security_required = SecurityRequirements::MODE4_LEVEL4;
        rec.classic.authenticated = true;
        rec.classic.encrypted = true;
        rec.link_key = Some(LinkKey {
            key: [0; 16],
            key_type: LinkKeyType::UnauthenticatedP192,
        });

        assert_eq!(
            execute(&mut rec, &commands, &events, SecurityMode::SimplePairing),
            SecStatus::FailedOnSecurity
        );

        rec.link_key = Some(LinkKey {
            key: [0; 16],
            key_type: LinkKeyType::AuthenticatedP256,
        });
        assert_eq!(
            execute(&mut rec, &commands, &events, SecurityMode::SimplePairing),
            SecStatus::Success
        );
    }

    #[test]
    fn sc_only_refused_before_encryption_starts() {
        let commands = CommandSink::new();
        let events = EventSink::new();
        let mut rec = connected_record();
        rec.is_originator = true;
        rec.security_required = SecurityRequirements::MODE4_LEVEL4.union(SecurityRequirements::OUT_ENCRYPT);
        rec.classic.authenticated = true;
        rec.link_key = Some(LinkKey {
            key: [0; 16],
            key_type: LinkKeyType::UnauthenticatedP192,
        });

        // The weak key fails the pass without touching the controller.
        assert_eq!(
            execute(&mut rec, &commands, &events, SecurityMode::SimplePairing),
            SecStatus::FailedOnSecurity
        );
        assert!(commands.try_take().is_none());
        assert_eq!(rec.sec_state, SecState::Idle);
    }

    #[test]
    fn authorization_prompt_and_trust() {
        let commands = CommandSink::new();
        let events = EventSink::new();
        let mut rec = connected_record();
        rec.is_originator = false;
        rec.security_required = SecurityRequirements::IN_AUTHORIZE;
        rec.cur_service_id = Some(7);

        assert_eq!(
            execute(&mut rec, &commands, &events, SecurityMode::SimplePairing),
            SecStatus::CmdStarted
        );
        assert!(matches!(
            events.try_take(),
            Some(SecurityEvent::AuthorizeRequest { service_id: 7, .. })
        ));
        assert_eq!(rec.sec_state, SecState::Authorizing);

        // A trusted service skips the prompt entirely.
        rec.sec_state = SecState::Idle;
        rec.trusted_mask = 1 << 7;
        assert_eq!(
            execute(&mut rec, &commands, &events, SecurityMode::SimplePairing),
            SecStatus::Success
        );
        assert!(events.try_take().is_none());
    }
}
