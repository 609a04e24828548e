//! ACL link control blocks.
//!
//! One [`LinkStorage`] per active or prospective ACL link, classic and LE
//! sharing the pool but transport-tagged. Slots are referenced through
//! generation-checked [`LinkHandle`]s so a handle retained across a release
//! is detectably stale instead of silently aliasing the next tenant.

use core::cell::RefCell;

use bt_hci::param::{BdAddr, ConnHandle};
use embassy_time::Instant;
use heapless::Vec;

use crate::alarm::Alarm;
use crate::command::{Command, CommandSink};
use crate::config::{
    CHANNELS_PER_LINK, DEFAULT_IDLE_TIMEOUT, FIXED_CHANNELS, IDLE_TIMEOUT_NEVER, INFO_RESPONSE_TIMEOUT,
    LINK_DISCONNECT_TIMEOUT, MAX_ACTIVE_PICONETS,
};
use crate::types::l2cap::Priority;
use crate::types::status::HciStatus;
use crate::types::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    Disconnected,
    /// A role switch was interposed before paging to stay inside the
    /// piconet participation limit.
    ConnectingWaitSwitch,
    Connecting,
    Connected,
    Disconnecting,
}

/// Generation-checked reference to a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkHandle {
    pub(crate) index: u8,
    pub(crate) gen: u16,
}

/// Longest fixed-channel idle timeout on a link, fed into the idle policy
/// when the last dynamic channel closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixedIdle {
    /// No fixed channels present.
    NoFixed,
    Secs(u16),
    /// At least one fixed channel never expires.
    Never,
}

#[derive(Debug)]
pub struct LinkStorage {
    pub(crate) in_use: bool,
    pub(crate) gen: u16,
    pub(crate) addr: Option<BdAddr>,
    pub(crate) transport: Transport,
    pub(crate) handle: Option<ConnHandle>,
    pub(crate) state: LinkState,
    pub(crate) bonding: bool,
    pub(crate) idle_timeout: u16,
    pub(crate) link_timer: Alarm,
    pub(crate) info_timer: Alarm,
    /// Packets handed to the controller and not yet acknowledged.
    pub(crate) sent_not_acked: u16,
    /// Transmit allocation for this link out of the per-transport budget.
    pub(crate) link_quota: u16,
    /// Dynamic channels, ascending priority value, FIFO within a priority.
    pub(crate) channels: Vec<(u8, Priority), CHANNELS_PER_LINK>,
    pub(crate) fixed: [Option<u8>; FIXED_CHANNELS],
    pub(crate) rr_cursor: u8,
    pub(crate) echo_pending: bool,
}

impl LinkStorage {
    pub const DISCONNECTED: LinkStorage = LinkStorage {
        in_use: false,
        gen: 0,
        addr: None,
        transport: Transport::Classic,
        handle: None,
        state: LinkState::Disconnected,
        bonding: false,
        idle_timeout: DEFAULT_IDLE_TIMEOUT,
        link_timer: Alarm::NEW,
        info_timer: Alarm::NEW,
        sent_not_acked: 0,
        link_quota: 0,
        channels: Vec::new(),
        fixed: [None; FIXED_CHANNELS],
        rr_cursor: 0,
        echo_pending: false,
    };
}

struct LmState<'d> {
    links: &'d mut [LinkStorage],
    classic_links: u8,
    le_links: u8,
    classic_window: u16,
    le_window: u16,
    classic_window_max: u16,
    le_window_max: u16,
}

impl<'d> LmState<'d> {
    fn adjust_allocation(&mut self, transport: Transport) {
        let (count, window) = match transport {
            Transport::Classic => (self.classic_links, self.classic_window_max),
            Transport::Le => (self.le_links, self.le_window_max),
        };
        if count == 0 {
            return;
        }
        let quota = (window / count as u16).max(1);
        for link in self.links.iter_mut() {
            if link.in_use && link.transport == transport {
                link.link_quota = quota;
            }
        }
        debug!("[link] {} links on transport, quota {}", count, quota);
    }
}

/// The ACL link pool.
pub struct LinkManager<'d> {
    state: RefCell<LmState<'d>>,
}

impl<'d> LinkManager<'d> {
    pub fn new(links: &'d mut [LinkStorage], classic_window: u16, le_window: u16) -> Self {
        Self {
            state: RefCell::new(LmState {
                links,
                classic_links: 0,
                le_links: 0,
                classic_window,
                le_window,
                classic_window_max: classic_window,
                le_window_max: le_window,
            }),
        }
    }

    /// First-fit allocation. Returns `None` when the pool is exhausted; the
    /// pool never grows.
    pub fn allocate(&self, addr: BdAddr, bonding: bool, transport: Transport) -> Option<LinkHandle> {
        let mut state = self.state.borrow_mut();
        for (idx, link) in state.links.iter_mut().enumerate() {
            if !link.in_use {
                let gen = link.gen.wrapping_add(1);
                *link = LinkStorage::DISCONNECTED;
                link.in_use = true;
                link.gen = gen;
                link.addr = Some(addr);
                link.transport = transport;
                link.bonding = bonding;
                link.state = LinkState::Disconnected;
                match transport {
                    Transport::Classic => state.classic_links += 1,
                    Transport::Le => state.le_links += 1,
                }
                state.adjust_allocation(transport);
                trace!("[link][alloc] slot {} for {:?}", idx, addr);
                return Some(LinkHandle {
                    index: idx as u8,
                    gen,
                });
            }
        }
        warn!("[link][alloc] pool exhausted");
        None
    }

    /// Tear a link down and return its slot to the pool. Queued channels are
    /// handed to `on_channel` one at a time for release; in-flight transmit
    /// credits go back to the per-transport budget. Idempotent: a stale
    /// handle is a no-op and the function returns false.
    pub fn release(&self, h: LinkHandle, mut on_channel: impl FnMut(u8)) -> bool {
        // Drain channel indices first so `on_channel` can re-enter us for
        // dequeueing without a double borrow.
        let drained = {
            let mut state = self.state.borrow_mut();
            let Some(link) = checked_mut(state.links, h) else {
                return false;
            };
            let mut drained: Vec<u8, { CHANNELS_PER_LINK + FIXED_CHANNELS }> = Vec::new();
            while let Some((idx, _)) = link.channels.pop() {
                let _ = drained.push(idx);
            }
            for slot in link.fixed.iter_mut() {
                if let Some(idx) = slot.take() {
                    let _ = drained.push(idx);
                }
            }
            drained
        };
        for idx in drained {
            on_channel(idx);
        }

        let mut state = self.state.borrow_mut();
        let Some(link) = checked_mut(state.links, h) else {
            return false;
        };
        link.link_timer.cancel();
        link.info_timer.cancel();
        link.echo_pending = false;
        let transport = link.transport;
        let unacked = link.sent_not_acked;
        link.sent_not_acked = 0;
        link.in_use = false;
        link.state = LinkState::Disconnected;
        link.handle = None;

        match transport {
            Transport::Classic => {
                state.classic_links = state.classic_links.saturating_sub(1);
                state.classic_window = (state.classic_window + unacked).min(state.classic_window_max);
            }
            Transport::Le => {
                state.le_links = state.le_links.saturating_sub(1);
                state.le_window = (state.le_window + unacked).min(state.le_window_max);
            }
        }
        state.adjust_allocation(transport);
        trace!("[link][release] slot {}", h.index);
        true
    }

    pub fn find_by_addr(&self, addr: BdAddr, transport: Transport) -> Option<LinkHandle> {
        let state = self.state.borrow();
        for (idx, link) in state.links.iter().enumerate() {
            if link.in_use && link.addr == Some(addr) && link.transport == transport {
                return Some(LinkHandle {
                    index: idx as u8,
                    gen: link.gen,
                });
            }
        }
        None
    }

    pub fn find_by_conn(&self, handle: ConnHandle) -> Option<LinkHandle> {
        let state = self.state.borrow();
        for (idx, link) in state.links.iter().enumerate() {
            if link.in_use && link.handle == Some(handle) {
                return Some(LinkHandle {
                    index: idx as u8,
                    gen: link.gen,
                });
            }
        }
        None
    }

    /// Current handle for a slot index, if the slot is live.
    pub fn handle_of(&self, index: u8) -> Option<LinkHandle> {
        let state = self.state.borrow();
        let link = state.links.get(index as usize)?;
        (link.in_use).then_some(LinkHandle {
            index,
            gen: link.gen,
        })
    }

    pub fn is_valid(&self, h: LinkHandle) -> bool {
        let state = self.state.borrow();
        checked(state.links, h).is_some()
    }

    /// Generation-checked access. `None` means the handle went stale.
    pub fn with<R>(&self, h: LinkHandle, f: impl FnOnce(&mut LinkStorage) -> R) -> Option<R> {
        let mut state = self.state.borrow_mut();
        checked_mut(state.links, h).map(f)
    }

    /// Mark the link up and start the information exchange timer.
    pub fn set_connected(&self, h: LinkHandle, conn: ConnHandle, now: Instant) {
        self.with(h, |link| {
            link.handle = Some(conn);
            link.state = LinkState::Connected;
            link.info_timer.set(now, INFO_RESPONSE_TIMEOUT);
        });
    }

    /// Flag the link as carrying a bonding attempt so idle handling leaves
    /// it alone. Returns false when no link to the peer exists.
    pub fn update_for_bonding(&self, addr: BdAddr, transport: Transport) -> bool {
        if let Some(h) = self.find_by_addr(addr, transport) {
            self.with(h, |link| {
                link.bonding = true;
                link.link_timer.cancel();
            });
            true
        } else {
            false
        }
    }

    pub fn clear_bonding(&self, addr: BdAddr, transport: Transport) {
        if let Some(h) = self.find_by_addr(addr, transport) {
            self.with(h, |link| link.bonding = false);
        }
    }

    /// Joining another piconet past the cap is avoided by switching roles on
    /// an existing link first.
    pub fn needs_role_switch(&self) -> bool {
        let state = self.state.borrow();
        state.classic_links as usize >= MAX_ACTIVE_PICONETS
    }

    /// Peer of some established classic link, the role-switch candidate when
    /// the piconet cap is hit.
    pub fn first_connected_classic(&self) -> Option<BdAddr> {
        let state = self.state.borrow();
        state
            .links
            .iter()
            .find(|l| l.in_use && l.transport == Transport::Classic && l.state == LinkState::Connected)
            .and_then(|l| l.addr)
    }

    /// Priority-ordered insert, FIFO within equal priorities. A new channel
    /// also disarms a running idle countdown: the link is in use again.
    pub fn enqueue_channel(&self, h: LinkHandle, chan_idx: u8, priority: Priority) -> bool {
        self.with(h, |link| {
            let pos = link
                .channels
                .iter()
                .position(|(_, p)| *p > priority)
                .unwrap_or(link.channels.len());
            let ok = link.channels.insert(pos, (chan_idx, priority)).is_ok();
            if ok && link.state == LinkState::Connected {
                link.link_timer.cancel();
            }
            ok
        })
        .unwrap_or(false)
    }

    pub fn dequeue_channel(&self, h: LinkHandle, chan_idx: u8) {
        self.with(h, |link| {
            if let Some(pos) = link.channels.iter().position(|(idx, _)| *idx == chan_idx) {
                link.channels.remove(pos);
            }
        });
    }

    pub fn attach_fixed(&self, h: LinkHandle, slot: usize, chan_idx: u8) -> bool {
        self.with(h, |link| {
            if link.fixed[slot].is_none() {
                link.fixed[slot] = Some(chan_idx);
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    pub fn dynamic_channel_count(&self, h: LinkHandle) -> usize {
        self.with(h, |link| link.channels.len()).unwrap_or(0)
    }

    /// The idle policy run when the last dynamic channel closes: take the
    /// longest fixed-channel timeout (a never-expiring fixed channel wins
    /// outright), fall back to the link idle timeout, and either arm the
    /// countdown or disconnect immediately on zero. Bonding links are left
    /// untouched.
    pub fn idle_check(&self, h: LinkHandle, fixed: FixedIdle, now: Instant, commands: &CommandSink) {
        self.with(h, |link| {
            if link.bonding {
                return;
            }
            let mut timeout = link.idle_timeout;
            match fixed {
                FixedIdle::NoFixed => {}
                FixedIdle::Never => {
                    link.link_timer.cancel();
                    return;
                }
                FixedIdle::Secs(secs) => timeout = timeout.max(secs),
            }
            if timeout == IDLE_TIMEOUT_NEVER {
                link.link_timer.cancel();
            } else if timeout == 0 {
                if let Some(conn) = link.handle {
                    debug!("[link][idle] timeout 0, disconnecting now");
                    commands.push(Command::Disconnect(conn, HciStatus::PeerUser));
                    link.state = LinkState::Disconnecting;
                    link.link_timer.set(now, LINK_DISCONNECT_TIMEOUT);
                }
            } else {
                link.link_timer
                    .set(now, embassy_time::Duration::from_secs(timeout as u64));
            }
        });
    }

    /// Return transmit credits acknowledged by the controller.
    pub fn on_packets_acked(&self, conn: ConnHandle, packets: u16) {
        let mut state = self.state.borrow_mut();
        for link in state.links.iter_mut() {
            if link.in_use && link.handle == Some(conn) {
                link.sent_not_acked = link.sent_not_acked.saturating_sub(packets);
                return;
            }
        }
        trace!("[link][acked] connection {:?} not found", conn);
    }

    /// Expired link timers, oldest slot first. The caller decides what an
    /// expiry means based on the returned state.
    pub fn poll_timers(&self, now: Instant) -> Option<(LinkHandle, LinkState)> {
        let mut state = self.state.borrow_mut();
        for (idx, link) in state.links.iter_mut().enumerate() {
            if link.in_use && link.link_timer.expired(now) {
                return Some((
                    LinkHandle {
                        index: idx as u8,
                        gen: link.gen,
                    },
                    link.state,
                ));
            }
            if link.in_use && link.info_timer.expired(now) {
                trace!("[link][info] response timed out on slot {}", idx);
            }
        }
        None
    }
}

fn checked<'a>(links: &'a [LinkStorage], h: LinkHandle) -> Option<&'a LinkStorage> {
    let link = links.get(h.index as usize)?;
    (link.in_use && link.gen == h.gen).then_some(link)
}

fn checked_mut<'a>(links: &'a mut [LinkStorage], h: LinkHandle) -> Option<&'a mut LinkStorage> {
    let link = links.get_mut(h.index as usize)?;
    (link.in_use && link.gen == h.gen).then_some(link)
}

#[cfg(test)]
mod tests {
    use embassy_time::Duration;

    use super::*;

    const ADDR_1: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
    const ADDR_2: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

    #[test]
    fn release_is_idempotent() {
        let mut storage = [LinkStorage::DISCONNECTED, LinkStorage::DISCONNECTED];
        let mgr = LinkManager::new(&mut storage[..], 8, 4);

        let h = unwrap!(mgr.allocate(BdAddr::new(ADDR_1), false, Transport::Classic));
        let mut released = 0;
        assert!(mgr.release(h, |_| released += 1));
        assert_eq!(released, 0);

        // Second release on the now-stale handle is a no-op.
        assert!(!mgr.release(h, |_| released += 1));
        assert!(!mgr.is_valid(h));
    }

    #[test]
    fn stale_handle_detected_after_reuse() {
        let mut storage = [LinkStorage::DISCONNECTED];
        let mgr = LinkManager::new(&mut storage[..], 8, 4);

        let h1 = unwrap!(mgr.allocate(BdAddr::new(ADDR_1), false, Transport::Classic));
        assert!(mgr.release(h1, |_| {}));

        let h2 = unwrap!(mgr.allocate(BdAddr::new(ADDR_2), false, Transport::Classic));
        assert!(!mgr.is_valid(h1));
        assert!(mgr.is_valid(h2));
        assert!(mgr.with(h1, |_| ()).is_none());
    }

    #[test]
    fn pool_exhaustion() {
        let mut storage = [LinkStorage::DISCONNECTED];
        let mgr = LinkManager::new(&mut storage[..], 8, 4);

        let _h = unwrap!(mgr.allocate(BdAddr::new(ADDR_1), false, Transport::Classic));
        assert!(mgr.allocate(BdAddr::new(ADDR_2), false, Transport::Le).is_none());
    }

    #[test]
    fn quota_rebalanced_across_links() {
        let mut storage = [LinkStorage::DISCONNECTED, LinkStorage::DISCONNECTED];
        let mgr = LinkManager::new(&mut storage[..], 8, 4);

        let h1 = unwrap!(mgr.allocate(BdAddr::new(ADDR_1), false, Transport::Classic));
        assert_eq!(mgr.with(h1, |l| l.link_quota), Some(8));

        let h2 = unwrap!(mgr.allocate(BdAddr::new(ADDR_2), false, Transport::Classic));
        assert_eq!(mgr.with(h1, |l| l.link_quota), Some(4));
        assert_eq!(mgr.with(h2, |l| l.link_quota), Some(4));

        assert!(mgr.release(h2, |_| {}));
        assert_eq!(mgr.with(h1, |l| l.link_quota), Some(8));
    }

    #[test]
    fn channel_queue_priority_order_fifo_ties() {
        let mut storage = [LinkStorage::DISCONNECTED];
        let mgr = LinkManager::new(&mut storage[..], 8, 4);
        let h = unwrap!(mgr.allocate(BdAddr::new(ADDR_1), false, Transport::Classic));

        assert!(mgr.enqueue_channel(h, 0, Priority::Low));
        assert!(mgr.enqueue_channel(h, 1, Priority::High));
        assert!(mgr.enqueue_channel(h, 2, Priority::Medium));
        assert!(mgr.enqueue_channel(h, 3, Priority::High));

        let order = unwrap!(mgr.with(h, |l| l.channels.clone()));
        let idxs: heapless::Vec<u8, 4> = order.iter().map(|(i, _)| *i).collect();
        assert_eq!(&idxs[..], &[1, 3, 2, 0]);

        mgr.dequeue_channel(h, 3);
        let order = unwrap!(mgr.with(h, |l| l.channels.clone()));
        let idxs: heapless::Vec<u8, 4> = order.iter().map(|(i, _)| *i).collect();
        assert_eq!(&idxs[..], &[1, 2, 0]);
    }

    #[test]
    fn idle_zero_disconnects_unless_bonding() {
        let t0 = Instant::from_ticks(0);
        let mut storage = [LinkStorage::DISCONNECTED];
        let mgr = LinkManager::new(&mut storage[..], 8, 4);
        let commands = CommandSink::new();

        let h = unwrap!(mgr.allocate(BdAddr::new(ADDR_1), true, Transport::Classic));
        mgr.set_connected(h, ConnHandle::new(9), t0);
        mgr.with(h, |l| l.idle_timeout = 0);

        // Bonding link: no action at all.
        mgr.idle_check(h, FixedIdle::NoFixed, t0, &commands);
        assert!(commands.try_take().is_none());
        assert_eq!(mgr.with(h, |l| l.state), Some(LinkState::Connected));

        mgr.with(h, |l| l.bonding = false);
        mgr.idle_check(h, FixedIdle::NoFixed, t0, &commands);
        assert_eq!(
            commands.try_take(),
            Some(Command::Disconnect(ConnHandle::new(9), HciStatus::PeerUser))
        );
        assert_eq!(mgr.with(h, |l| l.state), Some(LinkState::Disconnecting));
    }

    #[test]
    fn idle_timer_respects_fixed_channels() {
        let t0 = Instant::from_ticks(0);
        let mut storage = [LinkStorage::DISCONNECTED];
        let mgr = LinkManager::new(&mut storage[..], 8, 4);
        let commands = CommandSink::new();

        let h = unwrap!(mgr.allocate(BdAddr::new(ADDR_1), false, Transport::Classic));
        mgr.set_connected(h, ConnHandle::new(9), t0);
        mgr.with(h, |l| l.idle_timeout = 2);

        // A fixed channel with a longer timeout stretches the countdown.
        mgr.idle_check(h, FixedIdle::Secs(10), t0, &commands);
        assert!(mgr.poll_timers(t0 + Duration::from_secs(5)).is_none());
        let (expired, state) = unwrap!(mgr.poll_timers(t0 + Duration::from_secs(10)));
        assert_eq!(expired, h);
        assert_eq!(state, LinkState::Connected);

        // A never-expiring fixed channel disarms the countdown.
        mgr.idle_check(h, FixedIdle::Never, t0, &commands);
        assert!(mgr.poll_timers(t0 + Duration::from_secs(1000)).is_none());
    }

    #[test]
    fn new_channel_cancels_idle_countdown() {
        let t0 = Instant::from_ticks(0);
        let mut storage = [LinkStorage::DISCONNECTED];
        let mgr = LinkManager::new(&mut storage[..], 8, 4);
        let commands = CommandSink::new();

        let h = unwrap!(mgr.allocate(BdAddr::new(ADDR_1), false, Transport::Classic));
        mgr.set_connected(h, ConnHandle::new(9), t0);
        mgr.with(h, |l| l.idle_timeout = 4);
        mgr.idle_check(h, FixedIdle::NoFixed, t0, &commands);

        // A channel shows up before the countdown runs out; the link must
        // not be torn down under it.
        assert!(mgr.enqueue_channel(h, 0, Priority::Low));
        assert!(mgr.poll_timers(t0 + Duration::from_secs(10)).is_none());
        assert_eq!(mgr.with(h, |l| l.state), Some(LinkState::Connected));
    }

    #[test]
    fn credits_returned_on_release_clamped() {
        let mut storage = [LinkStorage::DISCONNECTED];
        let mgr = LinkManager::new(&mut storage[..], 8, 4);

        let h = unwrap!(mgr.allocate(BdAddr::new(ADDR_1), false, Transport::Classic));
        mgr.with(h, |l| l.sent_not_acked = 3);
        assert!(mgr.release(h, |_| {}));

        // Pool window never exceeds the controller maximum.
        let state = mgr.state.borrow();
        assert_eq!(state.classic_window, 8);
    }
}
