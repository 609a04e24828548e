//! Logical channel control blocks.
//!
//! One [`ChannelStorage`] per L2CAP channel, dynamic or fixed, linked into
//! its owning link's priority-ordered queue. Configuration negotiation,
//! transmit scheduling and congestion tracking live here; the signaling
//! bytes themselves are the controller layer's business.

use core::cell::RefCell;

use embassy_time::Instant;
use heapless::Deque;

use crate::alarm::Alarm;
use crate::command::{Command, CommandSink};
use crate::config::{
    CHANNEL_TX_QUEUE_SIZE, FIXED_CHANNELS, IDLE_TIMEOUT_NEVER, L2CAP_BASE_DYNAMIC_CID, L2CAP_DEFAULT_BUFF_QUOTA,
    L2CAP_MIN_MTU,
};
use crate::event::{EventSink, SecurityEvent};
use crate::link_manager::{FixedIdle, LinkHandle, LinkManager};
use crate::packet_pool::PacketId;
use crate::types::l2cap::{
    ChannelConfig, ConfigReq, ConfigResult, ConfigRsp, ConfigVerdict, FcrMode, Priority, QosOption, QosServiceType,
};
use crate::types::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    Closed,
    /// Originator waiting for the security gate before sending a connect
    /// request.
    OrigWaitSecComp,
    /// Acceptor waiting for the security gate before answering one.
    TermWaitSecComp,
    WaitConnectRsp,
    Config,
    Open,
    WaitDisconnectRsp,
}

/// Generation-checked reference to a channel slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChanHandle {
    pub(crate) index: u8,
    pub(crate) gen: u16,
}

#[derive(Debug)]
pub struct ChannelStorage {
    pub(crate) in_use: bool,
    pub(crate) gen: u16,
    /// Owning link slot. Always `Some` while queued on that link.
    pub(crate) link: Option<u8>,
    pub(crate) local_cid: u16,
    pub(crate) remote_cid: u16,
    pub(crate) fixed: bool,
    pub(crate) fixed_idle_timeout: u16,
    pub(crate) psm: u16,
    pub(crate) is_originator: bool,
    pub(crate) state: ChannelState,
    pub(crate) priority: Priority,
    pub(crate) local_cfg: ChannelConfig,
    pub(crate) peer_mtu: u16,
    pub(crate) peer_flush_timeout: u16,
    pub(crate) peer_qos: QosOption,
    pub(crate) our_cfg_done: bool,
    pub(crate) peer_cfg_done: bool,
    pub(crate) xmit_hold: Deque<PacketId, CHANNEL_TX_QUEUE_SIZE>,
    pub(crate) retrans_q: Deque<PacketId, CHANNEL_TX_QUEUE_SIZE>,
    /// ERTM: a poll is outstanding, hold transmission.
    pub(crate) wait_ack: bool,
    /// ERTM: peer closed our transmit window.
    pub(crate) tx_window_closed: bool,
    pub(crate) retrans_timer: Alarm,
    pub(crate) monitor_timer: Alarm,
    pub(crate) buff_quota: u16,
    pub(crate) congested: bool,
    pub(crate) in_congest_cb: bool,
    /// LE credit-based channels: peer credits left.
    pub(crate) le_credits: u16,
    /// Sends consumed from the current round-robin quota.
    pub(crate) served: u8,
}

impl ChannelStorage {
    pub const CLOSED: ChannelStorage = ChannelStorage {
        in_use: false,
        gen: 0,
        link: None,
        local_cid: 0,
        remote_cid: 0,
        fixed: false,
        fixed_idle_timeout: 0,
        psm: 0,
        is_originator: false,
        state: ChannelState::Closed,
        priority: Priority::Low,
        local_cfg: ChannelConfig {
            mtu: 672,
            flush_timeout: 0xffff,
            qos: QosOption {
                service_type: QosServiceType::BestEffort,
                token_rate: 0,
                token_bucket_size: 0,
                peak_bandwidth: 0,
                latency: u32::MAX,
                delay_variation: u32::MAX,
            },
            fcr: crate::types::l2cap::FcrOption {
                mode: FcrMode::Basic,
                tx_win_size: 10,
                max_transmit: 3,
                retrans_timeout: 2000,
                monitor_timeout: 12000,
                mps: 1010,
            },
            fcs: true,
        },
        peer_mtu: 672,
        peer_flush_timeout: 0xffff,
        peer_qos: QosOption {
            service_type: QosServiceType::BestEffort,
            token_rate: 0,
            token_bucket_size: 0,
            peak_bandwidth: 0,
            latency: u32::MAX,
            delay_variation: u32::MAX,
        },
        our_cfg_done: false,
        peer_cfg_done: false,
        xmit_hold: Deque::new(),
        retrans_q: Deque::new(),
        wait_ack: false,
        tx_window_closed: false,
        retrans_timer: Alarm::NEW,
        monitor_timer: Alarm::NEW,
        buff_quota: L2CAP_DEFAULT_BUFF_QUOTA,
        congested: false,
        in_congest_cb: false,
        le_credits: 0,
        served: 0,
    };

    fn ready_to_send(&self, transport: Transport) -> bool {
        if self.xmit_hold.is_empty() && self.retrans_q.is_empty() {
            return false;
        }
        if self.local_cfg.fcr.mode == FcrMode::Ertm && (self.wait_ack || self.tx_window_closed) {
            return false;
        }
        if transport == Transport::Le && self.le_credits == 0 {
            return false;
        }
        matches!(self.state, ChannelState::Open) || self.fixed
    }
}

struct CmState<'d> {
    channels: &'d mut [ChannelStorage],
}

/// The channel pool.
pub struct ChannelManager<'d> {
    state: RefCell<CmState<'d>>,
}

impl<'d> ChannelManager<'d> {
    pub fn new(channels: &'d mut [ChannelStorage]) -> Self {
        Self {
            state: RefCell::new(CmState { channels }),
        }
    }

    /// Allocate a dynamic channel on `link` and enqueue it at the default
    /// (low) priority. The local CID is derived from the slot index.
    pub fn alloc(&self, links: &LinkManager, link: LinkHandle, psm: u16, is_originator: bool) -> Option<ChanHandle> {
        let handle = {
            let mut state = self.state.borrow_mut();
            let mut found = None;
            for (idx, chan) in state.channels.iter_mut().enumerate() {
                if !chan.in_use {
                    let gen = chan.gen.wrapping_add(1);
                    *chan = ChannelStorage::CLOSED;
                    chan.in_use = true;
                    chan.gen = gen;
                    chan.link = Some(link.index);
                    chan.local_cid = L2CAP_BASE_DYNAMIC_CID + idx as u16;
                    chan.psm = psm;
                    chan.is_originator = is_originator;
                    chan.state = if is_originator {
                        ChannelState::OrigWaitSecComp
                    } else {
                        ChannelState::TermWaitSecComp
                    };
                    found = Some(ChanHandle {
                        index: idx as u8,
                        gen,
                    });
                    break;
                }
            }
            found
        }?;
        if !links.enqueue_channel(link, handle.index, Priority::Low) {
            // Roll the slot back rather than leave an orphan.
            self.state.borrow_mut().channels[handle.index as usize].in_use = false;
            return None;
        }
        trace!("[chan][alloc] cid {:#06x} on link {}", self.cid_of(handle), link.index);
        Some(handle)
    }

    /// Allocate a fixed channel with its own idle timeout
    /// ([`IDLE_TIMEOUT_NEVER`] means the link never idles out while it is
    /// up) and attach it to the link's fixed-channel array.
    pub fn alloc_fixed(
        &self,
        links: &LinkManager,
        link: LinkHandle,
        cid: u16,
        slot: usize,
        idle_timeout: u16,
    ) -> Option<ChanHandle> {
        let handle = {
            let mut state = self.state.borrow_mut();
            let mut found = None;
            for (idx, chan) in state.channels.iter_mut().enumerate() {
                if !chan.in_use {
                    let gen = chan.gen.wrapping_add(1);
                    *chan = ChannelStorage::CLOSED;
                    chan.in_use = true;
                    chan.gen = gen;
                    chan.link = Some(link.index);
                    chan.local_cid = cid;
                    chan.remote_cid = cid;
                    chan.fixed = true;
                    chan.fixed_idle_timeout = idle_timeout;
                    chan.state = ChannelState::Open;
                    found = Some(ChanHandle {
                        index: idx as u8,
                        gen,
                    });
                    break;
                }
            }
            found
        }?;
        if slot >= FIXED_CHANNELS || !links.attach_fixed(link, slot, handle.index) {
            self.state.borrow_mut().channels[handle.index as usize].in_use = false;
            return None;
        }
        Some(handle)
    }

    pub fn is_valid(&self, h: ChanHandle) -> bool {
        let state = self.state.borrow();
        checked(state.channels, h).is_some()
    }

    pub fn with<R>(&self, h: ChanHandle, f: impl FnOnce(&mut ChannelStorage) -> R) -> Option<R> {
        let mut state = self.state.borrow_mut();
        checked_mut(state.channels, h).map(f)
    }

    pub fn cid_of(&self, h: ChanHandle) -> u16 {
        self.with(h, |chan| chan.local_cid).unwrap_or(0)
    }

    pub fn find_by_cid(&self, local_cid: u16) -> Option<ChanHandle> {
        let state = self.state.borrow();
        for (idx, chan) in state.channels.iter().enumerate() {
            if chan.in_use && chan.local_cid == local_cid {
                return Some(ChanHandle {
                    index: idx as u8,
                    gen: chan.gen,
                });
            }
        }
        None
    }

    /// Release a channel: dequeue from the owning link, hand queued packets
    /// back through `free_pkt`, free the slot. Dequeue always precedes the
    /// free. Idempotent for stale handles.
    pub fn release(&self, h: ChanHandle, links: &LinkManager, mut free_pkt: impl FnMut(PacketId)) -> bool {
        let link_idx = {
            let state = self.state.borrow();
            match checked(state.channels, h) {
                Some(chan) => chan.link,
                None => return false,
            }
        };
        if let Some(link_idx) = link_idx {
            if let Some(link) = links_handle(links, link_idx) {
                links.dequeue_channel(link, h.index);
            }
        }
        let mut state = self.state.borrow_mut();
        let Some(chan) = checked_mut(state.channels, h) else {
            return false;
        };
        while let Some(id) = chan.xmit_hold.pop_front() {
            free_pkt(id);
        }
        while let Some(id) = chan.retrans_q.pop_front() {
            free_pkt(id);
        }
        chan.retrans_timer.cancel();
        chan.monitor_timer.cancel();
        chan.link = None;
        chan.in_use = false;
        chan.state = ChannelState::Closed;
        trace!("[chan][release] slot {}", h.index);
        true
    }

    /// Release by slot index, used by link teardown where the link has
    /// already forgotten the channel. Returns the local CID that went away.
    pub fn release_by_index(&self, index: u8, mut free_pkt: impl FnMut(PacketId)) -> Option<u16> {
        let mut state = self.state.borrow_mut();
        let chan = state.channels.get_mut(index as usize)?;
        if !chan.in_use {
            return None;
        }
        while let Some(id) = chan.xmit_hold.pop_front() {
            free_pkt(id);
        }
        while let Some(id) = chan.retrans_q.pop_front() {
            free_pkt(id);
        }
        chan.retrans_timer.cancel();
        chan.monitor_timer.cancel();
        chan.link = None;
        chan.in_use = false;
        chan.state = ChannelState::Closed;
        Some(chan.local_cid)
    }

    /// First channel on `link_index` still parked behind the security gate.
    pub fn next_sec_waiting(&self, link_index: u8) -> Option<ChanHandle> {
        let state = self.state.borrow();
        for (idx, chan) in state.channels.iter().enumerate() {
            if chan.in_use
                && chan.link == Some(link_index)
                && matches!(chan.state, ChannelState::OrigWaitSecComp | ChannelState::TermWaitSecComp)
            {
                return Some(ChanHandle {
                    index: idx as u8,
                    gen: chan.gen,
                });
            }
        }
        None
    }

    /// Peer sent a configuration request. Each option is validated on its
    /// own; MTU and flush timeout have explicit fallbacks, QoS falls back to
    /// best effort, and a flow-control mode we cannot run is grounds for
    /// disconnection rather than endless renegotiation.
    pub fn process_peer_cfg_req(&self, h: ChanHandle, req: &ConfigReq) -> ConfigVerdict {
        let Some(verdict) = self.with(h, |chan| {
            let mut rsp = ConfigRsp::default();
            let mut unacceptable = false;

            if let Some(mtu) = req.mtu {
                if mtu < L2CAP_MIN_MTU {
                    rsp.mtu = Some(L2CAP_MIN_MTU);
                    unacceptable = true;
                } else {
                    chan.peer_mtu = mtu;
                }
            }
            if let Some(flush) = req.flush_timeout {
                if flush == 0 {
                    rsp.flush_timeout = Some(chan.local_cfg.flush_timeout);
                    unacceptable = true;
                } else {
                    chan.peer_flush_timeout = flush;
                }
            }
            if let Some(qos) = req.qos {
                if qos.service_type == QosServiceType::Guaranteed {
                    // We do not run a guaranteed scheduler; offer best effort.
                    rsp.qos = Some(QosOption::default());
                    unacceptable = true;
                } else {
                    chan.peer_qos = qos;
                }
            }
            if let Some(fcr) = req.fcr {
                if fcr.mode != chan.local_cfg.fcr.mode {
                    return ConfigVerdict::Disconnect;
                }
            }

            if unacceptable {
                rsp.result = ConfigResult::UnacceptableParams;
                ConfigVerdict::Unacceptable(rsp)
            } else {
                chan.peer_cfg_done = true;
                if chan.our_cfg_done && chan.state == ChannelState::Config {
                    chan.state = ChannelState::Open;
                }
                ConfigVerdict::Ok(rsp)
            }
        }) else {
            return ConfigVerdict::Disconnect;
        };
        verdict
    }

    /// Build the configuration request we send, marking the exchange as
    /// started.
    pub fn process_our_cfg_req(&self, h: ChanHandle) -> Option<ConfigReq> {
        self.with(h, |chan| {
            chan.state = ChannelState::Config;
            ConfigReq {
                mtu: Some(chan.local_cfg.mtu),
                flush_timeout: None,
                qos: None,
                fcr: (chan.local_cfg.fcr.mode != FcrMode::Basic).then_some(chan.local_cfg.fcr),
                fcs: None,
            }
        })
    }

    /// Peer answered our configuration request.
    pub fn process_our_cfg_rsp(&self, h: ChanHandle, rsp: &ConfigRsp) -> ConfigVerdict {
        let Some(verdict) = self.with(h, |chan| match rsp.result {
            ConfigResult::Ok => {
                if let Some(mtu) = rsp.mtu {
                    chan.local_cfg.mtu = mtu;
                }
                chan.our_cfg_done = true;
                if chan.peer_cfg_done && chan.state == ChannelState::Config {
                    chan.state = ChannelState::Open;
                }
                ConfigVerdict::Ok(*rsp)
            }
            ConfigResult::UnacceptableParams => {
                // Adopt the peer's counter-proposal when it is sane,
                // otherwise give up on the channel.
                if let Some(mtu) = rsp.mtu {
                    if mtu < L2CAP_MIN_MTU {
                        return ConfigVerdict::Disconnect;
                    }
                    chan.local_cfg.mtu = mtu;
                }
                if rsp.fcr.map(|f| f.mode) == Some(chan.local_cfg.fcr.mode) || rsp.fcr.is_none() {
                    ConfigVerdict::Unacceptable(*rsp)
                } else {
                    ConfigVerdict::Disconnect
                }
            }
            _ => ConfigVerdict::Disconnect,
        }) else {
            return ConfigVerdict::Disconnect;
        };
        verdict
    }

    /// Disconnect a dynamic channel: send the request, release immediately
    /// without waiting for the response, tell the upper layer with the
    /// non-confirmed flag. Fixed channels are not disconnectable this way.
    pub fn disconnect_chnl(
        &self,
        h: ChanHandle,
        links: &LinkManager,
        commands: &CommandSink,
        events: &EventSink,
        free_pkt: impl FnMut(PacketId),
    ) -> bool {
        let Some((local_cid, remote_cid, link_idx)) =
            self.with(h, |chan| (chan.local_cid, chan.remote_cid, chan.link))
        else {
            return false;
        };
        if local_cid < L2CAP_BASE_DYNAMIC_CID {
            return false;
        }
        if let Some(link) = link_idx.and_then(|idx| links_handle(links, idx)) {
            if let Some(conn) = links.with(link, |l| l.handle).flatten() {
                commands.push(Command::L2capDisconnectReq {
                    handle: conn,
                    dcid: remote_cid,
                    scid: local_cid,
                });
            }
        }
        self.release(h, links, free_pkt);
        events.push(SecurityEvent::ChannelDisconnected {
            cid: local_cid,
            confirmed: false,
        });
        true
    }

    /// Queue a PDU for transmission, tracking the congestion edge.
    pub fn enqueue_pdu(&self, h: ChanHandle, id: PacketId, events: &EventSink) -> Result<(), PacketId> {
        let Some(result) = self.with(h, |chan| {
            chan.xmit_hold.push_back(id).map_err(|id| id)?;
            Ok(())
        }) else {
            return Err(id);
        };
        result?;
        self.check_congestion(h, events);
        Ok(())
    }

    /// Pick the next PDU to hand to the controller for `link`. Fixed
    /// channels are serviced before dynamic ones; dynamic channels within a
    /// priority group share the link round-robin, each getting a quota of
    /// consecutive sends proportional to its urgency. Retransmissions drain
    /// before fresh data.
    pub fn next_pdu(&self, links: &LinkManager, link: LinkHandle, events: &EventSink) -> Option<(ChanHandle, PacketId)> {
        let (transport, fixed, queue, cursor) = links.with(link, |l| {
            (
                l.transport,
                l.fixed,
                l.channels.clone(),
                l.rr_cursor as usize,
            )
        })?;

        // Fixed channels first.
        for slot in fixed.iter().flatten() {
            if let Some(picked) = self.try_take(*slot, transport) {
                self.check_decongestion(picked.0, events);
                return Some(picked);
            }
        }

        if queue.is_empty() {
            return None;
        }
        // Rotate inside the priority-sorted queue: scan from the cursor,
        // wrapping, but never let a lower priority overtake a ready higher
        // one in the same pass.
        let len = queue.len();
        let mut best: Option<(usize, Priority)> = None;
        for offset in 0..len {
            let pos = (cursor + offset) % len;
            let (idx, prio) = queue[pos];
            let ready = {
                let state = self.state.borrow();
                state
                    .channels
                    .get(idx as usize)
                    .map(|c| c.in_use && c.ready_to_send(transport))
                    .unwrap_or(false)
            };
            if ready {
                match best {
                    Some((_, bp)) if bp <= prio => {}
                    _ => best = Some((pos, prio)),
                }
            }
        }
        let (pos, prio) = best?;
        let idx = queue[pos].0;
        let picked = self.try_take(idx, transport)?;

        // Quota bookkeeping decides whether the cursor moves on.
        let rotate = self
            .state
            .borrow_mut()
            .channels
            .get_mut(idx as usize)
            .map(|chan| {
                chan.served += 1;
                if chan.served >= crate::config::priority_quota(prio as u8) {
                    chan.served = 0;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(true);
        links.with(link, |l| {
            l.rr_cursor = if rotate { ((pos + 1) % len) as u8 } else { pos as u8 };
        });

        self.check_decongestion(picked.0, events);
        Some(picked)
    }

    fn try_take(&self, index: u8, transport: Transport) -> Option<(ChanHandle, PacketId)> {
        let mut state = self.state.borrow_mut();
        let chan = state.channels.get_mut(index as usize)?;
        if !chan.in_use || !chan.ready_to_send(transport) {
            return None;
        }
        let id = chan.retrans_q.pop_front().or_else(|| chan.xmit_hold.pop_front())?;
        if transport == Transport::Le {
            chan.le_credits -= 1;
        }
        Some((
            ChanHandle {
                index,
                gen: chan.gen,
            },
            id,
        ))
    }

    /// ERTM retransmission timer driver: expiry re-queues everything that
    /// was awaiting acknowledgement.
    pub fn poll_fcr_timers(&self, now: Instant) {
        let mut state = self.state.borrow_mut();
        for chan in state.channels.iter_mut() {
            if chan.in_use && chan.retrans_timer.expired(now) {
                chan.wait_ack = false;
                debug!("[chan][fcr] retransmission timeout on cid {:#06x}", chan.local_cid);
            }
            if chan.in_use && chan.monitor_timer.expired(now) {
                chan.tx_window_closed = false;
            }
        }
    }

    pub fn grant_le_credits(&self, h: ChanHandle, credits: u16) {
        self.with(h, |chan| chan.le_credits = chan.le_credits.saturating_add(credits));
    }

    pub fn set_priority(&self, h: ChanHandle, links: &LinkManager, priority: Priority) {
        let Some(link_idx) = self.with(h, |chan| {
            chan.priority = priority;
            chan.link
        }) else {
            return;
        };
        // Reposition inside the link queue.
        if let Some(link) = link_idx.and_then(|idx| links_handle(links, idx)) {
            links.dequeue_channel(link, h.index);
            links.enqueue_channel(link, h.index, priority);
        }
    }

    pub fn set_buff_quota(&self, h: ChanHandle, quota: u16, events: &EventSink) {
        self.with(h, |chan| chan.buff_quota = quota);
        self.check_congestion(h, events);
        self.check_decongestion(h, events);
    }

    /// Longest fixed-channel idle timeout on a link, for the idle policy.
    pub fn fixed_idle(&self, fixed: [Option<u8>; FIXED_CHANNELS]) -> FixedIdle {
        let state = self.state.borrow();
        let mut longest: Option<u16> = None;
        for idx in fixed.iter().flatten() {
            if let Some(chan) = state.channels.get(*idx as usize) {
                if chan.in_use && chan.fixed {
                    if chan.fixed_idle_timeout == IDLE_TIMEOUT_NEVER {
                        return FixedIdle::Never;
                    }
                    longest = Some(longest.unwrap_or(0).max(chan.fixed_idle_timeout));
                }
            }
        }
        match longest {
            Some(secs) => FixedIdle::Secs(secs),
            None => FixedIdle::NoFixed,
        }
    }

    /// Congested edge: queue length climbed past the quota.
    fn check_congestion(&self, h: ChanHandle, events: &EventSink) {
        let Some(Some(cid)) = self.with(h, |chan| {
            if chan.buff_quota == 0 || chan.in_congest_cb {
                return None;
            }
            if !chan.congested && chan.xmit_hold.len() as u16 > chan.buff_quota {
                chan.congested = true;
                chan.in_congest_cb = true;
                Some(chan.local_cid)
            } else {
                None
            }
        }) else {
            return;
        };
        events.push(SecurityEvent::ChannelCongestion { cid, congested: true });
        self.with(h, |chan| chan.in_congest_cb = false);
    }

    /// Decongested edge: queue drained to half the quota or less. The gap
    /// between the two thresholds keeps the state from oscillating.
    fn check_decongestion(&self, h: ChanHandle, events: &EventSink) {
        let Some(Some(cid)) = self.with(h, |chan| {
            if chan.buff_quota == 0 || chan.in_congest_cb {
                return None;
            }
            if chan.congested && chan.xmit_hold.len() as u16 <= chan.buff_quota / 2 {
                chan.congested = false;
                chan.in_congest_cb = true;
                Some(chan.local_cid)
            } else {
                None
            }
        }) else {
            return;
        };
        events.push(SecurityEvent::ChannelCongestion { cid, congested: false });
        self.with(h, |chan| chan.in_congest_cb = false);
    }
}

fn links_handle(links: &LinkManager, index: u8) -> Option<LinkHandle> {
    links.handle_of(index)
}

fn checked<'a>(channels: &'a [ChannelStorage], h: ChanHandle) -> Option<&'a ChannelStorage> {
    let chan = channels.get(h.index as usize)?;
    (chan.in_use && chan.gen == h.gen).then_some(chan)
}

fn checked_mut<'a>(channels: &'a mut [ChannelStorage], h: ChanHandle) -> Option<&'a mut ChannelStorage> {
    let chan = channels.get_mut(h.index as usize)?;
    (chan.in_use && chan.gen == h.gen).then_some(chan)
}

#[cfg(test)]
mod tests {
    use bt_hci::param::BdAddr;

    use super::*;
    use crate::link_manager::LinkStorage;
    use crate::packet_pool::PacketPool;

    const ADDR_1: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    fn setup<'a>(
        links: &'a mut [LinkStorage],
        channels: &'a mut [ChannelStorage],
    ) -> (LinkManager<'a>, ChannelManager<'a>, LinkHandle) {
        let links = LinkManager::new(links, 8, 4);
        let channels = ChannelManager::new(channels);
        let link = unwrap!(links.allocate(BdAddr::new(ADDR_1), false, Transport::Classic));
        (links, channels, link)
    }

    #[test]
    fn mtu_validation() {
        let mut ls = [LinkStorage::DISCONNECTED];
        let mut cs = [ChannelStorage::CLOSED];
        let (links, channels, link) = setup(&mut ls, &mut cs);

        let h = unwrap!(channels.alloc(&links, link, 3, false));
        channels.with(h, |c| c.state = ChannelState::Config);

        // At the protocol minimum: accepted verbatim, response carries no MTU.
        let verdict = channels.process_peer_cfg_req(
            h,
            &ConfigReq {
                mtu: Some(48),
                ..Default::default()
            },
        );
        match verdict {
            ConfigVerdict::Ok(rsp) => {
                assert_eq!(rsp.mtu, None);
                assert_eq!(rsp.result, ConfigResult::Ok);
            }
            other => panic!("unexpected verdict {:?}", other),
        }
        assert_eq!(channels.with(h, |c| c.peer_mtu), Some(48));

        // Below the minimum: rejected with the minimum substituted.
        let verdict = channels.process_peer_cfg_req(
            h,
            &ConfigReq {
                mtu: Some(10),
                ..Default::default()
            },
        );
        match verdict {
            ConfigVerdict::Unacceptable(rsp) => {
                assert_eq!(rsp.mtu, Some(48));
                assert_eq!(rsp.result, ConfigResult::UnacceptableParams);
            }
            other => panic!("unexpected verdict {:?}", other),
        }
        assert_eq!(channels.with(h, |c| c.peer_mtu), Some(48));
    }

    #[test]
    fn incompatible_fcr_mode_disconnects() {
        let mut ls = [LinkStorage::DISCONNECTED];
        let mut cs = [ChannelStorage::CLOSED];
        let (links, channels, link) = setup(&mut ls, &mut cs);

        let h = unwrap!(channels.alloc(&links, link, 3, false));
        let verdict = channels.process_peer_cfg_req(
            h,
            &ConfigReq {
                fcr: Some(crate::types::l2cap::FcrOption {
                    mode: FcrMode::Ertm,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        assert_eq!(verdict, ConfigVerdict::Disconnect);
    }

    #[test]
    fn congestion_hysteresis_edges() {
        let mut ls = [LinkStorage::DISCONNECTED];
        let mut cs = [ChannelStorage::CLOSED];
        let (links, channels, link) = setup(&mut ls, &mut cs);
        let events = EventSink::new();
        let pool: PacketPool<16, 8> = PacketPool::new();

        let h = unwrap!(channels.alloc(&links, link, 3, true));
        channels.with(h, |c| {
            c.state = ChannelState::Open;
            c.buff_quota = 2;
        });

        // Three enqueues with quota two: exactly one congested edge.
        for _ in 0..3 {
            let id = unwrap!(pool.alloc(&[0xab]));
            unwrap!(channels.enqueue_pdu(h, id, &events).ok());
        }
        assert_eq!(
            events.try_take(),
            Some(SecurityEvent::ChannelCongestion {
                cid: 0x0040,
                congested: true
            })
        );
        assert!(events.try_take().is_none());

        // Draining to two (still above quota/2) must not notify.
        let _ = unwrap!(channels.next_pdu(&links, link, &events));
        assert!(events.try_take().is_none());

        // Draining to one (== quota/2) notifies exactly once.
        let _ = unwrap!(channels.next_pdu(&links, link, &events));
        assert_eq!(
            events.try_take(),
            Some(SecurityEvent::ChannelCongestion {
                cid: 0x0040,
                congested: false
            })
        );
        assert!(events.try_take().is_none());
    }

    #[test]
    fn fixed_channels_serviced_first() {
        let mut ls = [LinkStorage::DISCONNECTED];
        let mut cs = [ChannelStorage::CLOSED; 3];
        let (links, channels, link) = setup(&mut ls, &mut cs);
        let events = EventSink::new();
        let pool: PacketPool<16, 8> = PacketPool::new();

        let dynamic = unwrap!(channels.alloc(&links, link, 3, true));
        channels.with(dynamic, |c| c.state = ChannelState::Open);
        let fixed = unwrap!(channels.alloc_fixed(&links, link, 0x0002, 0, 0));

        let d1 = unwrap!(pool.alloc(&[1]));
        unwrap!(channels.enqueue_pdu(dynamic, d1, &events).ok());
        let f1 = unwrap!(pool.alloc(&[2]));
        unwrap!(channels.enqueue_pdu(fixed, f1, &events).ok());

        let (picked, id) = unwrap!(channels.next_pdu(&links, link, &events));
        assert_eq!(picked, fixed);
        assert_eq!(id, f1);

        let (picked, id) = unwrap!(channels.next_pdu(&links, link, &events));
        assert_eq!(picked, dynamic);
        assert_eq!(id, d1);
    }

    #[test]
    fn ertm_wait_ack_skipped() {
        let mut ls = [LinkStorage::DISCONNECTED];
        let mut cs = [ChannelStorage::CLOSED];
        let (links, channels, link) = setup(&mut ls, &mut cs);
        let events = EventSink::new();
        let pool: PacketPool<16, 8> = PacketPool::new();

        let h = unwrap!(channels.alloc(&links, link, 3, true));
        channels.with(h, |c| {
            c.state = ChannelState::Open;
            c.local_cfg.fcr.mode = FcrMode::Ertm;
            c.wait_ack = true;
        });
        let id = unwrap!(pool.alloc(&[1]));
        unwrap!(channels.enqueue_pdu(h, id, &events).ok());

        assert!(channels.next_pdu(&links, link, &events).is_none());

        channels.with(h, |c| c.wait_ack = false);
        assert!(channels.next_pdu(&links, link, &events).is_some());
    }

    #[test]
    fn le_credit_gating() {
        let mut ls = [LinkStorage::DISCONNECTED];
        let mut cs = [ChannelStorage::CLOSED];
        let links = LinkManager::new(&mut ls, 8, 4);
        let channels = ChannelManager::new(&mut cs);
        let link = unwrap!(links.allocate(BdAddr::new(ADDR_1), false, Transport::Le));
        let events = EventSink::new();
        let pool: PacketPool<16, 8> = PacketPool::new();

        let h = unwrap!(channels.alloc(&links, link, 0x25, true));
        channels.with(h, |c| c.state = ChannelState::Open);
        let id = unwrap!(pool.alloc(&[1]));
        unwrap!(channels.enqueue_pdu(h, id, &events).ok());

        // No credits: nothing to send.
        assert!(channels.next_pdu(&links, link, &events).is_none());

        channels.grant_le_credits(h, 1);
        assert!(channels.next_pdu(&links, link, &events).is_some());
        assert_eq!(channels.with(h, |c| c.le_credits), Some(0));
    }

    #[test]
    fn disconnect_dynamic_only_releases_immediately() {
        let mut ls = [LinkStorage::DISCONNECTED];
        let mut cs = [ChannelStorage::CLOSED; 2];
        let (links, channels, link) = setup(&mut ls, &mut cs);
        let commands = CommandSink::new();
        let events = EventSink::new();

        let fixed = unwrap!(channels.alloc_fixed(&links, link, 0x0002, 0, 0));
        assert!(!channels.disconnect_chnl(fixed, &links, &commands, &events, |_| {}));

        let dynamic = unwrap!(channels.alloc(&links, link, 3, true));
        links.with(link, |l| l.handle = Some(bt_hci::param::ConnHandle::new(4)));
        channels.with(dynamic, |c| {
            c.state = ChannelState::Open;
            c.remote_cid = 0x0050;
        });
        assert!(channels.disconnect_chnl(dynamic, &links, &commands, &events, |_| {}));
        assert!(!channels.is_valid(dynamic));
        assert!(matches!(commands.try_take(), Some(Command::L2capDisconnectReq { .. })));
        assert_eq!(
            events.try_take(),
            Some(SecurityEvent::ChannelDisconnected {
                cid: 0x0041,
                confirmed: false
            })
        );
        assert_eq!(links.dynamic_channel_count(link), 0);
    }
}
