//! A fixed pool of transmit packet buffers.
//!
//! Channel queues hold [`PacketId`]s rather than buffer references so the
//! control blocks stay `'static`-friendly; the dispatch context resolves an
//! id back to bytes when the scheduler hands it a packet to send.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;

/// Index of an allocated buffer in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketId(pub(crate) u8);

struct PacketBuf<const MTU: usize> {
    buf: [u8; MTU],
    len: usize,
    free: bool,
}

impl<const MTU: usize> PacketBuf<MTU> {
    const NEW: PacketBuf<MTU> = PacketBuf {
        buf: [0; MTU],
        len: 0,
        free: true,
    };
}

struct State<const MTU: usize, const N: usize> {
    packets: [PacketBuf<MTU>; N],
}

/// Pool of `N` buffers of `MTU` bytes each.
pub struct PacketPool<const MTU: usize, const N: usize> {
    state: Mutex<NoopRawMutex, RefCell<State<MTU, N>>>,
}

impl<const MTU: usize, const N: usize> Default for PacketPool<MTU, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const MTU: usize, const N: usize> PacketPool<MTU, N> {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(State {
                packets: [PacketBuf::NEW; N],
            })),
        }
    }

    /// Allocate a buffer and fill it with `data`. Returns `None` when the
    /// pool is exhausted or `data` exceeds the MTU.
    pub fn alloc(&self, data: &[u8]) -> Option<PacketId> {
        if data.len() > MTU {
            return None;
        }
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            for (idx, packet) in state.packets.iter_mut().enumerate() {
                if packet.free {
                    packet.free = false;
                    packet.buf[..data.len()].copy_from_slice(data);
                    packet.len = data.len();
                    return Some(PacketId(idx as u8));
                }
            }
            None
        })
    }

    pub fn free(&self, id: PacketId) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.packets[id.0 as usize].free = true;
        });
    }

    /// Borrow the payload of an allocated packet.
    pub fn with<R>(&self, id: PacketId, f: impl FnOnce(&[u8]) -> R) -> R {
        self.state.lock(|state| {
            let state = state.borrow();
            let packet = &state.packets[id.0 as usize];
            f(&packet.buf[..packet.len])
        })
    }

    pub fn available(&self) -> usize {
        self.state.lock(|state| {
            let state = state.borrow();
            state.packets.iter().filter(|p| p.free).count()
        })
    }
}

#[cfg(test)]
mod tests {
    use static_cell::StaticCell;

    use super::*;

    #[test]
    fn exhaustion_and_reuse() {
        static POOL: StaticCell<PacketPool<16, 2>> = StaticCell::new();
        let pool = POOL.init(PacketPool::new());

        let a = unwrap!(pool.alloc(&[1, 2, 3]));
        let b = unwrap!(pool.alloc(&[4, 5]));
        assert!(pool.alloc(&[6]).is_none());

        pool.with(a, |buf| assert_eq!(buf, &[1, 2, 3]));
        pool.with(b, |buf| assert_eq!(buf, &[4, 5]));

        pool.free(a);
        let c = unwrap!(pool.alloc(&[7; 16]));
        pool.with(c, |buf| assert_eq!(buf.len(), 16));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn oversized_rejected() {
        let pool: PacketPool<4, 1> = PacketPool::new();
        assert!(pool.alloc(&[0; 5]).is_none());
        assert_eq!(pool.available(), 1);
    }
}
