use std::{
    sync::Mutex,
    time::Duration,
};

use tokio::{
    sync::Semaphore,
    time::timeout,
};

use crate::volume::{SectorBuf, SECTOR_SIZE};

/// Number of sector buffers per partial file, which also bounds the number of
/// writes in flight to the device at once.
pub const POOL_SLOTS: usize = 4;

/// Bounded wait for a free slot before the write path gives up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed pool of preallocated sector buffers.
///
/// Admission goes through the semaphore; slot identity comes from the bitmap.
/// A slot acquired here travels with its write request to the device and
/// comes back through [`SectorPool::release`] in the completion callback, so
/// holding all permits at once means nothing is in flight.
pub struct SectorPool {
    sem: Semaphore,
    inner: Mutex<Inner>,
}

struct Inner {
    slot_mask: u32,
    buffers: [Option<SectorBuf>; POOL_SLOTS],
}

impl SectorPool {
    pub fn new() -> Self {
        Self {
            sem: Semaphore::new(POOL_SLOTS),
            inner: Mutex::new(Inner {
                slot_mask: 0,
                buffers: std::array::from_fn(|_| Some(Box::new([0u8; SECTOR_SIZE]))),
            }),
        }
    }

    /// Take the lowest free slot out of the pool, waiting a bounded time for
    /// one to free up. The returned buffer is zeroed.
    pub async fn acquire(&self) -> Option<(usize, SectorBuf)> {
        let permit = match timeout(ACQUIRE_TIMEOUT, self.sem.acquire()).await {
            Ok(Ok(permit)) => permit,
            _ => return None,
        };
        permit.forget();

        let (slot, mut buf) = {
            let mut inner = self.inner.lock().unwrap();
            let slot = inner.slot_mask.trailing_ones() as usize;
            debug_assert!(slot < POOL_SLOTS);
            inner.slot_mask |= 1 << slot;
            // The mask bit was clear, so the buffer has to be home.
            let buf = inner.buffers[slot].take().unwrap();
            (slot, buf)
        };

        buf.fill(0);
        Some((slot, buf))
    }

    /// Put a slot back. Safe to call from the device's writer thread.
    pub fn release(&self, slot: usize, buf: SectorBuf) {
        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(inner.slot_mask & (1 << slot) != 0);
            inner.slot_mask &= !(1 << slot);
            inner.buffers[slot] = Some(buf);
        }
        self.sem.add_permits(1);
    }

    /// Flush primitive: acquire `POOL_SLOTS - avoid` permits, then hand them
    /// straight back. Once all of them were held at the same time, no
    /// previously submitted sector can still be in flight. Returns whether
    /// all of them were obtained; with `force` the wait is unbounded and the
    /// drain cannot fail.
    pub async fn sync(&self, avoid: usize, force: bool) -> bool {
        debug_assert!(avoid <= POOL_SLOTS);
        let want = (POOL_SLOTS - avoid) as u32;

        if force {
            self.sem.acquire_many(want).await.is_ok()
        } else {
            matches!(timeout(ACQUIRE_TIMEOUT, self.sem.acquire_many(want)).await, Ok(Ok(_)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_assigns_lowest_slot() {
        let pool = SectorPool::new();

        let (s0, b0) = pool.acquire().await.unwrap();
        let (s1, b1) = pool.acquire().await.unwrap();
        let (s2, b2) = pool.acquire().await.unwrap();
        assert_eq!((s0, s1, s2), (0, 1, 2));

        // releasing the middle slot makes it the next one handed out
        pool.release(s1, b1);
        let (s, b) = pool.acquire().await.unwrap();
        assert_eq!(s, 1);

        pool.release(s0, b0);
        pool.release(s, b);
        pool.release(s2, b2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let pool = SectorPool::new();

        let mut held = Vec::new();
        for _ in 0..POOL_SLOTS {
            held.push(pool.acquire().await.unwrap());
        }

        assert!(pool.acquire().await.is_none());

        let (slot, buf) = held.pop().unwrap();
        pool.release(slot, buf);
        assert!(pool.acquire().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_drains_and_respects_avoid() {
        let pool = SectorPool::new();

        // nothing outstanding: a full drain succeeds
        assert!(pool.sync(0, false).await);

        let (slot, buf) = pool.acquire().await.unwrap();

        // one slot is out: a full bounded drain fails, avoiding it succeeds
        assert!(!pool.sync(0, false).await);
        assert!(pool.sync(1, false).await);

        pool.release(slot, buf);
        assert!(pool.sync(0, true).await);
    }

    #[tokio::test]
    async fn test_acquired_buffer_is_zeroed() {
        let pool = SectorPool::new();

        let (slot, mut buf) = pool.acquire().await.unwrap();
        buf.fill(0xcc);
        pool.release(slot, buf);

        let (_, buf) = pool.acquire().await.unwrap();
        assert!(buf.iter().all(|b| *b == 0));
    }
}
