use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use log::{error, info, warn};

use crate::core::segment_name;
use crate::errors::Result;
use crate::segment::Segment;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// FIFO guarded by one mutex, with a condition signaled on every push.
///
/// `close` wakes all waiters; `pop` then returns `None` even if items remain,
/// so workers exit between work units.
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        BlockingQueue::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        BlockingQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) -> Result<()> {
        self.state.lock()?.items.push_back(item);
        self.ready.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Result<Option<T>> {
        let mut state = self.state.lock()?;
        loop {
            if state.closed {
                return Ok(None);
            }
            if let Some(item) = state.items.pop_front() {
                return Ok(Some(item));
            }
            state = self.ready.wait(state)?;
        }
    }

    pub fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.closed)
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentId(pub usize);

/// Every segment the front-end created, indexed by position in the name
/// sequence. Unlinks all names exactly once.
pub struct SegmentRegistry {
    segments: Vec<Segment>,
    torn_down: AtomicBool,
}

impl SegmentRegistry {
    pub fn create(prefix: &str, count: usize, size: usize) -> Result<SegmentRegistry> {
        let mut registry = SegmentRegistry {
            segments: Vec::with_capacity(count),
            torn_down: AtomicBool::new(false),
        };
        for index in 0..count {
            // On failure, dropping the partial registry unlinks what was created.
            let name = segment_name(prefix, index)?;
            registry.segments.push(Segment::create(name, size)?);
        }
        info!(
            "Created {} segments of {} bytes ({}0..{})",
            count,
            size,
            prefix,
            count.saturating_sub(1)
        );
        Ok(registry)
    }

    pub fn get(&self, id: SegmentId) -> &Segment {
        &self.segments[id.0]
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Unlinks every segment name. Returns false if already torn down.
    pub fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        for segment in self.segments.iter() {
            if let Err(e) = segment.unlink() {
                warn!("Failed to unlink segment {}: {}", segment.name(), e);
            }
        }
        info!("Unlinked {} segments", self.segments.len());
        true
    }
}

impl Drop for SegmentRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct PoolState {
    free: VecDeque<SegmentId>,
    in_flight: usize,
    retired: usize,
    closed: bool,
}

/// A consistent view of where every segment is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub available: usize,
    pub in_flight: usize,
    pub retired: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.available + self.in_flight + self.retired
    }
}

/// Free segments, handed out as [`SegmentLease`]s.
///
/// Every count changes under one mutex, so [`SegmentPool::counts`] always
/// totals [`SegmentPool::capacity`].
pub struct SegmentPool {
    registry: SegmentRegistry,
    state: Mutex<PoolState>,
    ready: Condvar,
}

impl SegmentPool {
    pub fn new(registry: SegmentRegistry) -> Result<SegmentPool> {
        let free = (0..registry.len()).map(SegmentId).collect();
        Ok(SegmentPool {
            registry,
            state: Mutex::new(PoolState {
                free,
                in_flight: 0,
                retired: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a segment is free. `None` once the pool is closed.
    pub fn acquire(&self) -> Result<Option<SegmentLease<'_>>> {
        let mut state = self.state.lock()?;
        loop {
            if state.closed {
                return Ok(None);
            }
            if let Some(id) = state.free.pop_front() {
                state.in_flight += 1;
                return Ok(Some(SegmentLease {
                    pool: self,
                    id,
                    retired: false,
                }));
            }
            state = self.ready.wait(state)?;
        }
    }

    fn release(&self, id: SegmentId) {
        let segment = self.registry.get(id);
        debug_assert!(
            segment.is_clean(),
            "segment {} released with stale header",
            segment.name()
        );
        segment.reset();
        {
            let mut state = self.lock_state();
            state.in_flight -= 1;
            state.free.push_back(id);
        }
        self.ready.notify_one();
    }

    fn retire(&self, id: SegmentId) {
        let counts = {
            let mut state = self.lock_state();
            state.in_flight -= 1;
            state.retired += 1;
            Self::snapshot(&state)
        };
        error!(
            "Retired segment {}; {} of {} segments out of circulation",
            self.registry.get(id).name(),
            counts.retired,
            self.capacity()
        );
    }

    /// Wakes every waiter in `acquire`; subsequent acquires return `None`.
    pub fn close(&self) {
        self.lock_state().closed = true;
        self.ready.notify_all();
    }

    pub fn capacity(&self) -> usize {
        self.registry.len()
    }

    fn snapshot(state: &PoolState) -> PoolCounts {
        PoolCounts {
            available: state.free.len(),
            in_flight: state.in_flight,
            retired: state.retired,
        }
    }

    pub fn counts(&self) -> PoolCounts {
        Self::snapshot(&self.lock_state())
    }

    pub fn available(&self) -> usize {
        self.counts().available
    }

    pub fn in_flight(&self) -> usize {
        self.counts().in_flight
    }

    pub fn retired(&self) -> usize {
        self.counts().retired
    }

    pub fn teardown(&self) -> bool {
        self.registry.teardown()
    }
}

/// A segment bound to one transfer. Returns to the pool when dropped.
pub struct SegmentLease<'a> {
    pool: &'a SegmentPool,
    id: SegmentId,
    retired: bool,
}

impl<'a> SegmentLease<'a> {
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Takes the segment out of circulation. Used when the baton itself failed
    /// and the segment's state can no longer be trusted.
    pub fn retire(mut self) {
        self.retired = true;
        self.pool.retire(self.id);
    }
}

impl<'a> Deref for SegmentLease<'a> {
    type Target = Segment;

    fn deref(&self) -> &Segment {
        self.pool.registry.get(self.id)
    }
}

impl<'a> Drop for SegmentLease<'a> {
    fn drop(&mut self) {
        if !self.retired {
            self.pool.release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::tests::unique_name;

    #[test]
    fn queue_is_fifo() -> Result<()> {
        let queue = BlockingQueue::new();
        for i in 0..4 {
            queue.push(i)?;
        }
        for i in 0..4 {
            assert_eq!(queue.pop()?, Some(i));
        }
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn close_wakes_blocked_pop() {
        let queue = Arc::new(BlockingQueue::<u32>::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop().unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(queue.is_closed());
    }

    #[test]
    fn lease_returns_on_drop() -> Result<()> {
        let registry = SegmentRegistry::create(&unique_name("p"), 2, 4096)?;
        let pool = SegmentPool::new(registry)?;
        assert_eq!(pool.available(), 2);
        let a = pool.acquire()?.unwrap();
        let b = pool.acquire()?.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_flight(), 0);
        // FIFO: the first segment released is the first handed out again.
        assert_eq!(pool.acquire()?.unwrap().id(), SegmentId(0));
        Ok(())
    }

    #[test]
    fn retired_segments_leave_circulation() -> Result<()> {
        let registry = SegmentRegistry::create(&unique_name("r"), 2, 4096)?;
        let pool = SegmentPool::new(registry)?;
        let held = pool.acquire()?.unwrap();
        assert_eq!(
            pool.counts(),
            PoolCounts {
                available: 1,
                in_flight: 1,
                retired: 0
            }
        );
        held.retire();
        let counts = pool.counts();
        assert_eq!(counts.available, 1);
        assert_eq!(counts.retired, 1);
        assert_eq!(counts.total(), pool.capacity());
        Ok(())
    }

    #[test]
    fn close_unblocks_acquire() -> Result<()> {
        let registry = SegmentRegistry::create(&unique_name("c"), 1, 4096)?;
        let pool = Arc::new(SegmentPool::new(registry)?);
        let held = pool.acquire()?.map(|lease| lease.id());
        assert_eq!(held, Some(SegmentId(0)));
        // The lease above was dropped, so take it again and keep it.
        let lease = pool.acquire()?.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire().map(|lease| lease.is_none()))
        };
        thread::sleep(Duration::from_millis(50));
        pool.close();
        assert!(waiter.join().unwrap()?);
        drop(lease);
        assert!(pool.teardown());
        assert!(!pool.teardown());
        Ok(())
    }
}
