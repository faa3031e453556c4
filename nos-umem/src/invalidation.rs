//! Peer-memory invalidation coordinator
//!
//! A peer provider that is about to reclaim memory signals the region's
//! [`InvalidationSink`]. The notice moves the region from `Registered` to
//! `Invalidating` and queues it; a dedicated worker then claims it
//! (`Delivering`), runs the consumer's callback (which must stop the hardware
//! from touching the mapping), unpins the pages and marks the region
//! `Released`. Destroying a region whose notice is still queued delivers it
//! on the destroying thread instead. The provider waits on
//! the returned [`Completion`] before reusing the memory.
//!
//! Queued notices refer to regions by [`RegionId`], a generation-checked
//! arena index. The arena only holds weak references, so a notice racing
//! with region destruction can never reach freed memory: a stale id or a
//! dead region simply completes immediately.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::error::{Result, UmemError};
use crate::region::{NotifierState, Region};

/// Stable identifier of a region, valid until the region is destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId {
    index: u32,
    generation: u32,
}

impl RegionId {
    /// Arena slot
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at allocation time
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// One-shot completion flag shared between a waiter and a signaller
#[derive(Debug, Clone, Default)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

#[derive(Debug, Default)]
struct CompletionInner {
    done: AtomicBool,
    /// Threads parked in `wait`/`wait_timeout`
    #[cfg(feature = "std")]
    waiters: Mutex<Vec<std::thread::Thread>>,
}

impl Completion {
    /// Creates a pending completion.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an already signalled completion.
    pub fn completed() -> Self {
        let completion = Self::new();
        completion.complete();
        completion
    }

    /// Signals every waiter. Signalling twice is harmless.
    pub fn complete(&self) {
        self.inner.done.store(true, Ordering::Release);
        #[cfg(feature = "std")]
        {
            let waiters = core::mem::take(&mut *self.inner.waiters.lock());
            for thread in waiters {
                thread.unpark();
            }
        }
    }

    /// Whether [`complete`](Self::complete) was called
    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Blocks until signalled.
    ///
    /// Parks the calling thread under `std`; spins otherwise.
    pub fn wait(&self) {
        #[cfg(feature = "std")]
        {
            if self.is_done() {
                return;
            }
            self.inner.waiters.lock().push(std::thread::current());
            // Registered before the re-check: a signal from here on unparks us.
            while !self.is_done() {
                std::thread::park();
            }
        }
        #[cfg(not(feature = "std"))]
        while !self.is_done() {
            core::hint::spin_loop();
        }
    }

    /// Blocks until signalled or `timeout` elapses. Returns `true` if
    /// signalled.
    #[cfg(feature = "std")]
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        if self.is_done() {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        let me = std::thread::current();
        self.inner.waiters.lock().push(me.clone());
        while !self.is_done() {
            let now = std::time::Instant::now();
            if now >= deadline {
                self.inner.waiters.lock().retain(|t| t.id() != me.id());
                return self.is_done();
            }
            std::thread::park_timeout(deadline - now);
        }
        true
    }
}

/// Invalidation counters
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Notices received from providers
    pub notices: AtomicU64,
    /// Notices for unknown, destroyed or unregistered regions
    pub stale_notices: AtomicU64,
    /// Invalidations fully delivered by the worker
    pub delivered: AtomicU64,
    /// Consumer callbacks that reported an error
    pub callback_failures: AtomicU64,
}

struct Slot {
    generation: u32,
    region: Option<Weak<Region>>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    fn insert(&mut self, region: Weak<Region>) -> RegionId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.region = Some(region);
            return RegionId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            region: Some(region),
        });
        RegionId {
            index,
            generation: 0,
        }
    }

    fn get(&self, id: RegionId) -> Option<Arc<Region>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.region.as_ref()?.upgrade()
    }

    fn remove(&mut self, id: RegionId) -> bool {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.region.is_some() => {
                slot.region = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
                true
            }
            _ => false,
        }
    }

    fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

struct Shared {
    arena: Mutex<Arena>,
    queue: Mutex<VecDeque<RegionId>>,
    stats: CoordinatorStats,
    #[cfg(feature = "std")]
    waker: Mutex<Option<std::thread::Thread>>,
}

/// Routes provider notices to the invalidation worker
#[derive(Clone)]
pub struct InvalidationCoordinator {
    shared: Arc<Shared>,
}

impl Default for InvalidationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationCoordinator {
    /// Creates a coordinator with an empty queue.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                arena: Mutex::new(Arena::default()),
                queue: Mutex::new(VecDeque::new()),
                stats: CoordinatorStats::default(),
                #[cfg(feature = "std")]
                waker: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn reserve(&self, region: Weak<Region>) -> RegionId {
        self.shared.arena.lock().insert(region)
    }

    pub(crate) fn forget(&self, id: RegionId) {
        let removed = self.shared.arena.lock().remove(id);
        debug_assert!(removed, "region {} forgotten twice", id);
    }

    pub(crate) fn sink(&self, id: RegionId) -> InvalidationSink {
        InvalidationSink {
            coordinator: self.clone(),
            region: id,
        }
    }

    /// Live region for `id`, if any.
    pub fn lookup(&self, id: RegionId) -> Option<Arc<Region>> {
        self.shared.arena.lock().get(id)
    }

    /// Number of live regions
    pub fn live_regions(&self) -> usize {
        self.shared.arena.lock().live()
    }

    /// Number of queued, undelivered notices
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Counters
    pub fn stats(&self) -> &CoordinatorStats {
        &self.shared.stats
    }

    /// Handles a provider notice for `id`.
    ///
    /// The returned completion fires once the region's pages are unpinned,
    /// whether by the worker or by a destroy that won the race.
    /// `NotRegistered` means there is nothing to wait for: the id is stale
    /// or no notifier is installed.
    pub fn invalidate(&self, id: RegionId) -> Result<Completion> {
        self.shared.stats.notices.fetch_add(1, Ordering::Relaxed);
        let region = match self.lookup(id) {
            Some(region) => region,
            None => {
                self.shared.stats.stale_notices.fetch_add(1, Ordering::Relaxed);
                return Err(UmemError::NotRegistered);
            }
        };

        match region.mark_invalidating() {
            Ok(()) => {
                self.shared.queue.lock().push_back(id);
                self.wake();
                log::debug!("Queued invalidation of region {}", id);
                Ok(region.teardown_completion())
            }
            // Already on its way out; wait for the same teardown.
            Err(NotifierState::Invalidating | NotifierState::Delivering | NotifierState::Released) => {
                Ok(region.teardown_completion())
            }
            Err(_) => {
                self.shared.stats.stale_notices.fetch_add(1, Ordering::Relaxed);
                Err(UmemError::NotRegistered)
            }
        }
    }

    /// Delivers every queued notice on the calling context. Returns the
    /// number of notices taken from the queue.
    ///
    /// This is the worker body: the `std` worker thread loops over it, and
    /// kernels without threads call it from their own deferred-work context.
    pub fn run_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            let next = self.shared.queue.lock().pop_front();
            let Some(id) = next else {
                break;
            };
            handled += 1;
            let Some(region) = self.lookup(id) else {
                continue;
            };
            // None: claimed by a destroy that got there first.
            if let Some(outcome) = region.deliver_invalidation() {
                self.report_delivery(id, outcome);
            }
        }
        handled
    }

    pub(crate) fn report_delivery(&self, id: RegionId, outcome: Result<()>) {
        if let Err(err) = outcome {
            self.shared
                .stats
                .callback_failures
                .fetch_add(1, Ordering::Relaxed);
            log::error!("Invalidation callback for region {} failed: {}", id, err);
        }
        self.shared.stats.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn wake(&self) {
        #[cfg(feature = "std")]
        if let Some(thread) = self.shared.waker.lock().as_ref() {
            thread.unpark();
        }
    }
}

/// Handle a peer provider uses to revoke one region's memory.
///
/// The provider drops the sink after signalling it.
#[derive(Clone)]
pub struct InvalidationSink {
    coordinator: InvalidationCoordinator,
    region: RegionId,
}

impl InvalidationSink {
    /// Region this sink revokes
    pub fn region_id(&self) -> RegionId {
        self.region
    }

    /// Signals that the memory is about to be reclaimed. Wait on the result
    /// before reusing it.
    pub fn invalidate(&self) -> Completion {
        match self.coordinator.invalidate(self.region) {
            Ok(completion) => completion,
            Err(err) => {
                log::debug!("Ignoring invalidation of region {}: {}", self.region, err);
                Completion::completed()
            }
        }
    }
}

impl fmt::Debug for InvalidationSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationSink")
            .field("region", &self.region)
            .finish()
    }
}

/// Dedicated thread delivering invalidations; stops and joins on drop
#[cfg(feature = "std")]
pub struct InvalidationWorker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

#[cfg(feature = "std")]
impl InvalidationWorker {
    /// Starts a worker thread named `name` draining `coordinator`.
    pub fn spawn(coordinator: &InvalidationCoordinator, name: &str) -> Result<Self> {
        let coordinator = coordinator.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                *coordinator.shared.waker.lock() = Some(std::thread::current());
                while !stop_flag.load(Ordering::Acquire) {
                    if coordinator.run_pending() == 0 {
                        std::thread::park_timeout(std::time::Duration::from_millis(50));
                    }
                }
                coordinator.run_pending();
                *coordinator.shared.waker.lock() = None;
            })
            .map_err(|_| UmemError::OutOfMemory)?;
        log::debug!("Started invalidation worker '{}'", name);
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

#[cfg(feature = "std")]
impl Drop for InvalidationWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_generation_rejects_stale_ids() {
        let mut arena = Arena::default();
        let first = arena.insert(Weak::new());
        assert!(arena.remove(first));
        assert!(!arena.remove(first));

        let second = arena.insert(Weak::new());
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert!(arena.get(first).is_none());
        assert_eq!(arena.live(), 1);
    }

    #[test]
    fn test_completion() {
        let completion = Completion::new();
        assert!(!completion.is_done());
        let waiter = completion.clone();
        completion.complete();
        completion.complete();
        waiter.wait();
        assert!(Completion::completed().is_done());
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_completion_wakes_parked_waiter() {
        use std::time::Duration;

        let completion = Completion::new();
        assert!(!completion.wait_timeout(Duration::from_millis(20)));
        assert!(completion.inner.waiters.lock().is_empty());

        let signaller = completion.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signaller.complete();
        });
        completion.wait();
        assert!(completion.is_done());
        assert!(completion.wait_timeout(Duration::ZERO));
        assert!(completion.inner.waiters.lock().is_empty());
        thread.join().unwrap();
    }

    #[test]
    fn test_stale_notice_is_counted() {
        let coordinator = InvalidationCoordinator::new();
        let id = coordinator.reserve(Weak::new());
        coordinator.forget(id);

        assert_eq!(coordinator.invalidate(id).unwrap_err(), UmemError::NotRegistered);
        assert!(coordinator.sink(id).invalidate().is_done());
        assert_eq!(coordinator.stats().stale_notices.load(Ordering::Relaxed), 2);
        assert_eq!(coordinator.run_pending(), 0);
    }
}
