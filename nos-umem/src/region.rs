//! Pinned memory regions
//!
//! A [`Region`] ties together the pinned pages of a user range, the
//! scatter/gather table describing them to the device and, for peer memory,
//! the invalidation notifier. It is reached through exactly one owning
//! [`RegionHandle`]; dropping the handle is the only way to destroy it.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::min;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, RwLock};

use crate::access::Access;
use crate::config::UmemConfig;
use crate::error::{Result, UmemError};
use crate::invalidation::{Completion, InvalidationCoordinator, RegionId};
use crate::peer::PeerMemoryProvider;
use crate::pgsz;
use crate::physical::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, pages_spanned};
use crate::pinner::{PageSource, PinnedPages};
use crate::sg::{self, SgSegment, SgTable};
use crate::virtual_mem::VirtAddr;
use crate::vm::{AddressSpace, ChangeHandler, NotifierToken, VmService};

/// Consumer callback run when peer memory is revoked
pub type InvalidateFn = Box<dyn Fn(&Region) -> Result<()> + Send + Sync>;

/// Invalidation notifier state of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierState {
    /// No notifier installed
    Unregistered,
    /// Sink being handed to the provider; `stop` has no effect yet
    Registering,
    /// Notifier installed with the provider
    Registered,
    /// Provider revoked the memory; notice queued for delivery
    Invalidating,
    /// Callback running, pages released once it returns
    Delivering,
    /// Pages released
    Released,
}

struct Notifier {
    state: NotifierState,
    callback: Option<InvalidateFn>,
}

struct ChangeHook {
    token: NotifierToken,
    vm: Arc<dyn VmService>,
}

/// A pinned user memory region
pub struct Region {
    id: RegionId,
    owner: Weak<AddressSpace>,
    address: VirtAddr,
    length: usize,
    access: Access,
    max_segment_size: usize,
    provider: Option<Arc<dyn PeerMemoryProvider>>,
    // Lock order: pages, then mapping.
    pages: Mutex<Option<PinnedPages>>,
    mapping: RwLock<SgTable>,
    notifier: Mutex<Notifier>,
    change_hook: Mutex<Option<ChangeHook>>,
    mapping_stale: AtomicBool,
    invalidated: AtomicBool,
    teardown: Completion,
    coordinator: InvalidationCoordinator,
}

impl Region {
    /// Wraps freshly pinned pages into a region.
    ///
    /// On error everything acquired so far, including `pinned`, is released.
    pub(crate) fn create(
        space: &Arc<AddressSpace>,
        address: VirtAddr,
        length: usize,
        access: Access,
        pinned: PinnedPages,
        config: &UmemConfig,
        coordinator: &InvalidationCoordinator,
    ) -> Result<RegionHandle> {
        let provider = match pinned.source() {
            PageSource::Peer(provider) => Some(provider.clone()),
            PageSource::Vm { .. } => None,
        };
        let table = sg::build(pinned.pages(), PAGE_SHIFT as u32, config.max_segment_size);

        let region = Arc::new_cyclic(|weak| Region {
            id: coordinator.reserve(weak.clone()),
            owner: Arc::downgrade(space),
            address,
            length,
            access,
            max_segment_size: config.max_segment_size,
            provider,
            pages: Mutex::new(Some(pinned)),
            mapping: RwLock::new(table),
            notifier: Mutex::new(Notifier {
                state: NotifierState::Unregistered,
                callback: None,
            }),
            change_hook: Mutex::new(None),
            mapping_stale: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            teardown: Completion::new(),
            coordinator: coordinator.clone(),
        });
        let handle = RegionHandle { region };

        if !handle.is_peer() && config.track_mapping_changes {
            handle.region.watch_mapping(space)?;
        }

        log::debug!(
            "Created region {} at {} len {:#x} ({} segments{})",
            handle.id(),
            address,
            length,
            handle.segment_count(),
            if handle.is_peer() { ", peer" } else { "" }
        );
        Ok(handle)
    }

    fn watch_mapping(self: &Arc<Self>, space: &AddressSpace) -> Result<()> {
        let watch: Arc<dyn ChangeHandler> = Arc::new(StaleMappingWatch {
            region: Arc::downgrade(self),
        });
        let token = space.vm().register_change_notifier(
            space.id(),
            self.address.page_round_down(),
            self.page_count() * PAGE_SIZE,
            watch,
        )?;
        *self.change_hook.lock() = Some(ChangeHook {
            token,
            vm: space.vm().clone(),
        });
        Ok(())
    }

    /// Stable identifier, also used by peer providers
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// First user virtual address
    pub fn address(&self) -> VirtAddr {
        self.address
    }

    /// Length in bytes
    pub fn length(&self) -> usize {
        self.length
    }

    /// Access the region was pinned with
    pub fn access(&self) -> Access {
        self.access
    }

    /// Whether the device may write the region
    pub fn is_writable(&self) -> bool {
        self.access.is_writable()
    }

    /// Whether the pages belong to a peer provider
    pub fn is_peer(&self) -> bool {
        self.provider.is_some()
    }

    /// Whether pages are faulted lazily; always `false` for pinned regions
    pub fn is_odp(&self) -> bool {
        false
    }

    /// Offset of the first byte within its page
    pub fn offset(&self) -> usize {
        self.address.page_offset()
    }

    /// Number of system pages spanned, independent of the negotiated size
    pub fn page_count(&self) -> usize {
        // Range validated at acquisition.
        pages_spanned(self.address.as_usize(), self.length).unwrap_or(0)
    }

    /// log2 of the page size of the current segment table
    pub fn page_shift(&self) -> u32 {
        self.mapping.read().page_shift()
    }

    /// Page size of the current segment table
    pub fn page_size(&self) -> usize {
        1 << self.page_shift()
    }

    /// Number of scatter/gather segments
    pub fn segment_count(&self) -> usize {
        self.mapping.read().len()
    }

    /// Copy of the current scatter/gather table
    pub fn sg_table(&self) -> SgTable {
        self.mapping.read().clone()
    }

    /// Segments of the current table, in VA order
    pub fn segments(&self) -> Vec<SgSegment> {
        self.mapping.read().segments().to_vec()
    }

    /// Device addresses of the region in `block_size` blocks.
    ///
    /// `block_size` must be a power of two between the system page size and
    /// the negotiated page size.
    pub fn dma_blocks(&self, block_size: usize) -> Result<Vec<PhysAddr>> {
        let table = self.mapping.read();
        if !block_size.is_power_of_two() || block_size < PAGE_SIZE || block_size > table.page_size() {
            return Err(UmemError::NoCompatiblePageSize);
        }
        Ok(table.dma_blocks_at(block_size).collect())
    }

    /// Whether the peer provider revoked the memory
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Whether the VA range was unmapped or remapped while pinned
    pub fn is_mapping_stale(&self) -> bool {
        self.mapping_stale.load(Ordering::Acquire)
    }

    /// Current notifier state
    pub fn notifier_state(&self) -> NotifierState {
        self.notifier.lock().state
    }

    /// Whether the region was acquired from `space`
    pub fn owned_by(&self, space: &AddressSpace) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|owner| core::ptr::eq(Arc::as_ptr(&owner), space))
    }

    /// Copies `dst.len()` bytes starting `offset` bytes into the region.
    pub fn copy_from(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let end = offset.checked_add(dst.len()).ok_or(UmemError::OutOfBounds)?;
        if end > self.length {
            return Err(UmemError::OutOfBounds);
        }
        if dst.is_empty() {
            return Ok(());
        }

        let pages = self.pages.lock();
        let pinned = pages.as_ref().ok_or(UmemError::Invalidated)?;
        let table = self.mapping.read();

        let mut pos = self.offset() + offset;
        let mut copied = 0;
        let mut segment_start = 0;
        for segment in table.segments() {
            let segment_end = segment_start + table.segment_bytes(segment);
            while copied < dst.len() && pos < segment_end {
                let phys = segment.phys.offset(pos - segment_start);
                let chunk = min(dst.len() - copied, PAGE_SIZE - phys.page_offset());
                pinned
                    .source()
                    .read_phys(phys, &mut dst[copied..copied + chunk])?;
                copied += chunk;
                pos += chunk;
            }
            if copied == dst.len() {
                break;
            }
            segment_start = segment_end;
        }
        debug_assert_eq!(copied, dst.len());
        Ok(())
    }

    /// Reads `len` bytes starting `offset` bytes into the region.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.copy_from(offset, &mut buf)?;
        Ok(buf)
    }

    /// Largest page size from `bitmap` that maps the region at `iova` with
    /// uniform pages. See [`pgsz::negotiate`].
    pub fn find_best_page_size(&self, bitmap: u64, iova: usize) -> Result<usize> {
        let pages = self.pages.lock();
        let pinned = pages.as_ref().ok_or(UmemError::Invalidated)?;
        pgsz::negotiate(pinned.pages(), self.address, iova, bitmap)
    }

    pub(crate) fn teardown_completion(&self) -> Completion {
        self.teardown.clone()
    }

    /// Registered (or Registering) → Invalidating. Returns the state found
    /// otherwise.
    pub(crate) fn mark_invalidating(&self) -> core::result::Result<(), NotifierState> {
        let mut notifier = self.notifier.lock();
        match notifier.state {
            NotifierState::Registering | NotifierState::Registered => {
                notifier.state = NotifierState::Invalidating;
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Claims a queued notice and delivers it: callback, unpin, Released.
    ///
    /// Returns `None` when there is nothing to deliver, either because the
    /// notice was already claimed or because no invalidation is pending.
    /// The callback's error is returned for reporting only; the pages are
    /// released regardless.
    pub(crate) fn deliver_invalidation(&self) -> Option<Result<()>> {
        let callback = {
            let mut notifier = self.notifier.lock();
            if notifier.state != NotifierState::Invalidating {
                return None;
            }
            notifier.state = NotifierState::Delivering;
            notifier.callback.take()
        };

        let outcome = match &callback {
            Some(callback) => callback(self),
            None => Ok(()),
        };
        drop(callback);

        let pages = self.pages.lock().take();
        drop(pages);
        self.invalidated.store(true, Ordering::Release);
        self.notifier.lock().state = NotifierState::Released;
        self.teardown.complete();
        log::debug!("Region {} invalidated", self.id);
        Some(outcome)
    }

    fn activate(&self, callback: InvalidateFn) -> Result<()> {
        let provider = self
            .provider
            .as_ref()
            .ok_or(UmemError::UnsupportedPeerMemory)?;
        if !provider.supports_invalidation() {
            return Err(UmemError::UnsupportedPeerMemory);
        }

        {
            let mut notifier = self.notifier.lock();
            match notifier.state {
                NotifierState::Unregistered => {}
                NotifierState::Registering | NotifierState::Registered => {
                    return Err(UmemError::AlreadyRegistered);
                }
                NotifierState::Invalidating | NotifierState::Delivering | NotifierState::Released => {
                    return Err(UmemError::TearingDown);
                }
            }
            notifier.state = NotifierState::Registering;
            notifier.callback = Some(callback);
        }

        // Provider locks are never taken under the notifier lock.
        let registered = provider.register_invalidation(self.id, self.coordinator.sink(self.id));

        let callback = {
            let mut notifier = self.notifier.lock();
            match (&registered, notifier.state) {
                (Ok(()), NotifierState::Registering) => {
                    notifier.state = NotifierState::Registered;
                    None
                }
                (Err(_), NotifierState::Registering) => {
                    notifier.state = NotifierState::Unregistered;
                    notifier.callback.take()
                }
                // A notice arrived through the new sink; it owns the callback.
                _ => None,
            }
        };
        drop(callback);
        registered?;

        log::debug!(
            "Region {} registered for invalidation with '{}'",
            self.id,
            provider.name()
        );
        Ok(())
    }

    fn stop(&self) {
        if self.notifier.lock().state != NotifierState::Registered {
            return;
        }
        // Withdraw the sink first. A notice racing with this still finds the
        // region Registered and is delivered.
        if let Some(provider) = &self.provider {
            provider.unregister_invalidation(self.id);
        }
        let callback = {
            let mut notifier = self.notifier.lock();
            if notifier.state != NotifierState::Registered {
                return;
            }
            notifier.state = NotifierState::Unregistered;
            notifier.callback.take()
        };
        drop(callback);
        log::debug!("Region {} invalidation notifier stopped", self.id);
    }

    fn teardown(&self) {
        let (registered, invalidating, callback) = {
            let mut notifier = self.notifier.lock();
            match notifier.state {
                NotifierState::Registering | NotifierState::Registered => {
                    notifier.state = NotifierState::Released;
                    (true, false, notifier.callback.take())
                }
                NotifierState::Unregistered => {
                    notifier.state = NotifierState::Released;
                    (false, false, None)
                }
                NotifierState::Invalidating | NotifierState::Delivering => (false, true, None),
                NotifierState::Released => (false, false, None),
            }
        };

        if registered {
            if let Some(provider) = &self.provider {
                provider.unregister_invalidation(self.id);
            }
        }
        drop(callback);
        if invalidating {
            // A notice the worker has not taken yet is delivered here.
            if let Some(outcome) = self.deliver_invalidation() {
                self.coordinator.report_delivery(self.id, outcome);
            }
            self.teardown.wait();
        }
        if let Some(hook) = self.change_hook.lock().take() {
            hook.vm.deregister(hook.token);
        }

        let pages = self.pages.lock().take();
        drop(pages);
        self.teardown.complete();
        self.coordinator.forget(self.id);
        log::debug!("Released region {}", self.id);
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("length", &self.length)
            .field("access", &self.access)
            .field("is_peer", &self.is_peer())
            .field("page_shift", &self.page_shift())
            .field("state", &self.notifier_state())
            .finish()
    }
}

struct StaleMappingWatch {
    region: Weak<Region>,
}

impl ChangeHandler for StaleMappingWatch {
    fn range_changed(&self, start: VirtAddr, len: usize) {
        if let Some(region) = self.region.upgrade() {
            region.mapping_stale.store(true, Ordering::Release);
            log::warn!(
                "Region {} mapping changed at {} (len {:#x}) while pinned",
                region.id,
                start,
                len
            );
        }
    }
}

/// Exclusive owner of a [`Region`]; dropping it destroys the region
pub struct RegionHandle {
    region: Arc<Region>,
}

impl RegionHandle {
    /// Destroys the region. Equivalent to dropping the handle.
    ///
    /// Deregisters any invalidation notifier, finishes a pending
    /// invalidation (delivering it here if the worker has not taken it),
    /// unpins the pages and frees the segment table.
    pub fn release(self) {}

    /// Negotiates the page size for `iova` and rebuilds the segment table
    /// at that size. Returns the chosen size.
    pub fn negotiate_page_size(&mut self, bitmap: u64, iova: usize) -> Result<usize> {
        let pages = self.region.pages.lock();
        let pinned = pages.as_ref().ok_or(UmemError::Invalidated)?;
        let size = pgsz::negotiate(pinned.pages(), self.region.address, iova, bitmap)?;
        let shift = size.trailing_zeros();

        let mut mapping = self.region.mapping.write();
        if mapping.page_shift() != shift {
            *mapping = sg::build(pinned.pages(), shift, self.region.max_segment_size);
        }
        Ok(size)
    }

    /// Installs `callback` to run, with `context`, when the peer provider
    /// revokes the memory. The callback runs on the invalidation worker and
    /// must stop all device access to the region before returning.
    pub fn start_invalidation_notifier<C, F>(&self, context: Arc<C>, callback: F) -> Result<()>
    where
        C: Send + Sync + 'static,
        F: Fn(&Region, &C) -> Result<()> + Send + Sync + 'static,
    {
        self.region
            .activate(Box::new(move |region: &Region| callback(region, &context)))
    }

    /// Removes the notifier if it is still registered. Has no effect once an
    /// invalidation has started.
    pub fn stop_invalidation_notifier(&self) {
        self.region.stop();
    }
}

impl Deref for RegionHandle {
    type Target = Region;

    fn deref(&self) -> &Region {
        &self.region
    }
}

impl Drop for RegionHandle {
    fn drop(&mut self) {
        self.region.teardown();
    }
}

impl fmt::Debug for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.region, f)
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::accounting::PinCounter;
    use crate::pinner::pin_user_pages;
    use crate::sim::SimVm;

    fn setup(npages: usize) -> (Arc<SimVm>, Arc<AddressSpace>) {
        let vm = SimVm::new();
        vm.map_anonymous(7, VirtAddr::new(0x10000), npages, true).unwrap();
        let space = Arc::new(AddressSpace::new(7, vm.clone(), Arc::new(PinCounter::unlimited())));
        (vm, space)
    }

    fn acquire(space: &Arc<AddressSpace>, coordinator: &InvalidationCoordinator, addr: usize, len: usize) -> RegionHandle {
        let config = UmemConfig::default();
        let pinned = pin_user_pages(space, VirtAddr::new(addr), len, Access::READ, &config).unwrap();
        Region::create(space, VirtAddr::new(addr), len, Access::READ, pinned, &config, coordinator).unwrap()
    }

    #[test]
    fn test_unaligned_region_geometry() {
        let (_vm, space) = setup(4);
        let coordinator = InvalidationCoordinator::new();
        let region = acquire(&space, &coordinator, 0x10800, 2 * PAGE_SIZE);

        assert_eq!(region.offset(), 0x800);
        assert_eq!(region.page_count(), 3);
        assert_eq!(region.sg_table().total_bytes(), 3 * PAGE_SIZE);
        assert_eq!(region.dma_blocks(PAGE_SIZE).unwrap().len(), 3);
        assert_eq!(region.dma_blocks(2 * PAGE_SIZE), Err(UmemError::NoCompatiblePageSize));
        assert!(region.owned_by(&space));
        assert!(!region.is_odp());
    }

    #[test]
    fn test_copy_crosses_page_boundary() {
        let (vm, space) = setup(4);
        let data: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        vm.write(7, VirtAddr::new(0x10000), &data).unwrap();
        let coordinator = InvalidationCoordinator::new();
        let region = acquire(&space, &coordinator, 0x10000, 2 * PAGE_SIZE);

        let bytes = region.read(PAGE_SIZE - 8, 16).unwrap();
        assert_eq!(&bytes[..], &data[PAGE_SIZE - 8..PAGE_SIZE + 8]);
        assert_eq!(region.read(2 * PAGE_SIZE - 1, 2), Err(UmemError::OutOfBounds));
        assert_eq!(region.read(usize::MAX, 2), Err(UmemError::OutOfBounds));
    }

    #[test]
    fn test_drop_releases_everything() {
        let (vm, space) = setup(4);
        let coordinator = InvalidationCoordinator::new();
        let region = acquire(&space, &coordinator, 0x10000, 4 * PAGE_SIZE);
        assert_eq!(vm.watch_count(), 1);
        assert_eq!(coordinator.live_regions(), 1);

        let id = region.id();
        region.release();
        assert_eq!(vm.total_pins(), 0);
        assert_eq!(vm.watch_count(), 0);
        assert_eq!(space.pin_counter().pinned(), 0);
        assert!(coordinator.lookup(id).is_none());
    }

    #[test]
    fn test_unmap_marks_mapping_stale() {
        let (vm, space) = setup(4);
        let coordinator = InvalidationCoordinator::new();
        let region = acquire(&space, &coordinator, 0x10000, 2 * PAGE_SIZE);
        assert!(!region.is_mapping_stale());

        vm.unmap(7, VirtAddr::new(0x11000), 1);
        assert!(region.is_mapping_stale());
        // Pinned pages stay readable.
        assert!(region.read(0, 16).is_ok());
    }

    #[test]
    fn test_notifier_requires_peer_memory() {
        let (_vm, space) = setup(1);
        let coordinator = InvalidationCoordinator::new();
        let region = acquire(&space, &coordinator, 0x10000, PAGE_SIZE);
        let result = region.start_invalidation_notifier(Arc::new(()), |_, _| Ok(()));
        assert_eq!(result, Err(UmemError::UnsupportedPeerMemory));
        assert_eq!(region.notifier_state(), NotifierState::Unregistered);
    }
}
