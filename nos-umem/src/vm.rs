//! Process virtual-memory service interface
//!
//! The page tables, fault handling and page reference counting live in the
//! VM subsystem. This module only names the operations the region manager
//! consumes from it and the per-process context regions are acquired from.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::access::Access;
use crate::accounting::PinCounter;
use crate::error::Result;
use crate::physical::PhysAddr;
use crate::virtual_mem::VirtAddr;

/// Identifier of a process address space
pub type AddressSpaceId = u64;

/// Token returned by [`VmService::register_change_notifier`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierToken(pub u64);

/// Receives mapping changes (unmap, remap) over a watched range
pub trait ChangeHandler: Send + Sync {
    /// `[start, start + len)` of the watched range stopped being backed by
    /// the pages pinned earlier.
    fn range_changed(&self, start: VirtAddr, len: usize);
}

/// Operations consumed from the process VM subsystem
pub trait VmService: Send + Sync {
    /// Pins up to `npages` pages starting at the page-aligned `start`.
    ///
    /// Returns the physical page addresses in VA order. May return fewer
    /// pages than requested (the caller retries the remainder); an empty
    /// result means no progress could be made.
    fn pin(
        &self,
        space: AddressSpaceId,
        start: VirtAddr,
        npages: usize,
        access: Access,
    ) -> Result<Vec<PhysAddr>>;

    /// Releases pages returned by [`pin`](Self::pin), marking them dirty
    /// when the device may have written them.
    fn unpin(&self, space: AddressSpaceId, pages: &[PhysAddr], dirty: bool);

    /// Watches `[start, start + len)` for mapping changes.
    fn register_change_notifier(
        &self,
        space: AddressSpaceId,
        start: VirtAddr,
        len: usize,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<NotifierToken>;

    /// Stops a watch installed by
    /// [`register_change_notifier`](Self::register_change_notifier).
    fn deregister(&self, token: NotifierToken);

    /// Copies bytes from a pinned physical page. `dst` never crosses a page
    /// boundary.
    fn read_phys(&self, phys: PhysAddr, dst: &mut [u8]) -> Result<()>;
}

/// A process address space regions are pinned from
pub struct AddressSpace {
    id: AddressSpaceId,
    vm: Arc<dyn VmService>,
    pinned: Arc<PinCounter>,
    max_address: usize,
    lock_limit_exempt: bool,
}

impl AddressSpace {
    /// Creates an address space context with the given pin counter.
    pub fn new(id: AddressSpaceId, vm: Arc<dyn VmService>, pinned: Arc<PinCounter>) -> Self {
        Self {
            id,
            vm,
            pinned,
            max_address: usize::MAX,
            lock_limit_exempt: false,
        }
    }

    /// Limits the addressable range to `[0, max_address)`.
    pub fn with_max_address(mut self, max_address: usize) -> Self {
        self.max_address = max_address;
        self
    }

    /// Lets pins from this address space exceed the counter limit.
    pub fn with_lock_limit_exempt(mut self, exempt: bool) -> Self {
        self.lock_limit_exempt = exempt;
        self
    }

    /// Address space identifier
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// VM service backing this address space
    pub fn vm(&self) -> &Arc<dyn VmService> {
        &self.vm
    }

    /// Shared pinned-page counter
    pub fn pin_counter(&self) -> &Arc<PinCounter> {
        &self.pinned
    }

    /// Exclusive upper bound of user addresses
    pub fn max_address(&self) -> usize {
        self.max_address
    }

    /// Whether the pin limit is bypassed
    pub fn lock_limit_exempt(&self) -> bool {
        self.lock_limit_exempt
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("pinned", &self.pinned.pinned())
            .field("max_address", &self.max_address)
            .field("lock_limit_exempt", &self.lock_limit_exempt)
            .finish()
    }
}
