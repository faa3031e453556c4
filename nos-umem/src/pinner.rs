//! Page pinner
//!
//! Pins the pages behind a user virtual range and hands back their physical
//! addresses. The returned [`PinnedPages`] owns the pins: dropping it unpins
//! every page and uncharges the address space counter, which is also how a
//! failed acquisition rolls back the chunks pinned before the failure.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;

use crate::access::Access;
use crate::accounting::PinCounter;
use crate::config::UmemConfig;
use crate::error::{Result, UmemError};
use crate::peer::PeerMemoryProvider;
use crate::physical::{PAGE_SIZE, PhysAddr, pages_spanned};
use crate::virtual_mem::VirtAddr;
use crate::vm::{AddressSpace, AddressSpaceId, VmService};

/// Where pinned pages came from, and therefore how they are released
#[derive(Clone)]
pub enum PageSource {
    /// Ordinary process memory
    Vm {
        /// Owning address space
        space: AddressSpaceId,
        /// VM service that pinned the pages
        vm: Arc<dyn VmService>,
    },
    /// Memory of an external provider
    Peer(Arc<dyn PeerMemoryProvider>),
}

impl PageSource {
    /// Copies bytes out of one pinned page.
    pub fn read_phys(&self, phys: PhysAddr, dst: &mut [u8]) -> Result<()> {
        match self {
            PageSource::Vm { vm, .. } => vm.read_phys(phys, dst),
            PageSource::Peer(provider) => provider.read_phys(phys, dst),
        }
    }

    /// Whether the pages belong to a peer provider
    pub fn is_peer(&self) -> bool {
        matches!(self, PageSource::Peer(_))
    }
}

impl core::fmt::Debug for PageSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PageSource::Vm { space, .. } => f.debug_struct("Vm").field("space", space).finish(),
            PageSource::Peer(provider) => f.debug_tuple("Peer").field(&provider.name()).finish(),
        }
    }
}

/// Pages pinned for one region, released on drop
#[derive(Debug)]
pub struct PinnedPages {
    pages: Vec<PhysAddr>,
    source: PageSource,
    counter: Arc<PinCounter>,
    charged: usize,
    dirty: bool,
}

impl PinnedPages {
    /// Physical page addresses in VA order
    pub fn pages(&self) -> &[PhysAddr] {
        &self.pages
    }

    /// Number of pinned pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether no page is pinned
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Origin of the pages
    pub fn source(&self) -> &PageSource {
        &self.source
    }
}

impl Drop for PinnedPages {
    fn drop(&mut self) {
        if !self.pages.is_empty() {
            match &self.source {
                PageSource::Vm { space, vm } => vm.unpin(*space, &self.pages, self.dirty),
                PageSource::Peer(provider) => provider.unpin_peer(&self.pages),
            }
        }
        self.counter.uncharge(self.charged);
        log::debug!("Unpinned {} pages ({:?})", self.pages.len(), self.source);
    }
}

/// Validates `[addr, addr + len)` against `space` and returns its page count.
pub fn check_range(space: &AddressSpace, addr: VirtAddr, len: usize) -> Result<usize> {
    if len == 0 {
        return Err(UmemError::InvalidRange);
    }
    let end = addr.checked_add(len).ok_or(UmemError::InvalidRange)?;
    if end.as_usize() > space.max_address() {
        return Err(UmemError::InvalidRange);
    }
    pages_spanned(addr.as_usize(), len).ok_or(UmemError::InvalidRange)
}

/// Pins ordinary process memory backing `[addr, addr + len)`.
///
/// Pages are pinned `config.pin_chunk_pages` at a time. The VM service may
/// pin fewer pages per call than asked; the remainder is retried until the
/// service either finishes or reports an error.
pub fn pin_user_pages(
    space: &AddressSpace,
    addr: VirtAddr,
    len: usize,
    access: Access,
    config: &UmemConfig,
) -> Result<PinnedPages> {
    let npages = check_range(space, addr, len)?;
    let counter = space.pin_counter().clone();
    counter.charge(npages, space.lock_limit_exempt())?;

    let mut pinned = PinnedPages {
        pages: Vec::with_capacity(npages),
        source: PageSource::Vm {
            space: space.id(),
            vm: space.vm().clone(),
        },
        counter,
        charged: npages,
        dirty: access.is_writable(),
    };

    let mut cursor = addr.page_round_down();
    while pinned.pages.len() < npages {
        let want = min(npages - pinned.pages.len(), config.pin_chunk_pages);
        let got = space.vm().pin(space.id(), cursor, want, access)?;
        if got.len() > want {
            space.vm().unpin(space.id(), &got, false);
            return Err(UmemError::Fault);
        }
        if got.is_empty() {
            return Err(UmemError::Fault);
        }
        cursor = VirtAddr::new(cursor.as_usize() + got.len() * PAGE_SIZE);
        pinned.pages.extend(got);
    }

    log::debug!(
        "Pinned {} pages at {} (len {:#x}, space {})",
        npages,
        addr,
        len,
        space.id()
    );
    Ok(pinned)
}

/// Pins peer memory backing `[addr, addr + len)` through `provider`.
///
/// Peer pins are charged to the same counter as ordinary pins.
pub fn pin_peer_pages(
    space: &AddressSpace,
    provider: Arc<dyn PeerMemoryProvider>,
    addr: VirtAddr,
    len: usize,
    access: Access,
) -> Result<PinnedPages> {
    let npages = check_range(space, addr, len)?;
    let counter = space.pin_counter().clone();
    counter.charge(npages, space.lock_limit_exempt())?;

    let pages = match provider.pin_peer(addr, len, access) {
        Ok(pages) => pages,
        Err(err) => {
            counter.uncharge(npages);
            return Err(err);
        }
    };
    let pinned = PinnedPages {
        pages,
        source: PageSource::Peer(provider),
        counter,
        charged: npages,
        dirty: access.is_writable(),
    };
    if pinned.pages.len() != npages {
        log::warn!(
            "Peer provider pinned {} pages for a {} page range",
            pinned.pages.len(),
            npages
        );
        return Err(UmemError::Fault);
    }

    log::debug!("Pinned {} peer pages at {} (len {:#x})", npages, addr, len);
    Ok(pinned)
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::sim::SimVm;

    fn space(vm: &Arc<SimVm>, limit: usize) -> AddressSpace {
        AddressSpace::new(1, vm.clone(), Arc::new(PinCounter::new(limit)))
    }

    #[test]
    fn test_check_range() {
        let vm = SimVm::new();
        let space = space(&vm, 16).with_max_address(0x10_0000);
        assert_eq!(check_range(&space, VirtAddr::new(0x1000), 0), Err(UmemError::InvalidRange));
        assert_eq!(
            check_range(&space, VirtAddr::new(usize::MAX - 1), 4),
            Err(UmemError::InvalidRange)
        );
        assert_eq!(
            check_range(&space, VirtAddr::new(0xf_f000), 0x2000),
            Err(UmemError::InvalidRange)
        );
        assert_eq!(check_range(&space, VirtAddr::new(0x1800), PAGE_SIZE), Ok(2));
    }

    #[test]
    fn test_pin_in_chunks_preserves_order() {
        let vm = SimVm::new();
        vm.map_anonymous(1, VirtAddr::new(0x10000), 10, true).unwrap();
        let space = space(&vm, 64);
        let config = UmemConfig {
            pin_chunk_pages: 3,
            ..UmemConfig::default()
        };

        let pinned = pin_user_pages(&space, VirtAddr::new(0x10000), 10 * PAGE_SIZE, Access::READ, &config)
            .unwrap();
        assert_eq!(pinned.len(), 10);
        let expected: Vec<PhysAddr> = (0..10)
            .map(|i| vm.translate(1, VirtAddr::new(0x10000 + i * PAGE_SIZE)).unwrap())
            .collect();
        assert_eq!(pinned.pages(), &expected[..]);
        assert_eq!(space.pin_counter().pinned(), 10);
        assert_eq!(vm.total_pins(), 10);

        drop(pinned);
        assert_eq!(space.pin_counter().pinned(), 0);
        assert_eq!(vm.total_pins(), 0);
    }

    #[test]
    fn test_failure_rolls_back_earlier_chunks() {
        let vm = SimVm::new();
        // Hole at the fifth page.
        vm.map_anonymous(1, VirtAddr::new(0x10000), 4, true).unwrap();
        vm.map_anonymous(1, VirtAddr::new(0x15000), 4, true).unwrap();
        let space = space(&vm, 64);
        let config = UmemConfig {
            pin_chunk_pages: 2,
            ..UmemConfig::default()
        };

        let err = pin_user_pages(&space, VirtAddr::new(0x10000), 8 * PAGE_SIZE, Access::READ, &config)
            .unwrap_err();
        assert_eq!(err, UmemError::Fault);
        assert_eq!(space.pin_counter().pinned(), 0);
        assert_eq!(vm.total_pins(), 0);
    }

    #[test]
    fn test_limit_checked_before_pinning() {
        let vm = SimVm::new();
        vm.map_anonymous(1, VirtAddr::new(0x10000), 4, true).unwrap();
        let space = space(&vm, 2);

        let err = pin_user_pages(&space, VirtAddr::new(0x10000), 4 * PAGE_SIZE, Access::READ, &UmemConfig::default())
            .unwrap_err();
        assert_eq!(err, UmemError::ResourceExhausted);
        assert_eq!(vm.total_pins(), 0);
    }

    #[test]
    fn test_write_to_read_only_mapping() {
        let vm = SimVm::new();
        vm.map_anonymous(1, VirtAddr::new(0x10000), 2, false).unwrap();
        let space = space(&vm, 64);

        let err = pin_user_pages(&space, VirtAddr::new(0x10000), PAGE_SIZE, Access::READ | Access::WRITE, &UmemConfig::default())
            .unwrap_err();
        assert_eq!(err, UmemError::PermissionDenied);
        assert_eq!(space.pin_counter().pinned(), 0);
    }
}
