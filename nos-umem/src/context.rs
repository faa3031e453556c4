//! Region manager context
//!
//! Holds the configuration, the peer provider registry and the invalidation
//! coordinator shared by all regions acquired through it.

extern crate alloc;

use alloc::sync::Arc;

use crate::access::{Access, PeerMemFlags};
use crate::config::UmemConfig;
use crate::error::{Result, UmemError};
use crate::invalidation::InvalidationCoordinator;
#[cfg(feature = "std")]
use crate::invalidation::InvalidationWorker;
use crate::peer::PeerRegistry;
use crate::pinner;
use crate::region::{Region, RegionHandle};
use crate::virtual_mem::VirtAddr;
use crate::vm::AddressSpace;

/// Entry point for acquiring pinned regions
pub struct UmemContext {
    config: UmemConfig,
    peers: PeerRegistry,
    coordinator: InvalidationCoordinator,
    #[cfg(feature = "std")]
    worker: spin::Mutex<Option<InvalidationWorker>>,
}

impl UmemContext {
    /// Creates a context after validating `config`.
    ///
    /// Under `std` the invalidation worker is started here. Without it the
    /// embedder drives [`InvalidationCoordinator::run_pending`].
    pub fn new(config: UmemConfig) -> Result<Self> {
        config.validate()?;
        let coordinator = InvalidationCoordinator::new();
        #[cfg(feature = "std")]
        let worker = InvalidationWorker::spawn(&coordinator, config.worker_name)?;
        Ok(Self {
            config,
            peers: PeerRegistry::new(),
            coordinator,
            #[cfg(feature = "std")]
            worker: spin::Mutex::new(Some(worker)),
        })
    }

    /// Starts the invalidation worker thread if it was stopped.
    #[cfg(feature = "std")]
    pub fn start_worker(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = Some(InvalidationWorker::spawn(
                &self.coordinator,
                self.config.worker_name,
            )?);
        }
        Ok(())
    }

    /// Stops and joins the invalidation worker thread.
    #[cfg(feature = "std")]
    pub fn stop_worker(&self) {
        let worker = self.worker.lock().take();
        drop(worker);
    }

    /// Active configuration
    pub fn config(&self) -> &UmemConfig {
        &self.config
    }

    /// Peer provider registry
    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Invalidation coordinator
    pub fn coordinator(&self) -> &InvalidationCoordinator {
        &self.coordinator
    }

    /// Pins `[addr, addr + len)` of ordinary process memory.
    ///
    /// Either returns a fully pinned region or fails leaving nothing pinned.
    pub fn acquire_region(
        &self,
        space: &Arc<AddressSpace>,
        addr: VirtAddr,
        len: usize,
        access: Access,
    ) -> Result<RegionHandle> {
        if access.contains(Access::ON_DEMAND) {
            return Err(UmemError::Unsupported);
        }
        let pinned = pinner::pin_user_pages(space, addr, len, access, &self.config)?;
        Region::create(space, addr, len, access, pinned, &self.config, &self.coordinator)
    }

    /// Pins `[addr, addr + len)`, going through a peer provider when one
    /// claims the range and `flags` allow it.
    ///
    /// - A claiming provider is used with `ALLOW_PEER_MEMORY`; with
    ///   `REQUIRE_INVALIDATION_SUPPORT` it must support invalidation.
    /// - Without a claiming provider the range is pinned as ordinary memory.
    /// - A claimed range without `ALLOW_PEER_MEMORY` is tried as ordinary
    ///   memory; a fault there is reported as `UnsupportedPeerMemory`.
    pub fn acquire_peer_region(
        &self,
        space: &Arc<AddressSpace>,
        addr: VirtAddr,
        len: usize,
        access: Access,
        flags: PeerMemFlags,
    ) -> Result<RegionHandle> {
        if access.contains(Access::ON_DEMAND) {
            return Err(UmemError::Unsupported);
        }
        pinner::check_range(space, addr, len)?;

        let Some(provider) = self.peers.find_claiming(addr, len) else {
            return self.acquire_region(space, addr, len, access);
        };

        if !flags.contains(PeerMemFlags::ALLOW_PEER_MEMORY) {
            return match self.acquire_region(space, addr, len, access) {
                Err(UmemError::Fault) => {
                    log::debug!(
                        "Range at {} belongs to '{}' but peer memory is not allowed",
                        addr,
                        provider.name()
                    );
                    Err(UmemError::UnsupportedPeerMemory)
                }
                other => other,
            };
        }

        if flags.contains(PeerMemFlags::REQUIRE_INVALIDATION_SUPPORT)
            && !provider.supports_invalidation()
        {
            log::warn!(
                "Peer provider '{}' cannot invalidate, refusing range at {}",
                provider.name(),
                addr
            );
            return Err(UmemError::UnsupportedPeerMemory);
        }

        let pinned = pinner::pin_peer_pages(space, provider, addr, len, access)?;
        Region::create(space, addr, len, access, pinned, &self.config, &self.coordinator)
    }
}

impl core::fmt::Debug for UmemContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UmemContext")
            .field("config", &self.config)
            .field("peers", &self.peers.len())
            .field("live_regions", &self.coordinator.live_regions())
            .finish()
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::accounting::PinCounter;
    use crate::physical::{PAGE_SIZE, PhysAddr};
    use crate::sim::{SimPeerProvider, SimVm};

    fn setup() -> (UmemContext, Arc<SimVm>, Arc<AddressSpace>) {
        let vm = SimVm::new();
        vm.map_anonymous(1, VirtAddr::new(0x10000), 4, true).unwrap();
        let space = Arc::new(AddressSpace::new(1, vm.clone(), Arc::new(PinCounter::unlimited())));
        (UmemContext::new(UmemConfig::default()).unwrap(), vm, space)
    }

    #[test]
    fn test_on_demand_is_rejected() {
        let (ctx, vm, space) = setup();
        let result = ctx.acquire_region(&space, VirtAddr::new(0x10000), PAGE_SIZE, Access::READ | Access::ON_DEMAND);
        assert_eq!(result.unwrap_err(), UmemError::Unsupported);
        assert_eq!(vm.total_pins(), 0);
    }

    #[test]
    fn test_claimed_range_without_allow_flag() {
        let (ctx, _vm, space) = setup();
        let provider = SimPeerProvider::new("gpu", VirtAddr::new(0x100_0000), 8, PhysAddr::new(0x8000_0000), true);
        ctx.peers().register(provider.clone());

        let result = ctx.acquire_peer_region(
            &space,
            VirtAddr::new(0x100_0000),
            PAGE_SIZE,
            Access::READ,
            PeerMemFlags::empty(),
        );
        assert_eq!(result.unwrap_err(), UmemError::UnsupportedPeerMemory);
        assert_eq!(provider.pinned_pages(), 0);
    }

    #[test]
    fn test_peer_region_uses_provider() {
        let (ctx, _vm, space) = setup();
        let provider = SimPeerProvider::new("gpu", VirtAddr::new(0x100_0000), 8, PhysAddr::new(0x8000_0000), true);
        ctx.peers().register(provider.clone());

        let region = ctx
            .acquire_peer_region(
                &space,
                VirtAddr::new(0x100_0000),
                2 * PAGE_SIZE,
                Access::READ | Access::WRITE,
                PeerMemFlags::ALLOW_PEER_MEMORY,
            )
            .unwrap();
        assert!(region.is_peer());
        assert_eq!(provider.pinned_pages(), 2);
        assert_eq!(space.pin_counter().pinned(), 2);

        drop(region);
        assert_eq!(provider.pinned_pages(), 0);
        assert_eq!(space.pin_counter().pinned(), 0);
    }
}
