//! Peer-memory providers
//!
//! A peer provider owns memory outside the ordinary page cache and anonymous
//! mappings (device memory of an accelerator, for example). It can pin that
//! memory for DMA and revoke it later through an [`InvalidationSink`].

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

use crate::access::Access;
use crate::error::Result;
use crate::invalidation::{InvalidationSink, RegionId};
use crate::physical::PhysAddr;
use crate::virtual_mem::VirtAddr;

/// Operations consumed from an external memory provider
pub trait PeerMemoryProvider: Send + Sync {
    /// Provider name, used in logs
    fn name(&self) -> &str;

    /// Whether `[addr, addr + len)` belongs to this provider.
    fn claims(&self, addr: VirtAddr, len: usize) -> bool;

    /// Whether the provider can revoke memory through invalidations.
    fn supports_invalidation(&self) -> bool;

    /// Pins every page of `[align_down(addr), align_up(addr + len))` and
    /// returns their physical addresses in VA order.
    fn pin_peer(&self, addr: VirtAddr, len: usize, access: Access) -> Result<Vec<PhysAddr>>;

    /// Releases pages returned by [`pin_peer`](Self::pin_peer).
    fn unpin_peer(&self, pages: &[PhysAddr]);

    /// Installs the sink the provider signals before reclaiming the memory
    /// pinned for `region`.
    fn register_invalidation(&self, region: RegionId, sink: InvalidationSink) -> Result<()>;

    /// Drops the sink installed for `region`.
    fn unregister_invalidation(&self, region: RegionId);

    /// Copies bytes from a pinned peer page. `dst` never crosses a page
    /// boundary.
    fn read_phys(&self, phys: PhysAddr, dst: &mut [u8]) -> Result<()>;
}

/// Registered peer providers, probed in registration order
#[derive(Default)]
pub struct PeerRegistry {
    providers: RwLock<Vec<Arc<dyn PeerMemoryProvider>>>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a provider.
    pub fn register(&self, provider: Arc<dyn PeerMemoryProvider>) {
        log::debug!("Registered peer memory provider '{}'", provider.name());
        self.providers.write().push(provider);
    }

    /// Removes the provider named `name`. Returns `false` if none matched.
    ///
    /// Regions already pinned through it keep their reference.
    pub fn unregister(&self, name: &str) -> bool {
        let mut providers = self.providers.write();
        let before = providers.len();
        providers.retain(|p| p.name() != name);
        before != providers.len()
    }

    /// First provider claiming `[addr, addr + len)`.
    pub fn find_claiming(&self, addr: VirtAddr, len: usize) -> Option<Arc<dyn PeerMemoryProvider>> {
        self.providers
            .read()
            .iter()
            .find(|p| p.claims(addr, len))
            .cloned()
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    /// Whether no provider is registered
    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}
