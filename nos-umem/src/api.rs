//! Driver-facing entry points
//!
//! Free-function form of the region operations, for callers that program
//! DMA engines from a flat verbs-style interface.

extern crate alloc;

use alloc::sync::Arc;

use crate::access::{Access, PeerMemFlags};
use crate::context::UmemContext;
use crate::error::Result;
use crate::region::{Region, RegionHandle};
use crate::virtual_mem::VirtAddr;
use crate::vm::AddressSpace;

/// Pins `[addr, addr + len)` of `space` for device access.
pub fn acquire_region(
    ctx: &UmemContext,
    space: &Arc<AddressSpace>,
    addr: VirtAddr,
    len: usize,
    access: Access,
) -> Result<RegionHandle> {
    ctx.acquire_region(space, addr, len, access)
}

/// Pins `[addr, addr + len)`, allowing peer memory according to `flags`.
pub fn acquire_peer_region(
    ctx: &UmemContext,
    space: &Arc<AddressSpace>,
    addr: VirtAddr,
    len: usize,
    access: Access,
    flags: PeerMemFlags,
) -> Result<RegionHandle> {
    ctx.acquire_peer_region(space, addr, len, access, flags)
}

/// Destroys `region`, unpinning its pages.
pub fn release_region(region: RegionHandle) {
    region.release();
}

/// Number of system pages spanned by `region`.
pub fn region_page_count(region: &Region) -> usize {
    region.page_count()
}

/// Copies `dst.len()` bytes starting `offset` bytes into `region`.
pub fn region_copy_from(dst: &mut [u8], region: &Region, offset: usize) -> Result<()> {
    region.copy_from(offset, dst)
}

/// Picks the best page size from `bitmap` for `region` mapped at `virt`
/// and rebuilds its segment table at that size.
pub fn region_find_best_page_size(region: &mut RegionHandle, bitmap: u64, virt: usize) -> Result<usize> {
    region.negotiate_page_size(bitmap, virt)
}

/// Installs an invalidation callback on a peer region.
pub fn region_start_invalidation_notifier<C, F>(
    region: &RegionHandle,
    callback: F,
    context: Arc<C>,
) -> Result<()>
where
    C: Send + Sync + 'static,
    F: Fn(&Region, &C) -> Result<()> + Send + Sync + 'static,
{
    region.start_invalidation_notifier(context, callback)
}

/// Removes the invalidation callback of a peer region if still registered.
pub fn region_stop_invalidation_notifier(region: &RegionHandle) {
    region.stop_invalidation_notifier();
}
