//! Page-size negotiation
//!
//! Picks the largest hardware-supported page size that partitions the pinned
//! range into equal, physically contiguous, naturally aligned pages at the
//! IOVA the device will use. A larger page size means fewer translation
//! entries in the device.

use crate::error::{Result, UmemError};
use crate::physical::{PAGE_SHIFT, PAGE_SIZE, PhysAddr};
use crate::virtual_mem::VirtAddr;

/// Bits of a page-size bitmap at or below the system page size
const SUB_PAGE_MASK: u64 = (PAGE_SIZE as u64) | (PAGE_SIZE as u64 - 1);

/// Returns the page size to program for `pages` mapped at `iova`.
///
/// `pages` are the system pages backing a region that starts at `address`;
/// `iova` is the device address of `address`. Bit `n` of `bitmap` set means
/// the device supports pages of `1 << n` bytes. The bitmap must include the
/// system page size or a smaller size; sizes below the system page size
/// count as the system page size, which is always the fallback.
///
/// A size `S` qualifies when:
/// - the IOVA of the first page is a multiple of `S`,
/// - the mapped length is a multiple of `S`,
/// - each `S`-sized group of pages is physically contiguous and starts at an
///   `S`-aligned physical address.
pub fn negotiate(pages: &[PhysAddr], address: VirtAddr, iova: usize, bitmap: u64) -> Result<usize> {
    if bitmap & SUB_PAGE_MASK == 0 {
        return Err(UmemError::NoCompatiblePageSize);
    }

    let first_iova = iova.wrapping_sub(address.page_offset());
    let mapped = pages.len() * PAGE_SIZE;
    let candidates = bitmap & !SUB_PAGE_MASK;
    let max_bit = usize::BITS.min(u64::BITS) - 1;

    for bit in (PAGE_SHIFT as u32 + 1..=max_bit).rev() {
        if candidates & (1u64 << bit) == 0 {
            continue;
        }
        let size = 1usize << bit;
        if first_iova % size != 0 || mapped % size != 0 {
            continue;
        }
        if blocks_uniform(pages, size) {
            log::debug!(
                "Negotiated page size {:#x} for {} pages at iova {:#x}",
                size,
                pages.len(),
                iova
            );
            return Ok(size);
        }
    }

    Ok(PAGE_SIZE)
}

/// Whether every `size` block of `pages` is contiguous and aligned.
fn blocks_uniform(pages: &[PhysAddr], size: usize) -> bool {
    let per_block = size / PAGE_SIZE;
    pages.chunks(per_block).all(|block| {
        block[0].is_aligned_to(size)
            && block
                .windows(2)
                .all(|w| w[1].as_usize() == w[0].as_usize() + PAGE_SIZE)
    })
}
