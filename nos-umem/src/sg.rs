//! Scatter/gather table construction
//!
//! Coalesces pinned pages into (physical base, page count) segments at a
//! uniform page size. The table is built in one pass over the pages in VA
//! order and never holds two adjacent segments that could be merged within
//! the segment size cap.

extern crate alloc;

use alloc::vec::Vec;
use core::cmp::max;

use crate::physical::{PAGE_SHIFT, PAGE_SIZE, PhysAddr};

/// One physically contiguous run of pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgSegment {
    /// Physical address of the first byte
    pub phys: PhysAddr,
    /// Length in pages of the table's page size
    pub npages: usize,
}

/// Ordered segment list at a single page size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgTable {
    segments: Vec<SgSegment>,
    page_shift: u32,
}

impl SgTable {
    /// Segments in VA order
    pub fn segments(&self) -> &[SgSegment] {
        &self.segments
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// log2 of the page size
    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    /// Page size in bytes
    pub fn page_size(&self) -> usize {
        1 << self.page_shift
    }

    /// Byte length of `segment`
    pub fn segment_bytes(&self, segment: &SgSegment) -> usize {
        segment.npages << self.page_shift
    }

    /// Bytes covered by all segments
    pub fn total_bytes(&self) -> usize {
        self.segments.iter().map(|s| self.segment_bytes(s)).sum()
    }

    /// Physical address of every page-size block, in VA order.
    pub fn dma_blocks(&self) -> impl Iterator<Item = PhysAddr> + '_ {
        self.dma_blocks_at(self.page_size())
    }

    /// Physical address of every `block_size` block, in VA order.
    ///
    /// `block_size` must be a power of two no larger than the table's page
    /// size, so that it divides every segment.
    pub fn dma_blocks_at(&self, block_size: usize) -> impl Iterator<Item = PhysAddr> + '_ {
        debug_assert!(block_size.is_power_of_two() && block_size <= self.page_size());
        self.segments.iter().flat_map(move |s| {
            let blocks = self.segment_bytes(s) / block_size;
            (0..blocks).map(move |i| s.phys.offset(i * block_size))
        })
    }
}

/// Builds the segment table for `pages` at `1 << page_shift` bytes per page.
///
/// `pages` are system pages in VA order. When `page_shift` exceeds the
/// system page shift, every group of pages forming one large page must be
/// physically contiguous, which is what the page-size negotiator checks
/// before a larger shift is used. Segments never exceed `max_segment_size`
/// bytes (rounded down to whole pages, at least one page).
pub fn build(pages: &[PhysAddr], page_shift: u32, max_segment_size: usize) -> SgTable {
    debug_assert!(page_shift as usize >= PAGE_SHIFT);
    let page_size = 1usize << page_shift;
    let per_block = page_size / PAGE_SIZE;
    let max_blocks = max(1, max_segment_size / page_size);
    debug_assert!(pages.len() % per_block == 0);

    let mut segments: Vec<SgSegment> = Vec::new();
    for block in pages.chunks(per_block) {
        let phys = block[0];
        debug_assert!(
            block
                .windows(2)
                .all(|w| w[1].as_usize() == w[0].as_usize() + PAGE_SIZE),
            "large page not physically contiguous"
        );
        match segments.last_mut() {
            Some(last)
                if last.npages < max_blocks
                    && last.phys.as_usize() + (last.npages << page_shift) == phys.as_usize() =>
            {
                last.npages += 1;
            }
            _ => segments.push(SgSegment { phys, npages: 1 }),
        }
    }

    SgTable {
        segments,
        page_shift,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn pages(addrs: &[usize]) -> Vec<PhysAddr> {
        addrs.iter().map(|&a| PhysAddr::new(a)).collect()
    }

    #[test]
    fn test_contiguous_pages_merge() {
        let table = build(&pages(&[0x10000, 0x11000, 0x12000]), PAGE_SHIFT as u32, usize::MAX);
        assert_eq!(table.len(), 1);
        assert_eq!(table.segments()[0], SgSegment { phys: PhysAddr::new(0x10000), npages: 3 });
        assert_eq!(table.total_bytes(), 3 * PAGE_SIZE);
    }

    #[test]
    fn test_break_in_contiguity_starts_segment() {
        let table = build(
            &pages(&[0x10000, 0x11000, 0x40000, 0x41000, 0x20000]),
            PAGE_SHIFT as u32,
            usize::MAX,
        );
        assert_eq!(
            table.segments(),
            &[
                SgSegment { phys: PhysAddr::new(0x10000), npages: 2 },
                SgSegment { phys: PhysAddr::new(0x40000), npages: 2 },
                SgSegment { phys: PhysAddr::new(0x20000), npages: 1 },
            ]
        );
    }

    #[test]
    fn test_descending_physical_pages_do_not_merge() {
        let table = build(&pages(&[0x11000, 0x10000]), PAGE_SHIFT as u32, usize::MAX);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_segment_size_cap() {
        let table = build(
            &pages(&[0x10000, 0x11000, 0x12000, 0x13000, 0x14000]),
            PAGE_SHIFT as u32,
            2 * PAGE_SIZE,
        );
        let lens: Vec<usize> = table.segments().iter().map(|s| s.npages).collect();
        assert_eq!(lens, vec![2, 2, 1]);
    }

    #[test]
    fn test_large_page_shift() {
        // Two 16K pages, physically adjacent.
        let addrs: Vec<usize> = (0..8).map(|i| 0x100000 + i * PAGE_SIZE).collect();
        let table = build(&pages(&addrs), 14, usize::MAX);
        assert_eq!(table.page_size(), 0x4000);
        assert_eq!(table.segments(), &[SgSegment { phys: PhysAddr::new(0x100000), npages: 2 }]);
        let blocks: Vec<PhysAddr> = table.dma_blocks().collect();
        assert_eq!(blocks, pages(&[0x100000, 0x104000]));
        assert_eq!(table.dma_blocks_at(0x2000).count(), 4);
        assert_eq!(table.dma_blocks_at(PAGE_SIZE).collect::<Vec<_>>(), pages(&addrs));
    }
}
