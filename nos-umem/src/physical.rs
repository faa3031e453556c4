//! Physical addresses and system page geometry

use static_assertions::const_assert_eq;

/// System page size (4KB)
pub const PAGE_SIZE: usize = 4096;
/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

const_assert_eq!(1 << PAGE_SHIFT, PAGE_SIZE);

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary, `None` on overflow
#[inline]
pub const fn page_round_up(addr: usize) -> Option<usize> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(end) => Some(end & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// Number of system pages touched by `[addr, addr + len)`.
///
/// Returns `None` if the range wraps the address space.
#[inline]
pub const fn pages_spanned(addr: usize, len: usize) -> Option<usize> {
    let end = match addr.checked_add(len) {
        Some(end) => end,
        None => return None,
    };
    match page_round_up(end) {
        Some(end) => Some((end - page_round_down(addr)) >> PAGE_SHIFT),
        None => None,
    }
}

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    /// Creates a new physical address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the physical address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the page frame number for this physical address.
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Checks if the address is a multiple of `size` (a power of two).
    pub const fn is_aligned_to(self, size: usize) -> bool {
        self.0 & (size - 1) == 0
    }

    /// Returns the address `offset` bytes further on.
    pub const fn offset(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl From<usize> for PhysAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_round_down(0x1fff), 0x1000);
        assert_eq!(page_round_up(0x1001), Some(0x2000));
        assert_eq!(page_round_up(0x2000), Some(0x2000));
        assert_eq!(page_round_up(usize::MAX), None);
    }

    #[test]
    fn test_pages_spanned() {
        assert_eq!(pages_spanned(0x1000, 3 * PAGE_SIZE), Some(3));
        // Unaligned head and tail each add a partial page.
        assert_eq!(pages_spanned(0x1800, PAGE_SIZE), Some(2));
        assert_eq!(pages_spanned(0x1800, 1), Some(1));
        assert_eq!(pages_spanned(usize::MAX - 10, 100), None);
    }

    #[test]
    fn test_alignment() {
        assert!(PhysAddr::new(0x20_0000).is_aligned_to(0x20_0000));
        assert!(!PhysAddr::new(0x20_1000).is_aligned_to(0x20_0000));
        assert_eq!(PhysAddr::new(0x1234).page_offset(), 0x234);
        assert_eq!(PhysAddr::new(0x5000).page_number(), 5);
    }
}
