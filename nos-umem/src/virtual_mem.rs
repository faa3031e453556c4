//! User virtual addresses

use crate::physical::{PAGE_SHIFT, PAGE_SIZE, page_round_down};

/// A user virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the virtual address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the page number for this virtual address.
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Checks if the virtual address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Rounds down the virtual address to the previous page boundary.
    pub const fn page_round_down(self) -> Self {
        Self(page_round_down(self.0))
    }

    /// Adds `len` bytes, `None` if the result wraps.
    pub const fn checked_add(self, len: usize) -> Option<Self> {
        match self.0.checked_add(len) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Returns `true` if `[self, self + len)` overlaps `[other, other + other_len)`.
    pub const fn overlaps(self, len: usize, other: VirtAddr, other_len: usize) -> bool {
        self.0 < other.0.saturating_add(other_len) && other.0 < self.0.saturating_add(len)
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for usize {
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

impl core::fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlaps() {
        let a = VirtAddr::new(0x1000);
        assert!(a.overlaps(0x1000, VirtAddr::new(0x1fff), 1));
        assert!(!a.overlaps(0x1000, VirtAddr::new(0x2000), 0x1000));
        assert!(!a.overlaps(0x1000, VirtAddr::new(0x0), 0x1000));
    }

    #[test]
    fn test_checked_add() {
        assert_eq!(VirtAddr::new(0x1000).checked_add(0x10), Some(VirtAddr::new(0x1010)));
        assert_eq!(VirtAddr::new(usize::MAX).checked_add(1), None);
    }
}
