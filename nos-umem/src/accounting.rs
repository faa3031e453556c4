//! Per-address-space pinned page accounting

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, UmemError};

/// Shared counter of pages pinned on behalf of one address space.
///
/// Every region acquired from the address space charges its page count here
/// and uncharges the same amount when its pages are released.
#[derive(Debug)]
pub struct PinCounter {
    pinned: AtomicUsize,
    limit: usize,
}

impl PinCounter {
    /// Creates a counter that refuses charges beyond `limit` pages.
    pub const fn new(limit: usize) -> Self {
        Self {
            pinned: AtomicUsize::new(0),
            limit,
        }
    }

    /// Creates a counter without a limit.
    pub const fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Charges `pages` pinned pages.
    ///
    /// `exempt` skips the limit check (privileged address spaces) but the
    /// pages are still counted.
    pub fn charge(&self, pages: usize, exempt: bool) -> Result<()> {
        self.pinned
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(pages)?;
                if !exempt && next > self.limit {
                    None
                } else {
                    Some(next)
                }
            })
            .map(|_| ())
            .map_err(|current| {
                log::warn!(
                    "Pin limit hit: {} pinned, {} requested, limit {}",
                    current, pages, self.limit
                );
                UmemError::ResourceExhausted
            })
    }

    /// Returns `pages` previously charged.
    pub fn uncharge(&self, pages: usize) {
        let previous = self.pinned.fetch_sub(pages, Ordering::AcqRel);
        debug_assert!(previous >= pages, "pin counter underflow");
    }

    /// Pages currently charged.
    pub fn pinned(&self) -> usize {
        self.pinned.load(Ordering::Acquire)
    }

    /// Configured limit in pages.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for PinCounter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_within_limit() {
        let counter = PinCounter::new(8);
        assert!(counter.charge(5, false).is_ok());
        assert!(counter.charge(3, false).is_ok());
        assert_eq!(counter.pinned(), 8);
        counter.uncharge(8);
        assert_eq!(counter.pinned(), 0);
    }

    #[test]
    fn test_charge_over_limit_leaves_counter_untouched() {
        let counter = PinCounter::new(4);
        counter.charge(3, false).unwrap();
        assert_eq!(counter.charge(2, false), Err(UmemError::ResourceExhausted));
        assert_eq!(counter.pinned(), 3);
    }

    #[test]
    fn test_exempt_ignores_limit() {
        let counter = PinCounter::new(1);
        assert!(counter.charge(10, true).is_ok());
        assert_eq!(counter.pinned(), 10);
    }
}
