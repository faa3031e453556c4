//! Region manager configuration

use crate::error::{Result, UmemError};
use crate::physical::PAGE_SIZE;

/// Configuration for a [`UmemContext`](crate::UmemContext)
#[derive(Debug, Clone)]
pub struct UmemConfig {
    /// Largest scatter/gather segment the device can take, in bytes
    pub max_segment_size: usize,
    /// Pages handed to the VM service per pin call
    pub pin_chunk_pages: usize,
    /// Register a change notifier on ordinary regions to detect unmaps
    pub track_mapping_changes: bool,
    /// Name of the invalidation worker thread
    pub worker_name: &'static str,
}

impl Default for UmemConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 1 << 31,
            // One page worth of page pointers per call
            pin_chunk_pages: PAGE_SIZE / core::mem::size_of::<usize>(),
            track_mapping_changes: true,
            worker_name: "umem-inval",
        }
    }
}

impl UmemConfig {
    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_size < PAGE_SIZE || self.max_segment_size % PAGE_SIZE != 0 {
            return Err(UmemError::InvalidConfig);
        }
        if self.pin_chunk_pages == 0 {
            return Err(UmemError::InvalidConfig);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = UmemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pin_chunk_pages, 512);
    }

    #[test]
    fn test_rejects_unaligned_segment_size() {
        let config = UmemConfig {
            max_segment_size: PAGE_SIZE + 1,
            ..UmemConfig::default()
        };
        assert_eq!(config.validate(), Err(UmemError::InvalidConfig));

        let config = UmemConfig {
            pin_chunk_pages: 0,
            ..UmemConfig::default()
        };
        assert_eq!(config.validate(), Err(UmemError::InvalidConfig));
    }
}
