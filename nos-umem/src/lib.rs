//! NOS User Memory
//!
//! Pins user-space memory so a device can DMA into it. A region is acquired
//! from an address space, its pages are pinned and described to the device
//! as a scatter/gather table, and it is released by dropping its handle.
//!
//! Memory owned by an external provider (peer memory, such as accelerator
//! device memory) can be pinned through the same interface; such a provider
//! may later revoke the memory, which the invalidation coordinator turns
//! into a consumer callback followed by an unpin on a dedicated worker.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// Address and page geometry
pub mod physical;
pub mod virtual_mem;

pub mod error;
pub mod access;
pub mod config;
pub mod accounting;

// Collaborator interfaces
pub mod vm;
pub mod peer;

// Region manager
pub mod pinner;
pub mod sg;
pub mod pgsz;
pub mod invalidation;
pub mod region;
pub mod context;
pub mod api;

#[cfg(feature = "sim")]
pub mod sim;

pub use access::{Access, PeerMemFlags};
pub use accounting::PinCounter;
pub use api::*;
pub use config::UmemConfig;
pub use context::UmemContext;
pub use error::{Result, UmemError};
pub use invalidation::{Completion, CoordinatorStats, InvalidationCoordinator, InvalidationSink, RegionId};
#[cfg(feature = "std")]
pub use invalidation::InvalidationWorker;
pub use peer::{PeerMemoryProvider, PeerRegistry};
pub use physical::{PAGE_SHIFT, PAGE_SIZE, PhysAddr};
pub use region::{NotifierState, Region, RegionHandle};
pub use sg::{SgSegment, SgTable};
pub use virtual_mem::VirtAddr;
pub use vm::{AddressSpace, AddressSpaceId, ChangeHandler, NotifierToken, VmService};
