//! In-memory VM service and peer provider
//!
//! Backs tests and benchmarks with a software page table: frames hold real
//! bytes, mappings carry a writable bit and every frame counts its pins.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::min;
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use crate::access::Access;
use crate::error::{Result, UmemError};
use crate::invalidation::{Completion, InvalidationSink, RegionId};
use crate::peer::PeerMemoryProvider;
use crate::physical::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, page_round_down, pages_spanned};
use crate::virtual_mem::VirtAddr;
use crate::vm::{AddressSpaceId, ChangeHandler, NotifierToken, VmService};

/// First frame handed out by [`SimVm::map_anonymous`]
const FIRST_PFN: usize = 0x100;

struct Frame {
    data: Box<[u8]>,
    pins: usize,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            pins: 0,
        }
    }
}

#[derive(Clone, Copy)]
struct Mapping {
    pfn: usize,
    writable: bool,
}

struct Watch {
    space: AddressSpaceId,
    start: VirtAddr,
    len: usize,
    handler: Arc<dyn ChangeHandler>,
}

struct SimVmState {
    frames: HashMap<usize, Frame>,
    mappings: HashMap<(AddressSpaceId, usize), Mapping>,
    watches: HashMap<u64, Watch>,
    next_pfn: usize,
    max_pages_per_call: usize,
}

/// Software VM service
pub struct SimVm {
    state: Mutex<SimVmState>,
    next_token: AtomicU64,
}

impl SimVm {
    /// Creates an empty VM.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimVmState {
                frames: HashMap::new(),
                mappings: HashMap::new(),
                watches: HashMap::new(),
                next_pfn: FIRST_PFN,
                max_pages_per_call: usize::MAX,
            }),
            next_token: AtomicU64::new(1),
        })
    }

    /// Maps `npages` fresh, physically consecutive frames at `addr`.
    pub fn map_anonymous(&self, space: AddressSpaceId, addr: VirtAddr, npages: usize, writable: bool) -> Result<()> {
        let first = {
            let mut state = self.state.lock();
            let first = state.next_pfn;
            state.next_pfn += npages;
            first
        };
        let frames: Vec<PhysAddr> = (first..first + npages)
            .map(|pfn| PhysAddr::new(pfn << PAGE_SHIFT))
            .collect();
        self.map_frames(space, addr, &frames, writable)
    }

    /// Maps the given physical pages, in order, at `addr`.
    pub fn map_frames(&self, space: AddressSpaceId, addr: VirtAddr, frames: &[PhysAddr], writable: bool) -> Result<()> {
        if !addr.is_page_aligned() {
            return Err(UmemError::InvalidRange);
        }
        let mut state = self.state.lock();
        let first_vpn = addr.page_number();
        if (0..frames.len()).any(|i| state.mappings.contains_key(&(space, first_vpn + i))) {
            return Err(UmemError::InvalidRange);
        }
        for (i, frame) in frames.iter().enumerate() {
            let pfn = frame.page_number();
            state.frames.entry(pfn).or_insert_with(Frame::new);
            state.next_pfn = state.next_pfn.max(pfn + 1);
            state
                .mappings
                .insert((space, first_vpn + i), Mapping { pfn, writable });
        }
        Ok(())
    }

    /// Removes `npages` mappings at `addr` and notifies overlapping watches.
    /// Pinned frames stay allocated.
    pub fn unmap(&self, space: AddressSpaceId, addr: VirtAddr, npages: usize) {
        let len = npages * PAGE_SIZE;
        let handlers: Vec<Arc<dyn ChangeHandler>> = {
            let mut state = self.state.lock();
            for i in 0..npages {
                state.mappings.remove(&(space, addr.page_number() + i));
            }
            state
                .watches
                .values()
                .filter(|w| w.space == space && w.start.overlaps(w.len, addr, len))
                .map(|w| w.handler.clone())
                .collect()
        };
        for handler in handlers {
            handler.range_changed(addr, len);
        }
    }

    /// Writes `data` at `addr` through the page table.
    pub fn write(&self, space: AddressSpaceId, addr: VirtAddr, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let mut written = 0;
        while written < data.len() {
            let va = addr.as_usize() + written;
            let mapping = *state
                .mappings
                .get(&(space, va >> PAGE_SHIFT))
                .ok_or(UmemError::Fault)?;
            let offset = va & (PAGE_SIZE - 1);
            let chunk = min(data.len() - written, PAGE_SIZE - offset);
            let frame = state.frames.get_mut(&mapping.pfn).ok_or(UmemError::Fault)?;
            frame.data[offset..offset + chunk].copy_from_slice(&data[written..written + chunk]);
            written += chunk;
        }
        Ok(())
    }

    /// Physical page backing `addr`.
    pub fn translate(&self, space: AddressSpaceId, addr: VirtAddr) -> Option<PhysAddr> {
        self.state
            .lock()
            .mappings
            .get(&(space, addr.page_number()))
            .map(|m| PhysAddr::new(m.pfn << PAGE_SHIFT))
    }

    /// Caps the pages pinned per [`VmService::pin`] call.
    pub fn set_max_pages_per_call(&self, max: usize) {
        self.state.lock().max_pages_per_call = max;
    }

    /// Sum of pin counts over all frames
    pub fn total_pins(&self) -> usize {
        self.state.lock().frames.values().map(|f| f.pins).sum()
    }

    /// Pin count of the frame at `phys`
    pub fn pins(&self, phys: PhysAddr) -> usize {
        self.state
            .lock()
            .frames
            .get(&phys.page_number())
            .map_or(0, |f| f.pins)
    }

    /// Number of installed change watches
    pub fn watch_count(&self) -> usize {
        self.state.lock().watches.len()
    }
}

impl VmService for SimVm {
    fn pin(&self, space: AddressSpaceId, start: VirtAddr, npages: usize, access: Access) -> Result<Vec<PhysAddr>> {
        let mut state = self.state.lock();
        let limit = min(npages, state.max_pages_per_call);
        let mut pfns = Vec::with_capacity(limit);
        for i in 0..limit {
            let Some(mapping) = state.mappings.get(&(space, start.page_number() + i)) else {
                break;
            };
            if access.is_writable() && !mapping.writable {
                if pfns.is_empty() {
                    return Err(UmemError::PermissionDenied);
                }
                break;
            }
            pfns.push(mapping.pfn);
        }
        if pfns.is_empty() {
            return Err(UmemError::Fault);
        }
        for pfn in &pfns {
            if let Some(frame) = state.frames.get_mut(pfn) {
                frame.pins += 1;
            }
        }
        Ok(pfns
            .into_iter()
            .map(|pfn| PhysAddr::new(pfn << PAGE_SHIFT))
            .collect())
    }

    fn unpin(&self, _space: AddressSpaceId, pages: &[PhysAddr], _dirty: bool) {
        let mut state = self.state.lock();
        for page in pages {
            if let Some(frame) = state.frames.get_mut(&page.page_number()) {
                debug_assert!(frame.pins > 0, "unpin of unpinned frame {:#x}", page.as_usize());
                frame.pins -= 1;
            }
        }
    }

    fn register_change_notifier(
        &self,
        space: AddressSpaceId,
        start: VirtAddr,
        len: usize,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<NotifierToken> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.state.lock().watches.insert(
            token,
            Watch {
                space,
                start,
                len,
                handler,
            },
        );
        Ok(NotifierToken(token))
    }

    fn deregister(&self, token: NotifierToken) {
        self.state.lock().watches.remove(&token.0);
    }

    fn read_phys(&self, phys: PhysAddr, dst: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let frame = state
            .frames
            .get(&phys.page_number())
            .ok_or(UmemError::Fault)?;
        let offset = phys.page_offset();
        dst.copy_from_slice(&frame.data[offset..offset + dst.len()]);
        Ok(())
    }
}

struct PeerState {
    memory: Vec<u8>,
    pins: usize,
    sinks: HashMap<RegionId, InvalidationSink>,
}

/// Software peer provider owning one contiguous device window
pub struct SimPeerProvider {
    name: String,
    base: VirtAddr,
    len: usize,
    phys_base: PhysAddr,
    invalidation: bool,
    state: Mutex<PeerState>,
}

impl SimPeerProvider {
    /// Creates a provider claiming `npages` pages at `base`, backed by
    /// device memory at `phys_base`.
    pub fn new(name: &str, base: VirtAddr, npages: usize, phys_base: PhysAddr, invalidation: bool) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            base,
            len: npages * PAGE_SIZE,
            phys_base,
            invalidation,
            state: Mutex::new(PeerState {
                memory: vec![0u8; npages * PAGE_SIZE],
                pins: 0,
                sinks: HashMap::new(),
            }),
        })
    }

    /// Writes device memory at `offset` from the window start.
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.state.lock().memory[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Pages currently pinned
    pub fn pinned_pages(&self) -> usize {
        self.state.lock().pins
    }

    /// Regions with an installed sink
    pub fn registered(&self) -> usize {
        self.state.lock().sinks.len()
    }

    /// Revokes the whole window, signalling every registered region from
    /// inside the provider's critical section. Wait on the completions
    /// before reusing the memory.
    pub fn revoke(&self) -> Vec<Completion> {
        let mut state = self.state.lock();
        state.sinks.drain().map(|(_, sink)| sink.invalidate()).collect()
    }

    /// Revokes the memory of one region.
    pub fn revoke_region(&self, region: RegionId) -> Option<Completion> {
        let sink = self.state.lock().sinks.remove(&region)?;
        Some(sink.invalidate())
    }
}

impl PeerMemoryProvider for SimPeerProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn claims(&self, addr: VirtAddr, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len)
                .is_some_and(|end| end.as_usize() <= self.base.as_usize() + self.len)
    }

    fn supports_invalidation(&self) -> bool {
        self.invalidation
    }

    fn pin_peer(&self, addr: VirtAddr, len: usize, _access: Access) -> Result<Vec<PhysAddr>> {
        if !self.claims(addr, len) {
            return Err(UmemError::Fault);
        }
        let npages = pages_spanned(addr.as_usize(), len).ok_or(UmemError::InvalidRange)?;
        let first = (page_round_down(addr.as_usize()) - self.base.as_usize()) / PAGE_SIZE;
        self.state.lock().pins += npages;
        Ok((first..first + npages)
            .map(|i| self.phys_base.offset(i * PAGE_SIZE))
            .collect())
    }

    fn unpin_peer(&self, pages: &[PhysAddr]) {
        let mut state = self.state.lock();
        debug_assert!(state.pins >= pages.len(), "peer unpin underflow");
        state.pins -= pages.len();
    }

    fn register_invalidation(&self, region: RegionId, sink: InvalidationSink) -> Result<()> {
        if !self.invalidation {
            return Err(UmemError::UnsupportedPeerMemory);
        }
        self.state.lock().sinks.insert(region, sink);
        Ok(())
    }

    fn unregister_invalidation(&self, region: RegionId) {
        self.state.lock().sinks.remove(&region);
    }

    fn read_phys(&self, phys: PhysAddr, dst: &mut [u8]) -> Result<()> {
        let offset = phys
            .as_usize()
            .checked_sub(self.phys_base.as_usize())
            .ok_or(UmemError::Fault)?;
        let state = self.state.lock();
        let src = state
            .memory
            .get(offset..offset + dst.len())
            .ok_or(UmemError::Fault)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}
