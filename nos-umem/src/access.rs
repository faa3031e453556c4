//! Access and peer-memory flag sets

bitflags::bitflags! {
    /// Access requested for a pinned region
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        /// Device may read the region
        const READ = 0b0000_0001;
        /// Device may write the region
        const WRITE = 0b0000_0010;
        /// Fault pages lazily instead of pinning up front
        const ON_DEMAND = 0b0000_0100;
    }
}

impl Access {
    /// Whether pinned pages must be writable (and are dirtied on release).
    pub const fn is_writable(self) -> bool {
        self.contains(Access::WRITE)
    }
}

bitflags::bitflags! {
    /// Capability flags for peer-memory acquisition
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PeerMemFlags: u32 {
        /// Ranges claimed by a peer provider may be pinned through it
        const ALLOW_PEER_MEMORY = 0b0000_0001;
        /// The provider must be able to deliver invalidations
        const REQUIRE_INVALIDATION_SUPPORT = 0b0000_0010;
    }
}
