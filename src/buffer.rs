//! Frame buffer types.
//!
//! A [`CaptureBuffer`] is one frame-sized memory region the hardware can DMA
//! into. The scheduler never touches the memory itself — it only moves the
//! descriptor between owners (pool, hardware slot, HDR group, consumer), and
//! Rust's move semantics make that ownership transfer total: a buffer bound
//! into a slot cannot simultaneously sit in the pool.
//!
//! Timestamps are monotonic nanoseconds supplied by the interrupt context.
//! The scheduler never reads a clock, which keeps every test deterministic.

use bytes::Bytes;

/// Physical address usable as a hardware DMA target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DmaAddr(pub u64);

impl std::fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Exposure tier of a frame in a multi-exposure (HDR) capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExposureTier {
    /// Single-exposure capture; the HDR correlator is bypassed.
    Single,
    /// Longest exposure of the HDR set.
    Long,
    /// Middle exposure (3-exposure sensors only).
    Medium,
    /// Shortest exposure of the HDR set.
    Short,
}

impl ExposureTier {
    /// Position in the long → medium → short validation order, or `None`
    /// for single-exposure frames.
    #[must_use]
    pub fn hdr_index(self) -> Option<usize> {
        match self {
            ExposureTier::Single => None,
            ExposureTier::Long => Some(0),
            ExposureTier::Medium => Some(1),
            ExposureTier::Short => Some(2),
        }
    }
}

/// Descriptor for one consumer-supplied frame buffer.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    /// Consumer cookie, handed back unchanged on delivery.
    pub id: u32,
    /// DMA target address written into the hardware slot register.
    pub addr: DmaAddr,
    /// Per-plane byte offsets from `addr` (empty for single-plane formats).
    pub plane_offsets: Vec<u32>,
    /// Logical frame number, assigned at retirement.
    pub sequence: u64,
    /// Completion timestamp in monotonic nanoseconds, set at retirement.
    pub timestamp_ns: u64,
    /// Exposure tier this buffer captured.
    pub tier: ExposureTier,
    /// Optional consumer-visible mapping of the frame memory.
    pub mapping: Option<Bytes>,
}

impl CaptureBuffer {
    /// Descriptor for a single-exposure buffer at `addr`.
    #[must_use]
    pub fn new(id: u32, addr: DmaAddr) -> Self {
        Self {
            id,
            addr,
            plane_offsets: Vec::new(),
            sequence: 0,
            timestamp_ns: 0,
            tier: ExposureTier::Single,
            mapping: None,
        }
    }

    /// Same, tagged with an HDR exposure tier.
    #[must_use]
    pub fn with_tier(id: u32, addr: DmaAddr, tier: ExposureTier) -> Self {
        Self {
            tier,
            ..Self::new(id, addr)
        }
    }

    /// Attach a consumer-visible mapping of the frame memory. The mapping
    /// travels with the descriptor and comes back on delivery.
    #[must_use]
    pub fn with_mapping(mut self, mapping: Bytes) -> Self {
        self.mapping = Some(mapping);
        self
    }
}

/// A frame handed to the deferred delivery path.
#[derive(Debug, Clone)]
pub struct DeliveredFrame {
    /// The completed buffer, now consumer-owned.
    pub buffer: CaptureBuffer,
    /// False when an HDR correlation miss force-flushed this frame without
    /// its sibling tiers.
    pub correlated: bool,
}

impl DeliveredFrame {
    /// Wrap a normally retired frame.
    #[must_use]
    pub fn correlated(buffer: CaptureBuffer) -> Self {
        Self {
            buffer,
            correlated: true,
        }
    }

    /// Wrap a force-flushed frame that lost its HDR siblings.
    #[must_use]
    pub fn uncorrelated(buffer: CaptureBuffer) -> Self {
        Self {
            buffer,
            correlated: false,
        }
    }
}
