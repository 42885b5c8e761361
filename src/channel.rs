//! Per-channel capture state.
//!
//! Each channel owns an explicit slot-binding array indexed by [`SlotIndex`],
//! so "which hardware slot holds which buffer" is a single lookup instead of
//! current/next/last pointer juggling spread across call sites. The binding
//! array is the one place the ownership invariant is enforced: a buffer moved
//! into a slot is gone from everywhere else.

use crate::buffer::{CaptureBuffer, DmaAddr, ExposureTier};
use crate::rotation::RotationTracker;
use capture_pool::FrameQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of one logical capture path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u8);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the hardware frame-slot registers of a channel.
///
/// Two slots on most hardware; a third exists on revisions with triple
/// buffering and is treated as a straight generalization of the rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotIndex {
    /// First frame slot.
    A,
    /// Second frame slot.
    B,
    /// Third frame slot (triple-buffering hardware only).
    C,
}

impl SlotIndex {
    /// All slots in rotation order.
    pub const ALL: [SlotIndex; 3] = [SlotIndex::A, SlotIndex::B, SlotIndex::C];

    /// Array index of this slot.
    #[must_use]
    pub fn idx(self) -> usize {
        match self {
            SlotIndex::A => 0,
            SlotIndex::B => 1,
            SlotIndex::C => 2,
        }
    }

    /// The slot that completes after this one in an `n`-slot rotation.
    #[must_use]
    pub fn next(self, slot_count: usize) -> SlotIndex {
        Self::ALL[(self.idx() + 1) % slot_count]
    }
}

/// Interrupt-reported indicator of which slot just finished a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    /// No slot has completed.
    NotReady,
    /// Slot A finished capturing.
    AReady,
    /// Slot B finished capturing.
    BReady,
    /// Slot C finished capturing.
    CReady,
    /// Hardware claims several slots finished at once. Impossible in a
    /// healthy rotation; treated as a phase fault, never acted on.
    BothReady,
}

impl FramePhase {
    /// The completed slot, if the phase names exactly one.
    #[must_use]
    pub fn completed_slot(self) -> Option<SlotIndex> {
        match self {
            FramePhase::AReady => Some(SlotIndex::A),
            FramePhase::BReady => Some(SlotIndex::B),
            FramePhase::CReady => Some(SlotIndex::C),
            FramePhase::NotReady | FramePhase::BothReady => None,
        }
    }
}

/// Which register table a slot write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotTable {
    /// Slots feeding frames directly to the consumer.
    Direct,
    /// Slots feeding the downstream processor.
    Processor,
}

/// How frames leave this channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// Straight to the consumer.
    Direct,
    /// Routed into the downstream processor.
    ToProcessor,
    /// Routed into the downstream processor, with readback correlation:
    /// retired sequence numbers track the hardware frame counter so the
    /// readback stream stays aligned across a recovery.
    ToProcessorReadback,
}

impl RoutingMode {
    /// The slot table this mode's buffer addresses are written into.
    /// The assigner is otherwise identical across modes.
    #[must_use]
    pub fn target_table(self) -> SlotTable {
        match self {
            RoutingMode::Direct => SlotTable::Direct,
            RoutingMode::ToProcessor | RoutingMode::ToProcessorReadback => SlotTable::Processor,
        }
    }

    /// Whether retirement resynchronizes sequence numbers from the hardware
    /// frame counter.
    #[must_use]
    pub fn uses_readback(self) -> bool {
        matches!(self, RoutingMode::ToProcessorReadback)
    }
}

/// What a hardware slot currently points at.
#[derive(Debug)]
pub(crate) enum SlotBind {
    /// No binding yet (only legal while DMA is disabled).
    Empty,
    /// The process-wide dummy scratch buffer.
    Dummy,
    /// A real buffer, owned by this slot.
    Owned(CaptureBuffer),
    /// Shares the buffer owned by another slot (degenerate single-buffer
    /// rotation, e.g. interlaced capture or init from a one-buffer pool).
    Alias(SlotIndex),
}

impl SlotBind {
    pub(crate) fn is_real(&self) -> bool {
        matches!(self, SlotBind::Owned(_) | SlotBind::Alias(_))
    }
}

/// Buffer size and plane layout for a channel, supplied by the format
/// provider at stream-configuration time and constant for the session.
#[derive(Debug, Clone)]
pub struct Geometry {
    /// Total bytes per frame (sizes the dummy buffer).
    pub frame_bytes: usize,
    /// Per-plane byte offsets for multi-planar formats.
    pub plane_offsets: Vec<u32>,
}

impl Geometry {
    /// Single-plane geometry of `frame_bytes` bytes.
    #[must_use]
    pub fn packed(frame_bytes: usize) -> Self {
        Self {
            frame_bytes,
            plane_offsets: Vec::new(),
        }
    }
}

/// Static configuration of one channel, fixed at engine construction.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel identity; must match its index in the engine's channel list.
    pub id: ChannelId,
    /// Exposure tier this channel captures.
    pub tier: ExposureTier,
    /// Routing regime.
    pub routing: RoutingMode,
    /// HDR sibling set this channel belongs to, if any. Siblings are
    /// restarted as a unit during recovery.
    pub hdr_group: Option<u8>,
    /// Number of hardware slots (2, or 3 on triple-buffering revisions).
    pub slot_count: usize,
    /// Frame geometry from the format provider.
    pub geometry: Geometry,
}

impl ChannelConfig {
    /// Two-slot direct-routing single-exposure channel.
    #[must_use]
    pub fn direct(id: ChannelId, geometry: Geometry) -> Self {
        Self {
            id,
            tier: ExposureTier::Single,
            routing: RoutingMode::Direct,
            hdr_group: None,
            slot_count: 2,
            geometry,
        }
    }

    /// Two-slot channel capturing one tier of an HDR sibling set.
    #[must_use]
    pub fn hdr(id: ChannelId, geometry: Geometry, tier: ExposureTier, group: u8) -> Self {
        Self {
            id,
            tier,
            routing: RoutingMode::ToProcessor,
            hdr_group: Some(group),
            slot_count: 2,
            geometry,
        }
    }
}

/// Lock-free per-channel counters.
///
/// The watchdog samples these on its own timer without taking the channel
/// lock, so everything here is an atomic.
#[derive(Debug, Default)]
pub struct ChannelCounters {
    /// Frames completed by hardware (real or dummy).
    pub completions: AtomicU64,
    /// Frames handed to the delivery path.
    pub delivered: AtomicU64,
    /// Boundaries where the pool was empty and the dummy was bound.
    pub lack_events: AtomicU64,
    /// Early slot rebinds performed by rotation recovery.
    pub buffer_replaced: AtomicU64,
    /// Impossible phase signals reported by hardware.
    pub phase_faults: AtomicU64,
    /// Deliveries dropped because the notify FIFO was full.
    pub dropped_deliveries: AtomicU64,
    /// Watchdog resets that rebuilt this channel.
    pub resets: AtomicU64,
    /// Stops that timed out and forced DMA off.
    pub forced_stops: AtomicU64,
}

impl ChannelCounters {
    pub(crate) fn bump(field: &AtomicU64) {
        field.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            completions: self.completions.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            lack_events: self.lack_events.load(Ordering::Relaxed),
            buffer_replaced: self.buffer_replaced.load(Ordering::Relaxed),
            phase_faults: self.phase_faults.load(Ordering::Relaxed),
            dropped_deliveries: self.dropped_deliveries.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            forced_stops: self.forced_stops.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`ChannelCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    /// Frames completed by hardware (real or dummy).
    pub completions: u64,
    /// Frames handed to the delivery path.
    pub delivered: u64,
    /// Boundaries where the pool was empty and the dummy was bound.
    pub lack_events: u64,
    /// Early slot rebinds performed by rotation recovery.
    pub buffer_replaced: u64,
    /// Impossible phase signals reported by hardware.
    pub phase_faults: u64,
    /// Deliveries dropped because the notify FIFO was full.
    pub dropped_deliveries: u64,
    /// Watchdog resets that rebuilt this channel.
    pub resets: u64,
    /// Stops that timed out and forced DMA off.
    pub forced_stops: u64,
}

/// Mutable state of one capture channel.
///
/// Created at engine construction and never destroyed; between streaming
/// sessions only the DMA flag and the slot bindings reset.
pub struct Channel {
    pub(crate) cfg: ChannelConfig,
    pub(crate) slots: Vec<SlotBind>,
    /// Bitmask of slots that completed while sharing one buffer; a shared
    /// buffer retires only once every sharing slot has finished its phase.
    pub(crate) phase_done: u8,
    pub(crate) last_completed: Option<SlotIndex>,
    pub(crate) last_boundary_ns: u64,
    pub(crate) dma_enabled: bool,
    pub(crate) streaming: bool,
    pub(crate) stopping: bool,
    /// Saturates at 2; at 2 the channel auto-suspends DMA rather than
    /// recapture into memory the consumer still owns.
    pub(crate) lack_count: u8,
    pub(crate) next_sequence: u64,
    /// Dummy scratch address cached at stream start, so the boundary path
    /// never touches the engine's control state.
    pub(crate) dummy: Option<DmaAddr>,
    pub(crate) rotation: RotationTracker,
    pub(crate) pool: Arc<FrameQueue<CaptureBuffer>>,
    pub(crate) counters: Arc<ChannelCounters>,
}

/// Saturation point of the lack-of-buffer counter.
pub(crate) const LACK_SATURATE: u8 = 2;

impl Channel {
    pub(crate) fn new(cfg: ChannelConfig, pool: Arc<FrameQueue<CaptureBuffer>>) -> Self {
        debug_assert!(cfg.slot_count == 2 || cfg.slot_count == 3);
        let slot_count = cfg.slot_count;
        Self {
            cfg,
            slots: (0..slot_count).map(|_| SlotBind::Empty).collect(),
            phase_done: 0,
            last_completed: None,
            last_boundary_ns: 0,
            dma_enabled: false,
            streaming: false,
            stopping: false,
            lack_count: 0,
            next_sequence: 0,
            dummy: None,
            rotation: RotationTracker::new(),
            pool: Arc::clone(&pool),
            counters: Arc::new(ChannelCounters::default()),
        }
    }

    /// Channel identity.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.cfg.id
    }

    /// Static channel configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.cfg
    }

    /// Whether the channel is currently streaming.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Shared handle to this channel's counters.
    #[must_use]
    pub fn counters(&self) -> Arc<ChannelCounters> {
        Arc::clone(&self.counters)
    }

    /// The slot that owns the buffer `slot` is bound to, following at most
    /// one alias hop.
    pub(crate) fn owner_slot(&self, slot: SlotIndex) -> SlotIndex {
        match self.slots[slot.idx()] {
            SlotBind::Alias(owner) => owner,
            _ => slot,
        }
    }

    /// Slots currently aliasing `owner`.
    pub(crate) fn aliases_of(&self, owner: SlotIndex) -> Vec<SlotIndex> {
        SlotIndex::ALL[..self.cfg.slot_count]
            .iter()
            .copied()
            .filter(|s| matches!(self.slots[s.idx()], SlotBind::Alias(o) if o == owner))
            .collect()
    }

    /// Every slot in this channel's rotation.
    pub(crate) fn slot_range(&self) -> &'static [SlotIndex] {
        &SlotIndex::ALL[..self.cfg.slot_count]
    }

    /// Drop all bindings and per-session state, returning any real buffers
    /// so the caller can put them back in the pool. Used on stop and on
    /// watchdog recovery (buffers go back to the pool, never to delivery).
    pub(crate) fn reset_session(&mut self) -> Vec<CaptureBuffer> {
        let mut reclaimed = Vec::new();
        for bind in &mut self.slots {
            if let SlotBind::Owned(buf) = std::mem::replace(bind, SlotBind::Empty) {
                reclaimed.push(buf);
            }
        }
        self.phase_done = 0;
        self.last_completed = None;
        self.lack_count = 0;
        self.rotation.reset();
        reclaimed
    }
}
