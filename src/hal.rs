//! Collaborator interfaces.
//!
//! The scheduler decides *which* buffer a register points at and *when*;
//! everything that knows how to actually touch hardware lives behind these
//! traits. Implementations must be cheap and non-blocking — `write_slot` in
//! particular is called from the frame-boundary interrupt path.

use crate::buffer::{DeliveredFrame, DmaAddr};
use crate::channel::{ChannelId, FramePhase, SlotIndex, SlotTable};
use crate::error::CaptureResult;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "mock")]
pub mod mock;

/// Pure register I/O for the capture engine. No scheduling logic.
pub trait RegisterMap: Send + Sync {
    /// Point a frame slot at a DMA target address.
    fn write_slot(
        &self,
        channel: ChannelId,
        table: SlotTable,
        slot: SlotIndex,
        addr: DmaAddr,
    ) -> CaptureResult<()>;

    /// Which slot the hardware reports as just-completed.
    fn read_frame_phase(&self, channel: ChannelId) -> CaptureResult<FramePhase>;

    /// Enable or disable the channel's DMA engine.
    fn set_dma(&self, channel: ChannelId, enabled: bool) -> CaptureResult<()>;

    /// Soft-reset the channel's capture path.
    fn soft_reset(&self, channel: ChannelId) -> CaptureResult<()>;

    /// The hardware's own frame-start counter, used to resynchronize
    /// software sequence numbers across a recovery.
    fn read_frame_counter(&self, channel: ChannelId) -> CaptureResult<u64>;
}

/// Timing and link-health values measured by the physical layer.
///
/// The scheduler only reads these; it never configures the physical layer.
pub trait SensorTiming: Send + Sync {
    /// Measured frame interval, or `None` before the first measurement.
    fn frame_interval(&self) -> Option<Duration>;

    /// Measured readout time of one sensor line.
    fn line_time(&self) -> Duration;

    /// Vertical blanking, in lines.
    fn vertical_blank_lines(&self) -> u32;

    /// Drain the count of asynchronous protocol errors reported by the link
    /// since the last call.
    fn take_protocol_faults(&self) -> u64;
}

/// Allocator for the process-wide dummy scratch buffer.
pub trait ScratchAlloc: Send + Sync {
    /// Allocate a DMA-reachable scratch region of at least `bytes` bytes.
    fn alloc(&self, bytes: usize) -> CaptureResult<DmaAddr>;

    /// Release a region previously returned by [`ScratchAlloc::alloc`].
    fn free(&self, addr: DmaAddr);
}

/// Consumer-side delivery callback, invoked from the deferred context.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Hand a completed frame to the consumer. Per-channel FIFO order is
    /// guaranteed by the delivery worker.
    async fn deliver(&self, channel: ChannelId, frame: DeliveredFrame);
}
