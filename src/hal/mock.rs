//! Hardware-free collaborator implementations.
//!
//! These back every unit and integration test in the crate, and are useful
//! for bring-up on machines without a capture engine. The register map
//! records every slot write in order, so tests can assert the exact register
//! traffic a scheduling decision produced.

use super::{FrameSink, RegisterMap, ScratchAlloc, SensorTiming};
use crate::buffer::{DeliveredFrame, DmaAddr};
use crate::channel::{ChannelId, FramePhase, SlotIndex, SlotTable};
use crate::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One recorded slot register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWrite {
    /// Channel written.
    pub channel: ChannelId,
    /// Table targeted.
    pub table: SlotTable,
    /// Slot targeted.
    pub slot: SlotIndex,
    /// Address written.
    pub addr: DmaAddr,
}

/// Recording register map.
#[derive(Default)]
pub struct MockRegisterMap {
    writes: Mutex<Vec<SlotWrite>>,
    phases: Mutex<HashMap<ChannelId, FramePhase>>,
    dma: Mutex<HashMap<ChannelId, bool>>,
    resets: Mutex<Vec<ChannelId>>,
    frame_counters: Mutex<HashMap<ChannelId, u64>>,
    /// When set, every register access fails with this message.
    fail_with: Mutex<Option<String>>,
}

impl MockRegisterMap {
    /// Fresh mock with no recorded traffic.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All slot writes so far, in issue order.
    #[must_use]
    pub fn writes(&self) -> Vec<SlotWrite> {
        self.writes.lock().clone()
    }

    /// The most recent address written to `(channel, table, slot)`.
    #[must_use]
    pub fn last_write(
        &self,
        channel: ChannelId,
        table: SlotTable,
        slot: SlotIndex,
    ) -> Option<DmaAddr> {
        self.writes
            .lock()
            .iter()
            .rev()
            .find(|w| w.channel == channel && w.table == table && w.slot == slot)
            .map(|w| w.addr)
    }

    /// Forget recorded writes.
    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Program the phase the next `read_frame_phase` returns.
    pub fn set_phase(&self, channel: ChannelId, phase: FramePhase) {
        self.phases.lock().insert(channel, phase);
    }

    /// Current DMA-enable state of a channel.
    #[must_use]
    pub fn dma_enabled(&self, channel: ChannelId) -> bool {
        self.dma.lock().get(&channel).copied().unwrap_or(false)
    }

    /// Channels soft-reset so far, in order.
    #[must_use]
    pub fn resets(&self) -> Vec<ChannelId> {
        self.resets.lock().clone()
    }

    /// Program the hardware frame counter.
    pub fn set_frame_counter(&self, channel: ChannelId, count: u64) {
        self.frame_counters.lock().insert(channel, count);
    }

    /// Make every subsequent register access fail.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock() = Some(message.into());
    }

    /// Clear an injected failure.
    pub fn heal(&self) {
        *self.fail_with.lock() = None;
    }

    fn check_fault(&self) -> CaptureResult<()> {
        match self.fail_with.lock().as_ref() {
            Some(msg) => Err(CaptureError::Register(msg.clone())),
            None => Ok(()),
        }
    }
}

impl RegisterMap for MockRegisterMap {
    fn write_slot(
        &self,
        channel: ChannelId,
        table: SlotTable,
        slot: SlotIndex,
        addr: DmaAddr,
    ) -> CaptureResult<()> {
        self.check_fault()?;
        self.writes.lock().push(SlotWrite {
            channel,
            table,
            slot,
            addr,
        });
        Ok(())
    }

    fn read_frame_phase(&self, channel: ChannelId) -> CaptureResult<FramePhase> {
        self.check_fault()?;
        Ok(self
            .phases
            .lock()
            .get(&channel)
            .copied()
            .unwrap_or(FramePhase::NotReady))
    }

    fn set_dma(&self, channel: ChannelId, enabled: bool) -> CaptureResult<()> {
        self.check_fault()?;
        self.dma.lock().insert(channel, enabled);
        Ok(())
    }

    fn soft_reset(&self, channel: ChannelId) -> CaptureResult<()> {
        self.check_fault()?;
        self.resets.lock().push(channel);
        Ok(())
    }

    fn read_frame_counter(&self, channel: ChannelId) -> CaptureResult<u64> {
        self.check_fault()?;
        Ok(self
            .frame_counters
            .lock()
            .get(&channel)
            .copied()
            .unwrap_or(0))
    }
}

/// Programmable sensor timing.
pub struct MockTiming {
    frame_interval: Mutex<Option<Duration>>,
    line_time: Mutex<Duration>,
    vblank_lines: Mutex<u32>,
    protocol_faults: AtomicU64,
}

impl Default for MockTiming {
    fn default() -> Self {
        // 30 fps, 10 µs lines, 200-line vblank: a 2 ms early-update window.
        Self {
            frame_interval: Mutex::new(Some(Duration::from_millis(33))),
            line_time: Mutex::new(Duration::from_micros(10)),
            vblank_lines: Mutex::new(200),
            protocol_faults: AtomicU64::new(0),
        }
    }
}

impl MockTiming {
    /// Default 30 fps timing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the measured frame interval (`None` = not yet measured).
    pub fn set_frame_interval(&self, interval: Option<Duration>) {
        *self.frame_interval.lock() = interval;
    }

    /// Override line time and vertical blanking.
    pub fn set_blanking(&self, line_time: Duration, vblank_lines: u32) {
        *self.line_time.lock() = line_time;
        *self.vblank_lines.lock() = vblank_lines;
    }

    /// Inject asynchronous protocol faults, as the link layer would.
    pub fn inject_protocol_faults(&self, count: u64) {
        self.protocol_faults.fetch_add(count, Ordering::Relaxed);
    }
}

impl SensorTiming for MockTiming {
    fn frame_interval(&self) -> Option<Duration> {
        *self.frame_interval.lock()
    }

    fn line_time(&self) -> Duration {
        *self.line_time.lock()
    }

    fn vertical_blank_lines(&self) -> u32 {
        *self.vblank_lines.lock()
    }

    fn take_protocol_faults(&self) -> u64 {
        self.protocol_faults.swap(0, Ordering::Relaxed)
    }
}

/// Bump allocator handing out fake DMA addresses.
pub struct MockScratch {
    next: AtomicU64,
    live: Mutex<Vec<DmaAddr>>,
}

impl Default for MockScratch {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(0xd000_0000),
            live: Mutex::new(Vec::new()),
        }
    }
}

impl MockScratch {
    /// Fresh allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regions currently allocated.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

impl ScratchAlloc for MockScratch {
    fn alloc(&self, bytes: usize) -> CaptureResult<DmaAddr> {
        let addr = DmaAddr(
            self.next
                .fetch_add(bytes.next_power_of_two() as u64, Ordering::Relaxed),
        );
        self.live.lock().push(addr);
        Ok(addr)
    }

    fn free(&self, addr: DmaAddr) {
        self.live.lock().retain(|a| *a != addr);
    }
}

/// Sink that records every delivered frame.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(ChannelId, DeliveredFrame)>>,
}

impl RecordingSink {
    /// Fresh sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far, in order.
    #[must_use]
    pub fn delivered(&self) -> Vec<(ChannelId, DeliveredFrame)> {
        self.delivered.lock().clone()
    }

    /// Count of delivered frames.
    #[must_use]
    pub fn count(&self) -> usize {
        self.delivered.lock().len()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn deliver(&self, channel: ChannelId, frame: DeliveredFrame) {
        self.delivered.lock().push((channel, frame));
    }
}
