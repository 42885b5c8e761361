//! The capture engine: ties slot assignment, rotation tracking, HDR
//! correlation, delivery, and the watchdog together behind one object.
//!
//! Locking is layered and strictly ordered: the control lock (start, stop,
//! recovery) is taken before any channel lock, and a channel lock before its
//! group's correlator lock. The frame-boundary path takes only its own
//! channel lock, so interrupt handling for one channel never waits on
//! another channel's consumer.
//!
//! Time is passed in, never read: every boundary carries a caller-supplied
//! monotonic nanosecond timestamp, which keeps the whole scheduling core
//! deterministic under test.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::assign;
use crate::buffer::{CaptureBuffer, DeliveredFrame, ExposureTier};
use crate::channel::{
    Channel, ChannelConfig, ChannelCounters, ChannelId, ChannelStats, FramePhase, LACK_SATURATE,
};
use crate::config::SchedConfig;
use crate::error::{CaptureError, CaptureResult};
use crate::hal::{FrameSink, RegisterMap, ScratchAlloc, SensorTiming};
use crate::hdr::{HdrCorrelator, HdrOutcome};
use crate::notify::{self, DeliveryWorker, Notifier};
use crate::rotation;
use crate::watchdog::{TickVerdict, Watchdog};
use capture_pool::FrameQueue;

/// Engine-wide counter snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Per-channel counters, indexed by channel id.
    pub channels: Vec<ChannelStats>,
    /// HDR groups where one tier completed twice before its siblings.
    pub hdr_duplicate_tier: u64,
    /// HDR groups discarded for incoherent timestamps.
    pub hdr_timestamp_mismatch: u64,
}

/// State guarded by the control lock.
struct ControlState {
    /// Shared dummy scratch buffer, alive while any channel streams.
    dummy: Option<DummyBuffer>,
    streaming_count: usize,
}

struct DummyBuffer {
    addr: crate::buffer::DmaAddr,
    bytes: usize,
}

/// Frame-capture buffer scheduler for one capture device.
pub struct CaptureEngine {
    cfg: SchedConfig,
    regs: Arc<dyn RegisterMap>,
    timing: Arc<dyn SensorTiming>,
    scratch: Arc<dyn ScratchAlloc>,
    channel_cfgs: Vec<ChannelConfig>,
    channels: Vec<Mutex<Channel>>,
    pools: Vec<Arc<FrameQueue<CaptureBuffer>>>,
    counters: Vec<Arc<ChannelCounters>>,
    notifiers: Vec<Notifier>,
    /// HDR sibling sets: group id to member channel indices.
    groups: BTreeMap<u8, Vec<usize>>,
    correlators: BTreeMap<u8, Mutex<HdrCorrelator>>,
    watchdog: Mutex<Watchdog>,
    control: Mutex<ControlState>,
    stop_cv: Condvar,
}

impl CaptureEngine {
    /// Build an engine over the given channels and hardware collaborators.
    ///
    /// Returns the engine plus one [`DeliveryWorker`] per channel; spawn
    /// them with [`CaptureEngine::spawn_delivery`] for frames to flow.
    pub fn new(
        cfg: SchedConfig,
        channel_cfgs: Vec<ChannelConfig>,
        regs: Arc<dyn RegisterMap>,
        timing: Arc<dyn SensorTiming>,
        scratch: Arc<dyn ScratchAlloc>,
    ) -> CaptureResult<(Self, Vec<DeliveryWorker>)> {
        cfg.validate()?;
        if channel_cfgs.is_empty() {
            return Err(CaptureError::Configuration(
                "at least one channel is required".into(),
            ));
        }
        for (idx, ch) in channel_cfgs.iter().enumerate() {
            if usize::from(ch.id.0) != idx {
                return Err(CaptureError::Configuration(format!(
                    "channel id {} does not match its index {idx}",
                    ch.id
                )));
            }
            if !(2..=3).contains(&ch.slot_count) {
                return Err(CaptureError::Configuration(format!(
                    "channel {}: slot_count must be 2 or 3",
                    ch.id
                )));
            }
            if ch.geometry.frame_bytes == 0 {
                return Err(CaptureError::Configuration(format!(
                    "channel {}: frame_bytes must be non-zero",
                    ch.id
                )));
            }
            if ch.hdr_group.is_some() && ch.tier.hdr_index().is_none() {
                return Err(CaptureError::Configuration(format!(
                    "channel {}: HDR group members need an HDR exposure tier",
                    ch.id
                )));
            }
        }

        // Every HDR group must capture exactly the tier set its size
        // implies, one channel per tier, or nothing it produces would ever
        // correlate.
        let mut group_tiers: BTreeMap<u8, Vec<ExposureTier>> = BTreeMap::new();
        for ch in &channel_cfgs {
            if let Some(group) = ch.hdr_group {
                group_tiers.entry(group).or_default().push(ch.tier);
            }
        }
        for (group, tiers) in &group_tiers {
            let required = HdrCorrelator::required_tiers(tiers.len());
            let valid = tiers.len() == required.len()
                && required
                    .iter()
                    .all(|t| tiers.iter().filter(|have| *have == t).count() == 1);
            if !valid {
                return Err(CaptureError::Configuration(format!(
                    "HDR group {group}: member tiers {tiers:?} must be exactly {required:?}"
                )));
            }
        }

        let mut channels = Vec::with_capacity(channel_cfgs.len());
        let mut pools = Vec::with_capacity(channel_cfgs.len());
        let mut counters = Vec::with_capacity(channel_cfgs.len());
        let mut notifiers = Vec::with_capacity(channel_cfgs.len());
        let mut workers = Vec::with_capacity(channel_cfgs.len());
        let mut groups: BTreeMap<u8, Vec<usize>> = BTreeMap::new();

        for (idx, ch_cfg) in channel_cfgs.iter().enumerate() {
            let pool = Arc::new(FrameQueue::new("capture"));
            let channel = Channel::new(ch_cfg.clone(), Arc::clone(&pool));
            let channel_counters = channel.counters();
            let (notifier, worker) = notify::delivery_pair(
                ch_cfg.id,
                cfg.notify_queue_depth,
                Arc::clone(&pool),
                Arc::clone(&channel_counters),
            );
            if let Some(group) = ch_cfg.hdr_group {
                groups.entry(group).or_default().push(idx);
            }
            channels.push(Mutex::new(channel));
            pools.push(pool);
            counters.push(channel_counters);
            notifiers.push(notifier);
            workers.push(worker);
        }

        let correlators = groups
            .iter()
            .map(|(&group, members)| (group, Mutex::new(HdrCorrelator::new(members.len()))))
            .collect();
        let watchdog = Mutex::new(Watchdog::new(cfg.monitor_cycles, cfg.protocol_fault_pairs));

        Ok((
            Self {
                cfg,
                regs,
                timing,
                scratch,
                channel_cfgs,
                channels,
                pools,
                counters,
                notifiers,
                groups,
                correlators,
                watchdog,
                control: Mutex::new(ControlState {
                    dummy: None,
                    streaming_count: 0,
                }),
                stop_cv: Condvar::new(),
            },
            workers,
        ))
    }

    /// Spawn the delivery workers onto the current tokio runtime.
    pub fn spawn_delivery(
        workers: Vec<DeliveryWorker>,
        sink: Arc<dyn FrameSink>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run(Arc::clone(&sink))))
            .collect()
    }

    /// Give a buffer (back) to a channel's pool.
    ///
    /// Re-enables DMA on a channel that auto-suspended for lack of buffers.
    pub fn enqueue(&self, id: ChannelId, buffer: CaptureBuffer) -> CaptureResult<()> {
        let idx = self.index(id)?;
        let mut channel = self.channels[idx].lock();
        self.pools[idx].push(buffer);
        if channel.streaming && !channel.dma_enabled && !channel.stopping {
            debug!(channel = %id, "buffer arrived, resuming suspended DMA");
            self.regs.set_dma(id, true)?;
            channel.dma_enabled = true;
        }
        Ok(())
    }

    /// Start streaming on one channel.
    ///
    /// Initial slot bindings come from the pool; an empty pool starts on the
    /// dummy buffer and real buffers are promoted as they are enqueued.
    pub fn start(&self, id: ChannelId) -> CaptureResult<()> {
        let idx = self.index(id)?;
        let mut control = self.control.lock();
        let mut channel = self.channels[idx].lock();
        if channel.streaming {
            return Err(CaptureError::AlreadyStreaming(id));
        }

        if control.dummy.is_none() {
            let bytes = self
                .channel_cfgs
                .iter()
                .map(|c| c.geometry.frame_bytes)
                .max()
                .unwrap_or(0);
            let addr = self
                .scratch
                .alloc(bytes)
                .map_err(|_| CaptureError::ScratchExhausted { channel: id, bytes })?;
            debug!(%addr, bytes, "dummy scratch buffer allocated");
            control.dummy = Some(DummyBuffer { addr, bytes });
        }
        channel.dummy = control.dummy.as_ref().map(|d| d.addr);

        let dummy = channel.dummy;
        assign::init(&mut channel, dummy, self.regs.as_ref())?;
        channel.next_sequence = 0;
        channel.stopping = false;
        self.regs.set_dma(id, true)?;
        channel.dma_enabled = true;
        channel.streaming = true;

        control.streaming_count += 1;
        if control.streaming_count == 1 {
            self.watchdog.lock().arm();
        }
        info!(channel = %id, "streaming started");
        Ok(())
    }

    /// Stop streaming on one channel.
    ///
    /// Hands the stop to the frame-boundary handler first so DMA goes down
    /// on a frame edge; if no boundary arrives within the configured stop
    /// timeout the stop is forced and counted. All slot buffers return to
    /// the pool, and a partially assembled HDR group involving this channel
    /// is flushed back to the pools as well.
    pub fn stop(&self, id: ChannelId) -> CaptureResult<()> {
        let idx = self.index(id)?;
        let mut control = self.control.lock();
        let mut channel = self.channels[idx].lock();
        if !channel.streaming {
            return Err(CaptureError::NotStreaming(id));
        }

        channel.stopping = true;
        let deadline = Instant::now() + self.cfg.stop_timeout;
        while channel.streaming {
            let now = Instant::now();
            if now >= deadline
                || self
                    .stop_cv
                    .wait_for(&mut channel, deadline - now)
                    .timed_out()
            {
                break;
            }
        }
        if channel.streaming {
            warn!(channel = %id, "no frame boundary within stop timeout, forcing DMA off");
            self.regs.set_dma(id, false)?;
            channel.dma_enabled = false;
            channel.streaming = false;
            channel.stopping = false;
            ChannelCounters::bump(&channel.counters.forced_stops);
        }

        let reclaimed = channel.reset_session();
        for buf in reclaimed {
            self.pools[idx].push(buf);
        }
        channel.dummy = None;
        drop(channel);

        if let Some(group) = self.channel_cfgs[idx].hdr_group {
            self.flush_group(group);
        }

        control.streaming_count = control.streaming_count.saturating_sub(1);
        if control.streaming_count == 0 {
            if let Some(dummy) = control.dummy.take() {
                self.scratch.free(dummy.addr);
                debug!("dummy scratch buffer freed");
            }
            self.watchdog.lock().disarm();
        }
        info!(channel = %id, "streaming stopped");
        Ok(())
    }

    /// Handle a frame-boundary interrupt by reading the phase register.
    pub fn handle_interrupt(&self, id: ChannelId, now_ns: u64) -> CaptureResult<()> {
        let phase = self.regs.read_frame_phase(id)?;
        self.on_frame_boundary(id, phase, now_ns)
    }

    /// Handle one frame boundary on a channel.
    ///
    /// `now_ns` is the caller's monotonic timestamp of the interrupt. This
    /// is the hot path: it retires and rebinds slots, feeds the rotation
    /// tracker, correlates HDR tiers, and queues delivery, all without
    /// blocking.
    pub fn on_frame_boundary(
        &self,
        id: ChannelId,
        phase: FramePhase,
        now_ns: u64,
    ) -> CaptureResult<()> {
        let idx = self.index(id)?;
        let mut channel = self.channels[idx].lock();
        if !channel.streaming {
            return Ok(());
        }
        if channel.stopping {
            // Stop on the frame edge, as requested by `stop`.
            self.regs.set_dma(id, false)?;
            channel.dma_enabled = false;
            channel.streaming = false;
            channel.stopping = false;
            self.stop_cv.notify_all();
            return Ok(());
        }

        let Some(completed) = phase.completed_slot() else {
            if phase == FramePhase::BothReady {
                warn!(channel = %id, "hardware reported multiple slots complete");
                ChannelCounters::bump(&channel.counters.phase_faults);
            }
            return Ok(());
        };
        if completed.idx() >= channel.cfg.slot_count {
            // Hardware named a slot this channel does not have.
            warn!(channel = %id, slot = ?completed, "completion on a slot outside the rotation");
            ChannelCounters::bump(&channel.counters.phase_faults);
            return Ok(());
        }

        let dummy = channel.dummy;
        let mut outcome =
            assign::update(&mut channel, completed, now_ns, dummy, self.regs.as_ref())?;

        let state = rotation::classify(&channel);
        if channel.rotation.observe(state)
            && rotation::within_early_window(
                now_ns,
                channel.last_boundary_ns,
                self.timing.as_ref(),
                self.cfg.early_update_margin,
            )
        {
            let target = completed.next(channel.cfg.slot_count);
            if let Err(err) = assign::early_update(&mut channel, target, self.regs.as_ref()) {
                // The retired frame is still undelivered; recycle it rather
                // than drop it with the error.
                if let Some(retired) = outcome.retired.take() {
                    self.pools[idx].push(retired);
                }
                return Err(err);
            }
        }

        if let Some(retired) = outcome.retired {
            match self.channel_cfgs[idx].hdr_group {
                Some(group) => self.correlate(group, retired),
                None => self.notifiers[idx].offer(DeliveredFrame::correlated(retired)),
            }
        }
        Ok(())
    }

    /// Periodic watchdog tick. Call at a fixed cadence while streaming.
    ///
    /// A latched trigger runs recovery synchronously; the error, if any,
    /// reports every channel that failed to restart.
    pub fn on_tick(&self) -> CaptureResult<()> {
        let mut completions = Vec::new();
        for (idx, channel) in self.channels.iter().enumerate() {
            let channel = channel.lock();
            if !channel.streaming {
                continue;
            }
            if !channel.dma_enabled && channel.lack_count >= LACK_SATURATE {
                // Auto-suspended for lack of buffers: silence here is the
                // consumer's doing, not a pipeline stall.
                continue;
            }
            completions.push((
                self.channel_cfgs[idx].id,
                self.counters[idx]
                    .completions
                    .load(std::sync::atomic::Ordering::Relaxed),
            ));
        }
        let faults = self.timing.take_protocol_faults();

        let verdict = self.watchdog.lock().tick(&completions, faults);
        if let TickVerdict::Trigger(reason) = verdict {
            warn!(?reason, "watchdog triggered, starting recovery");
            self.watchdog.lock().begin_reset();
            let result = self.recover();
            self.watchdog.lock().rearm();
            return result;
        }
        Ok(())
    }

    /// Whether a channel is currently streaming.
    pub fn is_streaming(&self, id: ChannelId) -> CaptureResult<bool> {
        Ok(self.channels[self.index(id)?].lock().streaming)
    }

    /// Point-in-time engine counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let mut duplicate = 0;
        let mut mismatch = 0;
        for correlator in self.correlators.values() {
            let faults = correlator.lock().faults();
            duplicate += faults.duplicate_tier;
            mismatch += faults.timestamp_mismatch;
        }
        EngineStats {
            channels: self.counters.iter().map(|c| c.snapshot()).collect(),
            hdr_duplicate_tier: duplicate,
            hdr_timestamp_mismatch: mismatch,
        }
    }

    fn index(&self, id: ChannelId) -> CaptureResult<usize> {
        let idx = usize::from(id.0);
        if idx < self.channels.len() {
            Ok(idx)
        } else {
            Err(CaptureError::UnknownChannel(id))
        }
    }

    /// Offer a retired buffer to its group's correlator and route whatever
    /// comes out. Group emission happens under the correlator lock, so the
    /// members of one group reach their FIFOs together.
    fn correlate(&self, group: u8, retired: CaptureBuffer) {
        let Some(correlator) = self.correlators.get(&group) else {
            // Config validation makes this unreachable in practice.
            warn!(group, "retired buffer for unknown HDR group");
            return;
        };
        let period_ns = self.frame_period_ns();
        match correlator.lock().offer(retired, period_ns) {
            HdrOutcome::Pending => {}
            HdrOutcome::Flushed(frame) => self.route_frame(group, frame),
            HdrOutcome::Group(frames) => {
                for frame in frames {
                    self.route_frame(group, frame);
                }
            }
            HdrOutcome::Discarded(buffers) => {
                for buf in buffers {
                    self.recycle_to_group(group, buf);
                }
            }
        }
    }

    /// Deliver a correlator output on the channel capturing its tier.
    fn route_frame(&self, group: u8, frame: DeliveredFrame) {
        match self.group_member(group, frame.buffer.tier) {
            Some(idx) => self.notifiers[idx].offer(frame),
            None => {
                warn!(group, tier = ?frame.buffer.tier, "no channel for tier, recycling");
                self.recycle_to_group(group, frame.buffer);
            }
        }
    }

    /// Return a buffer to the pool of the group channel capturing its tier.
    fn recycle_to_group(&self, group: u8, buf: CaptureBuffer) {
        let idx = self
            .group_member(group, buf.tier)
            .or_else(|| self.groups.get(&group).and_then(|m| m.first().copied()));
        if let Some(idx) = idx {
            self.pools[idx].push(buf);
        }
    }

    fn group_member(&self, group: u8, tier: ExposureTier) -> Option<usize> {
        self.groups
            .get(&group)?
            .iter()
            .copied()
            .find(|&idx| self.channel_cfgs[idx].tier == tier)
    }

    /// Drop a group's partially assembled frames back to the pools.
    fn flush_group(&self, group: u8) {
        if let Some(correlator) = self.correlators.get(&group) {
            for buf in correlator.lock().flush() {
                self.recycle_to_group(group, buf);
            }
        }
    }

    fn frame_period_ns(&self) -> u64 {
        self.timing
            .frame_interval()
            .unwrap_or(self.cfg.fallback_frame_interval)
            .as_nanos() as u64
    }

    /// Restart every streaming channel after a watchdog trigger.
    ///
    /// Buffers captured before the wedge are suspect, so everything in the
    /// slots and the correlators goes back to the pools, never to delivery.
    /// HDR sibling sets restart as a unit: if any member fails, the whole
    /// set is stopped rather than left streaming half-correlated.
    fn recover(&self) -> CaptureResult<()> {
        let control = self.control.lock();

        for &group in self.groups.keys() {
            self.flush_group(group);
        }

        let mut errors = Vec::new();
        let mut failed_groups = Vec::new();
        for idx in 0..self.channels.len() {
            if let Err(err) = self.restart_channel(idx) {
                warn!(channel = %self.channel_cfgs[idx].id, %err, "channel restart failed");
                if let Some(group) = self.channel_cfgs[idx].hdr_group {
                    failed_groups.push(group);
                }
                errors.push(err);
            }
        }

        // Sibling atomicity: a group with any failed member stops whole.
        for group in failed_groups {
            if let Some(members) = self.groups.get(&group) {
                for &idx in members {
                    let mut channel = self.channels[idx].lock();
                    if channel.streaming {
                        let id = channel.cfg.id;
                        if self.regs.set_dma(id, false).is_ok() {
                            channel.dma_enabled = false;
                        }
                        channel.streaming = false;
                        channel.stopping = false;
                        warn!(channel = %id, group, "stopped with failed HDR sibling");
                    }
                }
            }
        }

        drop(control);
        if errors.is_empty() {
            info!("watchdog recovery complete");
            Ok(())
        } else {
            Err(CaptureError::RecoveryFailed(errors))
        }
    }

    fn restart_channel(&self, idx: usize) -> CaptureResult<()> {
        let mut channel = self.channels[idx].lock();
        if !channel.streaming {
            return Ok(());
        }
        let id = channel.cfg.id;

        self.regs.set_dma(id, false)?;
        channel.dma_enabled = false;
        let reclaimed = channel.reset_session();
        for buf in reclaimed {
            self.pools[idx].push(buf);
        }

        self.regs.soft_reset(id)?;
        let dummy = channel.dummy;
        assign::init(&mut channel, dummy, self.regs.as_ref())?;
        self.resync_sequence(&mut channel)?;
        self.regs.set_dma(id, true)?;
        channel.dma_enabled = true;
        ChannelCounters::bump(&channel.counters.resets);
        info!(channel = %id, "channel restarted after watchdog trigger");
        Ok(())
    }

    /// Resynchronize software sequencing to the hardware's frame counter so
    /// post-recovery frames slot into the consumer's numbering.
    fn resync_sequence(&self, channel: &mut Channel) -> CaptureResult<()> {
        channel.next_sequence = self.regs.read_frame_counter(channel.cfg.id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DmaAddr;
    use crate::channel::Geometry;
    use crate::hal::mock::{MockRegisterMap, MockScratch, MockTiming, RecordingSink};
    use std::time::Duration;

    struct Fixture {
        engine: Arc<CaptureEngine>,
        workers: Vec<DeliveryWorker>,
        regs: Arc<MockRegisterMap>,
        timing: Arc<MockTiming>,
        scratch: Arc<MockScratch>,
    }

    fn fixture(channel_cfgs: Vec<ChannelConfig>) -> Fixture {
        let regs = Arc::new(MockRegisterMap::new());
        let timing = Arc::new(MockTiming::new());
        let scratch = Arc::new(MockScratch::new());
        let cfg = SchedConfig {
            stop_timeout: Duration::from_millis(50),
            ..SchedConfig::default()
        };
        let (engine, workers) = CaptureEngine::new(
            cfg,
            channel_cfgs,
            Arc::clone(&regs) as Arc<dyn RegisterMap>,
            Arc::clone(&timing) as Arc<dyn SensorTiming>,
            Arc::clone(&scratch) as Arc<dyn ScratchAlloc>,
        )
        .unwrap();
        Fixture {
            engine: Arc::new(engine),
            workers,
            regs,
            timing,
            scratch,
        }
    }

    fn direct_fixture() -> Fixture {
        fixture(vec![ChannelConfig::direct(
            ChannelId(0),
            Geometry::packed(4096),
        )])
    }

    fn buf(id: u32) -> CaptureBuffer {
        CaptureBuffer::new(id, DmaAddr(0x1_0000 + u64::from(id) * 0x1000))
    }

    #[test]
    fn test_start_and_double_start() {
        let fx = direct_fixture();
        let ch = ChannelId(0);
        fx.engine.enqueue(ch, buf(0)).unwrap();
        fx.engine.enqueue(ch, buf(1)).unwrap();

        fx.engine.start(ch).unwrap();
        assert!(fx.engine.is_streaming(ch).unwrap());
        assert!(fx.regs.dma_enabled(ch));
        assert!(matches!(
            fx.engine.start(ch),
            Err(CaptureError::AlreadyStreaming(_))
        ));
        assert!(matches!(
            fx.engine.start(ChannelId(9)),
            Err(CaptureError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_zero_buffer_start_binds_dummy() {
        let fx = direct_fixture();
        let ch = ChannelId(0);

        fx.engine.start(ch).unwrap();
        // One scratch allocation backs both slots.
        assert_eq!(fx.scratch.live_count(), 1);
        let writes = fx.regs.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].addr, writes[1].addr);
        // Starting empty is not a starvation event.
        assert_eq!(fx.engine.stats().channels[0].lack_events, 0);
    }

    #[tokio::test]
    async fn test_boundaries_deliver_in_sequence() {
        let fx = direct_fixture();
        let ch = ChannelId(0);
        let sink = Arc::new(RecordingSink::new());
        let _handles =
            CaptureEngine::spawn_delivery(fx.workers, Arc::clone(&sink) as Arc<dyn FrameSink>);

        for i in 0..4 {
            fx.engine.enqueue(ch, buf(i)).unwrap();
        }
        fx.engine.start(ch).unwrap();

        let mut now = 1_000_000;
        for phase in [FramePhase::AReady, FramePhase::BReady, FramePhase::AReady] {
            fx.engine.on_frame_boundary(ch, phase, now).unwrap();
            now += 33_000_000;
        }
        // Let the worker drain.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 3);
        let sequences: Vec<u64> = delivered.iter().map(|(_, f)| f.buffer.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(delivered.iter().all(|(_, f)| f.correlated));
    }

    #[test]
    fn test_cooperative_stop_on_boundary() {
        let fx = direct_fixture();
        let ch = ChannelId(0);
        fx.engine.enqueue(ch, buf(0)).unwrap();
        fx.engine.enqueue(ch, buf(1)).unwrap();
        fx.engine.start(ch).unwrap();

        let engine = Arc::clone(&fx.engine);
        std::thread::scope(|scope| {
            let stopper = scope.spawn(move || engine.stop(ch));
            // Drive boundaries until the handler observes the stop flag.
            let deadline = Instant::now() + Duration::from_secs(1);
            while fx.engine.is_streaming(ch).unwrap() && Instant::now() < deadline {
                fx.engine
                    .on_frame_boundary(ch, FramePhase::AReady, 1_000)
                    .unwrap();
                std::thread::sleep(Duration::from_micros(200));
            }
            stopper.join().unwrap().unwrap();
        });

        assert!(!fx.engine.is_streaming(ch).unwrap());
        assert!(!fx.regs.dma_enabled(ch));
        // The boundary handler observed the stop flag; nothing was forced.
        assert_eq!(fx.engine.stats().channels[0].forced_stops, 0);
        // Dummy freed once the last channel stopped.
        assert_eq!(fx.scratch.live_count(), 0);
    }

    #[test]
    fn test_stop_without_boundary_is_forced() {
        let fx = direct_fixture();
        let ch = ChannelId(0);
        fx.engine.enqueue(ch, buf(0)).unwrap();
        fx.engine.enqueue(ch, buf(1)).unwrap();
        fx.engine.start(ch).unwrap();

        fx.engine.stop(ch).unwrap();
        assert!(!fx.engine.is_streaming(ch).unwrap());
        assert!(!fx.regs.dma_enabled(ch));
        assert_eq!(fx.engine.stats().channels[0].forced_stops, 1);
        assert!(matches!(
            fx.engine.stop(ch),
            Err(CaptureError::NotStreaming(_))
        ));
    }

    #[test]
    fn test_starvation_suspends_and_enqueue_resumes() {
        let fx = direct_fixture();
        let ch = ChannelId(0);
        fx.engine.enqueue(ch, buf(0)).unwrap();
        fx.engine.enqueue(ch, buf(1)).unwrap();
        fx.engine.start(ch).unwrap();

        // Consumer never returns buffers: two boundaries exhaust the pool
        // and saturate the lack counter.
        fx.engine
            .on_frame_boundary(ch, FramePhase::AReady, 1_000)
            .unwrap();
        fx.engine
            .on_frame_boundary(ch, FramePhase::BReady, 2_000)
            .unwrap();
        assert!(!fx.regs.dma_enabled(ch));
        assert!(fx.engine.is_streaming(ch).unwrap());
        assert_eq!(fx.engine.stats().channels[0].lack_events, 2);

        // One buffer back resumes DMA.
        fx.engine.enqueue(ch, buf(2)).unwrap();
        assert!(fx.regs.dma_enabled(ch));
    }

    #[test]
    fn test_phase_for_absent_slot_is_counted_fault() {
        let fx = direct_fixture();
        let ch = ChannelId(0);
        fx.engine.enqueue(ch, buf(0)).unwrap();
        fx.engine.enqueue(ch, buf(1)).unwrap();
        fx.engine.start(ch).unwrap();

        // Two-slot channel, hardware claims slot C finished.
        fx.engine
            .on_frame_boundary(ch, FramePhase::CReady, 1_000)
            .unwrap();
        let stats = fx.engine.stats();
        assert_eq!(stats.channels[0].phase_faults, 1);
        assert_eq!(stats.channels[0].completions, 0);
        assert!(fx.engine.is_streaming(ch).unwrap());

        // The rotation is untouched and keeps going.
        fx.engine
            .on_frame_boundary(ch, FramePhase::AReady, 2_000)
            .unwrap();
        assert_eq!(fx.engine.stats().channels[0].delivered, 1);
    }

    #[test]
    fn test_register_fault_on_boundary_keeps_buffers() {
        let fx = direct_fixture();
        let ch = ChannelId(0);
        for i in 0..3 {
            fx.engine.enqueue(ch, buf(i)).unwrap();
        }
        fx.engine.start(ch).unwrap();

        fx.regs.fail_with("bus timeout");
        let err = fx
            .engine
            .on_frame_boundary(ch, FramePhase::AReady, 1_000)
            .unwrap_err();
        assert!(matches!(err, CaptureError::Register(_)));
        fx.regs.heal();

        // All three buffers survived the fault: after a restart the session
        // retires three real frames before falling back to the dummy.
        fx.engine.stop(ch).unwrap();
        fx.engine.start(ch).unwrap();
        for (i, phase) in [FramePhase::AReady, FramePhase::BReady, FramePhase::AReady]
            .into_iter()
            .enumerate()
        {
            fx.engine
                .on_frame_boundary(ch, phase, 2_000 + i as u64)
                .unwrap();
        }
        assert_eq!(fx.engine.stats().channels[0].delivered, 3);
    }

    #[test]
    fn test_watchdog_ignores_lack_suspended_channel() {
        let fx = direct_fixture();
        let ch = ChannelId(0);
        fx.engine.enqueue(ch, buf(0)).unwrap();
        fx.engine.enqueue(ch, buf(1)).unwrap();
        fx.engine.start(ch).unwrap();

        // Starve the rotation until it auto-suspends DMA.
        fx.engine
            .on_frame_boundary(ch, FramePhase::AReady, 1_000)
            .unwrap();
        fx.engine
            .on_frame_boundary(ch, FramePhase::BReady, 2_000)
            .unwrap();
        assert!(!fx.regs.dma_enabled(ch));

        // Silence from a suspended channel is expected; no reset episode.
        for _ in 0..5 {
            fx.engine.on_tick().unwrap();
        }
        assert_eq!(fx.engine.stats().channels[0].resets, 0);
        assert!(fx.regs.resets().is_empty());
        assert!(!fx.regs.dma_enabled(ch));

        // Buffers returning still resume DMA the normal way.
        fx.engine.enqueue(ch, buf(2)).unwrap();
        assert!(fx.regs.dma_enabled(ch));
    }

    #[test]
    fn test_watchdog_stall_recovers_channel() {
        let fx = direct_fixture();
        let ch = ChannelId(0);
        for i in 0..4 {
            fx.engine.enqueue(ch, buf(i)).unwrap();
        }
        fx.engine.start(ch).unwrap();
        fx.engine
            .on_frame_boundary(ch, FramePhase::AReady, 1_000)
            .unwrap();

        // Baseline tick, then silence for monitor_cycles ticks.
        fx.engine.on_tick().unwrap();
        fx.engine.on_tick().unwrap();
        fx.engine.on_tick().unwrap();
        fx.regs.set_frame_counter(ch, 17);
        fx.engine.on_tick().unwrap();

        let stats = fx.engine.stats();
        assert_eq!(stats.channels[0].resets, 1);
        assert_eq!(fx.regs.resets(), vec![ch]);
        assert!(fx.regs.dma_enabled(ch));
        assert!(fx.engine.is_streaming(ch).unwrap());

        // Sequencing resynchronized to the hardware frame counter.
        fx.engine
            .on_frame_boundary(ch, FramePhase::AReady, 5_000)
            .unwrap();
        // Recovery re-pools the slot buffers, so delivery keeps flowing.
        assert_eq!(fx.engine.stats().channels[0].delivered, 2);
    }

    #[test]
    fn test_protocol_faults_trigger_recovery() {
        let fx = direct_fixture();
        let ch = ChannelId(0);
        fx.engine.enqueue(ch, buf(0)).unwrap();
        fx.engine.enqueue(ch, buf(1)).unwrap();
        fx.engine.start(ch).unwrap();

        let mut now = 1_000;
        for tick in 0..4 {
            // Keep completions advancing: this is a link problem, not a
            // stall.
            let phase = if tick % 2 == 0 {
                FramePhase::AReady
            } else {
                FramePhase::BReady
            };
            fx.engine.enqueue(ch, buf(10 + tick)).unwrap();
            fx.engine.on_frame_boundary(ch, phase, now).unwrap();
            now += 33_000_000;
            fx.timing.inject_protocol_faults(1);
            fx.engine.on_tick().unwrap();
        }

        assert_eq!(fx.engine.stats().channels[0].resets, 1);
    }

    #[tokio::test]
    async fn test_hdr_group_delivers_atomically() {
        let geometry = Geometry::packed(4096);
        let fx = fixture(vec![
            ChannelConfig::hdr(ChannelId(0), geometry.clone(), ExposureTier::Long, 0),
            ChannelConfig::hdr(ChannelId(1), geometry, ExposureTier::Short, 0),
        ]);
        let sink = Arc::new(RecordingSink::new());
        let _handles =
            CaptureEngine::spawn_delivery(fx.workers, Arc::clone(&sink) as Arc<dyn FrameSink>);

        let (long, short) = (ChannelId(0), ChannelId(1));
        for i in 0..4 {
            fx.engine.enqueue(long, buf(i)).unwrap();
            fx.engine.enqueue(short, buf(10 + i)).unwrap();
        }
        fx.engine.start(long).unwrap();
        fx.engine.start(short).unwrap();

        // Tiers complete 2ms apart, well within one 33ms frame period.
        fx.engine
            .on_frame_boundary(long, FramePhase::AReady, 100_000_000)
            .unwrap();
        assert_eq!(sink.count(), 0);
        fx.engine
            .on_frame_boundary(short, FramePhase::AReady, 102_000_000)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 2);
        // Both members carry the long tier's sequence.
        assert!(delivered.iter().all(|(_, f)| f.buffer.sequence == 0));
        assert!(delivered.iter().all(|(_, f)| f.correlated));
        assert_eq!(fx.engine.stats().hdr_timestamp_mismatch, 0);
    }

    #[tokio::test]
    async fn test_hdr_skew_discards_group() {
        let geometry = Geometry::packed(4096);
        let fx = fixture(vec![
            ChannelConfig::hdr(ChannelId(0), geometry.clone(), ExposureTier::Long, 0),
            ChannelConfig::hdr(ChannelId(1), geometry, ExposureTier::Short, 0),
        ]);
        let sink = Arc::new(RecordingSink::new());
        let _handles =
            CaptureEngine::spawn_delivery(fx.workers, Arc::clone(&sink) as Arc<dyn FrameSink>);

        let (long, short) = (ChannelId(0), ChannelId(1));
        for i in 0..4 {
            fx.engine.enqueue(long, buf(i)).unwrap();
            fx.engine.enqueue(short, buf(10 + i)).unwrap();
        }
        fx.engine.start(long).unwrap();
        fx.engine.start(short).unwrap();

        // Two frame periods apart: cannot be the same capture instant.
        fx.engine
            .on_frame_boundary(long, FramePhase::AReady, 100_000_000)
            .unwrap();
        fx.engine
            .on_frame_boundary(short, FramePhase::AReady, 170_000_000)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.count(), 0);
        assert_eq!(fx.engine.stats().hdr_timestamp_mismatch, 1);
    }

    #[tokio::test]
    async fn test_mapping_rides_through_delivery() {
        let fx = direct_fixture();
        let ch = ChannelId(0);
        let sink = Arc::new(RecordingSink::new());
        let _handles =
            CaptureEngine::spawn_delivery(fx.workers, Arc::clone(&sink) as Arc<dyn FrameSink>);

        let mapped = buf(0).with_mapping(bytes::Bytes::from_static(b"frame0"));
        fx.engine.enqueue(ch, mapped).unwrap();
        fx.engine.enqueue(ch, buf(1)).unwrap();
        fx.engine.start(ch).unwrap();
        fx.engine
            .on_frame_boundary(ch, FramePhase::AReady, 1_000)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].1.buffer.mapping.as_deref(),
            Some(b"frame0".as_slice())
        );
    }

    #[test]
    fn test_hdr_group_tier_set_validated() {
        let geometry = Geometry::packed(4096);
        let build = |cfgs: Vec<ChannelConfig>| {
            CaptureEngine::new(
                SchedConfig::default(),
                cfgs,
                Arc::new(MockRegisterMap::new()),
                Arc::new(MockTiming::new()),
                Arc::new(MockScratch::new()),
            )
        };

        // {Long, Medium} is not a valid two-exposure set.
        let result = build(vec![
            ChannelConfig::hdr(ChannelId(0), geometry.clone(), ExposureTier::Long, 0),
            ChannelConfig::hdr(ChannelId(1), geometry.clone(), ExposureTier::Medium, 0),
        ]);
        assert!(matches!(result, Err(CaptureError::Configuration(_))));

        // Two members sharing a tier could never correlate either.
        let result = build(vec![
            ChannelConfig::hdr(ChannelId(0), geometry.clone(), ExposureTier::Long, 0),
            ChannelConfig::hdr(ChannelId(1), geometry.clone(), ExposureTier::Long, 0),
        ]);
        assert!(matches!(result, Err(CaptureError::Configuration(_))));

        // The proper {Long, Short} pair still builds.
        assert!(build(vec![
            ChannelConfig::hdr(ChannelId(0), geometry.clone(), ExposureTier::Long, 0),
            ChannelConfig::hdr(ChannelId(1), geometry, ExposureTier::Short, 0),
        ])
        .is_ok());
    }

    #[test]
    fn test_id_index_mismatch_rejected() {
        let regs = Arc::new(MockRegisterMap::new());
        let timing = Arc::new(MockTiming::new());
        let scratch = Arc::new(MockScratch::new());
        let result = CaptureEngine::new(
            SchedConfig::default(),
            vec![ChannelConfig::direct(ChannelId(1), Geometry::packed(64))],
            regs,
            timing,
            scratch,
        );
        assert!(matches!(result, Err(CaptureError::Configuration(_))));
    }
}
