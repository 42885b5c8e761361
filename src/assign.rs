//! Ping-pong buffer assignment.
//!
//! On every frame boundary exactly one slot has finished capturing. The
//! assigner retires the buffer bound there, promotes the next buffer from
//! the pool into the vacated slot, and falls back to the dummy scratch
//! buffer when the pool is starved — the hardware is never left without a
//! valid target address. The order of operations matters: the retired buffer
//! is taken out of the slot array before anything else, so it can never be
//! delivered twice without an intervening re-binding.
//!
//! A starved pool can leave one buffer shared across both slots (and an
//! interlaced sensor does this on purpose). A shared buffer only retires
//! once every sharing slot has genuinely finished its phase; until then the
//! completion is recorded and nothing is delivered.

use crate::buffer::{CaptureBuffer, DmaAddr};
use crate::channel::{Channel, ChannelCounters, SlotBind, SlotIndex, LACK_SATURATE};
use crate::error::{CaptureError, CaptureResult};
use crate::hal::RegisterMap;
use tracing::{debug, warn};

/// Result of one `update` call.
#[derive(Debug, Default)]
pub(crate) struct AssignOutcome {
    /// The buffer that finished capturing, if a real one did.
    pub retired: Option<CaptureBuffer>,
    /// Set when lack-of-buffer saturation auto-suspended DMA this boundary.
    pub suspended: bool,
}

/// Bind initial buffers into every slot before streaming starts.
///
/// Pulls one pool buffer per slot. When the pool runs out mid-way the
/// remaining slots alias the last real buffer (single-buffer rotation);
/// when it is empty from the start they take the dummy. With neither
/// available the channel cannot stream at all.
pub(crate) fn init(
    channel: &mut Channel,
    dummy: Option<DmaAddr>,
    regs: &dyn RegisterMap,
) -> CaptureResult<()> {
    let table = channel.cfg.routing.target_table();
    let id = channel.cfg.id;
    let mut last_real: Option<SlotIndex> = None;

    for slot in channel.slot_range() {
        let slot = *slot;
        let bind = if let Some(buf) = channel.pool.pop() {
            if let Err(err) = regs.write_slot(id, table, slot, buf.addr) {
                channel.pool.push(buf);
                return Err(err);
            }
            last_real = Some(slot);
            SlotBind::Owned(buf)
        } else if let Some(owner) = last_real {
            // Pool ran dry mid-init: rotate the one buffer we have through
            // both phases rather than mixing in the dummy.
            let addr = owned_addr(channel, owner);
            regs.write_slot(id, table, slot, addr)?;
            SlotBind::Alias(owner)
        } else if let Some(dummy) = dummy {
            regs.write_slot(id, table, slot, dummy)?;
            SlotBind::Dummy
        } else {
            return Err(CaptureError::Starvation { channel: id });
        };
        channel.slots[slot.idx()] = bind;
    }

    channel.phase_done = 0;
    channel.last_completed = None;
    debug!(channel = %id, "slots initialized");
    Ok(())
}

/// Handle the completion of `completed` at time `now_ns`.
pub(crate) fn update(
    channel: &mut Channel,
    completed: SlotIndex,
    now_ns: u64,
    dummy: Option<DmaAddr>,
    regs: &dyn RegisterMap,
) -> CaptureResult<AssignOutcome> {
    channel.last_completed = Some(completed);
    channel.last_boundary_ns = now_ns;

    let owner = channel.owner_slot(completed);
    let mut outcome = AssignOutcome::default();

    match &channel.slots[owner.idx()] {
        SlotBind::Empty => {
            // Slot non-emptiness says this cannot happen with DMA enabled;
            // count it like a phase fault rather than trust the signal.
            warn!(channel = %channel.cfg.id, slot = ?completed, "completion on empty slot");
            ChannelCounters::bump(&channel.counters.phase_faults);
            return Ok(outcome);
        }
        SlotBind::Dummy => {
            // Frame landed in scratch and is dropped. Promote a real buffer
            // if one arrived, otherwise stay on the dummy and count the lack.
            ChannelCounters::bump(&channel.counters.completions);
            channel.next_sequence += 1;
            outcome.suspended = bind_fresh(channel, completed, dummy, regs)?;
            return Ok(outcome);
        }
        SlotBind::Owned(_) => {}
        // owner_slot() already collapsed the alias hop.
        SlotBind::Alias(_) => unreachable!("owner_slot returned an alias"),
    }

    let share = {
        let mut share = channel.aliases_of(owner);
        share.push(owner);
        share
    };

    if share.len() > 1 {
        // Degenerate single-buffer rotation: only retire once every sharing
        // slot has finished its phase, to avoid double delivery.
        channel.phase_done |= 1 << completed.idx();
        ChannelCounters::bump(&channel.counters.completions);
        let all_done = share.iter().all(|s| channel.phase_done & (1 << s.idx()) != 0);
        if !all_done {
            debug!(channel = %channel.cfg.id, slot = ?completed, "shared buffer phase recorded");
            return Ok(outcome);
        }

        channel.phase_done = 0;
        // Claim the sequence number while the slot is still intact, so a
        // readback error cannot strand the buffer outside the slot array.
        let sequence = claim_sequence(channel, regs)?;
        let SlotBind::Owned(buf) =
            std::mem::replace(&mut channel.slots[owner.idx()], SlotBind::Empty)
        else {
            unreachable!("share owner is always Owned")
        };
        outcome.retired = Some(finish(channel, buf, now_ns, sequence));
        for slot in share {
            channel.slots[slot.idx()] = SlotBind::Empty;
            match bind_fresh(channel, slot, dummy, regs) {
                Ok(suspended) => outcome.suspended |= suspended,
                Err(err) => {
                    // A failed rebind must not leak the retired descriptor.
                    if let Some(buf) = outcome.retired.take() {
                        channel.pool.push(buf);
                    }
                    return Err(err);
                }
            }
        }
        return Ok(outcome);
    }

    // Healthy rotation: retire the completed slot's buffer and rebind.
    let sequence = claim_sequence(channel, regs)?;
    let SlotBind::Owned(buf) = std::mem::replace(&mut channel.slots[owner.idx()], SlotBind::Empty)
    else {
        unreachable!("checked Owned above")
    };
    ChannelCounters::bump(&channel.counters.completions);
    outcome.retired = Some(finish(channel, buf, now_ns, sequence));
    match bind_fresh(channel, completed, dummy, regs) {
        Ok(suspended) => outcome.suspended = suspended,
        Err(err) => {
            // A failed rebind must not leak the retired descriptor.
            if let Some(buf) = outcome.retired.take() {
                channel.pool.push(buf);
            }
            return Err(err);
        }
    }
    Ok(outcome)
}

/// Rebind one stale slot ahead of its own frame-start.
///
/// Only called once the rotation tracker has authorized an early update and
/// the vblank-window check has passed. Replaces a dummy, alias, or empty
/// binding with the next pool buffer; a slot that already owns a buffer is
/// left alone.
pub(crate) fn early_update(
    channel: &mut Channel,
    target: SlotIndex,
    regs: &dyn RegisterMap,
) -> CaptureResult<bool> {
    if matches!(channel.slots[target.idx()], SlotBind::Owned(_)) {
        return Ok(false);
    }
    let Some(buf) = channel.pool.pop() else {
        return Ok(false);
    };

    let id = channel.cfg.id;
    if let Err(err) = regs.write_slot(id, channel.cfg.routing.target_table(), target, buf.addr) {
        channel.pool.push(buf);
        return Err(err);
    }
    channel.slots[target.idx()] = SlotBind::Owned(buf);
    channel.phase_done &= !(1 << target.idx());
    channel.lack_count = 0;
    ChannelCounters::bump(&channel.counters.buffer_replaced);
    debug!(channel = %id, slot = ?target, "early slot update");
    Ok(true)
}

/// Reserve the sequence number the next retired frame carries.
fn claim_sequence(channel: &mut Channel, regs: &dyn RegisterMap) -> CaptureResult<u64> {
    if channel.cfg.routing.uses_readback() {
        // Readback correlation: track the hardware's own frame counter so
        // the downstream readback stream stays aligned.
        let hw = regs.read_frame_counter(channel.cfg.id)?;
        channel.next_sequence = hw + 1;
        Ok(hw)
    } else {
        let seq = channel.next_sequence;
        channel.next_sequence += 1;
        Ok(seq)
    }
}

/// Stamp a retired buffer with its sequence number and completion time.
fn finish(channel: &Channel, mut buf: CaptureBuffer, now_ns: u64, sequence: u64) -> CaptureBuffer {
    buf.timestamp_ns = now_ns;
    buf.sequence = sequence;
    buf.tier = channel.cfg.tier;
    buf
}

/// Fill `slot` with the next pool buffer, or the dummy when starved.
///
/// Returns `true` when lack saturation auto-suspended DMA. With no pool
/// buffer *and* no dummy the hardware would be left without a valid target,
/// which is the hard failure case: DMA is forced off and the error surfaces.
fn bind_fresh(
    channel: &mut Channel,
    slot: SlotIndex,
    dummy: Option<DmaAddr>,
    regs: &dyn RegisterMap,
) -> CaptureResult<bool> {
    let id = channel.cfg.id;
    let table = channel.cfg.routing.target_table();

    if let Some(buf) = channel.pool.pop() {
        if let Err(err) = regs.write_slot(id, table, slot, buf.addr) {
            channel.pool.push(buf);
            return Err(err);
        }
        channel.slots[slot.idx()] = SlotBind::Owned(buf);
        channel.lack_count = 0;
        return Ok(false);
    }

    if let Some(dummy) = dummy {
        let was_dummy = matches!(channel.slots[slot.idx()], SlotBind::Dummy);
        if !was_dummy {
            regs.write_slot(id, table, slot, dummy)?;
            channel.slots[slot.idx()] = SlotBind::Dummy;
        }
        channel.lack_count = (channel.lack_count + 1).min(LACK_SATURATE);
        ChannelCounters::bump(&channel.counters.lack_events);

        if channel.lack_count >= LACK_SATURATE && channel.dma_enabled {
            // Sustained starvation: suspend rather than keep capturing into
            // memory the consumer still owns.
            warn!(channel = %id, "lack counter saturated, suspending DMA");
            regs.set_dma(id, false)?;
            channel.dma_enabled = false;
            return Ok(true);
        }
        return Ok(false);
    }

    warn!(channel = %id, "pool empty and no dummy buffer, forcing DMA off");
    regs.set_dma(id, false)?;
    channel.dma_enabled = false;
    Err(CaptureError::Starvation { channel: id })
}

fn owned_addr(channel: &Channel, slot: SlotIndex) -> DmaAddr {
    match &channel.slots[slot.idx()] {
        SlotBind::Owned(buf) => buf.addr,
        _ => unreachable!("caller tracked the owning slot"),
    }
}
