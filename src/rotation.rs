//! Rotation-state tracking and the early-update gate.
//!
//! Every frame boundary the scheduler classifies the two (or three) hardware
//! slots: distinct real buffers means the rotation is healthy, a shared
//! buffer means the pool has been starved for at least one cycle, anything
//! else is unresolved. A rotation that stays unhealthy earns an "early
//! update": the next slot may be rebound immediately, ahead of its own
//! frame-start, closing the window where recovering exactly on a boundary
//! would let the hardware recapture into stale memory.
//!
//! The authorization is a check-count-gated state machine, not a per-call
//! heuristic: a state must persist for a fixed number of boundaries before
//! the early write is allowed, and the write itself is only permitted while
//! there is comfortably more than the configured margin left in the
//! vertical-blank window.

use crate::channel::{Channel, SlotBind};
use crate::hal::SensorTiming;
use std::time::Duration;

/// Health of a channel's slot rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    /// Slots hold distinct real buffers.
    Rotating,
    /// Slots share one buffer (dummy or degenerate single-buffer rotation).
    Stalled,
    /// Could not be established, e.g. at the very first frame or while one
    /// slot still holds the dummy.
    Loss,
}

/// Boundaries a state must persist beyond its entry before early update.
const STALLED_CHECKS: u8 = 1;
const LOSS_CHECKS: u8 = 2;

/// Per-channel rotation classification with a bounded re-check counter.
#[derive(Debug)]
pub struct RotationTracker {
    state: RotationState,
    checks: u8,
}

impl RotationTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: RotationState::Loss,
            checks: 0,
        }
    }

    /// Current classification.
    #[must_use]
    pub fn state(&self) -> RotationState {
        self.state
    }

    /// Feed one per-boundary classification. Returns `true` when the state
    /// has persisted long enough to authorize an early slot update.
    pub(crate) fn observe(&mut self, classification: RotationState) -> bool {
        if classification != self.state {
            self.state = classification;
            self.checks = 0;
            return false;
        }
        self.checks = self.checks.saturating_add(1);
        match self.state {
            RotationState::Rotating => false,
            RotationState::Stalled => self.checks >= STALLED_CHECKS,
            RotationState::Loss => self.checks >= LOSS_CHECKS,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = RotationState::Loss;
        self.checks = 0;
    }
}

/// Classify the slot bindings of a channel.
pub(crate) fn classify(channel: &Channel) -> RotationState {
    let binds = &channel.slots;
    let all_owned = binds.iter().all(|b| matches!(b, SlotBind::Owned(_)));
    if all_owned {
        return RotationState::Rotating;
    }
    let shared = binds.iter().any(|b| matches!(b, SlotBind::Alias(_)));
    let all_dummy = binds.iter().all(|b| matches!(b, SlotBind::Dummy));
    if shared || all_dummy {
        return RotationState::Stalled;
    }
    RotationState::Loss
}

/// Whether an early slot write issued at `now_ns` still lands comfortably
/// before the next frame's readout begins.
///
/// The window opens at the frame boundary and closes `margin` before the end
/// of vertical blanking (`line_time × vertical_blank_lines`). The margin is
/// configuration — its correct value depends on the hardware revision and
/// sensor and is not a documented guarantee.
pub(crate) fn within_early_window(
    now_ns: u64,
    boundary_ns: u64,
    timing: &dyn SensorTiming,
    margin: Duration,
) -> bool {
    let vblank = timing.line_time().as_nanos() as u64 * u64::from(timing.vertical_blank_lines());
    let Some(window_end) = boundary_ns
        .checked_add(vblank)
        .and_then(|end| end.checked_sub(margin.as_nanos() as u64))
    else {
        return false;
    };
    now_ns >= boundary_ns && now_ns < window_end
}
