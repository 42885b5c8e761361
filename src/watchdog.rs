//! Capture liveness watchdog.
//!
//! The hardware can wedge in ways that produce no interrupt at all, so
//! liveness cannot be inferred from the interrupt path itself. Instead a
//! periodic tick samples each streaming channel's completion counter and the
//! sensor's protocol fault counter; sustained silence or sustained link
//! faults trigger a recovery episode.
//!
//! The watchdog only decides *that* recovery is needed. Performing it
//! (quiesce, soft reset, slot re-init) belongs to the engine, which walks the
//! `Triggered -> Resetting -> Armed` states as it goes. A trigger latches:
//! further ticks report nothing until the engine re-arms, so one wedged
//! sensor produces one recovery episode, not one per tick.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::channel::ChannelId;

/// Watchdog lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// Not monitoring (no channel streaming).
    Idle,
    /// Monitoring; ticks are evaluated.
    Armed,
    /// Fault latched, waiting for the engine to start recovery.
    Triggered,
    /// Engine is running recovery.
    Resetting,
}

/// Why a trigger fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// No streaming channel made progress for too many ticks.
    Stall {
        /// Consecutive ticks without progress.
        stalled_ticks: u32,
    },
    /// Sensor link faults persisted across consecutive tick pairs.
    ProtocolFault {
        /// Consecutive faulted pairs observed.
        pairs: u32,
    },
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickVerdict {
    /// Progress observed, or the watchdog is not armed.
    Healthy,
    /// No progress this tick, but below the trigger threshold.
    Stalled,
    /// Fault latched; the engine should run recovery.
    Trigger(TriggerReason),
}

/// Stall and protocol-fault detector fed by periodic ticks.
pub struct Watchdog {
    monitor_cycles: u32,
    protocol_fault_pairs: u32,
    state: WatchdogState,
    baselines: HashMap<ChannelId, u64>,
    stalled_ticks: u32,
    tick_parity: bool,
    pair_faulted: bool,
    fault_pairs: u32,
}

impl Watchdog {
    /// Trigger after `monitor_cycles` ticks without progress, or after
    /// `protocol_fault_pairs` consecutive tick pairs with link faults.
    #[must_use]
    pub fn new(monitor_cycles: u32, protocol_fault_pairs: u32) -> Self {
        Self {
            monitor_cycles,
            protocol_fault_pairs,
            state: WatchdogState::Idle,
            baselines: HashMap::new(),
            stalled_ticks: 0,
            tick_parity: false,
            pair_faulted: false,
            fault_pairs: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WatchdogState {
        self.state
    }

    /// Start monitoring. Called when the first channel starts streaming.
    pub fn arm(&mut self) {
        if self.state == WatchdogState::Idle {
            self.clear();
            self.state = WatchdogState::Armed;
            debug!("watchdog armed");
        }
    }

    /// Stop monitoring. Called when the last channel stops.
    pub fn disarm(&mut self) {
        self.state = WatchdogState::Idle;
        self.clear();
        debug!("watchdog disarmed");
    }

    /// Engine acknowledged the trigger and is starting recovery.
    pub fn begin_reset(&mut self) {
        if self.state == WatchdogState::Triggered {
            self.state = WatchdogState::Resetting;
        }
    }

    /// Recovery finished; resume monitoring from a fresh baseline.
    pub fn rearm(&mut self) {
        if self.state == WatchdogState::Resetting {
            self.clear();
            self.state = WatchdogState::Armed;
            debug!("watchdog re-armed after recovery");
        }
    }

    /// Evaluate one tick. `completions` holds the current completion counter
    /// for every streaming channel; `protocol_faults` is the number of link
    /// faults the sensor reported since the previous tick.
    pub fn tick(&mut self, completions: &[(ChannelId, u64)], protocol_faults: u64) -> TickVerdict {
        if self.state != WatchdogState::Armed {
            return TickVerdict::Healthy;
        }

        let mut progressed = false;
        for &(id, count) in completions {
            match self.baselines.insert(id, count) {
                // A channel we have not seen yet establishes its baseline,
                // which is not evidence of a stall.
                None => progressed = true,
                Some(prev) if prev != count => progressed = true,
                Some(_) => {}
            }
        }
        self.baselines.retain(|id, _| completions.iter().any(|(c, _)| c == id));

        if progressed {
            self.stalled_ticks = 0;
        } else {
            self.stalled_ticks += 1;
        }

        // Protocol faults are judged per pair of ticks: transient bursts
        // confined to one pair are tolerated, faults spanning consecutive
        // pairs are a wedged link.
        self.pair_faulted |= protocol_faults > 0;
        let pair_complete = self.tick_parity;
        self.tick_parity = !self.tick_parity;
        if pair_complete {
            if self.pair_faulted {
                self.fault_pairs += 1;
            } else {
                self.fault_pairs = 0;
            }
            self.pair_faulted = false;
        }

        if !completions.is_empty() && self.stalled_ticks >= self.monitor_cycles {
            let reason = TriggerReason::Stall {
                stalled_ticks: self.stalled_ticks,
            };
            warn!(stalled_ticks = self.stalled_ticks, "watchdog trigger: capture stalled");
            self.state = WatchdogState::Triggered;
            return TickVerdict::Trigger(reason);
        }
        if self.fault_pairs >= self.protocol_fault_pairs {
            let reason = TriggerReason::ProtocolFault {
                pairs: self.fault_pairs,
            };
            warn!(pairs = self.fault_pairs, "watchdog trigger: persistent protocol faults");
            self.state = WatchdogState::Triggered;
            return TickVerdict::Trigger(reason);
        }

        if progressed {
            TickVerdict::Healthy
        } else {
            TickVerdict::Stalled
        }
    }

    fn clear(&mut self) {
        self.baselines.clear();
        self.stalled_ticks = 0;
        self.tick_parity = false;
        self.pair_faulted = false;
        self.fault_pairs = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed(monitor_cycles: u32, fault_pairs: u32) -> Watchdog {
        let mut dog = Watchdog::new(monitor_cycles, fault_pairs);
        dog.arm();
        dog
    }

    #[test]
    fn test_progress_keeps_healthy() {
        let mut dog = armed(3, 2);
        let ch = ChannelId(0);

        assert_eq!(dog.tick(&[(ch, 1)], 0), TickVerdict::Healthy);
        assert_eq!(dog.tick(&[(ch, 2)], 0), TickVerdict::Healthy);
        assert_eq!(dog.tick(&[(ch, 3)], 0), TickVerdict::Healthy);
        assert_eq!(dog.state(), WatchdogState::Armed);
    }

    #[test]
    fn test_stall_triggers_after_monitor_cycles() {
        let mut dog = armed(3, 2);
        let ch = ChannelId(0);

        dog.tick(&[(ch, 5)], 0);
        assert_eq!(dog.tick(&[(ch, 5)], 0), TickVerdict::Stalled);
        assert_eq!(dog.tick(&[(ch, 5)], 0), TickVerdict::Stalled);
        assert_eq!(
            dog.tick(&[(ch, 5)], 0),
            TickVerdict::Trigger(TriggerReason::Stall { stalled_ticks: 3 })
        );
        assert_eq!(dog.state(), WatchdogState::Triggered);
    }

    #[test]
    fn test_trigger_latches_until_rearm() {
        let mut dog = armed(1, 2);
        let ch = ChannelId(0);

        dog.tick(&[(ch, 5)], 0);
        assert!(matches!(dog.tick(&[(ch, 5)], 0), TickVerdict::Trigger(_)));
        // Latched: further ticks report nothing new.
        assert_eq!(dog.tick(&[(ch, 5)], 0), TickVerdict::Healthy);
        assert_eq!(dog.state(), WatchdogState::Triggered);

        dog.begin_reset();
        assert_eq!(dog.state(), WatchdogState::Resetting);
        dog.rearm();
        assert_eq!(dog.state(), WatchdogState::Armed);
        // Fresh baseline after recovery.
        assert_eq!(dog.tick(&[(ch, 5)], 0), TickVerdict::Healthy);
    }

    #[test]
    fn test_any_channel_progress_counts() {
        let mut dog = armed(2, 2);
        let (a, b) = (ChannelId(0), ChannelId(1));

        dog.tick(&[(a, 1), (b, 1)], 0);
        // Only b advances; that is still progress.
        assert_eq!(dog.tick(&[(a, 1), (b, 2)], 0), TickVerdict::Healthy);
        assert_eq!(dog.tick(&[(a, 1), (b, 3)], 0), TickVerdict::Healthy);
    }

    #[test]
    fn test_protocol_faults_across_pairs_trigger() {
        let mut dog = armed(100, 2);
        let ch = ChannelId(0);
        let mut count = 0;

        // Pair 1: faulted. Pair 2: faulted. Trigger on the tick closing
        // the second pair.
        count += 1;
        dog.tick(&[(ch, count)], 1);
        count += 1;
        dog.tick(&[(ch, count)], 0);
        count += 1;
        dog.tick(&[(ch, count)], 1);
        count += 1;
        assert_eq!(
            dog.tick(&[(ch, count)], 1),
            TickVerdict::Trigger(TriggerReason::ProtocolFault { pairs: 2 })
        );
    }

    #[test]
    fn test_isolated_fault_burst_tolerated() {
        let mut dog = armed(100, 2);
        let ch = ChannelId(0);
        let mut count = 0;

        count += 1;
        dog.tick(&[(ch, count)], 7);
        count += 1;
        dog.tick(&[(ch, count)], 0);
        // Clean pair resets the streak.
        count += 1;
        dog.tick(&[(ch, count)], 0);
        count += 1;
        dog.tick(&[(ch, count)], 0);
        count += 1;
        dog.tick(&[(ch, count)], 3);
        count += 1;
        assert_ne!(
            dog.tick(&[(ch, count)], 0),
            TickVerdict::Trigger(TriggerReason::ProtocolFault { pairs: 2 })
        );
        assert_eq!(dog.state(), WatchdogState::Armed);
    }

    #[test]
    fn test_idle_ticks_are_ignored() {
        let mut dog = Watchdog::new(1, 1);
        let ch = ChannelId(0);
        assert_eq!(dog.tick(&[(ch, 0)], 9), TickVerdict::Healthy);
        assert_eq!(dog.state(), WatchdogState::Idle);
    }
}
