//! Multi-exposure (HDR) frame correlation.
//!
//! An HDR sensor emits one frame per exposure tier for every real-world
//! capture instant, on separate channels. Consumers want them back as one
//! logical frame: same sequence number, released together. The correlator
//! holds retired buffers per tier until the set is complete, checks that the
//! completion timestamps actually belong to the same instant, and emits the
//! group atomically.
//!
//! Faults are never silent: a tier that completes twice before its siblings
//! force-flushes the stale occupant downstream marked uncorrelated, and a
//! group whose timestamps disagree is discarded whole with a counted fault —
//! forwarding half an HDR set would be worse than dropping it.

use crate::buffer::{CaptureBuffer, DeliveredFrame, ExposureTier};
use tracing::{debug, warn};

/// Tier sets by exposure count.
const TIERS_1: &[ExposureTier] = &[ExposureTier::Long];
const TIERS_2: &[ExposureTier] = &[ExposureTier::Long, ExposureTier::Short];
const TIERS_3: &[ExposureTier] = &[
    ExposureTier::Long,
    ExposureTier::Medium,
    ExposureTier::Short,
];

/// Correlation fault counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HdrFaults {
    /// A tier completed twice before its siblings (stale occupant flushed).
    pub duplicate_tier: u64,
    /// A complete group failed timestamp validation and was discarded.
    pub timestamp_mismatch: u64,
}

impl HdrFaults {
    /// Total correlation faults.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.duplicate_tier + self.timestamp_mismatch
    }
}

/// What one `offer` produced.
#[derive(Debug)]
pub enum HdrOutcome {
    /// Group still incomplete; the buffer is now held by the correlator.
    Pending,
    /// A stale duplicate was force-flushed downstream, uncorrelated; the
    /// new arrival took its place in the open group.
    Flushed(DeliveredFrame),
    /// All tiers present and timestamp-coherent: the correlated group, every
    /// member carrying the long tier's sequence number.
    Group(Vec<DeliveredFrame>),
    /// Timestamp validation failed: the whole group goes back to the pool,
    /// nothing is forwarded.
    Discarded(Vec<CaptureBuffer>),
}

/// Correlation state for one HDR channel set.
///
/// At most one group is open at a time, by construction: the per-tier slots
/// *are* the open group.
pub struct HdrCorrelator {
    required: &'static [ExposureTier],
    held: [Option<CaptureBuffer>; 3],
    faults: HdrFaults,
}

impl HdrCorrelator {
    /// Correlator for a device capturing `exposures` tiers (1, 2, or 3).
    #[must_use]
    pub fn new(exposures: usize) -> Self {
        Self {
            required: Self::required_tiers(exposures),
            held: [None, None, None],
            faults: HdrFaults::default(),
        }
    }

    /// The tier set a device capturing `exposures` tiers must produce.
    #[must_use]
    pub fn required_tiers(exposures: usize) -> &'static [ExposureTier] {
        match exposures {
            0 | 1 => TIERS_1,
            2 => TIERS_2,
            _ => TIERS_3,
        }
    }

    /// Number of tiers required per group.
    #[must_use]
    pub fn exposures(&self) -> usize {
        self.required.len()
    }

    /// Fault counters so far.
    #[must_use]
    pub fn faults(&self) -> HdrFaults {
        self.faults
    }

    /// Offer one retired buffer. `frame_period_ns` is the measured frame
    /// interval; sibling completion timestamps further apart than one period
    /// cannot belong to the same capture instant.
    pub fn offer(&mut self, buf: CaptureBuffer, frame_period_ns: u64) -> HdrOutcome {
        let Some(idx) = buf.tier.hdr_index() else {
            // Single-exposure frames have no siblings to wait for.
            return HdrOutcome::Group(vec![DeliveredFrame::correlated(buf)]);
        };

        if !self.required.contains(&buf.tier) {
            // Tier outside the configured exposure set; forward rather than
            // drop, but it cannot correlate with anything.
            warn!(tier = ?buf.tier, "tier not in configured exposure set");
            self.faults.duplicate_tier += 1;
            return HdrOutcome::Flushed(DeliveredFrame::uncorrelated(buf));
        }

        if let Some(stale) = self.held[idx].replace(buf) {
            // Correlation miss: this tier lapped its siblings.
            warn!(
                tier = ?stale.tier,
                sequence = stale.sequence,
                "duplicate tier before group completion, flushing stale frame"
            );
            self.faults.duplicate_tier += 1;
            return HdrOutcome::Flushed(DeliveredFrame::uncorrelated(stale));
        }

        let complete = self
            .required
            .iter()
            .all(|t| self.held[t.hdr_index().unwrap_or(0)].is_some());
        if !complete {
            return HdrOutcome::Pending;
        }

        let mut members: Vec<CaptureBuffer> = Vec::with_capacity(self.required.len());
        for tier in self.required {
            if let Some(held) = self.held[tier.hdr_index().unwrap_or(0)].take() {
                members.push(held);
            }
        }

        // Validate in ascending-exposure order: timestamps must be
        // non-decreasing long → medium → short and pairwise within one
        // frame period.
        for pair in members.windows(2) {
            let (earlier, later) = (pair[0].timestamp_ns, pair[1].timestamp_ns);
            if later < earlier || later - earlier > frame_period_ns {
                warn!(
                    earlier,
                    later, frame_period_ns, "tier timestamps incoherent, discarding group"
                );
                self.faults.timestamp_mismatch += 1;
                return HdrOutcome::Discarded(members);
            }
        }

        // One logical frame number per physical exposure instant: every
        // member adopts the long tier's sequence.
        let sequence = members[0].sequence;
        for member in &mut members {
            member.sequence = sequence;
        }
        debug!(sequence, tiers = members.len(), "HDR group correlated");
        HdrOutcome::Group(members.into_iter().map(DeliveredFrame::correlated).collect())
    }

    /// Drop any partially assembled group, returning the held buffers.
    ///
    /// Used on stop and watchdog recovery: a group spanning a reset can
    /// never correlate.
    pub fn flush(&mut self) -> Vec<CaptureBuffer> {
        self.held.iter_mut().filter_map(Option::take).collect()
    }
}
