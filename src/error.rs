//! Error types for the capture scheduler.
//!
//! The scheduler splits failures into two families. Recoverable frame-level
//! faults (starvation absorbed by the dummy buffer, HDR correlation misses,
//! impossible phase signals) never surface as `Err` from the frame-boundary
//! path — they are counted on the channel and logged, and the stream keeps
//! running. [`CaptureError`] covers everything else: configuration problems,
//! register access failures, and the hard cases where the scheduler cannot
//! keep the hardware pointed at valid memory.

use crate::channel::ChannelId;
use thiserror::Error;

/// Convenience alias for results using the scheduler error type.
pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

/// Primary error type for the capture scheduler.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Configuration file parsing failed.
    ///
    /// Wraps `config::ConfigError` from the `config` crate; permanent,
    /// requires fixing the configuration file.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration values parsed but failed semantic validation
    /// (zero timing margin, zero queue depth, and so on).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A channel id outside the set configured at engine construction.
    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// `start` called on a channel that is already streaming.
    #[error("Channel {0} is already streaming")]
    AlreadyStreaming(ChannelId),

    /// An operation requiring an active stream hit a stopped channel.
    #[error("Channel {0} is not streaming")]
    NotStreaming(ChannelId),

    /// The pool was empty and no dummy buffer exists to fall back on.
    ///
    /// This is the one starvation case the scheduler cannot absorb: the
    /// hardware would be left without a valid target address, so DMA is
    /// forced off until buffers return. Transient from the stream's point
    /// of view — the watchdog or a consumer enqueue re-enables the channel.
    #[error("Channel {channel}: buffer pool empty and no dummy buffer available")]
    Starvation {
        /// Channel that ran dry.
        channel: ChannelId,
    },

    /// Dummy buffer allocation failed at stream start.
    #[error("Channel {channel}: failed to allocate {bytes}-byte scratch buffer")]
    ScratchExhausted {
        /// Channel being started.
        channel: ChannelId,
        /// Requested scratch size.
        bytes: usize,
    },

    /// Register access failed (bus error, device gone).
    #[error("Register access failed: {0}")]
    Register(String),

    /// One or more channels failed to restart during watchdog recovery.
    ///
    /// Carries every per-channel failure so recovery can be diagnosed as a
    /// whole; siblings that restarted cleanly keep streaming.
    #[error("Recovery failed for {} channel(s)", .0.len())]
    RecoveryFailed(Vec<CaptureError>),
}
