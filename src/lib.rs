//! # Capture Buffer Scheduler
//!
//! Buffer scheduling for a hardware image-sensor capture engine. The
//! hardware exposes two (on some revisions three) frame-slot registers per
//! channel and raises an interrupt at every frame boundary; this crate
//! decides which DMA buffer each slot points at, keeps the slots valid under
//! consumer starvation via a shared dummy scratch buffer, correlates
//! multi-exposure (HDR) sibling channels into atomic frame groups, and
//! recovers wedged hardware through a completion-counter watchdog.
//!
//! All hardware access goes through the traits in [`hal`], so the entire
//! scheduling core runs and is tested without a device (the default `mock`
//! feature provides recording implementations). Timestamps are supplied by
//! the caller on every frame boundary; the core never reads a clock.
//!
//! ## Module Structure
//!
//! - **`engine`**: [`engine::CaptureEngine`], the public entry point tying
//!   everything together: start/stop, the frame-boundary hot path, the
//!   watchdog tick, and buffer enqueue.
//! - **`buffer`**: DMA buffer and delivered-frame types, exposure tiers.
//! - **`channel`**: Per-channel state: slot bindings, routing modes,
//!   counters, configuration.
//! - **`assign`**: The ping-pong slot assigner: retire, rebind, dummy
//!   fallback, early update.
//! - **`rotation`**: Rotation-health classification and the early-update
//!   authorization gate.
//! - **`hdr`**: Multi-exposure frame correlation.
//! - **`watchdog`**: Stall and protocol-fault detection driving recovery.
//! - **`notify`**: Bounded per-channel delivery FIFOs and their workers.
//! - **`hal`**: Hardware collaborator traits ([`hal::RegisterMap`],
//!   [`hal::SensorTiming`], [`hal::ScratchAlloc`], [`hal::FrameSink`]).
//! - **`config`**: Tunable timing and depth parameters, loadable from TOML.
//! - **`error`**: [`error::CaptureError`].
//!
//! Pool plumbing (the lock-free per-channel buffer queue) lives in the
//! `capture-pool` workspace crate.

mod assign;

pub mod buffer;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod hal;
pub mod hdr;
pub mod notify;
pub mod rotation;
pub mod watchdog;

pub use buffer::{CaptureBuffer, DeliveredFrame, DmaAddr, ExposureTier};
pub use channel::{
    ChannelConfig, ChannelId, ChannelStats, FramePhase, Geometry, RoutingMode, SlotIndex,
};
pub use config::SchedConfig;
pub use engine::{CaptureEngine, EngineStats};
pub use error::{CaptureError, CaptureResult};
