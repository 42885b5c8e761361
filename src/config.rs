//! Scheduler configuration.
//!
//! Timing margins here are hardware- and sensor-dependent, which is exactly
//! why they are configuration and not constants: the early-update window in
//! particular was tuned per hardware revision in the systems this scheduler
//! is modeled on. Values load from a TOML file via the `config` crate, with
//! durations written human-style (`"500us"`, `"2s"`).

use crate::error::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunable parameters for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedConfig {
    /// Safety margin subtracted from the vertical-blank window when deciding
    /// whether an early slot update may still land before the next readout.
    #[serde(with = "humantime_serde")]
    pub early_update_margin: Duration,

    /// Watchdog ticks without completion progress before a stall is declared.
    pub monitor_cycles: u32,

    /// Consecutive odd/even tick pairs with protocol faults before the
    /// watchdog escalates to reset.
    pub protocol_fault_pairs: u32,

    /// Depth of the per-channel deferred delivery FIFO.
    pub notify_queue_depth: usize,

    /// How long a synchronous `stop` waits for the frame-boundary handler to
    /// observe the stopping flag before forcing DMA off.
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,

    /// Frame interval assumed until the physical layer has measured one.
    #[serde(with = "humantime_serde")]
    pub fallback_frame_interval: Duration,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            early_update_margin: Duration::from_micros(500),
            monitor_cycles: 3,
            protocol_fault_pairs: 2,
            notify_queue_depth: 32,
            stop_timeout: Duration::from_millis(100),
            fallback_frame_interval: Duration::from_millis(33),
        }
    }
}

impl SchedConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    pub fn from_file(path: &Path) -> CaptureResult<Self> {
        let cfg: SchedConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> CaptureResult<()> {
        if self.early_update_margin.is_zero() {
            return Err(CaptureError::Configuration(
                "early_update_margin must be non-zero".into(),
            ));
        }
        if self.monitor_cycles == 0 {
            return Err(CaptureError::Configuration(
                "monitor_cycles must be at least 1".into(),
            ));
        }
        if self.protocol_fault_pairs == 0 {
            return Err(CaptureError::Configuration(
                "protocol_fault_pairs must be at least 1".into(),
            ));
        }
        if self.notify_queue_depth == 0 {
            return Err(CaptureError::Configuration(
                "notify_queue_depth must be at least 1".into(),
            ));
        }
        if self.fallback_frame_interval.is_zero() {
            return Err(CaptureError::Configuration(
                "fallback_frame_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        SchedConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_margin_rejected() {
        let cfg = SchedConfig {
            early_update_margin: Duration::ZERO,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("early_update_margin"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "early_update_margin = \"250us\"\nmonitor_cycles = 5\nstop_timeout = \"50ms\""
        )
        .unwrap();

        let cfg = SchedConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.early_update_margin, Duration::from_micros(250));
        assert_eq!(cfg.monitor_cycles, 5);
        assert_eq!(cfg.stop_timeout, Duration::from_millis(50));
        // Unspecified fields keep defaults
        assert_eq!(cfg.notify_queue_depth, 32);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "monitor_cycles = 0").unwrap();

        assert!(SchedConfig::from_file(file.path()).is_err());
    }
}
