//! Session configuration
//!
//! Built from CLI flags by the binary, or directly by embedders. Serializable
//! so a session's settings can be recorded next to its summary.

use crate::domain::SamplerError;
use crate::profiler::TimerConfig;
use serde::{Deserialize, Serialize};
use sigsampler_common::tracers;
use std::time::Duration;

/// Detection intervals below this are raised to it
pub const MIN_THREAD_DETECT_INTERVAL_MS: u32 = 7;

pub const DEFAULT_SAMPLING_RATE_MS: u32 = 11;
pub const DEFAULT_THREAD_DETECT_INTERVAL_MS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Requested tracer bits; intersected with the available tracers
    pub tracers: u32,
    pub sampling_rate_ms: u32,
    pub thread_detect_interval_ms: u32,
    /// Sample on elapsed time instead of thread CPU time (whitelisted threads only)
    pub wall_clock_mode: bool,
    /// Thread ids whitelisted for the duration of the session
    pub whitelist: Vec<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            tracers: tracers::NATIVE,
            sampling_rate_ms: DEFAULT_SAMPLING_RATE_MS,
            thread_detect_interval_ms: DEFAULT_THREAD_DETECT_INTERVAL_MS,
            wall_clock_mode: false,
            whitelist: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// # Errors
    /// `InvalidConfig` for a zero sampling rate
    pub fn validate(&self) -> Result<(), SamplerError> {
        if self.sampling_rate_ms == 0 {
            return Err(SamplerError::InvalidConfig("sampling rate must be at least 1 ms".into()));
        }
        Ok(())
    }

    pub fn sampling_rate(&self) -> Duration {
        Duration::from_millis(u64::from(self.sampling_rate_ms))
    }

    /// Detection interval, floored at [`MIN_THREAD_DETECT_INTERVAL_MS`]
    pub fn thread_detect_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.thread_detect_interval_ms.max(MIN_THREAD_DETECT_INTERVAL_MS)))
    }

    pub fn timer_config(&self) -> TimerConfig {
        TimerConfig {
            thread_detect_interval: self.thread_detect_interval(),
            sampling_rate: self.sampling_rate(),
            wall_clock: self.wall_clock_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_interval_floor() {
        let config = SessionConfig { thread_detect_interval_ms: 1, ..SessionConfig::default() };
        assert_eq!(config.thread_detect_interval(), Duration::from_millis(7));
        let config = SessionConfig { thread_detect_interval_ms: 250, ..SessionConfig::default() };
        assert_eq!(config.timer_config().thread_detect_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_zero_rate_rejected() {
        let config = SessionConfig { sampling_rate_ms: 0, ..SessionConfig::default() };
        assert!(matches!(config.validate(), Err(SamplerError::InvalidConfig(_))));
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"sampling_rate_ms": 5, "wall_clock_mode": true}"#).unwrap();
        assert_eq!(config.sampling_rate_ms, 5);
        assert!(config.wall_clock_mode);
        assert_eq!(config.tracers, tracers::NATIVE);
        assert_eq!(config.thread_detect_interval_ms, DEFAULT_THREAD_DETECT_INTERVAL_MS);
    }
}
