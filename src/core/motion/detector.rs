//! Shake detection over a raw accelerometer stream.
//!
//! O(1) per sample: the detector only remembers the last accepted sample.

use std::time::Duration;

use crate::core::config::MotionSettings;
use crate::core::model::{MotionSample, RawMotionSample};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionConfig {
    pub threshold: f64,
    /// Samples closer than this to the last accepted one are dropped
    pub debounce: Duration,
    pub scale: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            threshold: 15.0,
            debounce: Duration::from_millis(100),
            scale: 1.0,
        }
    }
}

impl From<&MotionSettings> for MotionConfig {
    fn from(settings: &MotionSettings) -> Self {
        Self {
            threshold: settings.threshold,
            debounce: Duration::from_millis(settings.debounce_ms),
            scale: settings.scale,
        }
    }
}

/// Emitted when a shake crosses the threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerDetected {
    pub timestamp: Duration,
    pub speed: f64,
}

#[derive(Debug)]
pub struct MotionTriggerDetector {
    config: MotionConfig,
    last: Option<MotionSample>,
}

impl MotionTriggerDetector {
    pub fn new(config: MotionConfig) -> Self {
        Self { config, last: None }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Feed one raw sample. Malformed samples and samples inside the debounce
    /// window are dropped without touching the detector state.
    pub fn observe(&mut self, raw: &RawMotionSample) -> Option<TriggerDetected> {
        let sample = raw.validated()?;
        let Some(last) = self.last else {
            self.last = Some(sample);
            return None;
        };

        // Out-of-order timestamps count as "too soon"
        let elapsed = sample.timestamp.checked_sub(last.timestamp)?;
        if elapsed.is_zero() || elapsed < self.config.debounce {
            return None;
        }

        let delta = (sample.magnitude_sum() - last.magnitude_sum()).abs();
        let speed = delta / elapsed.as_secs_f64() * self.config.scale;
        self.last = Some(sample);

        if speed > self.config.threshold {
            log::debug!("Shake detected: speed {:.1} at {:?}", speed, sample.timestamp);
            Some(TriggerDetected {
                timestamp: sample.timestamp,
                speed,
            })
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
