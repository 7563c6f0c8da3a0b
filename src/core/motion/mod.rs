// Shake-to-alert support.
//
// Architecture:
// - detector.rs: Debounced threshold detector over raw samples
// - sensor.rs: Motion capability (IIO accelerometer, channel-fed, unsupported)
//
// The bridge below is the only link to the engine: it turns detections into
// motion-sourced triggers and never looks at alert state itself.

pub mod detector;
pub mod sensor;

use tokio::task::JoinHandle;

pub use detector::{MotionConfig, MotionTriggerDetector, TriggerDetected};
pub use sensor::{ChannelMotionSensor, IioAccelerometer, MotionFeed, MotionSensor, UnsupportedMotionSensor};

use crate::core::alerts::engine::EngineHandle;
use crate::core::model::{EmergencyType, TriggerSource};

/// Forward shake detections from `sensor` into the engine as motion triggers.
///
/// Returns `None` when the device has no motion capability.
pub fn spawn_motion_bridge(
    sensor: &dyn MotionSensor,
    mut detector: MotionTriggerDetector,
    engine: EngineHandle,
    emergency_type: EmergencyType,
    message: String,
) -> Option<JoinHandle<()>> {
    let Some(mut samples) = sensor.subscribe() else {
        log::info!("Motion sensor unavailable, shake trigger disabled");
        return None;
    };
    log::info!("Shake trigger armed using {} sensor", sensor.name());

    Some(tokio::spawn(async move {
        while let Some(raw) = samples.recv().await {
            if let Some(detected) = detector.observe(&raw) {
                log::info!("Shake trigger at {:?} (speed {:.1})", detected.timestamp, detected.speed);
                if engine
                    .trigger(TriggerSource::Motion, emergency_type, message.clone())
                    .is_err()
                {
                    break;
                }
            }
        }
        log::debug!("Motion bridge stopped");
    }))
}
