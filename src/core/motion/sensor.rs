//! Motion-sensor capability.
//!
//! A missing sensor is a normal condition: `subscribe` simply returns `None`
//! and the manual button remains the only trigger.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::core::error::CapabilityUnavailable;
use crate::core::model::RawMotionSample;

const SAMPLE_BUFFER: usize = 64;

pub trait MotionSensor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start delivering samples. Returns `None` when the capability is absent
    /// or already subscribed. Must be called from within a tokio runtime.
    fn subscribe(&self) -> Option<mpsc::Receiver<RawMotionSample>>;
}

/// No accelerometer on this device.
pub struct UnsupportedMotionSensor;

impl MotionSensor for UnsupportedMotionSensor {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn subscribe(&self) -> Option<mpsc::Receiver<RawMotionSample>> {
        None
    }
}

/// Sensor fed by hand through a [`MotionFeed`]. Used by hosts that receive
/// samples from elsewhere and by tests that need deterministic input.
pub struct ChannelMotionSensor {
    receiver: Mutex<Option<mpsc::Receiver<RawMotionSample>>>,
}

#[derive(Clone)]
pub struct MotionFeed {
    sender: mpsc::Sender<RawMotionSample>,
}

impl MotionFeed {
    /// Returns false once the subscriber has gone away.
    pub async fn push(&self, sample: RawMotionSample) -> bool {
        self.sender.send(sample).await.is_ok()
    }
}

impl ChannelMotionSensor {
    pub fn pair() -> (Self, MotionFeed) {
        let (sender, receiver) = mpsc::channel(SAMPLE_BUFFER);
        (
            Self {
                receiver: Mutex::new(Some(receiver)),
            },
            MotionFeed { sender },
        )
    }
}

impl MotionSensor for ChannelMotionSensor {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn subscribe(&self) -> Option<mpsc::Receiver<RawMotionSample>> {
        self.receiver.lock().ok()?.take()
    }
}

/// Linux Industrial I/O accelerometer, polled through sysfs.
///
/// Reads `in_accel_{x,y,z}_raw` and multiplies by `in_accel_scale` when the
/// driver exposes one.
pub struct IioAccelerometer {
    device_dir: PathBuf,
    poll_interval: Duration,
}

impl IioAccelerometer {
    pub fn probe(device_dir: impl AsRef<Path>, poll_interval: Duration) -> Result<Self, CapabilityUnavailable> {
        let device_dir = device_dir.as_ref().to_path_buf();
        let has_axes = ["x", "y", "z"]
            .iter()
            .all(|axis| device_dir.join(format!("in_accel_{}_raw", axis)).is_file());
        if !has_axes {
            return Err(CapabilityUnavailable::Unsupported);
        }
        Ok(Self {
            device_dir,
            poll_interval,
        })
    }
}

impl MotionSensor for IioAccelerometer {
    fn name(&self) -> &'static str {
        "iio"
    }

    fn subscribe(&self) -> Option<mpsc::Receiver<RawMotionSample>> {
        let (sender, receiver) = mpsc::channel(SAMPLE_BUFFER);
        let device_dir = self.device_dir.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let sample = read_iio_sample(&device_dir, started.elapsed()).await;
                if sender.send(sample).await.is_err() {
                    log::debug!("IIO accelerometer subscriber dropped, stopping poll");
                    break;
                }
            }
        });
        Some(receiver)
    }
}

async fn read_iio_value(path: PathBuf) -> Option<f64> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    content.trim().parse().ok()
}

/// Unreadable axes come back as `None`; the detector discards such samples.
async fn read_iio_sample(device_dir: &Path, timestamp: Duration) -> RawMotionSample {
    let scale = read_iio_value(device_dir.join("in_accel_scale"))
        .await
        .unwrap_or(1.0);
    let x = read_iio_value(device_dir.join("in_accel_x_raw")).await;
    let y = read_iio_value(device_dir.join("in_accel_y_raw")).await;
    let z = read_iio_value(device_dir.join("in_accel_z_raw")).await;
    RawMotionSample {
        x: x.map(|v| v * scale),
        y: y.map(|v| v * scale),
        z: z.map(|v| v * scale),
        timestamp,
    }
}
