//! Geolocation capability.
//!
//! Every variant answers a single `current_position` request; variants that
//! can push fixes on their own also offer `watch_position`. The tracker owns
//! the refresh schedule and the overall timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::core::error::CapabilityUnavailable;
use crate::core::model::Position;

/// Accuracy reported when gpsd gives no error estimate, in meters.
const GPSD_DEFAULT_ACCURACY: f64 = 50.0;

/// How long a high accuracy request waits for a 3D fix once a 2D one is in hand.
const HIGH_ACCURACY_GRACE: Duration = Duration::from_secs(5);

const WATCH_BUFFER: usize = 16;

pub type PositionUpdate = Result<Position, CapabilityUnavailable>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionOptions {
    /// Prefer a 3D fix over the first 2D one
    pub enable_high_accuracy: bool,
    pub timeout: Duration,
    /// Fixes older than this must not be returned. Zero disables reuse of
    /// the last fix and accepts any fix time from the receiver.
    pub maximum_age: Duration,
}

impl PositionOptions {
    fn is_stale(&self, fixed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.maximum_age.is_zero() {
            return false;
        }
        match (now - fixed_at).to_std() {
            Ok(age) => age > self.maximum_age,
            // Fix time in the future: receiver clock ahead of ours
            Err(_) => false,
        }
    }
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            enable_high_accuracy: true,
            timeout: Duration::from_secs(15),
            maximum_age: Duration::ZERO,
        }
    }
}

#[async_trait]
pub trait GeolocationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn current_position(&self, options: &PositionOptions) -> Result<Position, CapabilityUnavailable>;

    /// Start pushing fixes as the device produces them. Returns `None` when
    /// the variant only answers on request or is already watched. Must be
    /// called from within a tokio runtime.
    fn watch_position(&self, _options: &PositionOptions) -> Option<mpsc::Receiver<PositionUpdate>> {
        None
    }
}

pub struct UnsupportedGeolocation;

#[async_trait]
impl GeolocationProvider for UnsupportedGeolocation {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    async fn current_position(&self, _options: &PositionOptions) -> Result<Position, CapabilityUnavailable> {
        Err(CapabilityUnavailable::Unsupported)
    }
}

/// Always reports the configured coordinates.
pub struct FixedGeolocation {
    position: Position,
}

impl FixedGeolocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            position: Position {
                latitude,
                longitude,
                accuracy_meters: 0.0,
            },
        }
    }
}

#[async_trait]
impl GeolocationProvider for FixedGeolocation {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn current_position(&self, _options: &PositionOptions) -> Result<Position, CapabilityUnavailable> {
        Ok(self.position)
    }
}

/// Reads fixes from a gpsd daemon over its JSON socket protocol.
pub struct GpsdGeolocation {
    address: String,
}

/// The subset of a gpsd report we care about. Only `TPV` reports carry positions.
#[derive(Debug, Deserialize)]
struct GpsdReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    /// Estimated horizontal position error (gpsd >= 3.20)
    eph: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
    time: Option<DateTime<Utc>>,
}

impl GpsdReport {
    fn is_3d(&self) -> bool {
        self.mode >= 3
    }

    /// Position of a usable fix report, honoring the freshness limit.
    fn fix(&self, options: &PositionOptions, now: DateTime<Utc>) -> Option<Position> {
        if let Some(time) = self.time {
            if options.is_stale(time, now) {
                log::debug!("Skipping stale gpsd fix from {}", time);
                return None;
            }
        }
        self.position()
    }

    fn position(&self) -> Option<Position> {
        // mode 2 = 2D fix, 3 = 3D fix
        if self.class != "TPV" || self.mode < 2 {
            return None;
        }
        let accuracy_meters = self
            .eph
            .or_else(|| match (self.epx, self.epy) {
                (Some(x), Some(y)) => Some(x.max(y)),
                (x, y) => x.or(y),
            })
            .unwrap_or(GPSD_DEFAULT_ACCURACY);
        Some(Position {
            latitude: self.lat?,
            longitude: self.lon?,
            accuracy_meters,
        })
    }
}

impl GpsdGeolocation {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Connect and enable JSON watch mode.
    async fn open(&self) -> Result<Lines<BufReader<OwnedReadHalf>>, CapabilityUnavailable> {
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            CapabilityUnavailable::PositionUnavailable(format!("gpsd at {}: {}", self.address, e))
        })?;
        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(b"?WATCH={\"enable\":true,\"json\":true};\n")
            .await
            .map_err(|e| CapabilityUnavailable::PositionUnavailable(e.to_string()))?;
        Ok(BufReader::new(reader).lines())
    }
}

fn parse_report(line: &str) -> Option<GpsdReport> {
    match serde_json::from_str::<GpsdReport>(line) {
        Ok(report) => Some(report),
        Err(e) => {
            log::debug!("Skipping unparseable gpsd line: {}", e);
            None
        }
    }
}

fn read_error(e: std::io::Error) -> CapabilityUnavailable {
    CapabilityUnavailable::PositionUnavailable(e.to_string())
}

#[async_trait]
impl GeolocationProvider for GpsdGeolocation {
    fn name(&self) -> &'static str {
        "gpsd"
    }

    async fn current_position(&self, options: &PositionOptions) -> Result<Position, CapabilityUnavailable> {
        let mut lines = self.open().await?;
        // Best 2D fix seen while a high accuracy request waits for 3D
        let mut fallback: Option<Position> = None;
        loop {
            let next = match fallback {
                Some(_) => match timeout(HIGH_ACCURACY_GRACE, lines.next_line()).await {
                    Ok(next) => next.map_err(read_error)?,
                    Err(_) => break,
                },
                None => lines.next_line().await.map_err(read_error)?,
            };
            let Some(line) = next else { break };
            let Some(report) = parse_report(&line) else { continue };
            let Some(position) = report.fix(options, Utc::now()) else { continue };
            if !options.enable_high_accuracy || report.is_3d() {
                return Ok(position);
            }
            fallback = Some(position);
        }
        fallback.ok_or_else(|| {
            CapabilityUnavailable::PositionUnavailable(
                "gpsd closed the connection before reporting a fix".to_string(),
            )
        })
    }

    fn watch_position(&self, options: &PositionOptions) -> Option<mpsc::Receiver<PositionUpdate>> {
        let (sender, receiver) = mpsc::channel(WATCH_BUFFER);
        let provider = Self::new(self.address.clone());
        let options = *options;
        tokio::spawn(async move {
            let mut lines = match provider.open().await {
                Ok(lines) => lines,
                Err(e) => {
                    let _ = sender.send(Err(e)).await;
                    return;
                }
            };
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = sender.send(Err(read_error(e))).await;
                        break;
                    }
                };
                let Some(position) = parse_report(&line).and_then(|r| r.fix(&options, Utc::now())) else {
                    continue;
                };
                if sender.send(Ok(position)).await.is_err() {
                    break;
                }
            }
            log::debug!("gpsd watch at {} ended", provider.address);
        });
        Some(receiver)
    }
}

/// Deterministic provider for tests and demos: answers from a script,
/// optionally after a delay, and counts how often it was asked.
pub struct ScriptedGeolocation {
    script: Mutex<VecDeque<Result<Position, CapabilityUnavailable>>>,
    delay: Duration,
    calls: AtomicUsize,
    updates: Mutex<Option<mpsc::Receiver<PositionUpdate>>>,
}

impl ScriptedGeolocation {
    pub fn new(script: impl IntoIterator<Item = Result<Position, CapabilityUnavailable>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            updates: Mutex::new(None),
        }
    }

    /// Also push fixes: whatever is sent on the returned sender arrives
    /// through `watch_position`.
    pub fn with_updates(mut self) -> (Self, mpsc::Sender<PositionUpdate>) {
        let (sender, receiver) = mpsc::channel(WATCH_BUFFER);
        self.updates = Mutex::new(Some(receiver));
        (self, sender)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeolocationProvider for ScriptedGeolocation {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn current_position(&self, _options: &PositionOptions) -> Result<Position, CapabilityUnavailable> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
        next.unwrap_or_else(|| {
            Err(CapabilityUnavailable::PositionUnavailable(
                "script exhausted".to_string(),
            ))
        })
    }

    fn watch_position(&self, _options: &PositionOptions) -> Option<mpsc::Receiver<PositionUpdate>> {
        self.updates.lock().ok()?.take()
    }
}
