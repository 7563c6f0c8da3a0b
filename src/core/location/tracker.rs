//! Keeps the freshest location estimate available to the engine.
//!
//! The current sample lives in a `watch` channel: every publish swaps the
//! whole value, so readers only ever see complete samples. Providers that
//! push fixes on their own are published as they arrive, between polls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use super::geocode::ReverseGeocoder;
use super::provider::{GeolocationProvider, PositionOptions, PositionUpdate};
use crate::core::config::LocationSettings;
use crate::core::error::CapabilityUnavailable;
use crate::core::model::{LocationSample, Position, ResolvedAddress};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    pub refresh_interval: Duration,
    pub options: PositionOptions,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            options: PositionOptions::default(),
        }
    }
}

impl From<&LocationSettings> for TrackerConfig {
    fn from(settings: &LocationSettings) -> Self {
        Self {
            refresh_interval: Duration::from_secs(settings.refresh_seconds.max(1)),
            options: PositionOptions {
                enable_high_accuracy: settings.enable_high_accuracy,
                timeout: Duration::from_secs(settings.timeout_seconds),
                maximum_age: Duration::from_secs(settings.maximum_age_seconds),
            },
        }
    }
}

/// Read side of the tracker, cheap to clone.
#[derive(Clone)]
pub struct LocationHandle {
    samples: watch::Receiver<LocationSample>,
    refresh: Arc<Notify>,
    in_flight: Arc<AtomicBool>,
}

impl LocationHandle {
    pub fn current(&self) -> LocationSample {
        self.samples.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LocationSample> {
        self.samples.clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Ask for a new fix now. Returns false when a refresh is already in
    /// flight; that refresh absorbs the request.
    pub fn request_refresh(&self) -> bool {
        if self.is_refreshing() {
            log::debug!("Location refresh already in flight, coalescing request");
            return false;
        }
        self.refresh.notify_one();
        true
    }
}

pub struct LocationTracker {
    provider: Arc<dyn GeolocationProvider>,
    geocoder: Arc<dyn ReverseGeocoder>,
    config: TrackerConfig,
    sample_tx: watch::Sender<LocationSample>,
    refresh: Arc<Notify>,
    in_flight: Arc<AtomicBool>,
}

impl LocationTracker {
    pub fn new(
        provider: Arc<dyn GeolocationProvider>,
        geocoder: Arc<dyn ReverseGeocoder>,
        config: TrackerConfig,
    ) -> (Self, LocationHandle) {
        let (sample_tx, samples) = watch::channel(LocationSample::acquiring(Utc::now()));
        let refresh = Arc::new(Notify::new());
        let in_flight = Arc::new(AtomicBool::new(false));
        let handle = LocationHandle {
            samples,
            refresh: Arc::clone(&refresh),
            in_flight: Arc::clone(&in_flight),
        };
        (
            Self {
                provider,
                geocoder,
                config,
                sample_tx,
                refresh,
                in_flight,
            },
            handle,
        )
    }

    /// Activate: take a fix immediately, then every refresh interval or on request.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        log::info!(
            "Location tracking started using {} provider (refresh every {:?})",
            self.provider.name(),
            self.config.refresh_interval
        );
        let mut ticker = interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let refresh = Arc::clone(&self.refresh);
        let mut updates = self.provider.watch_position(&self.config.options);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_once().await,
                _ = refresh.notified() => {
                    ticker.reset();
                    self.refresh_once().await;
                }
                update = next_update(&mut updates) => match update {
                    Some(Ok(position)) => self.publish_fix(position).await,
                    // Failures on the push stream leave the last fix alone; the next poll reports them
                    Some(Err(e)) => log::debug!("Location watch error: {}", e),
                    None => {
                        log::debug!("Location watch ended, polling only");
                        updates = None;
                    }
                },
            }
            if self.sample_tx.is_closed() {
                log::debug!("All location readers gone, stopping tracker");
                break;
            }
        }
    }

    /// One full refresh: acquire a fix, publish it, then resolve its address.
    ///
    /// With a non-zero `maximum_age`, a fix younger than that is kept and the
    /// provider is not asked.
    pub async fn refresh_once(&self) {
        self.in_flight.store(true, Ordering::SeqCst);
        let options = self.config.options;

        if self.current_fix_is_fresh(&options) {
            log::debug!("Reusing location fix younger than {:?}", options.maximum_age);
            self.in_flight.store(false, Ordering::SeqCst);
            return;
        }

        let acquired = match timeout(options.timeout, self.provider.current_position(&options)).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityUnavailable::Timeout),
        };

        match acquired {
            Ok(position) => self.publish_fix(position).await,
            Err(e) => {
                log::warn!("Location unavailable: {}", e);
                self.sample_tx
                    .send_replace(LocationSample::unavailable(e.to_string(), Utc::now()));
            }
        }

        self.in_flight.store(false, Ordering::SeqCst);
    }

    fn current_fix_is_fresh(&self, options: &PositionOptions) -> bool {
        if options.maximum_age.is_zero() {
            return false;
        }
        let current = self.sample_tx.borrow();
        current.position.is_some()
            && (Utc::now() - current.captured_at)
                .to_std()
                .is_ok_and(|age| age <= options.maximum_age)
    }

    async fn publish_fix(&self, position: Position) {
        let timeout_limit = self.config.options.timeout;
        let sample = LocationSample::fix(position, Utc::now());
        let captured_at = sample.captured_at;
        self.sample_tx.send_replace(sample);
        log::debug!("Location fix {} (±{:.0}m)", position.coordinates_label(), position.accuracy_meters);

        let address = match timeout(timeout_limit, self.geocoder.resolve(&position)).await {
            Ok(Ok(address)) => ResolvedAddress::Resolved(address),
            Ok(Err(e)) => ResolvedAddress::Unavailable(e.to_string()),
            Err(_) => ResolvedAddress::Unavailable(CapabilityUnavailable::Timeout.to_string()),
        };
        // Only complete the fix we started from; a newer one wins
        self.sample_tx.send_if_modified(|current| {
            if current.captured_at == captured_at && current.position == Some(position) {
                current.resolved_address = address;
                true
            } else {
                false
            }
        });
    }
}

/// Next pushed fix, or never when the provider does not push.
async fn next_update(updates: &mut Option<mpsc::Receiver<PositionUpdate>>) -> Option<PositionUpdate> {
    match updates {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::location::geocode::CoordinateGeocoder;
    use crate::core::location::provider::{ScriptedGeolocation, UnsupportedGeolocation};
    use crate::core::model::Position;
    use async_trait::async_trait;

    const DENVER: Position = Position {
        latitude: 39.7392,
        longitude: -104.9903,
        accuracy_meters: 10.0,
    };

    struct GatedGeocoder {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ReverseGeocoder for GatedGeocoder {
        async fn resolve(&self, _position: &Position) -> Result<String, CapabilityUnavailable> {
            self.gate.notified().await;
            Ok("Denver, CO".to_string())
        }
    }

    struct GatedProvider {
        gate: Arc<Notify>,
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl GeolocationProvider for GatedProvider {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn current_position(&self, _options: &PositionOptions) -> Result<Position, CapabilityUnavailable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(DENVER)
        }
    }

    #[tokio::test]
    async fn test_fix_then_address() {
        let gate = Arc::new(Notify::new());
        let (tracker, handle) = LocationTracker::new(
            Arc::new(ScriptedGeolocation::new(vec![Ok(DENVER)])),
            Arc::new(GatedGeocoder { gate: Arc::clone(&gate) }),
            TrackerConfig::default(),
        );
        let mut rx = handle.subscribe();
        let task = tokio::spawn(async move { tracker.refresh_once().await });

        rx.changed().await.unwrap();
        let pending = rx.borrow_and_update().clone();
        assert_eq!(pending.position, Some(DENVER));
        assert_eq!(pending.resolved_address, ResolvedAddress::Pending);

        gate.notify_one();
        rx.changed().await.unwrap();
        let resolved = rx.borrow_and_update().clone();
        assert_eq!(resolved.position, Some(DENVER));
        assert_eq!(resolved.captured_at, pending.captured_at);
        assert_eq!(
            resolved.resolved_address,
            ResolvedAddress::Resolved("Denver, CO".to_string())
        );
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_publishes_sentinel() {
        let (tracker, handle) = LocationTracker::new(
            Arc::new(UnsupportedGeolocation),
            Arc::new(CoordinateGeocoder),
            TrackerConfig::default(),
        );
        tracker.refresh_once().await;
        let sample = handle.current();
        assert!(!sample.is_available());
        assert_eq!(
            sample.resolved_address,
            ResolvedAddress::Unavailable("not supported on this device".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fix_times_out() {
        let provider = ScriptedGeolocation::new(vec![Ok(DENVER)]).with_delay(Duration::from_secs(30));
        let (tracker, handle) = LocationTracker::new(
            Arc::new(provider),
            Arc::new(CoordinateGeocoder),
            TrackerConfig::default(),
        );
        tracker.refresh_once().await;
        assert_eq!(
            handle.current().resolved_address,
            ResolvedAddress::Unavailable("timed out".to_string())
        );
        assert!(!handle.is_refreshing());
    }

    #[tokio::test]
    async fn test_refresh_requests_coalesce_while_in_flight() {
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (tracker, handle) = LocationTracker::new(
            Arc::new(GatedProvider {
                gate: Arc::clone(&gate),
                calls: Arc::clone(&calls),
            }),
            Arc::new(CoordinateGeocoder),
            TrackerConfig::default(),
        );
        let tracker = Arc::new(tracker);
        let task = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.refresh_once().await })
        };
        while !handle.is_refreshing() {
            tokio::task::yield_now().await;
        }

        assert!(!handle.request_refresh());
        assert!(!handle.request_refresh());

        gate.notify_one();
        task.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.current().is_available());
        assert!(handle.request_refresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushed_fixes_publish_between_polls() {
        let moved = Position {
            latitude: 39.75,
            longitude: -105.0,
            accuracy_meters: 5.0,
        };
        let (provider, updates) = ScriptedGeolocation::new(vec![Ok(DENVER)]).with_updates();
        let provider = Arc::new(provider);
        let (tracker, handle) = LocationTracker::new(
            Arc::clone(&provider) as Arc<dyn GeolocationProvider>,
            Arc::new(CoordinateGeocoder),
            TrackerConfig::default(),
        );
        let mut rx = handle.subscribe();
        let task = tracker.spawn();

        while rx.borrow_and_update().position != Some(DENVER) {
            rx.changed().await.unwrap();
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        updates.send(Ok(moved)).await.unwrap();
        // A push error keeps the last good fix
        updates
            .send(Err(CapabilityUnavailable::PositionUnavailable("lost lock".to_string())))
            .await
            .unwrap();
        while rx.borrow_and_update().position != Some(moved) {
            rx.changed().await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let sample = handle.current();
        assert_eq!(sample.position, Some(moved));
        assert!(matches!(sample.resolved_address, ResolvedAddress::Resolved(_)));
        assert_eq!(provider.calls(), 1);
        task.abort();
    }

    #[tokio::test]
    async fn test_fresh_fix_is_reused_within_maximum_age() {
        let provider = Arc::new(ScriptedGeolocation::new(vec![Ok(DENVER), Ok(DENVER)]));
        let config = TrackerConfig {
            options: PositionOptions {
                maximum_age: Duration::from_secs(3600),
                ..PositionOptions::default()
            },
            ..TrackerConfig::default()
        };
        let (tracker, handle) = LocationTracker::new(
            Arc::clone(&provider) as Arc<dyn GeolocationProvider>,
            Arc::new(CoordinateGeocoder),
            config,
        );
        tracker.refresh_once().await;
        tracker.refresh_once().await;
        assert_eq!(provider.calls(), 1);
        assert!(handle.current().is_available());
        assert!(!handle.is_refreshing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh() {
        let provider = Arc::new(ScriptedGeolocation::new(vec![
            Err(CapabilityUnavailable::PermissionDenied),
            Ok(DENVER),
        ]));
        let (tracker, handle) = LocationTracker::new(
            Arc::clone(&provider) as Arc<dyn GeolocationProvider>,
            Arc::new(CoordinateGeocoder),
            TrackerConfig::default(),
        );
        let mut rx = handle.subscribe();
        let task = tracker.spawn();

        // Immediate first attempt fails
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().is_available());

        // Sixty seconds later the next attempt succeeds
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(handle.current().is_available());
        assert_eq!(provider.calls(), 2);
        task.abort();
    }
}
