// Location tracking.
//
// Architecture:
// - provider.rs: Geolocation capability (gpsd, fixed, unsupported, scripted)
// - geocode.rs: Reverse geocoding of fixes into readable addresses
// - tracker.rs: Refresh loop publishing the current sample

pub mod geocode;
pub mod provider;
pub mod tracker;

use std::sync::Arc;

pub use geocode::{CoordinateGeocoder, ReverseGeocoder};
pub use provider::{
    FixedGeolocation, GeolocationProvider, GpsdGeolocation, PositionOptions, ScriptedGeolocation,
    UnsupportedGeolocation,
};
pub use tracker::{LocationHandle, LocationTracker, TrackerConfig};

use crate::core::config::LocationSettings;

/// Pick the geolocation backend the settings describe.
pub fn provider_from_settings(settings: &LocationSettings) -> Arc<dyn GeolocationProvider> {
    if let Some(address) = &settings.gpsd_address {
        return Arc::new(GpsdGeolocation::new(address.clone()));
    }
    match (settings.fixed_latitude, settings.fixed_longitude) {
        (Some(latitude), Some(longitude)) => Arc::new(FixedGeolocation::new(latitude, longitude)),
        _ => Arc::new(UnsupportedGeolocation),
    }
}
