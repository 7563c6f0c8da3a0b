// Emergency alert engine core.
//
// Architecture:
// - model.rs / error.rs: Shared domain types and error taxonomy
// - config.rs: settings.json sections and the config manager
// - contacts/: Contact registry and its JSON store
// - location/: Geolocation capability and the refresh loop
// - motion/: Accelerometer capability and shake detection
// - connectivity.rs: Online/offline tracking
// - alerts/: Alert lifecycle, delivery and the engine task

pub mod alerts;
pub mod config;
pub mod connectivity;
pub mod contacts;
pub mod error;
pub mod location;
pub mod model;
pub mod motion;

#[cfg(test)]
mod sim_test;
