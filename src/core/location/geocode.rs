use async_trait::async_trait;

use crate::core::error::CapabilityUnavailable;
use crate::core::model::Position;

/// Turns a fix into something a person can read in a text message.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn resolve(&self, position: &Position) -> Result<String, CapabilityUnavailable>;
}

/// Offline fallback: the coordinates themselves.
pub struct CoordinateGeocoder;

#[async_trait]
impl ReverseGeocoder for CoordinateGeocoder {
    async fn resolve(&self, position: &Position) -> Result<String, CapabilityUnavailable> {
        Ok(position.coordinates_label())
    }
}
