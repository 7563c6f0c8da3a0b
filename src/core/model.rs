use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier handed out by the contact registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(pub u64);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: ContactId,
    pub name: String,
    /// E.164 formatted, e.g. "+15551234567"
    pub phone: String,
    pub primary: bool,
    /// Free-form label shown on contact cards ("Family", "Friend", ...)
    #[serde(default)]
    pub relationship: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyType {
    #[default]
    Personal,
    Medical,
    Safety,
}

impl EmergencyType {
    pub fn all() -> &'static [EmergencyType] {
        &[Self::Personal, Self::Medical, Self::Safety]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Personal => "Personal Emergency",
            Self::Medical => "Medical Emergency",
            Self::Safety => "Safety Concern",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "personal" => Some(Self::Personal),
            "medical" => Some(Self::Medical),
            "safety" => Some(Self::Safety),
            _ => None,
        }
    }
}

/// What started an alert countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Motion,
}

/// A geographic fix as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
}

impl Position {
    /// "lat, lng" with six decimals.
    pub fn coordinates_label(&self) -> String {
        format!("{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum ResolvedAddress {
    Pending,
    Resolved(String),
    Unavailable(String),
}

/// The tracker's current location estimate. Published whole, never patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub position: Option<Position>,
    pub captured_at: DateTime<Utc>,
    pub resolved_address: ResolvedAddress,
}

impl LocationSample {
    pub fn fix(position: Position, captured_at: DateTime<Utc>) -> Self {
        Self {
            position: Some(position),
            captured_at,
            resolved_address: ResolvedAddress::Pending,
        }
    }

    /// Placeholder before the first fix attempt completes.
    pub fn acquiring(captured_at: DateTime<Utc>) -> Self {
        Self {
            position: None,
            captured_at,
            resolved_address: ResolvedAddress::Pending,
        }
    }

    /// Sentinel published when no fix could be obtained.
    pub fn unavailable(reason: impl Into<String>, captured_at: DateTime<Utc>) -> Self {
        Self {
            position: None,
            captured_at,
            resolved_address: ResolvedAddress::Unavailable(reason.into()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.position.is_some()
    }

    /// Best human-readable rendering for an outgoing alert.
    pub fn describe(&self) -> String {
        match (&self.resolved_address, &self.position) {
            (ResolvedAddress::Resolved(address), _) => address.clone(),
            (_, Some(position)) => position.coordinates_label(),
            (ResolvedAddress::Unavailable(reason), None) => {
                format!("location unavailable ({})", reason)
            }
            (ResolvedAddress::Pending, None) => "location pending".to_string(),
        }
    }
}

/// Raw accelerometer reading as delivered by a sensor. Axes may be missing
/// when the platform reports partial data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawMotionSample {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    /// Sensor clock, monotonic
    pub timestamp: Duration,
}

impl RawMotionSample {
    pub fn new(x: f64, y: f64, z: f64, timestamp: Duration) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            z: Some(z),
            timestamp,
        }
    }

    /// Returns a well-formed sample, or None when any axis is missing or non-finite.
    pub fn validated(&self) -> Option<MotionSample> {
        let (x, y, z) = (self.x?, self.y?, self.z?);
        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            return None;
        }
        Some(MotionSample {
            x,
            y,
            z,
            timestamp: self.timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: Duration,
}

impl MotionSample {
    pub fn magnitude_sum(&self) -> f64 {
        self.x + self.y + self.z
    }
}
