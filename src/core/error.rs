//! Error taxonomy for the alert engine.
//!
//! None of these reach the presentation layer raw: validation errors go back
//! to the contact form, capability errors degrade to sentinel values, dispatch
//! failures end up as per-contact statuses and trigger rejections as states.

use thiserror::Error;

use super::model::ContactId;

/// Malformed contact data, rejected by the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Contact name is required")]
    EmptyName,

    #[error("Phone number is required")]
    EmptyPhone,

    #[error("Phone number {0:?} is not in E.164 format (e.g. +1234567890)")]
    InvalidPhone(String),

    #[error("Phone number {0} already belongs to another contact")]
    DuplicatePhone(String),

    #[error("Unknown contact {0}")]
    UnknownContact(ContactId),
}

/// A sensor or geolocation capability that is missing or refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityUnavailable {
    #[error("not supported on this device")]
    Unsupported,

    #[error("permission denied")]
    PermissionDenied,

    #[error("timed out")]
    Timeout,

    #[error("position unavailable: {0}")]
    PositionUnavailable(String),
}

/// One failed delivery attempt to one contact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    /// Network unreachable; worth retrying once connectivity returns.
    #[error("Delivery channel unreachable: {0}")]
    Unreachable(String),

    #[error("Delivery timed out")]
    Timeout,

    /// Channel answered but could not deliver right now (5xx, throttling, success=false).
    #[error("Delivery failed: {0}")]
    Transient(String),

    /// Channel refused the request; retrying will not help.
    #[error("Delivery rejected: {0}")]
    Rejected(String),
}

impl DispatchFailure {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Why `trigger()` or `run_practice_alert()` did not start a session.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerRejected {
    #[error("No emergency contacts configured")]
    NoContacts,

    #[error("An alert is already in progress")]
    AlertInProgress,
}

/// The engine task has stopped and no longer accepts events.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Alert engine is no longer running")]
pub struct EngineClosed;
