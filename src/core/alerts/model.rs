// Alert model types shared by the state machine, dispatcher and presentation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::model::{ContactId, EmergencyType, LocationSample};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Idle,
    /// Trigger attempted with no contacts; stays until contacts exist
    BlockedNoContacts,
    CountingDown,
    Sending,
    Sent,
}

impl AlertState {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Idle => "Ready",
            Self::BlockedNoContacts => "Add an emergency contact first",
            Self::CountingDown => "Sending alert soon",
            Self::Sending => "Sending alert",
            Self::Sent => "Alert sent",
        }
    }

    /// States in which a new trigger is refused.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::CountingDown | Self::Sending | Self::Sent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Live,
    /// Rehearsal: delivery is simulated, no external channel is contacted
    Practice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed { retry_count: u32 },
    Abandoned,
}

impl DeliveryStatus {
    /// Sent and abandoned are final.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Sent | Self::Abandoned)
    }
}

/// Frozen content of an alert at the moment it starts sending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertPayload {
    pub session: SessionId,
    pub emergency_type: EmergencyType,
    pub message: String,
    pub location: LocationSample,
}

/// One delivery attempt to one contact.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    pub session: SessionId,
    pub contact_id: ContactId,
    pub contact_name: String,
    pub contact_phone: String,
    /// 1 for the first attempt
    pub attempt: u32,
    pub payload: Arc<AlertPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactDelivery {
    pub contact_id: ContactId,
    pub name: String,
    pub status: DeliveryStatus,
}

/// What the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertView {
    pub state: AlertState,
    pub countdown_remaining: Option<u32>,
    pub emergency_type: Option<EmergencyType>,
    pub mode: Option<SessionMode>,
    /// Snapshot order; empty until the alert starts sending
    pub deliveries: Vec<ContactDelivery>,
}

impl Default for AlertView {
    fn default() -> Self {
        Self {
            state: AlertState::Idle,
            countdown_remaining: None,
            emergency_type: None,
            mode: None,
            deliveries: Vec::new(),
        }
    }
}
