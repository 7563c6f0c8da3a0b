// Delivery channel: how one alert reaches one contact.
//
// The engine wraps every call in its own timeout and feeds the result back
// as an event, so implementations only need to make a single attempt.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::model::DeliveryRequest;
use crate::core::config::DispatchSettings;
use crate::core::error::DispatchFailure;
use crate::core::model::EmergencyType;

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<(), DispatchFailure>;
}

/// Call-initiation request understood by the backend.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CallRequest<'a> {
    to: &'a str,
    contact_name: &'a str,
    emergency_type: EmergencyType,
    message: &'a str,
    location: CallLocation,
    attempt: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CallLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
    accuracy_meters: Option<f64>,
    description: String,
}

#[derive(Debug, Deserialize)]
struct CallResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Places calls through an HTTP backend (`POST {endpoint}`).
pub struct HttpCallChannel {
    client: Client,
    endpoint: String,
}

impl HttpCallChannel {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn from_settings(settings: &DispatchSettings) -> Result<Self, reqwest::Error> {
        Self::new(
            settings.endpoint.clone(),
            Duration::from_secs(settings.request_timeout_seconds.max(1)),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DeliveryChannel for HttpCallChannel {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<(), DispatchFailure> {
        let payload = &request.payload;
        let position = payload.location.position;
        let body = CallRequest {
            to: &request.contact_phone,
            contact_name: &request.contact_name,
            emergency_type: payload.emergency_type,
            message: &payload.message,
            location: CallLocation {
                latitude: position.map(|p| p.latitude),
                longitude: position.map(|p| p.longitude),
                accuracy_meters: position.map(|p| p.accuracy_meters),
                description: payload.location.describe(),
            },
            attempt: request.attempt,
        };

        log::debug!(
            "POST {} for contact {} (attempt {})",
            self.endpoint,
            request.contact_id,
            request.attempt
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        // A 2xx without a parseable body counts as accepted
        match response.json::<CallResponse>().await {
            Ok(CallResponse { success: false, message }) => Err(DispatchFailure::Transient(
                message.unwrap_or_else(|| "call not placed".to_string()),
            )),
            _ => Ok(()),
        }
    }
}

fn classify_send_error(error: reqwest::Error) -> DispatchFailure {
    if error.is_timeout() {
        DispatchFailure::Timeout
    } else {
        DispatchFailure::Unreachable(error.to_string())
    }
}

fn classify_status(status: StatusCode, body: String) -> DispatchFailure {
    let detail = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, body)
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
    {
        DispatchFailure::Transient(detail)
    } else {
        DispatchFailure::Rejected(detail)
    }
}
