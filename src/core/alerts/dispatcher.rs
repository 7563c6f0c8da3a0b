// Per-contact delivery bookkeeping for one alert session.
//
// The dispatcher never performs I/O. It hands out delivery requests and
// folds their results back into independent per-contact records; the
// engine runtime decides when and how requests actually go out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::model::{AlertPayload, DeliveryRequest, DeliveryStatus};
use crate::core::config::DispatchSettings;
use crate::core::contacts::registry::is_valid_phone;
use crate::core::error::DispatchFailure;
use crate::core::model::{ContactId, EmergencyContact};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DispatchSettings::default())
    }
}

impl From<&DispatchSettings> for RetryPolicy {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (1-based): base * 2^(n-1), capped.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.backoff_base.as_millis() as u64;
        let max_ms = self.backoff_max.as_millis() as u64;
        let multiplier = 1u64.checked_shl(retry_count - 1).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub failures: u32,
    pub last_error: Option<String>,
}

impl DeliveryRecord {
    fn pending() -> Self {
        Self {
            status: DeliveryStatus::Pending,
            attempts: 0,
            failures: 0,
            last_error: None,
        }
    }
}

/// What the caller should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStep {
    /// Record reached a final status, nothing more to do
    Settled,
    RetryAfter(Duration),
    /// Held until connectivity returns
    AwaitConnectivity,
}

pub struct ContactDispatcher {
    policy: RetryPolicy,
    payload: Option<Arc<AlertPayload>>,
    contacts: Vec<EmergencyContact>,
    records: HashMap<ContactId, DeliveryRecord>,
    awaiting_connectivity: Vec<ContactId>,
}

impl ContactDispatcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            payload: None,
            contacts: Vec::new(),
            records: HashMap::new(),
            awaiting_connectivity: Vec::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start live delivery: one pending record and one request per contact.
    /// Contacts whose phone is not valid E.164 are abandoned without an attempt.
    pub fn dispatch(&mut self, payload: AlertPayload, contacts: &[EmergencyContact]) -> Vec<DeliveryRequest> {
        self.load(payload, contacts);
        let mut requests = Vec::with_capacity(contacts.len());
        for contact in contacts {
            if !is_valid_phone(&contact.phone) {
                log::warn!(
                    "Skipping contact {} ({}): invalid phone number {:?}",
                    contact.id,
                    contact.name,
                    contact.phone
                );
                if let Some(record) = self.records.get_mut(&contact.id) {
                    record.status = DeliveryStatus::Abandoned;
                    record.last_error = Some("invalid phone number".to_string());
                }
                continue;
            }
            if let Some(request) = self.next_attempt(contact.id) {
                requests.push(request);
            }
        }
        requests
    }

    /// Start practice delivery: pending records only, no requests are built.
    /// Returns the contacts the simulation should report on.
    pub fn simulate(&mut self, payload: AlertPayload, contacts: &[EmergencyContact]) -> Vec<ContactId> {
        self.load(payload, contacts);
        contacts.iter().map(|c| c.id).collect()
    }

    pub fn record_simulated(&mut self, contact_id: ContactId) -> bool {
        self.record_success(contact_id)
    }

    /// Returns true when the record changed.
    pub fn record_success(&mut self, contact_id: ContactId) -> bool {
        match self.records.get_mut(&contact_id) {
            Some(record) if !record.status.is_settled() => {
                record.status = DeliveryStatus::Sent;
                record.last_error = None;
                true
            }
            _ => false,
        }
    }

    pub fn record_failure(&mut self, contact_id: ContactId, failure: &DispatchFailure, online: bool) -> DispatchStep {
        let max_retries = self.policy.max_retries;
        let Some(record) = self.records.get_mut(&contact_id) else {
            return DispatchStep::Settled;
        };
        if record.status.is_settled() {
            return DispatchStep::Settled;
        }

        record.failures += 1;
        record.last_error = Some(failure.to_string());

        if !failure.is_retryable() || record.failures > max_retries {
            record.status = DeliveryStatus::Abandoned;
            log::warn!(
                "Giving up on contact {} after {} attempt(s): {}",
                contact_id,
                record.attempts,
                failure
            );
            return DispatchStep::Settled;
        }

        if !online {
            record.status = DeliveryStatus::Pending;
            if !self.awaiting_connectivity.contains(&contact_id) {
                self.awaiting_connectivity.push(contact_id);
            }
            log::info!("Offline, holding delivery to contact {} until connectivity returns", contact_id);
            return DispatchStep::AwaitConnectivity;
        }

        let retry_count = record.failures;
        record.status = DeliveryStatus::Failed { retry_count };
        let delay = self.policy.backoff(retry_count);
        log::info!(
            "Delivery to contact {} failed ({}), retry {} in {:?}",
            contact_id,
            failure,
            retry_count,
            delay
        );
        DispatchStep::RetryAfter(delay)
    }

    /// Next attempt for a record waiting on its retry timer.
    pub fn retry(&mut self, contact_id: ContactId) -> Option<DeliveryRequest> {
        match self.records.get(&contact_id).map(|r| r.status) {
            Some(DeliveryStatus::Failed { .. }) => self.next_attempt(contact_id),
            _ => None,
        }
    }

    /// Connectivity is back: re-attempt every record held while offline.
    pub fn resume(&mut self) -> Vec<DeliveryRequest> {
        let held = std::mem::take(&mut self.awaiting_connectivity);
        held.into_iter().filter_map(|id| self.next_attempt(id)).collect()
    }

    pub fn awaiting_connectivity(&self) -> &[ContactId] {
        &self.awaiting_connectivity
    }

    pub fn status(&self, contact_id: ContactId) -> Option<DeliveryStatus> {
        self.records.get(&contact_id).map(|r| r.status)
    }

    pub fn record(&self, contact_id: ContactId) -> Option<&DeliveryRecord> {
        self.records.get(&contact_id)
    }

    /// Records in snapshot order.
    pub fn records(&self) -> impl Iterator<Item = (&EmergencyContact, &DeliveryRecord)> {
        self.contacts
            .iter()
            .filter_map(|c| self.records.get(&c.id).map(|r| (c, r)))
    }

    /// True once every record is sent or abandoned.
    pub fn is_complete(&self) -> bool {
        self.records.values().all(|r| r.status.is_settled())
    }

    /// (sent, abandoned)
    pub fn tally(&self) -> (usize, usize) {
        self.records.values().fold((0, 0), |(sent, abandoned), r| match r.status {
            DeliveryStatus::Sent => (sent + 1, abandoned),
            DeliveryStatus::Abandoned => (sent, abandoned + 1),
            _ => (sent, abandoned),
        })
    }

    fn load(&mut self, payload: AlertPayload, contacts: &[EmergencyContact]) {
        self.payload = Some(Arc::new(payload));
        self.contacts = contacts.to_vec();
        self.records = contacts.iter().map(|c| (c.id, DeliveryRecord::pending())).collect();
        self.awaiting_connectivity.clear();
    }

    fn next_attempt(&mut self, contact_id: ContactId) -> Option<DeliveryRequest> {
        let payload = Arc::clone(self.payload.as_ref()?);
        let contact = self.contacts.iter().find(|c| c.id == contact_id)?;
        let record = self.records.get_mut(&contact_id)?;
        record.attempts += 1;
        record.status = DeliveryStatus::Pending;
        Some(DeliveryRequest {
            session: payload.session,
            contact_id,
            contact_name: contact.name.clone(),
            contact_phone: contact.phone.clone(),
            attempt: record.attempts,
            payload,
        })
    }
}
