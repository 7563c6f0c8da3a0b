// Alert lifecycle state machine.
//
// Synchronous and I/O free: every input is an `EngineEvent`, every output an
// `Effect` the runtime executes. The machine owns the single active session,
// so exactly one alert can be in flight at a time.

use std::time::Duration;

use tokio::sync::watch;

use super::dispatcher::{ContactDispatcher, DispatchStep, RetryPolicy};
use super::model::{
    AlertPayload, AlertState, AlertView, ContactDelivery, DeliveryRequest, SessionId, SessionMode,
};
use super::timer::{TimerKey, TimerKind};
use crate::core::config::Settings;
use crate::core::contacts::registry::{snapshot_shared, SharedContacts};
use crate::core::error::{DispatchFailure, TriggerRejected};
use crate::core::model::{ContactId, EmergencyContact, EmergencyType, LocationSample, TriggerSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    pub countdown_ticks: u32,
    pub tick_interval: Duration,
    pub sent_display: Duration,
    pub retry: RetryPolicy,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for MachineConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            countdown_ticks: settings.alert.countdown_ticks,
            tick_interval: settings.alert.tick_interval(),
            sent_display: settings.alert.sent_display(),
            retry: RetryPolicy::from(&settings.dispatch),
        }
    }
}

/// Everything the engine task reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Trigger {
        source: TriggerSource,
        emergency_type: EmergencyType,
        message: String,
    },
    Cancel,
    PracticeAlert {
        emergency_type: EmergencyType,
        message: String,
    },
    TimerFired(TimerKey),
    DeliveryFinished {
        session: SessionId,
        contact_id: ContactId,
        result: Result<(), DispatchFailure>,
    },
    SimulatedDelivery {
        session: SessionId,
        contact_id: ContactId,
    },
    Connectivity(bool),
    ContactsChanged(usize),
    Shutdown,
}

/// Work for the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Schedule { key: TimerKey, after: Duration },
    CancelTimers { session: SessionId },
    Deliver(DeliveryRequest),
    /// Practice only; never reaches a delivery channel
    SimulateDelivery { session: SessionId, contacts: Vec<ContactId> },
}

pub struct AlertSession {
    pub id: SessionId,
    pub mode: SessionMode,
    /// None for practice alerts
    pub source: Option<TriggerSource>,
    pub emergency_type: EmergencyType,
    pub message: String,
    pub countdown_remaining: Option<u32>,
    /// Frozen at trigger time
    pub contacts_snapshot: Vec<EmergencyContact>,
    /// Frozen when sending starts
    pub location_snapshot: Option<LocationSample>,
    pub dispatcher: ContactDispatcher,
}

pub struct AlertStateMachine {
    config: MachineConfig,
    contacts: SharedContacts,
    location: watch::Receiver<LocationSample>,
    online: bool,
    state: AlertState,
    session: Option<AlertSession>,
    last_session_id: SessionId,
}

impl AlertStateMachine {
    pub fn new(
        config: MachineConfig,
        contacts: SharedContacts,
        location: watch::Receiver<LocationSample>,
        online: bool,
    ) -> Self {
        Self {
            config,
            contacts,
            location,
            online,
            state: AlertState::Idle,
            session: None,
            last_session_id: 0,
        }
    }

    pub fn state(&self) -> AlertState {
        self.state
    }

    pub fn session(&self) -> Option<&AlertSession> {
        self.session.as_ref()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Apply one event. Rejections are logged, never surfaced as errors here.
    pub fn handle(&mut self, event: EngineEvent) -> Vec<Effect> {
        match event {
            EngineEvent::Trigger {
                source,
                emergency_type,
                message,
            } => self.trigger(source, emergency_type, message).unwrap_or_else(|rejected| {
                log::warn!("{:?} trigger ignored: {}", source, rejected);
                Vec::new()
            }),
            EngineEvent::Cancel => self.cancel(),
            EngineEvent::PracticeAlert { emergency_type, message } => self
                .run_practice_alert(emergency_type, message)
                .unwrap_or_else(|rejected| {
                    log::warn!("Practice alert ignored: {}", rejected);
                    Vec::new()
                }),
            EngineEvent::TimerFired(key) => self.on_timer(key),
            EngineEvent::DeliveryFinished {
                session,
                contact_id,
                result,
            } => self.on_delivery_finished(session, contact_id, result),
            EngineEvent::SimulatedDelivery { session, contact_id } => self.on_simulated_delivery(session, contact_id),
            EngineEvent::Connectivity(online) => self.on_connectivity(online),
            EngineEvent::ContactsChanged(count) => self.on_contacts_changed(count),
            EngineEvent::Shutdown => Vec::new(),
        }
    }

    /// Start the countdown for a live alert.
    pub fn trigger(
        &mut self,
        source: TriggerSource,
        emergency_type: EmergencyType,
        message: String,
    ) -> Result<Vec<Effect>, TriggerRejected> {
        let contacts = self.admit()?;
        let id = self.next_session_id();
        log::info!(
            "{:?} trigger: {} alert to {} contact(s), countdown {} ticks",
            source,
            emergency_type.display_name(),
            contacts.len(),
            self.config.countdown_ticks
        );
        self.session = Some(AlertSession {
            id,
            mode: SessionMode::Live,
            source: Some(source),
            emergency_type,
            message,
            countdown_remaining: Some(self.config.countdown_ticks),
            contacts_snapshot: contacts,
            location_snapshot: None,
            dispatcher: ContactDispatcher::new(self.config.retry),
        });

        if self.config.countdown_ticks == 0 {
            return Ok(self.begin_sending());
        }
        self.transition(AlertState::CountingDown);
        Ok(vec![Effect::Schedule {
            key: TimerKey::new(id, TimerKind::CountdownTick),
            after: self.config.tick_interval,
        }])
    }

    /// Abort a countdown. Ignored in every other state.
    pub fn cancel(&mut self) -> Vec<Effect> {
        if self.state != AlertState::CountingDown {
            log::debug!("Cancel ignored in state {:?}", self.state);
            return Vec::new();
        }
        let Some(session) = self.session.take() else {
            return Vec::new();
        };
        log::info!(
            "Alert cancelled with {} tick(s) remaining",
            session.countdown_remaining.unwrap_or(0)
        );
        self.transition(AlertState::Idle);
        vec![Effect::CancelTimers { session: session.id }]
    }

    /// Rehearse the whole flow without contacting anyone. Skips the countdown.
    pub fn run_practice_alert(
        &mut self,
        emergency_type: EmergencyType,
        message: String,
    ) -> Result<Vec<Effect>, TriggerRejected> {
        let contacts = self.admit()?;
        let id = self.next_session_id();
        let location = self.location.borrow().clone();
        let payload = AlertPayload {
            session: id,
            emergency_type,
            message: message.clone(),
            location: location.clone(),
        };
        let mut dispatcher = ContactDispatcher::new(self.config.retry);
        let simulated = dispatcher.simulate(payload, &contacts);
        log::info!("Practice alert: simulating delivery to {} contact(s)", simulated.len());

        self.session = Some(AlertSession {
            id,
            mode: SessionMode::Practice,
            source: None,
            emergency_type,
            message,
            countdown_remaining: None,
            contacts_snapshot: contacts,
            location_snapshot: Some(location),
            dispatcher,
        });
        self.transition(AlertState::Sending);
        Ok(vec![Effect::SimulateDelivery {
            session: id,
            contacts: simulated,
        }])
    }

    pub fn on_timer(&mut self, key: TimerKey) -> Vec<Effect> {
        let state = self.state;
        let Some(session) = self.session.as_mut().filter(|s| s.id == key.session) else {
            log::debug!("Stale timer {:?} ignored", key);
            return Vec::new();
        };

        match key.kind {
            TimerKind::CountdownTick => {
                if state != AlertState::CountingDown {
                    return Vec::new();
                }
                let remaining = session.countdown_remaining.unwrap_or(0).saturating_sub(1);
                session.countdown_remaining = Some(remaining);
                log::debug!("Countdown: {} tick(s) remaining", remaining);
                if remaining == 0 {
                    self.begin_sending()
                } else {
                    vec![Effect::Schedule {
                        key,
                        after: self.config.tick_interval,
                    }]
                }
            }
            TimerKind::Retry(contact_id) => {
                if state != AlertState::Sending {
                    return Vec::new();
                }
                session.dispatcher.retry(contact_id).map(Effect::Deliver).into_iter().collect()
            }
            TimerKind::DisplayReset => {
                if state == AlertState::Sent {
                    self.session = None;
                    self.transition(AlertState::Idle);
                }
                Vec::new()
            }
        }
    }

    pub fn on_delivery_finished(
        &mut self,
        session_id: SessionId,
        contact_id: ContactId,
        result: Result<(), DispatchFailure>,
    ) -> Vec<Effect> {
        let online = self.online;
        let Some(session) = self.sending_session(session_id, SessionMode::Live) else {
            log::debug!("Late delivery result for session {} ignored", session_id);
            return Vec::new();
        };

        let mut effects = Vec::new();
        match result {
            Ok(()) => {
                if session.dispatcher.record_success(contact_id) {
                    log::info!("Alert delivered to contact {}", contact_id);
                }
            }
            Err(failure) => match session.dispatcher.record_failure(contact_id, &failure, online) {
                DispatchStep::RetryAfter(after) => effects.push(Effect::Schedule {
                    key: TimerKey::new(session_id, TimerKind::Retry(contact_id)),
                    after,
                }),
                DispatchStep::Settled | DispatchStep::AwaitConnectivity => {}
            },
        }
        effects.extend(self.finish_if_complete());
        effects
    }

    pub fn on_simulated_delivery(&mut self, session_id: SessionId, contact_id: ContactId) -> Vec<Effect> {
        let Some(session) = self.sending_session(session_id, SessionMode::Practice) else {
            return Vec::new();
        };
        session.dispatcher.record_simulated(contact_id);
        self.finish_if_complete()
    }

    pub fn on_connectivity(&mut self, online: bool) -> Vec<Effect> {
        self.online = online;
        if !online {
            return Vec::new();
        }
        if self.state != AlertState::Sending {
            return Vec::new();
        }
        let Some(session) = self.session.as_mut().filter(|s| s.mode == SessionMode::Live) else {
            return Vec::new();
        };
        let resumed = session.dispatcher.resume();
        if !resumed.is_empty() {
            log::info!("Connectivity restored, resending to {} contact(s)", resumed.len());
        }
        resumed.into_iter().map(Effect::Deliver).collect()
    }

    pub fn on_contacts_changed(&mut self, count: usize) -> Vec<Effect> {
        if self.state == AlertState::BlockedNoContacts && count > 0 {
            self.transition(AlertState::Idle);
        }
        Vec::new()
    }

    pub fn view(&self) -> AlertView {
        let Some(session) = &self.session else {
            return AlertView {
                state: self.state,
                ..AlertView::default()
            };
        };
        AlertView {
            state: self.state,
            countdown_remaining: session.countdown_remaining.filter(|_| self.state == AlertState::CountingDown),
            emergency_type: Some(session.emergency_type),
            mode: Some(session.mode),
            deliveries: session
                .dispatcher
                .records()
                .map(|(contact, record)| ContactDelivery {
                    contact_id: contact.id,
                    name: contact.name.clone(),
                    status: record.status,
                })
                .collect(),
        }
    }

    /// Gate shared by live and practice alerts.
    fn admit(&mut self) -> Result<Vec<EmergencyContact>, TriggerRejected> {
        if self.state.is_busy() {
            return Err(TriggerRejected::AlertInProgress);
        }
        let contacts = snapshot_shared(&self.contacts);
        if contacts.is_empty() {
            self.transition(AlertState::BlockedNoContacts);
            return Err(TriggerRejected::NoContacts);
        }
        Ok(contacts)
    }

    fn begin_sending(&mut self) -> Vec<Effect> {
        let location = self.location.borrow().clone();
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        session.countdown_remaining = None;
        session.location_snapshot = Some(location.clone());
        let payload = AlertPayload {
            session: session.id,
            emergency_type: session.emergency_type,
            message: session.message.clone(),
            location,
        };
        log::info!(
            "Sending {} to {} contact(s), location: {}",
            session.emergency_type.display_name(),
            session.contacts_snapshot.len(),
            payload.location.describe()
        );
        let requests = session.dispatcher.dispatch(payload, &session.contacts_snapshot);
        self.transition(AlertState::Sending);

        let mut effects: Vec<Effect> = requests.into_iter().map(Effect::Deliver).collect();
        effects.extend(self.finish_if_complete());
        effects
    }

    fn finish_if_complete(&mut self) -> Vec<Effect> {
        if self.state != AlertState::Sending {
            return Vec::new();
        }
        let Some(session) = &self.session else {
            return Vec::new();
        };
        if !session.dispatcher.is_complete() {
            return Vec::new();
        }
        let (sent, abandoned) = session.dispatcher.tally();
        let id = session.id;
        log::info!(
            "{} alert finished: {} delivered, {} failed",
            if session.mode == SessionMode::Practice { "Practice" } else { "Live" },
            sent,
            abandoned
        );
        self.transition(AlertState::Sent);
        vec![Effect::Schedule {
            key: TimerKey::new(id, TimerKind::DisplayReset),
            after: self.config.sent_display,
        }]
    }

    fn sending_session(&mut self, session_id: SessionId, mode: SessionMode) -> Option<&mut AlertSession> {
        if self.state != AlertState::Sending {
            return None;
        }
        self.session
            .as_mut()
            .filter(|s| s.id == session_id && s.mode == mode)
    }

    fn next_session_id(&mut self) -> SessionId {
        self.last_session_id += 1;
        self.last_session_id
    }

    fn transition(&mut self, to: AlertState) {
        if self.state != to {
            log::info!("Alert state {:?} -> {:?}", self.state, to);
            self.state = to;
        }
    }
}
