// Alert engine runtime - the single task that owns the state machine.
//
// Triggers, cancels, timer fires, delivery results and connectivity changes
// all arrive on one queue and are applied strictly in order. The machine
// returns effects; this module turns them into tokio tasks.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::channel::DeliveryChannel;
use super::machine::{AlertStateMachine, Effect, EngineEvent};
use super::model::{AlertView, DeliveryRequest};
use super::practice::{self, SIMULATED_LATENCY};
use super::timer::TimerSet;
use crate::core::connectivity::ConnectivityMonitor;
use crate::core::contacts::SharedContacts;
use crate::core::error::{DispatchFailure, EngineClosed};
use crate::core::model::{EmergencyType, TriggerSource};

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    events: EventSender,
    view: watch::Receiver<AlertView>,
}

impl EngineHandle {
    pub fn trigger(
        &self,
        source: TriggerSource,
        emergency_type: EmergencyType,
        message: impl Into<String>,
    ) -> Result<(), EngineClosed> {
        self.send(EngineEvent::Trigger {
            source,
            emergency_type,
            message: message.into(),
        })
    }

    pub fn cancel(&self) -> Result<(), EngineClosed> {
        self.send(EngineEvent::Cancel)
    }

    pub fn run_practice_alert(
        &self,
        emergency_type: EmergencyType,
        message: impl Into<String>,
    ) -> Result<(), EngineClosed> {
        self.send(EngineEvent::PracticeAlert {
            emergency_type,
            message: message.into(),
        })
    }

    pub fn notify_connectivity(&self, online: bool) -> Result<(), EngineClosed> {
        self.send(EngineEvent::Connectivity(online))
    }

    pub fn notify_contacts_changed(&self, count: usize) -> Result<(), EngineClosed> {
        self.send(EngineEvent::ContactsChanged(count))
    }

    pub fn shutdown(&self) -> Result<(), EngineClosed> {
        self.send(EngineEvent::Shutdown)
    }

    /// Latest published view.
    pub fn view(&self) -> AlertView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AlertView> {
        self.view.clone()
    }

    /// Forward registry mutations into the engine.
    pub fn watch_contacts(&self, contacts: &SharedContacts) {
        let engine = self.clone();
        contacts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .on_change(move |change| {
                let _ = engine.notify_contacts_changed(change.count);
            });
    }

    /// Forward connectivity into the engine until it stops, starting with
    /// the state the monitor holds right now.
    pub fn watch_connectivity(&self, monitor: &ConnectivityMonitor) -> JoinHandle<()> {
        let engine = self.clone();
        let mut online = monitor.subscribe();
        let current = *online.borrow_and_update();
        tokio::spawn(async move {
            if engine.notify_connectivity(current).is_err() {
                return;
            }
            while online.changed().await.is_ok() {
                let state = *online.borrow_and_update();
                if engine.notify_connectivity(state).is_err() {
                    break;
                }
            }
        })
    }

    fn send(&self, event: EngineEvent) -> Result<(), EngineClosed> {
        self.events.send(event).map_err(|_| EngineClosed)
    }
}

pub struct AlertEngine {
    machine: AlertStateMachine,
    channel: Arc<dyn DeliveryChannel>,
    timers: TimerSet,
    delivery_timeout: Duration,
    practice_latency: Duration,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    view_tx: watch::Sender<AlertView>,
}

impl AlertEngine {
    pub fn new(
        machine: AlertStateMachine,
        channel: Arc<dyn DeliveryChannel>,
        delivery_timeout: Duration,
    ) -> (Self, EngineHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(machine.view());
        let handle = EngineHandle {
            events: events_tx.clone(),
            view,
        };
        (
            Self {
                machine,
                channel,
                timers: TimerSet::new(),
                delivery_timeout,
                practice_latency: SIMULATED_LATENCY,
                events_tx,
                events_rx,
                view_tx,
            },
            handle,
        )
    }

    pub fn with_practice_latency(mut self, latency: Duration) -> Self {
        self.practice_latency = latency;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        log::info!("Alert engine started");
        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, EngineEvent::Shutdown) {
                break;
            }
            self.process(event);
        }
        log::info!("Alert engine stopped");
    }

    fn process(&mut self, event: EngineEvent) {
        if let EngineEvent::TimerFired(key) = &event {
            self.timers.fired(key);
        }
        for effect in self.machine.handle(event) {
            self.execute(effect);
        }
        let view = self.machine.view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Schedule { key, after } => self.timers.schedule(key, after, self.events_tx.clone()),
            Effect::CancelTimers { session } => self.timers.cancel_session(session),
            Effect::Deliver(request) => self.deliver(request),
            Effect::SimulateDelivery { session, contacts } => {
                practice::simulate_delivery(session, contacts, self.practice_latency, self.events_tx.clone());
            }
        }
    }

    fn deliver(&self, request: DeliveryRequest) {
        let channel = Arc::clone(&self.channel);
        let events = self.events_tx.clone();
        let limit = self.delivery_timeout;
        tokio::spawn(async move {
            let result = match timeout(limit, channel.deliver(&request)).await {
                Ok(result) => result,
                Err(_) => Err(DispatchFailure::Timeout),
            };
            if let Err(e) = &result {
                log::warn!(
                    "Delivery to {} ({}) attempt {} failed: {}",
                    request.contact_name,
                    request.contact_id,
                    request.attempt,
                    e
                );
            }
            let _ = events.send(EngineEvent::DeliveryFinished {
                session: request.session,
                contact_id: request.contact_id,
                result,
            });
        });
    }
}
