// Session-scoped timers for the engine task.
//
// Every timer carries the session it was armed for. Cancelling a session
// aborts its pending sleeps, and a fire that was already queued is dropped
// by the state machine because the session id no longer matches.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::machine::EngineEvent;
use super::model::SessionId;
use crate::core::model::ContactId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    CountdownTick,
    Retry(ContactId),
    DisplayReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub session: SessionId,
    pub kind: TimerKind,
}

impl TimerKey {
    pub fn new(session: SessionId, kind: TimerKind) -> Self {
        Self { session, kind }
    }
}

#[derive(Default)]
pub struct TimerSet {
    pending: HashMap<TimerKey, JoinHandle<()>>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` to fire into `events` after `after`. Re-arming a key replaces it.
    pub fn schedule(&mut self, key: TimerKey, after: Duration, events: UnboundedSender<EngineEvent>) {
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(EngineEvent::TimerFired(key));
        });
        if let Some(previous) = self.pending.insert(key, task) {
            previous.abort();
        }
    }

    /// Forget a timer that has fired.
    pub fn fired(&mut self, key: &TimerKey) {
        self.pending.remove(key);
    }

    /// Abort every pending timer belonging to `session`.
    pub fn cancel_session(&mut self, session: SessionId) {
        self.pending.retain(|key, task| {
            if key.session == session {
                task.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        for task in self.pending.values() {
            task.abort();
        }
    }
}
