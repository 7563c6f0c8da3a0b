//! Online/offline tracking.
//!
//! The monitor only records transitions. Whoever knows the network state
//! (the TCP probe, a platform hook, a test) calls [`ConnectivityMonitor::set_online`].

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use super::config::ConnectivitySettings;

pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self { state }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record the current state. Returns true when this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            log::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        changed
    }

    /// Receiver that wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

/// Decides online/offline by opening a TCP connection to a well-known host.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub address: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl TcpProbe {
    pub fn from_settings(settings: &ConnectivitySettings) -> Option<Self> {
        settings.probe_address.as_ref().map(|address| Self {
            address: address.clone(),
            interval: Duration::from_secs(settings.probe_interval_seconds.max(1)),
            timeout: Duration::from_secs(settings.probe_timeout_seconds.max(1)),
        })
    }

    pub async fn check(&self) -> bool {
        matches!(
            timeout(self.timeout, TcpStream::connect(&self.address)).await,
            Ok(Ok(_))
        )
    }

    /// Probe forever, feeding results into `monitor`.
    pub fn spawn(self, monitor: Arc<ConnectivityMonitor>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = self.check().await;
                monitor.set_online(online);
            }
        })
    }
}
