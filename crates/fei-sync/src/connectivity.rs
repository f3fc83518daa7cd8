// File: fei-sync/src/connectivity.rs
// Purpose: Online/offline state machine with a degraded-connection guard

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::api::RemoteApi;
use crate::error::ApiError;

/// Externally observed connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

/// Result of feeding one event to the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecameOnline,
    BecameOffline,
    Unchanged,
}

/// Full monitor state as published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub connectivity: Connectivity,

    /// Set by a very bad connection; keeps the monitor offline even when the
    /// transport claims to be connected
    pub degraded: bool,

    /// Incremented on every Offline -> Online transition
    pub online_epoch: u64,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        self.connectivity == Connectivity::Online
    }
}

/// Tracks connectivity events and folds them into one online/offline signal.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<Mutex<ConnectivityState>>,
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectivityMonitor {
    /// `platform_online` is what the platform reports at startup; unknown is
    /// treated as offline.
    pub fn new(platform_online: Option<bool>) -> Self {
        let connectivity = match platform_online {
            Some(true) => Connectivity::Online,
            Some(false) | None => Connectivity::Offline,
        };
        let initial = ConnectivityState {
            connectivity,
            degraded: false,
            online_epoch: 0,
        };
        let (tx, _) = watch::channel(initial);

        Self {
            state: Arc::new(Mutex::new(initial)),
            tx: Arc::new(tx),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.state().connectivity
    }

    /// Receives the state after every change
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Native "online" event
    pub fn on_online(&self) -> Transition {
        self.apply(|state| try_online(state, "online"))
    }

    /// A connection check succeeded
    pub fn on_good_connection(&self) -> Transition {
        self.apply(|state| try_online(state, "good-connection"))
    }

    /// Native "offline" event
    pub fn on_offline(&self) -> Transition {
        self.apply(|state| go_offline(state, "offline"))
    }

    /// The network is technically up but unusable
    pub fn on_very_bad_connection(&self) -> Transition {
        self.apply(|state| {
            state.degraded = true;
            go_offline(state, "very-bad-connection")
        })
    }

    /// The connection proved healthy again: lift the degraded guard and try
    /// to come back online
    pub fn on_connection_recovered(&self) -> Transition {
        self.apply(|state| {
            state.degraded = false;
            try_online(state, "connection-recovered")
        })
    }

    fn apply(&self, f: impl FnOnce(&mut ConnectivityState) -> Transition) -> Transition {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = *state;
        let transition = f(&mut state);

        if *state != before {
            self.tx.send_replace(*state);
        }
        transition
    }
}

fn try_online(state: &mut ConnectivityState, event: &str) -> Transition {
    if state.degraded {
        tracing::debug!(event, "ignoring online signal, connection is degraded");
        return Transition::Unchanged;
    }
    if state.connectivity == Connectivity::Online {
        return Transition::Unchanged;
    }

    state.connectivity = Connectivity::Online;
    state.online_epoch += 1;
    tracing::info!(event, "connectivity: back online");
    Transition::BecameOnline
}

fn go_offline(state: &mut ConnectivityState, event: &str) -> Transition {
    if state.connectivity == Connectivity::Offline {
        return Transition::Unchanged;
    }

    state.connectivity = Connectivity::Offline;
    tracing::warn!(event, "connectivity: offline");
    Transition::BecameOffline
}

/// Periodically checks the backend's clock endpoint and feeds the result to
/// a monitor.
pub struct ConnectivityProbe {
    monitor: ConnectivityMonitor,
    api: Arc<dyn RemoteApi>,
    interval: Duration,
    timeout: Duration,
}

impl ConnectivityProbe {
    pub fn new(
        monitor: ConnectivityMonitor,
        api: Arc<dyn RemoteApi>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            monitor,
            api,
            interval,
            timeout,
        }
    }

    /// One check: healthy answer recovers, slow answer degrades, transport
    /// error goes offline
    pub async fn probe_once(&self) -> Transition {
        match tokio::time::timeout(self.timeout, self.api.now()).await {
            Ok(Ok(_)) => self.monitor.on_connection_recovered(),
            Ok(Err(ApiError::Timeout(_))) => self.monitor.on_very_bad_connection(),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "connectivity probe failed");
                self.monitor.on_offline()
            }
            Err(_) => {
                tracing::debug!(timeout_ms = self.timeout.as_millis() as u64, "connectivity probe too slow");
                self.monitor.on_very_bad_connection()
            }
        }
    }

    /// Probe forever
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.probe_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some(true), Connectivity::Online)]
    #[case(Some(false), Connectivity::Offline)]
    #[case(None, Connectivity::Offline)]
    fn test_initial_state(#[case] platform: Option<bool>, #[case] expected: Connectivity) {
        let monitor = ConnectivityMonitor::new(platform);
        assert_eq!(monitor.connectivity(), expected);
        assert!(!monitor.state().degraded);
    }

    #[test]
    fn test_online_offline_transitions() {
        let monitor = ConnectivityMonitor::new(Some(false));

        assert_eq!(monitor.on_online(), Transition::BecameOnline);
        assert_eq!(monitor.on_good_connection(), Transition::Unchanged);
        assert_eq!(monitor.on_offline(), Transition::BecameOffline);
        assert_eq!(monitor.on_offline(), Transition::Unchanged);
        assert_eq!(monitor.on_good_connection(), Transition::BecameOnline);
        assert_eq!(monitor.state().online_epoch, 2);
    }

    #[test]
    fn test_very_bad_connection_blocks_online_signals() {
        let monitor = ConnectivityMonitor::new(Some(true));

        assert_eq!(monitor.on_very_bad_connection(), Transition::BecameOffline);
        assert!(monitor.state().degraded);

        assert_eq!(monitor.on_online(), Transition::Unchanged);
        assert_eq!(monitor.on_good_connection(), Transition::Unchanged);
        assert!(!monitor.is_online());

        assert_eq!(monitor.on_connection_recovered(), Transition::BecameOnline);
        assert!(!monitor.state().degraded);
        assert!(monitor.is_online());
    }

    #[test]
    fn test_very_bad_connection_while_offline_still_degrades() {
        let monitor = ConnectivityMonitor::new(None);

        assert_eq!(monitor.on_very_bad_connection(), Transition::Unchanged);
        assert!(monitor.state().degraded);
        assert_eq!(monitor.on_online(), Transition::Unchanged);
    }

    #[tokio::test]
    async fn test_subscribers_only_see_changes() {
        let monitor = ConnectivityMonitor::new(Some(false));
        let mut rx = monitor.subscribe();

        monitor.on_offline();
        assert!(!rx.has_changed().unwrap());

        monitor.on_online();
        assert!(rx.has_changed().unwrap());
        let state = *rx.borrow_and_update();
        assert_eq!(state.connectivity, Connectivity::Online);
        assert_eq!(state.online_epoch, 1);
    }
}
