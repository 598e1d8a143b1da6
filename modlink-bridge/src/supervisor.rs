//! Connection (re)establishment with bounded retries.
//!
//! # State machine
//!
//! ```text
//! Disconnected --ensure_connected--> Connecting --ok--> Connected
//!      ^                                 |                  |
//!      |            fail, retries < max  |                  | connection_lost
//!      +---- (retry scheduled) <---------+                  |
//!      +----------------------------------------------------+
//!
//! fail, retries >= max  =>  Disconnected + gave_up (terminal until rearm)
//! ```
//!
//! All transitions go through one `watch` channel, so the check-and-set in
//! [`SupervisorHandle::ensure_connected`] is atomic and at most one connection
//! cycle runs at a time.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::config::ModbusConfig;
use crate::link::{Connector, SharedLink};

/// Connection state of the device link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Observable supervisor state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub state: ConnectionState,
    /// Consecutive failed connection attempts since the last success.
    pub retries: u32,
    /// A retry is waiting out the backoff delay.
    pub retry_scheduled: bool,
    /// Retries are exhausted; no further attempts until re-armed.
    pub gave_up: bool,
}

impl LinkStatus {
    /// Whether a connection cycle is currently active.
    pub fn cycle_active(&self) -> bool {
        self.state == ConnectionState::Connecting || self.retry_scheduled
    }
}

/// Retry bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl From<&ModbusConfig> for RetryPolicy {
    fn from(config: &ModbusConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_interval: config.retry_interval(),
        }
    }
}

/// Cheap-to-clone handle for requesting connections and watching status.
#[derive(Clone)]
pub struct SupervisorHandle {
    status: Arc<watch::Sender<LinkStatus>>,
    trigger: Arc<Notify>,
}

impl SupervisorHandle {
    fn new() -> Self {
        let (status, _) = watch::channel(LinkStatus::default());
        Self {
            status: Arc::new(status),
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Current status.
    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    /// Request a connection.
    ///
    /// No-op when already connected, when a cycle is in flight or waiting to
    /// retry, or after giving up. Returns whether a new cycle was started.
    pub fn ensure_connected(&self) -> bool {
        let started = self.status.send_if_modified(|status| {
            if status.state == ConnectionState::Connected
                || status.cycle_active()
                || status.gave_up
            {
                return false;
            }
            status.state = ConnectionState::Connecting;
            true
        });

        if started {
            debug!("Connection cycle requested");
            self.trigger.notify_one();
        }
        started
    }

    /// Report that the connected session died, then request a reconnect.
    pub fn connection_lost(&self) -> bool {
        self.status.send_if_modified(|status| {
            if status.state != ConnectionState::Connected {
                return false;
            }
            status.state = ConnectionState::Disconnected;
            true
        });
        self.ensure_connected()
    }

    /// Leave the terminal give-up state and start a fresh cycle.
    ///
    /// Returns `false` if the supervisor had not given up.
    pub fn rearm(&self) -> bool {
        let rearmed = self.status.send_if_modified(|status| {
            if !status.gave_up {
                return false;
            }
            status.gave_up = false;
            status.retries = 0;
            true
        });

        if rearmed {
            info!("Reconnection re-armed by operator");
            self.ensure_connected();
        }
        rearmed
    }
}

/// Drives connection attempts against the shared link.
pub struct ReconnectSupervisor<C: Connector> {
    link: SharedLink<C>,
    policy: RetryPolicy,
    handle: SupervisorHandle,
}

impl<C: Connector> ReconnectSupervisor<C> {
    pub fn new(link: SharedLink<C>, policy: RetryPolicy) -> Self {
        Self {
            link,
            policy,
            handle: SupervisorHandle::new(),
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Serve connection requests until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.handle.trigger.notified() => {}
                _ = shutdown.changed() => break,
            }

            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = self.connect_cycle() => {}
                _ = shutdown.changed() => break,
            }
        }

        debug!("Supervisor stopped");
    }

    /// Attempt until connected or out of retries, sleeping between attempts.
    async fn connect_cycle(&self) {
        loop {
            if self.attempt().await {
                return;
            }

            let status = self.handle.status();
            if status.gave_up {
                return;
            }

            tokio::time::sleep(self.policy.retry_interval).await;

            self.handle.status.send_modify(|status| {
                status.retry_scheduled = false;
                status.state = ConnectionState::Connecting;
            });
        }
    }

    /// One connection attempt. Updates the retry counter and state.
    pub async fn attempt(&self) -> bool {
        self.handle.status.send_modify(|status| {
            status.state = ConnectionState::Connecting;
        });

        let result = {
            let mut link = self.link.lock().await;
            link.connect().await
        };

        match result {
            Ok(()) => {
                self.handle.status.send_modify(|status| {
                    status.state = ConnectionState::Connected;
                    status.retries = 0;
                    status.retry_scheduled = false;
                    status.gave_up = false;
                });
                true
            }
            Err(e) => {
                let max_retries = self.policy.max_retries;
                let interval = self.policy.retry_interval;

                self.handle.status.send_modify(|status| {
                    status.state = ConnectionState::Disconnected;
                    status.retries += 1;

                    if status.retries < max_retries {
                        status.retry_scheduled = true;
                        warn!(
                            error = %e,
                            retries = status.retries,
                            max_retries,
                            "Connection failed, retrying in {:?}",
                            interval
                        );
                    } else {
                        status.retry_scheduled = false;
                        status.gave_up = true;
                        error!(
                            error = %e,
                            retries = status.retries,
                            "Maximum retries reached, polling stopped"
                        );
                    }
                });
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CloseError, ConnectError, ReadError};
    use crate::link::{DeviceLink, Endpoint, LinkTimeouts, RegisterSession};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connector answering from a script; an exhausted script keeps failing.
    struct ScriptedConnector {
        script: Mutex<VecDeque<bool>>,
        attempts: Arc<AtomicUsize>,
    }

    struct NullSession;

    impl RegisterSession for NullSession {
        async fn read_holding_registers(
            &mut self,
            _start: u16,
            count: u16,
        ) -> Result<Vec<u16>, ReadError> {
            Ok(vec![0; count as usize])
        }

        async fn close(&mut self) -> Result<(), CloseError> {
            Ok(())
        }
    }

    impl Connector for ScriptedConnector {
        type Session = NullSession;

        async fn connect(&self, _endpoint: &Endpoint) -> Result<NullSession, ConnectError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let up = self.script.lock().unwrap().pop_front().unwrap_or(false);
            if up {
                Ok(NullSession)
            } else {
                Err(ConnectError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            }
        }
    }

    fn supervisor(
        script: &[bool],
        max_retries: u32,
    ) -> (ReconnectSupervisor<ScriptedConnector>, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = ScriptedConnector {
            script: Mutex::new(script.iter().copied().collect()),
            attempts: attempts.clone(),
        };
        let link = DeviceLink::new(
            connector,
            Endpoint {
                host: "127.0.0.1".into(),
                port: 502,
                unit_id: 1,
            },
            LinkTimeouts {
                connect: Duration::from_secs(1),
                read: Duration::from_secs(1),
                close: Duration::from_secs(1),
            },
        )
        .shared();
        let policy = RetryPolicy {
            max_retries,
            retry_interval: Duration::from_secs(15),
        };
        (ReconnectSupervisor::new(link, policy), attempts)
    }

    #[tokio::test]
    async fn test_retry_counter_sequence() {
        let (sup, _) = supervisor(&[true, false, false, true], 15);
        let handle = sup.handle();

        let mut seen = Vec::new();
        for _ in 0..4 {
            sup.attempt().await;
            seen.push(handle.status().retries);
        }

        assert_eq!(seen, vec![0, 1, 2, 0]);
        assert_eq!(handle.status().state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let (sup, attempts) = supervisor(&[], 3);
        let handle = sup.handle();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sup.run(shutdown_rx));

        assert!(handle.ensure_connected());

        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.gave_up).await.unwrap();

        // Give any stray retry a chance to show up.
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let status = handle.status();
        assert_eq!(status.retries, 3);
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.retry_scheduled);

        // Terminal: further requests are ignored.
        assert!(!handle.ensure_connected());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_start_one_cycle() {
        let (sup, attempts) = supervisor(&[true], 3);
        let handle = sup.handle();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sup.run(shutdown_rx));

        let started: Vec<bool> = (0..5).map(|_| handle.ensure_connected()).collect();
        assert_eq!(started, vec![true, false, false, false, false]);
        assert!(handle.status().cycle_active());

        handle
            .subscribe()
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();

        // Connected: another request is a no-op.
        assert!(!handle.status().cycle_active());
        assert!(!handle.ensure_connected());
        tokio::task::yield_now().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_during_backoff_do_not_skip_delay() {
        let (sup, attempts) = supervisor(&[false, true], 5);
        let handle = sup.handle();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sup.run(shutdown_rx));

        handle.ensure_connected();
        handle
            .subscribe()
            .wait_for(|s| s.retry_scheduled)
            .await
            .unwrap();

        let status = handle.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.cycle_active());
        assert!(!handle.ensure_connected());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        handle
            .subscribe()
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(handle.status().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_after_give_up() {
        let (sup, attempts) = supervisor(&[false, true], 1);
        let handle = sup.handle();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sup.run(shutdown_rx));

        assert!(!handle.rearm());

        handle.ensure_connected();
        handle.subscribe().wait_for(|s| s.gave_up).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        assert!(handle.rearm());
        handle
            .subscribe()
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!handle.status().gave_up);
    }

    #[tokio::test]
    async fn test_connection_lost_triggers_new_cycle() {
        let (sup, _) = supervisor(&[true], 3);
        let handle = sup.handle();

        sup.attempt().await;
        assert_eq!(handle.status().state, ConnectionState::Connected);

        assert!(handle.connection_lost());
        assert_eq!(handle.status().state, ConnectionState::Connecting);

        // A second report while the cycle is pending is absorbed.
        assert!(!handle.connection_lost());
    }
}
