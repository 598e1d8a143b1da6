//! Bridge lifecycle: wiring, task spawning and ordered shutdown.

use modlink_common::Format;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::link::{Connector, DeviceLink, Endpoint, LinkTimeouts, SharedLink};
use crate::poller::PollLoop;
use crate::publisher::Publisher;
use crate::server::AppState;
use crate::store::RegisterStore;
use crate::supervisor::{ReconnectSupervisor, RetryPolicy, SupervisorHandle};

/// A running bridge.
///
/// Owns the supervisor and poll tasks. Dropping it without calling
/// [`Bridge::shutdown`] leaves both tasks running until the runtime stops.
pub struct Bridge<C: Connector> {
    store: RegisterStore,
    publisher: Publisher,
    supervisor: SupervisorHandle,
    link: SharedLink<C>,
    poll_shutdown: watch::Sender<bool>,
    poll_task: JoinHandle<()>,
    supervisor_shutdown: watch::Sender<bool>,
    supervisor_task: JoinHandle<()>,
}

impl<C: Connector> Bridge<C> {
    /// Build all components, spawn the background tasks and request the
    /// first connection.
    ///
    /// Must be called from within a Tokio runtime. The configuration is
    /// expected to have been validated.
    pub fn start(config: &BridgeConfig, connector: C) -> Self {
        let modbus = &config.modbus;

        let store = RegisterStore::new(modbus.total_registers);
        let publisher = Publisher::new(store.clone(), config.server.observer_buffer);

        let endpoint = Endpoint {
            host: modbus.host.clone(),
            port: modbus.port,
            unit_id: modbus.unit_id,
        };
        info!(endpoint = %endpoint, ranges = modbus.ranges.len(), "Starting bridge");

        let link = DeviceLink::new(connector, endpoint, LinkTimeouts::from(modbus)).shared();

        let supervisor = ReconnectSupervisor::new(link.clone(), RetryPolicy::from(modbus));
        let handle = supervisor.handle();

        let poll_loop = PollLoop::new(
            link.clone(),
            modbus.ranges.clone(),
            store.clone(),
            publisher.clone(),
            handle.clone(),
            modbus.poll_interval(),
        );

        let (supervisor_shutdown, supervisor_rx) = watch::channel(false);
        let supervisor_task = tokio::spawn(supervisor.run(supervisor_rx));

        let (poll_shutdown, poll_rx) = watch::channel(false);
        let poll_task = tokio::spawn(poll_loop.run(poll_rx));

        handle.ensure_connected();

        Self {
            store,
            publisher,
            supervisor: handle,
            link,
            poll_shutdown,
            poll_task,
            supervisor_shutdown,
            supervisor_task,
        }
    }

    pub fn store(&self) -> &RegisterStore {
        &self.store
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    /// State for the HTTP server.
    pub fn app_state(&self, format: Format) -> AppState {
        AppState {
            store: self.store.clone(),
            publisher: self.publisher.clone(),
            supervisor: self.supervisor.clone(),
            format,
        }
    }

    /// Stop polling, stop reconnecting, close the session, close the
    /// publisher. In that order.
    pub async fn shutdown(self) {
        info!("Stopping poll loop");
        let _ = self.poll_shutdown.send(true);
        if let Err(e) = self.poll_task.await {
            warn!(error = %e, "Poll task ended abnormally");
        }

        info!("Stopping reconnect supervisor");
        let _ = self.supervisor_shutdown.send(true);
        if let Err(e) = self.supervisor_task.await {
            warn!(error = %e, "Supervisor task ended abnormally");
        }

        info!("Closing device session");
        if let Err(e) = self.link.lock().await.close().await {
            warn!(error = %e, "Failed to close device session");
        }

        self.publisher.close();
        info!("Bridge stopped");
    }
}
