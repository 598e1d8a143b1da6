//! The single connection to the remote register endpoint.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ModbusConfig, RegisterRange};
use crate::error::{CloseError, ConnectError, ReadError};

/// Where the remote endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} (unit {})", self.host, self.port, self.unit_id)
    }
}

/// Opens sessions to a register endpoint.
pub trait Connector: Send + Sync + 'static {
    type Session: RegisterSession;

    fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<Self::Session, ConnectError>> + Send;
}

/// An open session able to read holding registers.
pub trait RegisterSession: Send + 'static {
    fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, ReadError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), CloseError>> + Send;
}

/// Timeouts applied by [`DeviceLink`].
#[derive(Debug, Clone, Copy)]
pub struct LinkTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub close: Duration,
}

impl From<&ModbusConfig> for LinkTimeouts {
    fn from(config: &ModbusConfig) -> Self {
        Self {
            connect: config.connect_timeout(),
            read: config.read_timeout(),
            close: config.close_timeout(),
        }
    }
}

/// Owner of at most one session to the endpoint.
///
/// Every remote call is bounded by a timeout. The link never reconnects on
/// its own; that is the supervisor's job.
pub struct DeviceLink<C: Connector> {
    connector: C,
    endpoint: Endpoint,
    timeouts: LinkTimeouts,
    session: Option<C::Session>,
}

/// A [`DeviceLink`] shared by the poll loop and the supervisor.
///
/// The mutex is the only way to reach the session, so at most one request is
/// ever in flight.
pub type SharedLink<C> = Arc<Mutex<DeviceLink<C>>>;

impl<C: Connector> DeviceLink<C> {
    pub fn new(connector: C, endpoint: Endpoint, timeouts: LinkTimeouts) -> Self {
        Self {
            connector,
            endpoint,
            timeouts,
            session: None,
        }
    }

    /// Wrap this link for sharing.
    pub fn shared(self) -> SharedLink<C> {
        Arc::new(Mutex::new(self))
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Open a fresh session, closing any existing one first.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if let Err(e) = self.close().await {
            warn!(endpoint = %self.endpoint, error = %e, "Failed to close previous session");
        }

        debug!(endpoint = %self.endpoint, "Connecting");

        let session = tokio::time::timeout(
            self.timeouts.connect,
            self.connector.connect(&self.endpoint),
        )
        .await
        .map_err(|_| ConnectError::Timeout(self.timeouts.connect))??;

        self.session = Some(session);
        info!(endpoint = %self.endpoint, "Connected");
        Ok(())
    }

    /// Close the session. Closing a closed link is a no-op.
    ///
    /// The session is dropped even when closing it fails.
    pub async fn close(&mut self) -> Result<(), CloseError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        debug!(endpoint = %self.endpoint, "Closing session");

        tokio::time::timeout(self.timeouts.close, session.close())
            .await
            .map_err(|_| CloseError::Timeout(self.timeouts.close))?
    }

    /// Read one register range.
    pub async fn read_range(&mut self, range: &RegisterRange) -> Result<Vec<u16>, ReadError> {
        let session = self.session.as_mut().ok_or(ReadError::NotConnected)?;

        let values = tokio::time::timeout(
            self.timeouts.read,
            session.read_holding_registers(range.start, range.length),
        )
        .await
        .map_err(|_| ReadError::Timeout(self.timeouts.read))??;

        if values.len() != range.length as usize {
            return Err(ReadError::ShortResponse {
                expected: range.length as usize,
                actual: values.len(),
            });
        }

        Ok(values)
    }
}
