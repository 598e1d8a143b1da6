//! Modbus TCP transport backed by `tokio-modbus`.

use tokio_modbus::client::{Client, Context, Reader};
use tokio_modbus::prelude::*;

use crate::error::{CloseError, ConnectError, ReadError};
use crate::link::{Connector, Endpoint, RegisterSession};

/// Opens Modbus TCP sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusTcpConnector;

/// An open Modbus TCP client context.
pub struct ModbusTcpSession {
    ctx: Context,
}

impl Connector for ModbusTcpConnector {
    type Session = ModbusTcpSession;

    async fn connect(&self, endpoint: &Endpoint) -> Result<ModbusTcpSession, ConnectError> {
        let addr = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await?
            .next()
            .ok_or_else(|| ConnectError::Resolve(endpoint.host.clone()))?;

        let ctx = tcp::connect_slave(addr, Slave(endpoint.unit_id)).await?;
        Ok(ModbusTcpSession { ctx })
    }
}

impl RegisterSession for ModbusTcpSession {
    async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ReadError> {
        // Outer error: transport/protocol, the session is unusable.
        // Inner error: exception response, the device is still talking to us.
        self.ctx
            .read_holding_registers(start, count)
            .await
            .map_err(|e| ReadError::Transport(e.to_string()))?
            .map_err(|e| ReadError::Exception(format!("{:?}", e)))
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        self.ctx.disconnect().await?;
        Ok(())
    }
}
