//! Scripted in-memory endpoint shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};

use modlink_bridge::error::{CloseError, ConnectError, ReadError};
use modlink_bridge::{BridgeConfig, Connector, Endpoint, RegisterRange, RegisterSession};
use parking_lot::Mutex;

#[derive(Default)]
struct Shared {
    down: AtomicBool,
    connects: AtomicUsize,
    closes: AtomicUsize,
    generation: AtomicU16,
    exceptions: Mutex<HashSet<u16>>,
}

/// Endpoint whose availability is switched from the test.
///
/// Every register read returns the number of the session that served it,
/// so a fresh connection is visible in the published data.
#[derive(Clone, Default)]
pub struct ScriptedEndpoint {
    shared: Arc<Shared>,
}

impl ScriptedEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the endpoint down: connects are refused, open sessions break.
    pub fn go_down(&self) {
        self.shared.down.store(true, Ordering::SeqCst);
    }

    pub fn go_up(&self) {
        self.shared.down.store(false, Ordering::SeqCst);
    }

    /// Make reads starting at `start` answer with a device exception.
    pub fn fail_range(&self, start: u16) {
        self.shared.exceptions.lock().insert(start);
    }

    pub fn heal_range(&self, start: u16) {
        self.shared.exceptions.lock().remove(&start);
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }
}

pub struct ScriptedSession {
    shared: Arc<Shared>,
    generation: u16,
}

impl Connector for ScriptedEndpoint {
    type Session = ScriptedSession;

    async fn connect(&self, _endpoint: &Endpoint) -> Result<ScriptedSession, ConnectError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if self.shared.down.load(Ordering::SeqCst) {
            return Err(ConnectError::Io(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            )));
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ScriptedSession {
            shared: self.shared.clone(),
            generation,
        })
    }
}

impl RegisterSession for ScriptedSession {
    async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ReadError> {
        if self.shared.down.load(Ordering::SeqCst) {
            return Err(ReadError::Transport("connection reset by peer".into()));
        }
        if self.shared.exceptions.lock().contains(&start) {
            return Err(ReadError::Exception("IllegalDataAddress".into()));
        }
        Ok(vec![self.generation; count as usize])
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Small two-range configuration with fast timers.
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.modbus.total_registers = 6;
    config.modbus.ranges = vec![
        RegisterRange::new(0, 3, "Batch 1A"),
        RegisterRange::new(3, 3, "Batch 1B"),
    ];
    config.modbus.poll_interval_ms = 100;
    config.modbus.retry_interval_ms = 1000;
    config.modbus.max_retries = 5;
    config.server.listen = "127.0.0.1:0".to_string();
    config.validate().unwrap();
    config
}
