//! Bridge status reporting.

use serde::{Deserialize, Serialize};

use crate::publisher::Publisher;
use crate::store::RegisterStore;
use crate::supervisor::{ConnectionState, LinkStatus, SupervisorHandle};

/// Overall bridge health as shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Connected and polling.
    Running,
    /// Not connected, a connection cycle is (or will be) in progress.
    Reconnecting,
    /// Retries exhausted; polling has stopped until re-armed.
    Failed,
}

impl From<&LinkStatus> for Health {
    fn from(link: &LinkStatus) -> Self {
        if link.gave_up {
            Health::Failed
        } else if link.state == ConnectionState::Connected {
            Health::Running
        } else {
            Health::Reconnecting
        }
    }
}

/// Bridge status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge name.
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Derived health.
    pub status: Health,
    /// Connection supervisor state.
    pub link: LinkStatus,
    /// Version of the current snapshot.
    pub snapshot_version: u64,
    /// When the current snapshot was committed (Unix epoch millis).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<i64>,
    /// Connected observers.
    pub observers: usize,
}

impl BridgeStatus {
    /// Collect the status from the running components.
    pub fn collect(
        supervisor: &SupervisorHandle,
        store: &RegisterStore,
        publisher: &Publisher,
    ) -> Self {
        let link = supervisor.status();
        let snapshot = store.snapshot();

        Self {
            bridge: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            status: Health::from(&link),
            link,
            snapshot_version: snapshot.version,
            last_update: snapshot.updated_at,
            observers: publisher.observer_count(),
        }
    }
}
