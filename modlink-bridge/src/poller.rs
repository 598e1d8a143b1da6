//! Register polling and snapshot publishing.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::RegisterRange;
use crate::link::{Connector, SharedLink};
use crate::publisher::Publisher;
use crate::store::RegisterStore;
use crate::supervisor::{ConnectionState, SupervisorHandle};

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The link was busy with another operation; nothing was read.
    Skipped,
    /// The link was closed; a connection was requested instead of reading.
    Disconnected,
    /// Ranges were read.
    Polled(TickReport),
}

/// Per-range results of a tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Ranges refreshed from the device.
    pub updated: Vec<String>,
    /// Ranges that failed and kept their previous values.
    pub failed: Vec<String>,
    /// The session died mid-tick; remaining ranges were not attempted.
    pub connection_lost: bool,
    /// Version of the published snapshot, if one was published.
    pub published: Option<u64>,
}

/// Periodically reads all configured ranges and publishes the result.
pub struct PollLoop<C: Connector> {
    link: SharedLink<C>,
    ranges: Vec<RegisterRange>,
    store: RegisterStore,
    publisher: Publisher,
    supervisor: SupervisorHandle,
    interval: Duration,
}

impl<C: Connector> PollLoop<C> {
    pub fn new(
        link: SharedLink<C>,
        ranges: Vec<RegisterRange>,
        store: RegisterStore,
        publisher: Publisher,
        supervisor: SupervisorHandle,
        interval: Duration,
    ) -> Self {
        Self {
            link,
            ranges,
            store,
            publisher,
            supervisor,
            interval,
        }
    }

    /// Tick until shutdown.
    ///
    /// Ticks run one at a time; ticks missed while a tick or a connection
    /// attempt was in flight are skipped rather than queued. The cadence
    /// restarts whenever the link becomes connected.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            ranges = self.ranges.len(),
            "Starting poll loop"
        );

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut status = self.supervisor.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let connected = status.borrow_and_update().state == ConnectionState::Connected;
                    if connected {
                        ticker.reset();
                    }
                }
                _ = ticker.tick() => {
                    // An in-flight tick is abandoned on shutdown; nothing is
                    // committed and the link guard is released.
                    tokio::select! {
                        _ = self.tick() => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!("Poll loop stopped");
    }

    /// Run one tick.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(mut link) = self.link.try_lock() else {
            debug!("Link busy, skipping tick");
            return TickOutcome::Skipped;
        };

        if !link.is_open() {
            drop(link);
            debug!("Link closed, requesting connection");
            self.supervisor.ensure_connected();
            return TickOutcome::Disconnected;
        }

        let mut builder = self.store.snapshot().to_builder();
        let mut report = TickReport::default();

        for range in &self.ranges {
            match link.read_range(range).await {
                Ok(values) => match builder.apply(range, &values) {
                    Ok(()) => report.updated.push(range.name.clone()),
                    Err(e) => {
                        warn!(range = %range.name, error = %e, "Discarding read");
                        report.failed.push(range.name.clone());
                    }
                },
                Err(e) if e.is_fatal() => {
                    error!(range = %range.name, error = %e, "Connection lost during read");
                    report.failed.push(range.name.clone());
                    report.connection_lost = true;
                    break;
                }
                Err(e) => {
                    warn!(range = %range.name, error = %e, "Read error");
                    report.failed.push(range.name.clone());
                }
            }
        }

        if report.connection_lost {
            if let Err(e) = link.close().await {
                warn!(error = %e, "Failed to close broken session");
            }
        }
        drop(link);

        if !report.connection_lost || !report.updated.is_empty() {
            let snapshot = self.store.commit(builder);
            let stats = self.publisher.broadcast(snapshot.clone());
            report.published = Some(snapshot.version);

            debug!(
                version = snapshot.version,
                updated = report.updated.len(),
                failed = report.failed.len(),
                observers = stats.total(),
                delivered = stats.delivered,
                "Published snapshot"
            );
        }

        if report.connection_lost {
            self.supervisor.connection_lost();
        }

        TickOutcome::Polled(report)
    }
}
