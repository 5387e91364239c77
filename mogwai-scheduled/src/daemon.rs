//! Daemon lifecycle
//!
//! Wires the production collaborators to the scheduler core, runs the
//! event loop, and handles termination: SIGINT/SIGTERM, and an optional
//! inactivity timeout that exits the daemon once no entries have existed
//! for the configured time.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mogwai_schedule::{
    ProcessPeerManager, ScheduleService, Scheduler, SchedulerLoop, SharedScheduler, ShutdownToken,
    StaticConnectionMonitor, SystemClock,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;

/// The assembled download scheduler daemon
pub struct Daemon {
    scheduler: SharedScheduler,
    service: ScheduleService,
    shutdown: ShutdownToken,
    inactivity_timeout: Option<Duration>,
    loop_task: JoinHandle<()>,
}

impl Daemon {
    /// Build collaborators and scheduler from the configuration.
    pub fn new(config: &Config, tariff_dir: &Path) -> anyhow::Result<Self> {
        let connections = config
            .connection_table(tariff_dir)
            .context("resolving connection table")?;
        info!(connections = connections.len(), "configured connections");

        let monitor = StaticConnectionMonitor::new(connections);
        let peers = ProcessPeerManager::new(Duration::from_secs(
            config.scheduler.peer_poll_interval_secs,
        ));
        let clock = SystemClock::new();
        let scheduler: SharedScheduler = Arc::new(Mutex::new(Scheduler::new(
            monitor,
            peers,
            clock,
            config.scheduler_config(),
        )));

        let shutdown = ShutdownToken::new();
        let loop_task = tokio::spawn(
            SchedulerLoop::new(Arc::clone(&scheduler), shutdown.clone()).run(),
        );
        let service = ScheduleService::new(Arc::clone(&scheduler), shutdown.clone());

        let inactivity_timeout = match config.scheduler.inactivity_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            scheduler,
            service,
            shutdown,
            inactivity_timeout,
            loop_task,
        })
    }

    /// The client-facing service surface.
    pub fn service(&self) -> &ScheduleService {
        &self.service
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Run until a termination signal, the inactivity timeout, or an
    /// external shutdown trigger.
    pub async fn run(self) -> anyhow::Result<()> {
        if let Some(timeout) = self.inactivity_timeout {
            tokio::spawn(watch_inactivity(
                Arc::clone(&self.scheduler),
                timeout,
                self.shutdown.clone(),
            ));
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("shutdown requested");
            }
            signal = termination_signal() => {
                let signal = signal?;
                info!(signal, "termination signal received");
                self.shutdown.trigger();
            }
        }

        // The loop drops all entries (cancelling in-flight work) on exit.
        self.loop_task.await.context("scheduler loop panicked")?;
        info!("scheduler stopped");
        Ok(())
    }
}

/// Wait for SIGINT or SIGTERM; resolves to the signal name.
async fn termination_signal() -> anyhow::Result<&'static str> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for SIGINT")?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

/// Trigger shutdown once the scheduler has been empty for `timeout`.
/// Any scheduler signal resets the countdown.
async fn watch_inactivity(
    scheduler: SharedScheduler,
    timeout: Duration,
    shutdown: ShutdownToken,
) {
    let mut signals = scheduler.lock().subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            signal = signals.recv() => {
                if signal.is_none() {
                    return;
                }
                debug!("activity observed, inactivity timer reset");
            }
            _ = tokio::time::sleep(timeout) => {
                if scheduler.lock().entry_count() == 0 {
                    info!(?timeout, "no entries for the inactivity timeout, exiting");
                    shutdown.trigger();
                    return;
                }
            }
        }
    }
}
