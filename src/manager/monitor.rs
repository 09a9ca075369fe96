//! Crash detection while serving.
//!
//! # Responsibilities
//! - Periodically look for worlds whose server exited on its own
//! - Settle and deregister them; restarting is left to the operator

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;

use crate::manager::WorldManager;
use crate::process::{CrashReport, Launcher};
use crate::provision::ExecutableFetcher;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct CrashMonitor<L: Launcher, F: ExecutableFetcher> {
    manager: Arc<WorldManager<L, F>>,
    interval: Duration,
}

impl<L: Launcher, F: ExecutableFetcher> CrashMonitor<L, F> {
    pub fn new(manager: Arc<WorldManager<L, F>>) -> Self {
        Self {
            manager,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll until the shutdown broadcast fires. Returns every crash seen.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Vec<CrashReport> {
        tracing::info!(interval = ?self.interval, "Crash monitor starting");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut seen = Vec::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for crash in self.manager.poll_crashes().await {
                        tracing::error!(
                            world = %crash.world,
                            exit = %crash.exit,
                            port = ?crash.port,
                            "World exited unexpectedly and was marked stopped"
                        );
                        seen.push(crash);
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Crash monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
        seen
    }
}
