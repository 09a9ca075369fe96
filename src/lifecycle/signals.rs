//! OS signal handling.
//!
//! # Responsibilities
//! - Register SIGTERM, SIGINT and SIGHUP handlers
//! - Translate signals into manager events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGTERM/SIGINT stop every supervised world, SIGHUP restarts them

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};

/// What a received signal asks the manager to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Restart,
}

/// Signal streams registered once and polled repeatedly.
pub struct Signals {
    terminate: Signal,
    interrupt: Signal,
    hangup: Signal,
}

impl Signals {
    pub fn register() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next signal of interest.
    pub async fn next(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.terminate.recv() => {
                tracing::info!("SIGTERM received");
                SignalEvent::Shutdown
            }
            _ = self.interrupt.recv() => {
                tracing::info!("SIGINT received");
                SignalEvent::Shutdown
            }
            _ = self.hangup.recv() => {
                tracing::info!("SIGHUP received");
                SignalEvent::Restart
            }
        }
    }
}
