//! Restart coalescing scheduler
//!
//! One worker task behind a capacity-1 channel. A signal sent while another
//! is already queued is dropped, so a burst collapses into a single reload
//! that starts `delay` after the first signal. Signals arriving during the
//! delay are drained before reloading; signals arriving during a reload
//! queue exactly one follow-up.

use crate::reload::ReloadRunner;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct RestartScheduler {
    tx: mpsc::Sender<()>,
}

impl RestartScheduler {
    /// Spawn the worker onto the current runtime
    pub fn spawn(runner: Arc<ReloadRunner>, delay: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(worker(rx, runner, delay));
        Self { tx }
    }

    /// Request a reload without blocking. Returns false when the request was
    /// folded into one already pending.
    pub fn schedule(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!("Reload already pending, coalescing");
                false
            }
            Err(TrySendError::Closed(())) => {
                warn!("Reload scheduler has stopped, dropping request");
                false
            }
        }
    }
}

async fn worker(mut rx: mpsc::Receiver<()>, runner: Arc<ReloadRunner>, delay: Duration) {
    while rx.recv().await.is_some() {
        tokio::time::sleep(delay).await;

        let mut coalesced = 0usize;
        while rx.try_recv().is_ok() {
            coalesced += 1;
        }
        debug!(coalesced, in_flight = runner.is_in_flight(), "Running scheduled reload");

        if let Err(e) = runner.run_exclusive().await {
            error!(error = %e, "Scheduled reload failed");
        }
    }
    debug!("Reload scheduler stopped");
}
