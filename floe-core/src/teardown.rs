//! Detached, self-owning teardown of ICE engines and port reservations
//!
//! Stopping an engine is asynchronous and must never block the caller:
//! sessions, channels and the manager all hand their transport resources
//! here and move on. The coordinator waits for every engine's `Stopped`
//! event, bounded by [`TEARDOWN_TIMEOUT`], then drops everything it holds
//! (releasing the port reservation last).

use crate::ice::{IceEngine, IceEngineEvent};
use crate::types::PortReservation;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on waiting for engines to confirm they stopped
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Fire-and-forget teardown of a set of engines
#[derive(Debug)]
pub struct TeardownCoordinator;

impl TeardownCoordinator {
    /// Stop the given engines in the background and release the port
    /// reservation once they are all down or the timeout elapses.
    ///
    /// Returns immediately. The spawned task owns the engines and the
    /// reservation for the remainder of their lives.
    pub fn release(engines: Vec<Arc<dyn IceEngine>>, reservation: Option<PortReservation>) {
        if engines.is_empty() {
            drop(reservation);
            return;
        }
        tokio::spawn(async move {
            // The timeout covers the stop calls themselves, not just the
            // Stopped waits: an engine whose `stop` never returns must not
            // hold up the others or the release. Subscribe before
            // requesting the stop so the Stopped event cannot be missed.
            let shutdowns = engines.iter().map(|engine| async move {
                let rx = engine.subscribe();
                engine.stop().await;
                if !engine.is_stopped() {
                    wait_for_stopped(rx).await;
                }
            });

            let all = join_all(shutdowns);
            if tokio::time::timeout(TEARDOWN_TIMEOUT, all).await.is_err() {
                warn!(
                    engines = engines.len(),
                    "teardown timed out waiting for engines to stop"
                );
            } else {
                debug!(engines = engines.len(), "all engines stopped");
            }
            drop(engines);
            drop(reservation);
        });
    }
}

async fn wait_for_stopped(mut rx: tokio::sync::broadcast::Receiver<IceEngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(IceEngineEvent::Stopped) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
