//! Cross-context RTP packet channel
//!
//! The channel is created in the application's execution context before
//! negotiation finishes; the session hands it the ICE engines on
//! activation via a message to the channel's home task, so the engines
//! are only ever touched from one context after the hand-off. Closing is
//! asynchronous: transports go to the teardown coordinator, never severed
//! inline.

use crate::ice::{IceEngine, IceEngineEvent};
use crate::teardown::TeardownCoordinator;
use crate::types::{MediaType, PortReservation};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Inactivity span after which a diagnostic is logged
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel errors
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// Transports not installed yet
    #[error("channel not active")]
    NotActive,

    /// Channel has been closed
    #[error("channel closed")]
    Closed,

    /// The underlying engine rejected the datagram
    #[error("transport error: {0}")]
    Ice(#[from] crate::ice::IceError),
}

/// One media datagram crossing the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Stream the packet belongs to
    pub media: MediaType,
    /// Component offset within the stream: 0 for RTP, 1 for RTCP
    pub port_offset: usize,
    /// Raw packet bytes
    pub payload: Bytes,
}

/// The engines and ports a session transfers on activation
pub struct TransportSet {
    /// Engines by media type, exactly one per surviving stream
    pub engines: Vec<(MediaType, Arc<dyn IceEngine>)>,
    /// Port reservation backing the engines, if any
    pub reservation: Option<PortReservation>,
}

impl std::fmt::Debug for TransportSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSet")
            .field(
                "media",
                &self.engines.iter().map(|(m, _)| *m).collect::<Vec<_>>(),
            )
            .field("reservation", &self.reservation)
            .finish()
    }
}

enum ChannelCommand {
    SetTransports(TransportSet),
    Shutdown,
}

struct ChannelShared {
    inbound: parking_lot::Mutex<VecDeque<RtpPacket>>,
    readers: Notify,
    activity: Notify,
    transports: tokio::sync::Mutex<Option<TransportSet>>,
    closed: AtomicBool,
}

/// Bidirectional packet interface over a session's activated transports
///
/// Create it in the context that will consume media; the home task it
/// spawns there receives the transports when the session activates.
pub struct RtpChannel {
    shared: Arc<ChannelShared>,
    cmd_tx: mpsc::UnboundedSender<ChannelCommand>,
}

impl RtpChannel {
    /// Create a channel homed on the current runtime context
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(ChannelShared {
            inbound: parking_lot::Mutex::new(VecDeque::new()),
            readers: Notify::new(),
            activity: Notify::new(),
            transports: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(home_task(Arc::clone(&shared), cmd_rx));
        Self { shared, cmd_tx }
    }

    /// Hand the activated transports to the channel's home context.
    ///
    /// Called once, by the session, at activation. The transports are
    /// installed and wired up by the home task, not the caller.
    pub fn set_transports(&self, set: TransportSet) -> Result<(), ChannelError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.cmd_tx
            .send(ChannelCommand::SetTransports(set))
            .map_err(|_| ChannelError::Closed)
    }

    /// Whether transports have been installed
    pub async fn is_active(&self) -> bool {
        self.shared.transports.lock().await.is_some()
    }

    /// Receive the next inbound packet, waiting if none is queued
    pub async fn read(&self) -> Result<RtpPacket, ChannelError> {
        loop {
            let notified = self.shared.readers.notified();
            if let Some(packet) = self.shared.inbound.lock().pop_front() {
                return Ok(packet);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            notified.await;
        }
    }

    /// Receive the next inbound packet without waiting
    #[must_use]
    pub fn try_read(&self) -> Option<RtpPacket> {
        self.shared.inbound.lock().pop_front()
    }

    /// Number of inbound packets waiting
    #[must_use]
    pub fn packets_available(&self) -> usize {
        self.shared.inbound.lock().len()
    }

    /// Send a packet on its stream's component
    pub async fn write(&self, packet: RtpPacket) -> Result<(), ChannelError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let guard = self.shared.transports.lock().await;
        let set = guard.as_ref().ok_or(ChannelError::NotActive)?;
        let engine = set
            .engines
            .iter()
            .find(|(m, _)| *m == packet.media)
            .map(|(_, e)| e)
            .ok_or(ChannelError::NotActive)?;
        engine.write_datagram(packet.port_offset, packet.payload)?;
        Ok(())
    }

    /// Close the channel; transports are released in the background
    pub fn close(&self) {
        let _ = self.cmd_tx.send(ChannelCommand::Shutdown);
    }
}

impl Default for RtpChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RtpChannel {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(ChannelCommand::Shutdown);
    }
}

impl std::fmt::Debug for RtpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpChannel")
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

async fn home_task(
    shared: Arc<ChannelShared>,
    mut cmd_rx: mpsc::UnboundedReceiver<ChannelCommand>,
) {
    loop {
        match cmd_rx.recv().await {
            Some(ChannelCommand::SetTransports(set)) => {
                install_transports(&shared, set).await;
            }
            Some(ChannelCommand::Shutdown) | None => break,
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
    shared.readers.notify_waiters();
    let taken = shared.transports.lock().await.take();
    if let Some(set) = taken {
        let engines = set.engines.into_iter().map(|(_, e)| e).collect();
        TeardownCoordinator::release(engines, set.reservation);
    }
}

async fn install_transports(shared: &Arc<ChannelShared>, set: TransportSet) {
    for (media, engine) in &set.engines {
        tokio::spawn(forward_inbound(
            Arc::clone(shared),
            *media,
            Arc::clone(engine),
        ));
    }
    tokio::spawn(watch_inactivity(Arc::clone(shared)));
    debug!(streams = set.engines.len(), "transports installed");
    *shared.transports.lock().await = Some(set);
}

/// Pump one engine's received datagrams into the shared inbound queue.
async fn forward_inbound(shared: Arc<ChannelShared>, media: MediaType, engine: Arc<dyn IceEngine>) {
    let mut events = engine.subscribe();
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        match events.recv().await {
            Ok(IceEngineEvent::DatagramReady { component }) => {
                let mut drained = 0usize;
                while let Some(payload) = engine.read_datagram(component) {
                    shared.inbound.lock().push_back(RtpPacket {
                        media,
                        port_offset: component,
                        payload,
                    });
                    drained += 1;
                }
                if drained > 0 {
                    shared.readers.notify_waiters();
                    if component == 0 {
                        shared.activity.notify_waiters();
                    }
                }
            }
            Ok(IceEngineEvent::Stopped) | Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                return;
            }
            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

/// Diagnostic timer: logs when no RTP arrives for a while. Restarts on
/// every inbound packet; purely informational.
async fn watch_inactivity(shared: Arc<ChannelShared>) {
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let activity = shared.activity.notified();
        if tokio::time::timeout(INACTIVITY_TIMEOUT, activity)
            .await
            .is_err()
        {
            warn!(
                timeout_secs = INACTIVITY_TIMEOUT.as_secs(),
                "no inbound RTP within the inactivity window"
            );
        }
    }
}
