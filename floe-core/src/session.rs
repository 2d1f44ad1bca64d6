//! Per-call negotiation state machine
//!
//! A session owns everything one call needs between creation and
//! activation: resolved helper addresses, one ICE engine per media
//! stream, the trickle queues for both candidate directions, and the
//! signaling conversation with the remote peer. All mutation happens
//! under a single lock that produces a batch of outbound effects; the
//! effects (signaling sends, events, teardowns, the activation hand-off)
//! run after the lock is dropped.

use crate::ice::{
    order_local_addresses, Candidate, IceConfig, IceEngine, IceEngineEvent, IceEngineFactory,
    IceFeatures, IceRole, TransportKind, TurnServer, COMPONENTS,
};
use crate::manager::Registry;
use crate::resolver::{AddressResolver, ResolvedAddresses};
use crate::rtp::{RtpChannel, TransportSet};
use crate::signaling::{
    error_codes, ContentBlock, MediaDescription, SignalingAction, SignalingEnvelope,
    SignalingError, SignalingTransport, TransportBlock,
};
use crate::teardown::TeardownCoordinator;
use crate::trickle::TrickleQueue;
use crate::types::{
    Direction, FailureReason, MediaSelection, MediaType, PayloadType, PortReservation, Reason,
    ReasonCondition, SessionConfig, SessionEvent, SessionId, SessionState,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Ports reserved per call: two media streams of two components each
const RESERVED_PORTS: u16 = (2 * COMPONENTS) as u16;

/// Session API misuse errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Operation does not apply in the current state
    #[error("operation invalid in state {0:?}")]
    InvalidState(SessionState),

    /// The selection shares no media with the offer
    #[error("no usable media selected")]
    NoMediaSelected,
}

/// Per-stream negotiation bookkeeping
struct IceStatus {
    content_name: String,
    kind: TransportKind,
    version: u32,
    engine: Option<Arc<dyn IceEngine>>,
    remote_ufrag: Option<String>,
    remote_password: Option<String>,
    pending_local: TrickleQueue<Candidate>,
    pending_remote: TrickleQueue<Candidate>,
    local_gathering_complete_pending: bool,
    remote_gathering_complete: bool,
    started: bool,
    connected: bool,
}

impl IceStatus {
    fn new(content_name: String, kind: TransportKind, version: u32) -> Self {
        Self {
            content_name,
            kind,
            version,
            engine: None,
            remote_ufrag: None,
            remote_password: None,
            pending_local: TrickleQueue::new(),
            pending_remote: TrickleQueue::new(),
            local_gathering_complete_pending: false,
            remote_gathering_complete: false,
            started: false,
            connected: false,
        }
    }

    /// Apply stored peer credentials and gathering state to the engine.
    fn sync_engine_remote_state(&mut self) {
        let Some(engine) = &self.engine else { return };
        if let (Some(ufrag), Some(password)) = (&self.remote_ufrag, &self.remote_password) {
            engine.set_peer_credentials(ufrag, password);
        }
        let batch = self.pending_remote.mark_ready();
        if !batch.is_empty() {
            engine.add_remote_candidates(batch);
        }
        if self.remote_gathering_complete {
            engine.set_remote_gathering_complete();
        }
    }
}

struct SessionInner {
    state: SessionState,
    local_payloads: HashMap<MediaType, Vec<PayloadType>>,
    remote_payloads: HashMap<MediaType, Vec<PayloadType>>,
    ice: HashMap<MediaType, IceStatus>,
    resolved: ResolvedAddresses,
    remote_identity: Option<String>,
    local_media_ready: bool,
    ice_started: bool,
    ice_connected: bool,
    offer_sent: bool,
    remote_accept_processed: bool,
    activated: bool,
    reservation: Option<PortReservation>,
}

/// Deferred side effects produced under the session lock
enum Outbound {
    /// Tracked offer (initiate or accept); failure terminates the session
    Offer(SignalingEnvelope),
    /// Fire-and-forget envelope
    Send(SignalingEnvelope),
    /// Acknowledge an inbound request
    Ack(String),
    /// Reject an inbound request
    Error {
        correlation_id: String,
        code: u16,
        text: String,
    },
    /// Application event
    Event(SessionEvent),
    /// Background teardown of transport resources
    Release {
        engines: Vec<Arc<dyn IceEngine>>,
        reservation: Option<PortReservation>,
    },
    /// Transfer transports to the RTP channel
    Activate(TransportSet),
    /// Close the RTP channel
    CloseChannel,
}

/// Envelope headed for the signaling transport, in sending order.
///
/// All of a session's traffic funnels through one queue so that nothing
/// overtakes anything it was produced after: candidate flushes stay
/// behind the offer they were buffered for, and the acknowledgement of an
/// inbound request stays ahead of any terminate it triggered.
enum WireMessage {
    /// Tracked offer (initiate or accept); failure terminates the session
    Offer(SignalingEnvelope),
    /// Fire-and-forget envelope
    Send(SignalingEnvelope),
    /// Acknowledge an inbound request
    Ack(String),
    /// Reject an inbound request
    Error {
        correlation_id: String,
        code: u16,
        text: String,
    },
}

/// One peer-to-peer media call, outgoing or incoming
pub struct CallSession<T: SignalingTransport> {
    id: SessionId,
    peer: T::PeerId,
    direction: Direction,
    config: SessionConfig,
    signaling: Arc<T>,
    resolver: AddressResolver,
    factory: Arc<dyn IceEngineFactory>,
    registry: Weak<Registry<T>>,
    events: broadcast::Sender<SessionEvent>,
    channel: Arc<RtpChannel>,
    outbound: mpsc::UnboundedSender<WireMessage>,
    inner: parking_lot::Mutex<SessionInner>,
}

impl<T: SignalingTransport> CallSession<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        peer: T::PeerId,
        direction: Direction,
        config: SessionConfig,
        signaling: Arc<T>,
        resolver: AddressResolver,
        factory: Arc<dyn IceEngineFactory>,
        registry: Weak<Registry<T>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            peer,
            direction,
            config,
            signaling,
            resolver,
            factory,
            registry,
            events,
            channel: Arc::new(RtpChannel::new()),
            outbound,
            inner: parking_lot::Mutex::new(SessionInner {
                state: SessionState::Idle,
                local_payloads: HashMap::new(),
                remote_payloads: HashMap::new(),
                ice: HashMap::new(),
                resolved: ResolvedAddresses::default(),
                remote_identity: None,
                local_media_ready: false,
                ice_started: false,
                ice_connected: false,
                offer_sent: false,
                remote_accept_processed: false,
                activated: false,
                reservation: None,
            }),
        });
        tokio::spawn(outbound_pump(
            Arc::downgrade(&session),
            Arc::clone(&session.signaling),
            session.peer.clone(),
            session.config.negotiation_timeout,
            outbound_rx,
        ));
        session
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Remote peer
    #[must_use]
    pub fn peer(&self) -> &T::PeerId {
        &self.peer
    }

    /// Whether we initiated the call
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current negotiation state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Remote payload types recorded so far, per media type
    #[must_use]
    pub fn remote_payloads(&self) -> HashMap<MediaType, Vec<PayloadType>> {
        self.inner.lock().remote_payloads.clone()
    }

    /// Media types the remote offered (incoming) or still in play
    #[must_use]
    pub fn media_types(&self) -> Vec<MediaType> {
        let inner = self.inner.lock();
        MediaType::all()
            .into_iter()
            .filter(|m| inner.ice.contains_key(m))
            .collect()
    }

    /// Helper addresses resolved for this call, if resolution has run
    #[must_use]
    pub fn resolved_addresses(&self) -> ResolvedAddresses {
        self.inner.lock().resolved.clone()
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// The packet channel this session activates into
    #[must_use]
    pub fn channel(&self) -> Arc<RtpChannel> {
        Arc::clone(&self.channel)
    }

    /// Begin an outgoing call offering the given media and codecs.
    #[tracing::instrument(skip(self, payloads), fields(sid = %self.id))]
    pub fn start(
        self: &Arc<Self>,
        selection: MediaSelection,
        payloads: HashMap<MediaType, Vec<PayloadType>>,
    ) -> Result<(), SessionError> {
        if self.direction != Direction::Outgoing {
            return Err(SessionError::InvalidState(self.state()));
        }
        if selection.is_empty() {
            return Err(SessionError::NoMediaSelected);
        }
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(SessionError::InvalidState(inner.state));
            }
            for media in selection.to_media_types() {
                inner.ice.insert(
                    media,
                    IceStatus::new(media.to_string(), TransportKind::IceUdp, 1),
                );
            }
            inner.local_payloads = payloads;
            inner.local_media_ready = true;
            inner.state = SessionState::ResolvingAddresses;
        }
        info!(peer = %self.peer, "starting outgoing call");
        self.spawn_resolve();
        Ok(())
    }

    /// Accept an incoming call with a subset of the offered media.
    ///
    /// If `payloads` is `None` the local media is finalized later via
    /// [`update_local_media`](Self::update_local_media); the accept is
    /// held until then.
    #[tracing::instrument(skip(self, payloads), fields(sid = %self.id))]
    pub fn accept(
        self: &Arc<Self>,
        selection: MediaSelection,
        payloads: Option<HashMap<MediaType, Vec<PayloadType>>>,
    ) -> Result<(), SessionError> {
        if self.direction != Direction::Incoming {
            return Err(SessionError::InvalidState(self.state()));
        }
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(SessionError::InvalidState(inner.state));
            }
            inner.ice.retain(|media, _| selection.contains(*media));
            if inner.ice.is_empty() {
                return Err(SessionError::NoMediaSelected);
            }
            if let Some(payloads) = payloads {
                inner.local_payloads = payloads;
                inner.local_media_ready = true;
            }
            inner.state = SessionState::ResolvingAddresses;
        }
        info!(peer = %self.peer, "accepting incoming call");
        self.spawn_resolve();
        Ok(())
    }

    /// Supply or replace the local payload types once media is finalized.
    ///
    /// Marks local media ready; if the engines have already started this
    /// releases the held accept (incoming) or is a no-op for sessions
    /// that were started with payloads.
    pub fn update_local_media(self: &Arc<Self>, payloads: HashMap<MediaType, Vec<PayloadType>>) {
        let out = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.local_payloads = payloads;
            inner.local_media_ready = true;
            let mut out = Vec::new();
            self.try_send_local_offer(&mut inner, &mut out);
            out
        };
        self.dispatch(out);
    }

    /// End the call locally.
    ///
    /// Before an initiate has been sent an outgoing call ends silently;
    /// otherwise the remote is told why (cancel, decline, or success for
    /// an established call).
    #[tracing::instrument(skip(self), fields(sid = %self.id))]
    pub fn reject(self: &Arc<Self>) {
        let out = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Terminated {
                return;
            }
            let mut out = Vec::new();
            let silent = self.direction == Direction::Outgoing && !inner.offer_sent;
            if !silent {
                let condition = if inner.activated {
                    ReasonCondition::Success
                } else if self.direction == Direction::Outgoing {
                    ReasonCondition::Cancel
                } else {
                    ReasonCondition::Decline
                };
                out.push(Outbound::Send(
                    self.terminate_envelope(Reason::new(condition)),
                ));
            }
            self.collect_teardown(&mut inner, &mut out);
            inner.state = SessionState::Terminated;
            out
        };
        self.dispatch(out);
        self.unregister();
    }

    /// Record the remote offer from a `session-initiate`.
    ///
    /// Called by the manager before the session is registered; an offer
    /// with no usable content never creates a session.
    pub(crate) fn handle_initiate(&self, envelope: &SignalingEnvelope) -> Result<(), FailureReason> {
        let mut inner = self.inner.lock();
        inner.remote_identity = envelope.initiator.clone();
        for content in &envelope.contents {
            let Some(media) = content.media_hint() else {
                continue;
            };
            let (kind, version) = content
                .transport
                .as_ref()
                .map_or((TransportKind::IceUdp, 1), |t| (t.kind, t.version));
            let mut status = IceStatus::new(content.name.clone(), kind, version);
            if let Some(transport) = &content.transport {
                status.remote_ufrag = transport.ufrag.clone();
                status.remote_password = transport.password.clone();
                status
                    .pending_remote
                    .push_with(transport.candidates.iter().cloned(), Candidate::same_endpoint);
                status.remote_gathering_complete = transport.gathering_complete;
            }
            if let Some(desc) = &content.description {
                inner
                    .remote_payloads
                    .insert(media, desc.payload_types.clone());
            }
            inner.ice.insert(media, status);
        }
        if inner.ice.is_empty() {
            return Err(FailureReason::NoUsableMedia);
        }
        let _ = self.events.send(SessionEvent::RemoteMediaUpdated);
        Ok(())
    }

    /// Process an inbound request addressed to this session.
    pub(crate) fn handle_request(
        self: &Arc<Self>,
        correlation_id: &str,
        envelope: &SignalingEnvelope,
    ) {
        let out = {
            let mut inner = self.inner.lock();
            let mut out = Vec::new();
            match &envelope.action {
                SignalingAction::SessionAccept => {
                    self.process_accept(&mut inner, correlation_id, envelope, &mut out);
                }
                SignalingAction::TransportInfo => {
                    self.process_transport_info(&mut inner, correlation_id, envelope, &mut out);
                }
                SignalingAction::SessionTerminate => {
                    debug!(sid = %self.id, reason = ?envelope.reason, "remote terminated session");
                    out.push(Outbound::Ack(correlation_id.to_owned()));
                    if inner.state != SessionState::Terminated {
                        self.collect_teardown(&mut inner, &mut out);
                        inner.state = SessionState::Terminated;
                        out.push(Outbound::Event(SessionEvent::Rejected));
                    }
                }
                SignalingAction::SessionInitiate | SignalingAction::Other(_) => {
                    out.push(Outbound::Error {
                        correlation_id: correlation_id.to_owned(),
                        code: error_codes::BAD_REQUEST,
                        text: format!("unexpected action {}", envelope.action),
                    });
                }
            }
            out
        };
        let terminated = matches!(self.state(), SessionState::Terminated);
        self.dispatch(out);
        if terminated {
            self.unregister();
        }
    }

    fn process_accept(
        self: &Arc<Self>,
        inner: &mut SessionInner,
        correlation_id: &str,
        envelope: &SignalingEnvelope,
        out: &mut Vec<Outbound>,
    ) {
        if self.direction != Direction::Outgoing || inner.remote_accept_processed {
            out.push(Outbound::Error {
                correlation_id: correlation_id.to_owned(),
                code: error_codes::BAD_REQUEST,
                text: "unexpected session-accept".to_owned(),
            });
            return;
        }
        inner.remote_identity = envelope.responder.clone();
        inner.remote_accept_processed = true;

        let mut accepted = Vec::new();
        let mut media_updated = false;
        for content in &envelope.contents {
            let Some(media) = content.media_hint() else {
                continue;
            };
            if !inner.ice.contains_key(&media) {
                continue;
            }
            accepted.push(media);
            if let Some(desc) = &content.description {
                inner
                    .remote_payloads
                    .insert(media, desc.payload_types.clone());
                media_updated = true;
            }
            if let Some(status) = inner.ice.get_mut(&media) {
                if let Some(transport) = &content.transport {
                    if transport.ufrag.is_some() {
                        status.remote_ufrag = transport.ufrag.clone();
                    }
                    if transport.password.is_some() {
                        status.remote_password = transport.password.clone();
                    }
                    status
                        .pending_remote
                        .push_with(transport.candidates.iter().cloned(), Candidate::same_endpoint);
                    if transport.gathering_complete {
                        status.remote_gathering_complete = true;
                    }
                }
            }
        }

        // Media we offered but the remote declined is torn down now.
        let declined: Vec<MediaType> = inner
            .ice
            .keys()
            .filter(|m| !accepted.contains(m))
            .copied()
            .collect();
        let mut dropped = Vec::new();
        for media in declined {
            if let Some(mut status) = inner.ice.remove(&media) {
                if let Some(engine) = status.engine.take() {
                    dropped.push(engine);
                }
            }
        }
        if !dropped.is_empty() {
            out.push(Outbound::Release {
                engines: dropped,
                reservation: None,
            });
        }

        if inner.ice.is_empty() {
            warn!(sid = %self.id, "remote accept left no usable media");
            out.push(Outbound::Ack(correlation_id.to_owned()));
            out.push(Outbound::Send(self.terminate_envelope(Reason::new(
                ReasonCondition::IncompatibleParameters,
            ))));
            self.collect_teardown(inner, out);
            inner.state = SessionState::Terminated;
            out.push(Outbound::Event(SessionEvent::Rejected));
            return;
        }

        if media_updated {
            out.push(Outbound::Event(SessionEvent::RemoteMediaUpdated));
        }
        for status in inner.ice.values_mut() {
            status.sync_engine_remote_state();
            if let Some(engine) = &status.engine {
                engine.start_checks();
            }
        }
        inner.state = SessionState::Connecting;
        out.push(Outbound::Ack(correlation_id.to_owned()));
        // Connectivity may already have been signalled while we waited
        // for the accept.
        self.try_activate(inner, out);
    }

    fn process_transport_info(
        &self,
        inner: &mut SessionInner,
        correlation_id: &str,
        envelope: &SignalingEnvelope,
        out: &mut Vec<Outbound>,
    ) {
        let mut matched = false;
        for content in &envelope.contents {
            let media = inner
                .ice
                .iter()
                .find(|(_, s)| s.content_name == content.name)
                .map(|(m, _)| *m)
                .or_else(|| content.media_hint().filter(|m| inner.ice.contains_key(m)));
            let Some(media) = media else { continue };
            let Some(status) = inner.ice.get_mut(&media) else {
                continue;
            };
            matched = true;
            let Some(transport) = &content.transport else {
                continue;
            };
            if transport.ufrag.is_some() {
                status.remote_ufrag = transport.ufrag.clone();
            }
            if transport.password.is_some() {
                status.remote_password = transport.password.clone();
            }
            let ready = status.pending_remote.is_ready();
            let batch = status
                .pending_remote
                .push_with(transport.candidates.iter().cloned(), Candidate::same_endpoint);
            if transport.gathering_complete {
                status.remote_gathering_complete = true;
            }
            if ready {
                if let Some(engine) = &status.engine {
                    if let (Some(ufrag), Some(password)) =
                        (&status.remote_ufrag, &status.remote_password)
                    {
                        engine.set_peer_credentials(ufrag, password);
                    }
                    if !batch.is_empty() {
                        engine.add_remote_candidates(batch);
                    }
                    if transport.gathering_complete {
                        engine.set_remote_gathering_complete();
                    }
                }
            }
        }
        if matched {
            out.push(Outbound::Ack(correlation_id.to_owned()));
        } else {
            out.push(Outbound::Error {
                correlation_id: correlation_id.to_owned(),
                code: error_codes::BAD_REQUEST,
                text: "transport-info matches no content".to_owned(),
            });
        }
    }

    fn spawn_resolve(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let resolver = self.resolver.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let resolved = resolver.resolve(&config).await;
            if let Some(session) = weak.upgrade() {
                session.on_addresses_resolved(resolved);
            }
        });
    }

    fn on_addresses_resolved(self: &Arc<Self>, resolved: ResolvedAddresses) {
        let mut engines = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::ResolvingAddresses {
                return;
            }
            inner.resolved = resolved.clone();
            inner.state = SessionState::GatheringCandidates;
            if let Some(base) = self.config.base_port {
                inner.reservation = Some(PortReservation::new(base, RESERVED_PORTS));
            }
            let local_addresses = order_local_addresses(&self.config.local_addresses);
            for (media, status) in &mut inner.ice {
                let engine = self.factory.create(IceConfig {
                    media: *media,
                    components: COMPONENTS,
                    local_addresses: local_addresses.clone(),
                    external_address: resolved.external,
                    stun: resolved.stun,
                    turn_udp: turn_server(resolved.turn_udp, self.config.turn_udp.as_ref()),
                    turn_tcp: turn_server(resolved.turn_tcp, self.config.turn_tcp.as_ref()),
                    base_port: self.config.base_port,
                });
                let features = IceFeatures::for_transport(status.kind, status.version);
                engine.set_local_features(features);
                engine.set_remote_features(features);
                if self.direction == Direction::Incoming {
                    // Remote state arrived with the initiate; feed it as
                    // soon as the engine exists.
                    status.engine = Some(Arc::clone(&engine));
                    status.sync_engine_remote_state();
                } else {
                    status.engine = Some(Arc::clone(&engine));
                }
                engines.push((*media, engine));
            }
        }
        let role = match self.direction {
            Direction::Outgoing => IceRole::Initiator,
            Direction::Incoming => IceRole::Responder,
        };
        for (media, engine) in engines {
            self.spawn_engine_pump(media, &engine);
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                if let Err(e) = engine.start(role).await {
                    warn!(%media, error = %e, "ICE engine failed to start");
                    if let Some(session) = weak.upgrade() {
                        session.fail(FailureReason::IceFailure);
                    }
                }
            });
        }
    }

    fn spawn_engine_pump(self: &Arc<Self>, media: MediaType, engine: &Arc<dyn IceEngine>) {
        let mut events = engine.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(session) = weak.upgrade() else { return };
                match event {
                    IceEngineEvent::Started => session.on_engine_started(media),
                    IceEngineEvent::LocalCandidatesReady(candidates) => {
                        session.on_local_candidates(media, candidates);
                    }
                    IceEngineEvent::LocalGatheringComplete => {
                        session.on_local_gathering_complete(media);
                    }
                    IceEngineEvent::ReadyToSendMedia => session.on_engine_connected(media),
                    IceEngineEvent::Error(e) => {
                        warn!(%media, error = %e, "ICE engine error");
                        session.fail(FailureReason::IceFailure);
                        return;
                    }
                    IceEngineEvent::Stopped => return,
                    IceEngineEvent::DatagramReady { .. } => {}
                }
            }
        });
    }

    fn on_engine_started(self: &Arc<Self>, media: MediaType) {
        let out = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            if let Some(status) = inner.ice.get_mut(&media) {
                status.started = true;
            }
            if inner.ice.values().all(|s| s.started) {
                inner.ice_started = true;
            }
            let mut out = Vec::new();
            self.try_send_local_offer(&mut inner, &mut out);
            if inner.ice_started
                && !inner.offer_sent
                && self.direction == Direction::Incoming
                && !inner.local_media_ready
            {
                inner.state = SessionState::AwaitingLocalAccept;
            }
            out
        };
        self.dispatch(out);
    }

    fn on_local_candidates(self: &Arc<Self>, media: MediaType, candidates: Vec<Candidate>) {
        let out = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            let mut out = Vec::new();
            if let Some(status) = inner.ice.get_mut(&media) {
                let batch = status
                    .pending_local
                    .push_with(candidates, Candidate::same_endpoint);
                if !batch.is_empty() {
                    let envelope = self.transport_info_envelope(status, batch, false);
                    out.push(Outbound::Send(envelope));
                }
            }
            out
        };
        self.dispatch(out);
    }

    fn on_local_gathering_complete(self: &Arc<Self>, media: MediaType) {
        let out = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            let mut out = Vec::new();
            if let Some(status) = inner.ice.get_mut(&media) {
                if status.pending_local.is_ready() {
                    let envelope = self.transport_info_envelope(status, Vec::new(), true);
                    out.push(Outbound::Send(envelope));
                } else {
                    status.local_gathering_complete_pending = true;
                }
            }
            out
        };
        self.dispatch(out);
    }

    fn on_engine_connected(self: &Arc<Self>, media: MediaType) {
        let out = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            if let Some(status) = inner.ice.get_mut(&media) {
                status.connected = true;
            }
            if inner.ice.values().all(|s| s.connected) {
                inner.ice_connected = true;
            }
            let mut out = Vec::new();
            self.try_activate(&mut inner, &mut out);
            out
        };
        self.dispatch(out);
    }

    /// Send the initiate (outgoing) or accept (incoming) once every
    /// engine has started and local media is ready. Flushes each
    /// stream's buffered local candidates right behind it.
    fn try_send_local_offer(self: &Arc<Self>, inner: &mut SessionInner, out: &mut Vec<Outbound>) {
        if inner.offer_sent || !inner.ice_started || !inner.local_media_ready {
            return;
        }
        if inner.state.is_terminal() {
            return;
        }
        let action = match self.direction {
            Direction::Outgoing => SignalingAction::SessionInitiate,
            Direction::Incoming => SignalingAction::SessionAccept,
        };
        let mut envelope = SignalingEnvelope::new(action, self.id.as_str());
        match self.direction {
            Direction::Outgoing => envelope.initiator = self.config.local_identity.clone(),
            Direction::Incoming => {
                envelope.initiator = inner.remote_identity.clone();
                envelope.responder = self.config.local_identity.clone();
            }
        }
        for media in MediaType::all() {
            let Some(status) = inner.ice.get(&media) else {
                continue;
            };
            let mut content = ContentBlock::initiator(status.content_name.clone());
            content.description = Some(MediaDescription {
                media,
                payload_types: inner.local_payloads.get(&media).cloned().unwrap_or_default(),
            });
            let mut transport = TransportBlock::new(status.kind, status.version);
            if let Some(engine) = &status.engine {
                transport.ufrag = Some(engine.local_ufrag());
                transport.password = Some(engine.local_password());
            }
            content.transport = Some(transport);
            envelope.contents.push(content);
        }
        inner.offer_sent = true;
        out.push(Outbound::Offer(envelope));

        // Buffered local candidates flush now, as standalone updates.
        let mut flushes = Vec::new();
        for status in inner.ice.values_mut() {
            let batch = status.pending_local.mark_ready();
            let complete = std::mem::take(&mut status.local_gathering_complete_pending);
            if !batch.is_empty() || complete {
                flushes.push(self.transport_info_envelope(status, batch, complete));
            }
        }
        out.extend(flushes.into_iter().map(Outbound::Send));

        match self.direction {
            Direction::Outgoing => inner.state = SessionState::AwaitingAccept,
            Direction::Incoming => {
                // Our accept is on the wire; checks can begin.
                for status in inner.ice.values() {
                    if let Some(engine) = &status.engine {
                        engine.start_checks();
                    }
                }
                inner.state = SessionState::Connecting;
            }
        }
    }

    /// Activate exactly once: transports move to the RTP channel.
    fn try_activate(&self, inner: &mut SessionInner, out: &mut Vec<Outbound>) {
        if inner.activated || !inner.ice_connected || inner.state != SessionState::Connecting {
            return;
        }
        inner.activated = true;
        inner.state = SessionState::Activated;
        let mut engines = Vec::new();
        for media in MediaType::all() {
            if let Some(status) = inner.ice.get_mut(&media) {
                if let Some(engine) = status.engine.take() {
                    engines.push((media, engine));
                }
            }
        }
        let reservation = inner.reservation.take();
        info!(sid = %self.id, streams = engines.len(), "session activated");
        out.push(Outbound::Activate(TransportSet {
            engines,
            reservation,
        }));
        out.push(Outbound::Event(SessionEvent::Activated));
    }

    /// Terminate after an unrecoverable local failure.
    pub(crate) fn fail(self: &Arc<Self>, reason: FailureReason) {
        let out = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Terminated {
                return;
            }
            let mut out = Vec::new();
            if matches!(reason, FailureReason::IceFailure) && inner.offer_sent {
                out.push(Outbound::Send(self.terminate_envelope(Reason::with_text(
                    ReasonCondition::ConnectivityError,
                    reason.to_string(),
                ))));
            }
            self.collect_teardown(&mut inner, &mut out);
            inner.state = SessionState::Terminated;
            out.push(Outbound::Event(SessionEvent::Failed { reason }));
            out
        };
        self.dispatch(out);
        self.unregister();
    }

    /// The tracked offer came back with a remote error.
    fn on_offer_rejected(self: &Arc<Self>, code: u16, text: &str) {
        warn!(sid = %self.id, code, text, "offer rejected by remote");
        let out = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Terminated {
                return;
            }
            let mut out = Vec::new();
            self.collect_teardown(&mut inner, &mut out);
            inner.state = SessionState::Terminated;
            out.push(Outbound::Event(SessionEvent::Rejected));
            out
        };
        self.dispatch(out);
        self.unregister();
    }

    fn collect_teardown(&self, inner: &mut SessionInner, out: &mut Vec<Outbound>) {
        let engines: Vec<Arc<dyn IceEngine>> = inner
            .ice
            .values_mut()
            .filter_map(|s| s.engine.take())
            .collect();
        let reservation = inner.reservation.take();
        if !engines.is_empty() || reservation.is_some() {
            out.push(Outbound::Release {
                engines,
                reservation,
            });
        }
        out.push(Outbound::CloseChannel);
    }

    fn terminate_envelope(&self, reason: Reason) -> SignalingEnvelope {
        let mut envelope =
            SignalingEnvelope::new(SignalingAction::SessionTerminate, self.id.as_str());
        envelope.reason = Some(reason);
        envelope
    }

    fn transport_info_envelope(
        &self,
        status: &IceStatus,
        candidates: Vec<Candidate>,
        gathering_complete: bool,
    ) -> SignalingEnvelope {
        let mut envelope = SignalingEnvelope::new(SignalingAction::TransportInfo, self.id.as_str());
        let mut content = ContentBlock::initiator(status.content_name.clone());
        content.disposition = None;
        content.senders = None;
        let mut transport = TransportBlock::new(status.kind, status.version);
        if let Some(engine) = &status.engine {
            transport.ufrag = Some(engine.local_ufrag());
            transport.password = Some(engine.local_password());
        }
        transport.candidates = candidates;
        transport.gathering_complete = gathering_complete;
        content.transport = Some(transport);
        envelope.contents.push(content);
        envelope
    }

    fn dispatch(self: &Arc<Self>, items: Vec<Outbound>) {
        for item in items {
            match item {
                // Signaling traffic goes through the ordered pump, one
                // message at a time; nothing may overtake the offer it
                // was queued behind.
                Outbound::Offer(envelope) => {
                    let _ = self.outbound.send(WireMessage::Offer(envelope));
                }
                Outbound::Send(envelope) => {
                    let _ = self.outbound.send(WireMessage::Send(envelope));
                }
                Outbound::Ack(correlation_id) => {
                    let _ = self.outbound.send(WireMessage::Ack(correlation_id));
                }
                Outbound::Error {
                    correlation_id,
                    code,
                    text,
                } => {
                    let _ = self.outbound.send(WireMessage::Error {
                        correlation_id,
                        code,
                        text,
                    });
                }
                Outbound::Event(event) => {
                    let _ = self.events.send(event);
                }
                Outbound::Release {
                    engines,
                    reservation,
                } => {
                    TeardownCoordinator::release(engines, reservation);
                }
                Outbound::Activate(set) => {
                    if self.channel.set_transports(set).is_err() {
                        warn!(sid = %self.id, "RTP channel closed before activation");
                    }
                }
                Outbound::CloseChannel => {
                    self.channel.close();
                }
            }
        }
    }

    fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let peer = self.peer.clone();
            let id = self.id.clone();
            tokio::spawn(async move {
                registry.remove(&peer, &id).await;
            });
        }
    }
}

/// Drains one session's [`WireMessage`] queue in order.
///
/// Holds only a `Weak` back-reference: messages already queued (a final
/// terminate in particular) still go out after the session is dropped,
/// and the pump ends once the queue closes.
async fn outbound_pump<T: SignalingTransport>(
    session: Weak<CallSession<T>>,
    signaling: Arc<T>,
    peer: T::PeerId,
    offer_timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<WireMessage>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            WireMessage::Offer(envelope) => {
                let sent = signaling.request(&peer, envelope);
                match tokio::time::timeout(offer_timeout, sent).await {
                    Ok(Ok(())) => {
                        debug!(%peer, "offer acknowledged");
                    }
                    Ok(Err(SignalingError::Remote { code, text })) => {
                        if let Some(session) = session.upgrade() {
                            session.on_offer_rejected(code, &text);
                        }
                    }
                    Ok(Err(SignalingError::Timeout)) | Err(_) => {
                        if let Some(session) = session.upgrade() {
                            session.fail(FailureReason::NegotiationTimeout);
                        }
                    }
                    Ok(Err(SignalingError::Transport(text))) => {
                        if let Some(session) = session.upgrade() {
                            session.fail(FailureReason::General(text));
                        }
                    }
                }
            }
            WireMessage::Send(envelope) => {
                if let Err(e) = signaling.request(&peer, envelope).await {
                    warn!(%peer, error = %e, "signaling send failed");
                }
            }
            WireMessage::Ack(correlation_id) => {
                if let Err(e) = signaling.respond_ok(&peer, &correlation_id).await {
                    warn!(%peer, error = %e, "acknowledgement failed");
                }
            }
            WireMessage::Error {
                correlation_id,
                code,
                text,
            } => {
                if let Err(e) = signaling
                    .respond_error(&peer, &correlation_id, code, &text)
                    .await
                {
                    warn!(%peer, error = %e, "error response failed");
                }
            }
        }
    }
}

fn turn_server(
    addr: Option<std::net::SocketAddr>,
    config: Option<&crate::types::TurnConfig>,
) -> Option<TurnServer> {
    let addr = addr?;
    let config = config?;
    Some(TurnServer {
        addr,
        username: config.username.clone(),
        password: config.password.clone(),
    })
}

impl<T: SignalingTransport> std::fmt::Debug for CallSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
