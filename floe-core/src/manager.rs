//! Session registry and inbound request routing
//!
//! The manager owns the session table keyed by (peer, session id),
//! creates outgoing sessions with collision-free ids, and turns inbound
//! signaling requests into session calls or numeric error responses.

use crate::ice::IceEngineFactory;
use crate::resolver::AddressResolver;
use crate::session::CallSession;
use crate::signaling::{error_codes, SignalingAction, SignalingEnvelope, SignalingTransport};
use crate::types::{
    Direction, HostPort, LocalAddress, SessionConfig, SessionId, TurnConfig,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Session table, keyed by remote peer and session id
pub(crate) struct Registry<T: SignalingTransport> {
    map: tokio::sync::RwLock<HashMap<(T::PeerId, SessionId), Arc<CallSession<T>>>>,
}

impl<T: SignalingTransport> Registry<T> {
    fn new() -> Self {
        Self {
            map: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    async fn insert(&self, session: Arc<CallSession<T>>) {
        let key = (session.peer().clone(), session.id().clone());
        self.map.write().await.insert(key, session);
    }

    async fn get(&self, peer: &T::PeerId, id: &SessionId) -> Option<Arc<CallSession<T>>> {
        self.map
            .read()
            .await
            .get(&(peer.clone(), id.clone()))
            .cloned()
    }

    async fn contains(&self, peer: &T::PeerId, id: &SessionId) -> bool {
        self.map
            .read()
            .await
            .contains_key(&(peer.clone(), id.clone()))
    }

    pub(crate) async fn remove(&self, peer: &T::PeerId, id: &SessionId) {
        if self
            .map
            .write()
            .await
            .remove(&(peer.clone(), id.clone()))
            .is_some()
        {
            debug!(%peer, sid = %id, "session removed from registry");
        }
    }

    async fn all(&self) -> Vec<Arc<CallSession<T>>> {
        self.map.read().await.values().cloned().collect()
    }

    async fn len(&self) -> usize {
        self.map.read().await.len()
    }
}

/// Manager notifications
#[derive(Debug, Clone)]
pub enum ManagerEvent<P> {
    /// A remote offer was accepted provisionally and is waiting in the
    /// incoming queue
    IncomingSession {
        /// Offering peer
        peer: P,
        /// New session's id
        id: SessionId,
    },
}

/// Creates, registers and routes call sessions
pub struct SessionManager<T: SignalingTransport> {
    signaling: Arc<T>,
    factory: Arc<dyn IceEngineFactory>,
    resolver: AddressResolver,
    config: parking_lot::RwLock<SessionConfig>,
    registry: Arc<Registry<T>>,
    events: broadcast::Sender<ManagerEvent<T::PeerId>>,
    pending_incoming: parking_lot::Mutex<VecDeque<Arc<CallSession<T>>>>,
}

impl<T: SignalingTransport> SessionManager<T> {
    /// Create a manager with the system name resolver
    #[must_use]
    pub fn new(signaling: Arc<T>, factory: Arc<dyn IceEngineFactory>) -> Self {
        Self::with_resolver(signaling, factory, AddressResolver::system())
    }

    /// Create a manager with an explicit resolver
    #[must_use]
    pub fn with_resolver(
        signaling: Arc<T>,
        factory: Arc<dyn IceEngineFactory>,
        resolver: AddressResolver,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            signaling,
            factory,
            resolver,
            config: parking_lot::RwLock::new(SessionConfig::default()),
            registry: Arc::new(Registry::new()),
            events,
            pending_incoming: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// Subscribe to manager events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent<T::PeerId>> {
        self.events.subscribe()
    }

    /// Snapshot of the current call configuration
    #[must_use]
    pub fn config(&self) -> SessionConfig {
        self.config.read().clone()
    }

    /// Identity placed in outbound initiator/responder fields
    pub fn set_local_identity(&self, identity: Option<String>) {
        self.config.write().local_identity = identity;
    }

    /// Local interface addresses offered for candidate gathering
    pub fn set_local_addresses(&self, addresses: Vec<LocalAddress>) {
        self.config.write().local_addresses = addresses;
    }

    /// Base port for per-call port reservations
    pub fn set_base_port(&self, base_port: Option<u16>) {
        self.config.write().base_port = base_port;
    }

    /// External (NATed) address host, resolved at call start
    pub fn set_external_address(&self, host: Option<String>) {
        self.config.write().external_host = host;
    }

    /// STUN bind server
    pub fn set_stun_host(&self, stun: Option<HostPort>) {
        self.config.write().stun_host = stun;
    }

    /// TURN over UDP relay
    pub fn set_turn_udp(&self, turn: Option<TurnConfig>) {
        self.config.write().turn_udp = turn;
    }

    /// TURN over TCP relay
    pub fn set_turn_tcp(&self, turn: Option<TurnConfig>) {
        self.config.write().turn_tcp = turn;
    }

    /// Sending bitrate cap in kbps
    pub fn set_max_bitrate(&self, kbps: Option<u32>) {
        self.config.write().max_bitrate_kbps = kbps;
    }

    /// Round-trip timeout for sent offers
    pub fn set_negotiation_timeout(&self, timeout: Duration) {
        self.config.write().negotiation_timeout = timeout;
    }

    /// Number of registered sessions
    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Look up a registered session
    pub async fn session(&self, peer: &T::PeerId, id: &SessionId) -> Option<Arc<CallSession<T>>> {
        self.registry.get(peer, id).await
    }

    /// Create and register an outgoing session toward `peer`.
    ///
    /// The session is idle until [`CallSession::start`] is called.
    #[tracing::instrument(skip(self), fields(peer = %peer))]
    pub async fn create_outgoing(&self, peer: T::PeerId) -> Arc<CallSession<T>> {
        let id = self.generate_session_id(&peer).await;
        let session = CallSession::new(
            id.clone(),
            peer,
            Direction::Outgoing,
            self.config(),
            Arc::clone(&self.signaling),
            self.resolver.clone(),
            Arc::clone(&self.factory),
            Arc::downgrade(&self.registry),
        );
        self.registry.insert(Arc::clone(&session)).await;
        info!(sid = %id, "outgoing session created");
        session
    }

    /// Route one inbound signaling request.
    ///
    /// `correlation_id` identifies the request for the acknowledgement
    /// or error response the remote is waiting on.
    #[tracing::instrument(skip(self, envelope), fields(peer = %peer, action = %envelope.action, sid = %envelope.sid))]
    pub async fn handle_incoming_request(
        &self,
        peer: T::PeerId,
        correlation_id: &str,
        envelope: SignalingEnvelope,
    ) {
        let id = SessionId::new(envelope.sid.clone());
        if envelope.action == SignalingAction::SessionInitiate {
            self.handle_initiate(peer, correlation_id, id, envelope)
                .await;
            return;
        }
        match self.registry.get(&peer, &id).await {
            Some(session) => session.handle_request(correlation_id, &envelope),
            None => {
                debug!("request for unknown session");
                self.respond_error(
                    &peer,
                    correlation_id,
                    error_codes::ITEM_NOT_FOUND,
                    "unknown session",
                )
                .await;
            }
        }
    }

    async fn handle_initiate(
        &self,
        peer: T::PeerId,
        correlation_id: &str,
        id: SessionId,
        envelope: SignalingEnvelope,
    ) {
        if self.registry.contains(&peer, &id).await {
            self.respond_error(
                &peer,
                correlation_id,
                error_codes::CONFLICT,
                "session already exists",
            )
            .await;
            return;
        }
        let session = CallSession::new(
            id.clone(),
            peer.clone(),
            Direction::Incoming,
            self.config(),
            Arc::clone(&self.signaling),
            self.resolver.clone(),
            Arc::clone(&self.factory),
            Arc::downgrade(&self.registry),
        );
        if let Err(reason) = session.handle_initiate(&envelope) {
            // Unusable offers never create a session.
            warn!(error = %reason, "rejecting unusable session-initiate");
            self.respond_error(
                &peer,
                correlation_id,
                error_codes::BAD_REQUEST,
                &reason.to_string(),
            )
            .await;
            return;
        }
        if let Err(e) = self.signaling.respond_ok(&peer, correlation_id).await {
            warn!(error = %e, "failed to acknowledge session-initiate");
        }
        self.registry.insert(Arc::clone(&session)).await;
        self.pending_incoming.lock().push_back(Arc::clone(&session));
        info!(sid = %id, "incoming session registered");
        let _ = self.events.send(ManagerEvent::IncomingSession { peer, id });
    }

    /// Take the next incoming session waiting for a local decision
    #[must_use]
    pub fn take_incoming(&self) -> Option<Arc<CallSession<T>>> {
        self.pending_incoming.lock().pop_front()
    }

    /// End every registered session
    pub async fn close_all(&self) {
        for session in self.registry.all().await {
            session.reject();
        }
    }

    async fn generate_session_id(&self, peer: &T::PeerId) -> SessionId {
        loop {
            let id = SessionId::random();
            if !self.registry.contains(peer, &id).await {
                return id;
            }
        }
    }

    async fn respond_error(&self, peer: &T::PeerId, correlation_id: &str, code: u16, text: &str) {
        if let Err(e) = self
            .signaling
            .respond_error(peer, correlation_id, code, text)
            .await
        {
            warn!(error = %e, code, "error response failed");
        }
    }
}

impl<T: SignalingTransport> std::fmt::Debug for SessionManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}
