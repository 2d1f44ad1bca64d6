//! Shared mocks for the integration tests: a recording signaling
//! transport, a scriptable ICE engine and its factory.
#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use floe_core::{
    Candidate, CandidateKind, IceConfig, IceEngine, IceEngineEvent, IceEngineFactory, IceError,
    IceFeatures, IceRole, MediaType, PayloadType, SignalingEnvelope, SignalingError,
    SignalingTransport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Install a test subscriber once so `RUST_LOG` works in test runs.
pub fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// How the mock transport answers a tracked request, keyed by action.
#[derive(Clone)]
pub enum AckBehavior {
    Ok,
    Err(u16, String),
    Never,
}

/// Recording signaling transport with scriptable acknowledgements.
pub struct MockSignaling {
    pub requests: parking_lot::Mutex<Vec<(String, SignalingEnvelope)>>,
    pub acks: parking_lot::Mutex<Vec<(String, String)>>,
    pub errors: parking_lot::Mutex<Vec<(String, String, u16, String)>>,
    pub ack_policy: parking_lot::Mutex<HashMap<String, AckBehavior>>,
}

impl MockSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: parking_lot::Mutex::new(Vec::new()),
            acks: parking_lot::Mutex::new(Vec::new()),
            errors: parking_lot::Mutex::new(Vec::new()),
            ack_policy: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn set_ack(&self, action: &str, behavior: AckBehavior) {
        self.ack_policy.lock().insert(action.to_owned(), behavior);
    }

    pub fn requests_for(&self, action: &str) -> Vec<SignalingEnvelope> {
        self.requests
            .lock()
            .iter()
            .filter(|(_, env)| env.action.as_str() == action)
            .map(|(_, env)| env.clone())
            .collect()
    }

    /// Wait until a request with the given action has been sent, and
    /// consume it from the log.
    pub async fn wait_for_request(&self, action: &str) -> SignalingEnvelope {
        assert!(
            wait_until(|| !self.requests_for(action).is_empty()).await,
            "no {action} request was sent"
        );
        let mut requests = self.requests.lock();
        let idx = requests
            .iter()
            .position(|(_, env)| env.action.as_str() == action)
            .unwrap();
        requests.remove(idx).1
    }
}

#[async_trait::async_trait]
impl SignalingTransport for MockSignaling {
    type PeerId = String;

    async fn request(
        &self,
        peer: &String,
        envelope: SignalingEnvelope,
    ) -> Result<(), SignalingError> {
        let behavior = self
            .ack_policy
            .lock()
            .get(envelope.action.as_str())
            .cloned()
            .unwrap_or(AckBehavior::Ok);
        self.requests.lock().push((peer.clone(), envelope));
        match behavior {
            AckBehavior::Ok => Ok(()),
            AckBehavior::Err(code, text) => Err(SignalingError::Remote { code, text }),
            AckBehavior::Never => futures::future::pending().await,
        }
    }

    async fn respond_ok(&self, peer: &String, correlation_id: &str) -> Result<(), SignalingError> {
        self.acks
            .lock()
            .push((peer.clone(), correlation_id.to_owned()));
        Ok(())
    }

    async fn respond_error(
        &self,
        peer: &String,
        correlation_id: &str,
        code: u16,
        text: &str,
    ) -> Result<(), SignalingError> {
        self.errors
            .lock()
            .push((peer.clone(), correlation_id.to_owned(), code, text.to_owned()));
        Ok(())
    }
}

/// Scriptable ICE engine: records what the session feeds it, emits
/// whatever events a test scripts.
pub struct MockIceEngine {
    media: MediaType,
    events: broadcast::Sender<IceEngineEvent>,
    pub peer_credentials: parking_lot::Mutex<Option<(String, String)>>,
    pub remote_candidates: parking_lot::Mutex<Vec<Candidate>>,
    pub checks_started: AtomicBool,
    pub remote_gathering_complete: AtomicBool,
    pub stop_requested: AtomicBool,
    stubborn: AtomicBool,
    hung: AtomicBool,
    stopped: AtomicBool,
    inbound: parking_lot::Mutex<HashMap<usize, VecDeque<Bytes>>>,
    pub written: parking_lot::Mutex<Vec<(usize, Bytes)>>,
}

impl MockIceEngine {
    pub fn new(media: MediaType) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            media,
            events,
            peer_credentials: parking_lot::Mutex::new(None),
            remote_candidates: parking_lot::Mutex::new(Vec::new()),
            checks_started: AtomicBool::new(false),
            remote_gathering_complete: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stubborn: AtomicBool::new(false),
            hung: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            inbound: parking_lot::Mutex::new(HashMap::new()),
            written: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn emit(&self, event: IceEngineEvent) {
        let _ = self.events.send(event);
    }

    /// Queue an inbound datagram and signal it, as a real engine would.
    pub fn push_inbound(&self, component: usize, data: Bytes) {
        self.inbound
            .lock()
            .entry(component)
            .or_default()
            .push_back(data);
        self.emit(IceEngineEvent::DatagramReady { component });
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Make `stop` return without the engine ever reporting `Stopped`.
    pub fn set_stubborn(&self) {
        self.stubborn.store(true, Ordering::SeqCst);
    }

    /// Make the `stop` call itself never resolve.
    pub fn set_hung(&self) {
        self.hung.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl IceEngine for MockIceEngine {
    fn media(&self) -> MediaType {
        self.media
    }

    fn set_local_features(&self, _features: IceFeatures) {}

    fn set_remote_features(&self, _features: IceFeatures) {}

    async fn start(&self, _role: IceRole) -> Result<(), IceError> {
        Ok(())
    }

    fn set_peer_credentials(&self, ufrag: &str, password: &str) {
        *self.peer_credentials.lock() = Some((ufrag.to_owned(), password.to_owned()));
    }

    fn add_remote_candidates(&self, candidates: Vec<Candidate>) {
        self.remote_candidates.lock().extend(candidates);
    }

    fn set_remote_gathering_complete(&self) {
        self.remote_gathering_complete.store(true, Ordering::SeqCst);
    }

    fn start_checks(&self) {
        self.checks_started.store(true, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if self.hung.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.stubborn.load(Ordering::SeqCst) {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.events.send(IceEngineEvent::Stopped);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn local_ufrag(&self) -> String {
        format!("ufrag-{}", self.media)
    }

    fn local_password(&self) -> String {
        format!("pass-{}", self.media)
    }

    fn component_count(&self) -> usize {
        2
    }

    fn write_datagram(&self, component: usize, data: Bytes) -> Result<(), IceError> {
        self.written.lock().push((component, data));
        Ok(())
    }

    fn read_datagram(&self, component: usize) -> Option<Bytes> {
        self.inbound.lock().get_mut(&component)?.pop_front()
    }

    fn has_pending_datagrams(&self, component: usize) -> bool {
        self.inbound
            .lock()
            .get(&component)
            .is_some_and(|q| !q.is_empty())
    }

    fn subscribe(&self) -> broadcast::Receiver<IceEngineEvent> {
        self.events.subscribe()
    }
}

/// Factory that records every engine it creates.
pub struct MockEngineFactory {
    pub engines: parking_lot::Mutex<Vec<Arc<MockIceEngine>>>,
    pub configs: parking_lot::Mutex<Vec<IceConfig>>,
}

impl MockEngineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engines: parking_lot::Mutex::new(Vec::new()),
            configs: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Wait for the engine created for `media`, with the session's event
    /// pump already attached.
    pub async fn engine_for(&self, media: MediaType) -> Arc<MockIceEngine> {
        assert!(
            wait_until(|| self.find(media).is_some()).await,
            "no engine created for {media}"
        );
        let engine = self.find(media).unwrap();
        assert!(
            wait_until(|| engine.subscriber_count() > 0).await,
            "nothing subscribed to the {media} engine"
        );
        engine
    }

    fn find(&self, media: MediaType) -> Option<Arc<MockIceEngine>> {
        self.engines
            .lock()
            .iter()
            .find(|e| e.media == media)
            .cloned()
    }
}

impl IceEngineFactory for MockEngineFactory {
    fn create(&self, config: IceConfig) -> Arc<dyn IceEngine> {
        let engine = Arc::new(MockIceEngine::new(config.media));
        self.configs.lock().push(config);
        self.engines.lock().push(Arc::clone(&engine));
        engine
    }
}

/// A host candidate at the given port.
pub fn candidate(component: u8, port: u16) -> Candidate {
    Candidate {
        component,
        foundation: "1".to_owned(),
        generation: 0,
        id: None,
        ip: "192.0.2.10".parse().unwrap(),
        network: 0,
        port,
        priority: 2_130_706_431,
        protocol: "udp".to_owned(),
        related_addr: None,
        related_port: None,
        kind: CandidateKind::Host,
    }
}

/// Wait for a session event matching `pred`, skipping others.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<floe_core::SessionEvent>,
    pred: impl Fn(&floe_core::SessionEvent) -> bool,
) -> floe_core::SessionEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

fn audio_content(candidates: Vec<Candidate>) -> floe_core::ContentBlock {
    let mut content = floe_core::ContentBlock::initiator("audio");
    content.description = Some(floe_core::MediaDescription {
        media: MediaType::Audio,
        payload_types: vec![PayloadType::new(96, "opus", 48_000)],
    });
    let mut transport = floe_core::TransportBlock::new(floe_core::TransportKind::IceUdp, 1);
    transport.ufrag = Some("r-ufrag".to_owned());
    transport.password = Some("r-pass".to_owned());
    transport.candidates = candidates;
    content.transport = Some(transport);
    content
}

fn video_content() -> floe_core::ContentBlock {
    let mut content = floe_core::ContentBlock::initiator("video");
    content.description = Some(floe_core::MediaDescription {
        media: MediaType::Video,
        payload_types: vec![PayloadType::new(97, "VP8", 90_000)],
    });
    content.transport = Some(floe_core::TransportBlock::new(
        floe_core::TransportKind::IceUdp,
        1,
    ));
    content
}

/// A remote session-initiate offering only video.
pub fn video_initiate_envelope(sid: &str) -> SignalingEnvelope {
    let mut envelope = SignalingEnvelope::new(floe_core::SignalingAction::SessionInitiate, sid);
    envelope.initiator = Some("remote@example.org".to_owned());
    envelope.contents.push(video_content());
    envelope
}

/// A remote audio-only session-initiate.
pub fn initiate_envelope(sid: &str, candidates: Vec<Candidate>) -> SignalingEnvelope {
    let mut envelope =
        SignalingEnvelope::new(floe_core::SignalingAction::SessionInitiate, sid);
    envelope.initiator = Some("remote@example.org".to_owned());
    envelope.contents.push(audio_content(candidates));
    envelope
}

/// A remote audio-only session-accept.
pub fn accept_envelope(sid: &str, candidates: Vec<Candidate>) -> SignalingEnvelope {
    let mut envelope = SignalingEnvelope::new(floe_core::SignalingAction::SessionAccept, sid);
    envelope.responder = Some("remote@example.org".to_owned());
    envelope.contents.push(audio_content(candidates));
    envelope
}

/// A transport-info carrying candidates for the audio content.
pub fn transport_info_envelope(sid: &str, candidates: Vec<Candidate>) -> SignalingEnvelope {
    let mut envelope = SignalingEnvelope::new(floe_core::SignalingAction::TransportInfo, sid);
    let mut content = audio_content(candidates);
    content.description = None;
    envelope.contents.push(content);
    envelope
}

/// A minimal audio payload offer.
pub fn audio_payloads() -> HashMap<MediaType, Vec<PayloadType>> {
    let mut map = HashMap::new();
    map.insert(
        MediaType::Audio,
        vec![PayloadType::new(96, "opus", 48_000), PayloadType::new(8, "PCMA", 8_000)],
    );
    map
}

/// Audio and video payload offers.
pub fn both_payloads() -> HashMap<MediaType, Vec<PayloadType>> {
    let mut map = audio_payloads();
    map.insert(MediaType::Video, vec![PayloadType::new(97, "VP8", 90_000)]);
    map
}
