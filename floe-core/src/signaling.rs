//! Signaling envelope model and pluggable transport
//!
//! Sessions speak a store-and-forward request/acknowledgement protocol:
//! each outbound envelope is a correlated request that the remote either
//! acknowledges or rejects with a numeric error code. The transport is
//! abstracted behind [`SignalingTransport`] so the core never touches
//! wire formats or connection management.

use crate::ice::{Candidate, TransportKind};
use crate::types::{MediaType, PayloadType, Reason};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric error codes carried in signaling error responses
pub mod error_codes {
    /// Malformed or unprocessable request
    pub const BAD_REQUEST: u16 = 400;
    /// No session matches the envelope's id
    pub const ITEM_NOT_FOUND: u16 = 404;
    /// A session with this id already exists for the peer
    pub const CONFLICT: u16 = 409;
}

/// Signaling errors
#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    /// The remote rejected the request
    #[error("remote error {code}: {text}")]
    Remote {
        /// Numeric error code
        code: u16,
        /// Human-readable condition
        text: String,
    },

    /// The transport failed to deliver
    #[error("signaling transport error: {0}")]
    Transport(String),

    /// No acknowledgement arrived in time
    #[error("signaling request timed out")]
    Timeout,
}

/// Envelope action verb
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalingAction {
    /// Offer a new session
    SessionInitiate,
    /// Accept an offered session
    SessionAccept,
    /// Trickle candidates or end-of-candidates for existing contents
    TransportInfo,
    /// End the session, with a reason
    SessionTerminate,
    /// Unrecognized verb, preserved as received
    Other(String),
}

impl SignalingAction {
    /// Wire name of the action
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::SessionInitiate => "session-initiate",
            Self::SessionAccept => "session-accept",
            Self::TransportInfo => "transport-info",
            Self::SessionTerminate => "session-terminate",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for SignalingAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "session-initiate" => Self::SessionInitiate,
            "session-accept" => Self::SessionAccept,
            "transport-info" => Self::TransportInfo,
            "session-terminate" => Self::SessionTerminate,
            _ => Self::Other(s),
        }
    }
}

impl From<SignalingAction> for String {
    fn from(a: SignalingAction) -> Self {
        a.as_str().to_owned()
    }
}

impl std::fmt::Display for SignalingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Media description inside a content block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescription {
    /// Media type being described
    pub media: MediaType,
    /// Offered payload formats, preferred first
    #[serde(default)]
    pub payload_types: Vec<PayloadType>,
}

/// Transport description inside a content block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportBlock {
    /// Transport kind
    pub kind: TransportKind,
    /// Transport protocol version
    #[serde(default)]
    pub version: u32,
    /// Local ICE username fragment
    #[serde(default)]
    pub ufrag: Option<String>,
    /// Local ICE password
    #[serde(default)]
    pub password: Option<String>,
    /// Candidates carried by this block
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    /// End-of-candidates marker
    #[serde(default)]
    pub gathering_complete: bool,
}

impl TransportBlock {
    /// An empty block for the given transport
    #[must_use]
    pub fn new(kind: TransportKind, version: u32) -> Self {
        Self {
            kind,
            version,
            ufrag: None,
            password: None,
            candidates: Vec::new(),
            gathering_complete: false,
        }
    }
}

/// One content block: a named stream with its description and transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    /// Which side created the content, "initiator" or "responder"
    pub creator: String,
    /// Stream name, unique within the session
    pub name: String,
    /// Content disposition
    #[serde(default)]
    pub disposition: Option<String>,
    /// Directionality, e.g. "both"
    #[serde(default)]
    pub senders: Option<String>,
    /// Media description; absent on pure transport updates
    #[serde(default)]
    pub description: Option<MediaDescription>,
    /// Transport description
    #[serde(default)]
    pub transport: Option<TransportBlock>,
}

impl ContentBlock {
    /// A content block created by the initiator with defaults for an offer
    #[must_use]
    pub fn initiator(name: impl Into<String>) -> Self {
        Self {
            creator: "initiator".to_owned(),
            name: name.into(),
            disposition: Some("session".to_owned()),
            senders: Some("both".to_owned()),
            description: None,
            transport: None,
        }
    }

    /// Media type this block refers to, from description or name
    #[must_use]
    pub fn media_hint(&self) -> Option<MediaType> {
        if let Some(desc) = &self.description {
            return Some(desc.media);
        }
        match self.name.as_str() {
            "audio" => Some(MediaType::Audio),
            "video" => Some(MediaType::Video),
            _ => None,
        }
    }
}

/// A complete signaling envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    /// Action verb
    pub action: SignalingAction,
    /// Session id the envelope belongs to
    pub sid: String,
    /// Initiator identity, on session-initiate
    #[serde(default)]
    pub initiator: Option<String>,
    /// Responder identity, on session-accept
    #[serde(default)]
    pub responder: Option<String>,
    /// Termination reason, on session-terminate
    #[serde(default)]
    pub reason: Option<Reason>,
    /// Content blocks
    #[serde(default)]
    pub contents: Vec<ContentBlock>,
}

impl SignalingEnvelope {
    /// An envelope with no contents
    #[must_use]
    pub fn new(action: SignalingAction, sid: impl Into<String>) -> Self {
        Self {
            action,
            sid: sid.into(),
            initiator: None,
            responder: None,
            reason: None,
            contents: Vec::new(),
        }
    }
}

/// Store-and-forward signaling transport
///
/// `request` resolves once the correlated acknowledgement (or error)
/// arrives from the remote; delivery of inbound requests is the
/// transport owner's job and feeds `SessionManager::handle_incoming_request`.
#[async_trait::async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Remote peer identity
    type PeerId: Clone
        + Eq
        + std::hash::Hash
        + Send
        + Sync
        + std::fmt::Debug
        + std::fmt::Display
        + 'static;

    /// Send an envelope and wait for the correlated acknowledgement
    async fn request(
        &self,
        peer: &Self::PeerId,
        envelope: SignalingEnvelope,
    ) -> Result<(), SignalingError>;

    /// Acknowledge an inbound request
    async fn respond_ok(
        &self,
        peer: &Self::PeerId,
        correlation_id: &str,
    ) -> Result<(), SignalingError>;

    /// Reject an inbound request with a numeric error code
    async fn respond_error(
        &self,
        peer: &Self::PeerId,
        correlation_id: &str,
        code: u16,
        text: &str,
    ) -> Result<(), SignalingError>;
}
