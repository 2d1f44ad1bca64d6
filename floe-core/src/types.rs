//! Core negotiation types and data structures

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Session identifier, unique per remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing token (e.g. from an inbound request)
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Generate a random 16-character alphanumeric token
    ///
    /// Uniqueness per peer is the registry's job; see
    /// `SessionManager::generate_session_id`.
    #[must_use]
    pub fn random() -> Self {
        use rand::distributions::Alphanumeric;
        use rand::Rng;
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        Self(token)
    }

    /// Get the raw token
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media type of one negotiated stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Audio stream
    Audio,
    /// Video stream
    Video,
}

impl MediaType {
    /// All media types, in canonical order
    #[must_use]
    pub const fn all() -> [MediaType; 2] {
        [MediaType::Audio, MediaType::Video]
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Which media types a call wants or accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSelection {
    /// Audio selected
    pub audio: bool,
    /// Video selected
    pub video: bool,
}

impl MediaSelection {
    /// Audio-only selection
    #[must_use]
    pub const fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video-only selection
    #[must_use]
    pub const fn video_only() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }

    /// Audio and video
    #[must_use]
    pub const fn both() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Empty selection
    #[must_use]
    pub const fn none() -> Self {
        Self {
            audio: false,
            video: false,
        }
    }

    /// Whether the given media type is selected
    #[must_use]
    pub const fn contains(&self, media: MediaType) -> bool {
        match media {
            MediaType::Audio => self.audio,
            MediaType::Video => self.video,
        }
    }

    /// Whether nothing is selected
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }

    /// Intersection of two selections
    #[must_use]
    pub const fn intersect(&self, other: &Self) -> Self {
        Self {
            audio: self.audio && other.audio,
            video: self.video && other.video,
        }
    }

    /// Selected media types, in canonical order
    #[must_use]
    pub fn to_media_types(&self) -> Vec<MediaType> {
        MediaType::all()
            .into_iter()
            .filter(|m| self.contains(*m))
            .collect()
    }
}

/// One name/value codec parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadParameter {
    /// Parameter name
    pub name: String,
    /// Parameter value
    pub value: String,
}

/// A negotiated codec configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadType {
    /// RTP payload type id (0-127)
    pub id: u8,
    /// Codec name, may be empty for static ids
    pub name: String,
    /// Clock rate in Hz
    pub clockrate: u32,
    /// Channel count
    pub channels: u16,
    /// Packetization time in milliseconds
    pub ptime: Option<u32>,
    /// Maximum packetization time in milliseconds
    pub maxptime: Option<u32>,
    /// Additional codec parameters
    pub parameters: Vec<PayloadParameter>,
}

impl PayloadType {
    /// Create a payload type with defaults for the optional fields
    pub fn new(id: u8, name: impl Into<String>, clockrate: u32) -> Self {
        Self {
            id,
            name: name.into(),
            clockrate,
            channels: 1,
            ptime: None,
            maxptime: None,
            parameters: Vec::new(),
        }
    }
}

/// Termination reason condition, mirroring the signaling protocol's table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCondition {
    /// Superseded by another session
    AlternativeSession,
    /// Callee is busy
    Busy,
    /// Initiator cancelled before acceptance
    Cancel,
    /// Connectivity could not be established
    ConnectivityError,
    /// Callee declined
    Decline,
    /// Offer expired
    Expired,
    /// Application-level failure
    FailedApplication,
    /// Transport-level failure
    FailedTransport,
    /// Unspecified error
    GeneralError,
    /// Party has gone away
    Gone,
    /// Parameters could not be agreed
    IncompatibleParameters,
    /// Media processing failure
    MediaError,
    /// Security requirements not met
    SecurityError,
    /// Normal successful completion
    Success,
    /// Negotiation timed out
    Timeout,
    /// No supported application
    UnsupportedApplications,
    /// No supported transport
    UnsupportedTransports,
}

/// Termination reason carried by a `session-terminate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// Reason condition
    pub condition: ReasonCondition,
    /// Optional free-form text
    pub text: Option<String>,
}

impl Reason {
    /// Reason with no text
    #[must_use]
    pub const fn new(condition: ReasonCondition) -> Self {
        Self {
            condition,
            text: None,
        }
    }

    /// Reason with accompanying text
    pub fn with_text(condition: ReasonCondition, text: impl Into<String>) -> Self {
        Self {
            condition,
            text: Some(text.into()),
        }
    }
}

/// Which side created the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We initiate
    Outgoing,
    /// Remote initiated
    Incoming,
}

/// Negotiation state of a call session
///
/// `Terminated` and `Activated` are absorbing: once reached no further
/// transition occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing started
    Idle,
    /// Waiting on the address resolver
    ResolvingAddresses,
    /// ICE engines created, gathering candidates
    GatheringCandidates,
    /// Outgoing: initiate sent, waiting for the remote accept
    AwaitingAccept,
    /// Incoming: engines ready, waiting for local media finalization
    AwaitingLocalAccept,
    /// Accept exchanged, connectivity checks running
    Connecting,
    /// Media flowing; transports owned by the RTP channel
    Activated,
    /// Torn down
    Terminated,
}

impl SessionState {
    /// Whether this state admits no further transitions
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Activated | Self::Terminated)
    }
}

/// Why a session failed, surfaced on the event stream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    /// A sent accept/initiate never received its correlated response
    #[error("call negotiation timed out")]
    NegotiationTimeout,
    /// An ICE engine reported an internal error
    #[error("unable to establish peer-to-peer connection")]
    IceFailure,
    /// Neither audio nor video could be agreed
    #[error("no usable media")]
    NoUsableMedia,
    /// Anything else, with a human-readable reason
    #[error("call negotiation failed: {0}")]
    General(String),
}

/// Application-visible session notifications
///
/// Every internal failure normalizes to exactly one of `Rejected`,
/// `Failed` or `Activated`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Remote payload types recorded or updated
    RemoteMediaUpdated,
    /// Session reached `Activated`; transports handed to the RTP channel
    Activated,
    /// Remote rejected or terminated the call
    Rejected,
    /// Unrecoverable failure; session is `Terminated`
    Failed {
        /// Why the session failed
        reason: FailureReason,
    },
}

/// Host/port pair to be resolved before a call starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    /// Host name or literal address
    pub host: String,
    /// Port number
    pub port: u16,
}

/// TURN relay configuration, with long-term credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Relay host name
    pub host: String,
    /// Relay port
    pub port: u16,
    /// Long-term credential user
    pub username: String,
    /// Long-term credential password
    pub password: String,
}

/// A local interface address offered for candidate gathering
///
/// IPv6 link-local addresses carry the interface scope identifier needed
/// to use them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAddress {
    /// Interface address
    pub ip: IpAddr,
    /// Scope identifier for IPv6 link-local addresses
    pub scope_id: Option<u32>,
}

impl LocalAddress {
    /// Address without a scope identifier
    #[must_use]
    pub const fn new(ip: IpAddr) -> Self {
        Self { ip, scope_id: None }
    }

    /// Address with a scope identifier attached
    #[must_use]
    pub const fn with_scope(ip: IpAddr, scope_id: u32) -> Self {
        Self {
            ip,
            scope_id: Some(scope_id),
        }
    }
}

/// Per-call configuration, supplied programmatically before a call starts
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identity string placed in outbound envelopes' initiator/responder
    pub local_identity: Option<String>,
    /// Local interface addresses to gather from
    pub local_addresses: Vec<LocalAddress>,
    /// External (NATed) address host name, resolved at call start
    pub external_host: Option<String>,
    /// STUN bind host
    pub stun_host: Option<HostPort>,
    /// TURN over UDP relay
    pub turn_udp: Option<TurnConfig>,
    /// TURN over TCP relay
    pub turn_tcp: Option<TurnConfig>,
    /// Base port for the shared port reservation
    pub base_port: Option<u16>,
    /// Maximum sending bitrate cap in kbps
    pub max_bitrate_kbps: Option<u32>,
    /// Round-trip timeout for a sent accept/initiate
    pub negotiation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_identity: None,
            local_addresses: Vec::new(),
            external_host: None,
            stun_host: None,
            turn_udp: None,
            turn_tcp: None,
            base_port: None,
            max_bitrate_kbps: None,
            negotiation_timeout: Duration::from_secs(30),
        }
    }
}

/// A block of consecutive ports reserved for one call's media transports
///
/// Shared between the engines of one session; released by dropping, which
/// the teardown coordinator does once every engine has stopped.
#[derive(Debug)]
pub struct PortReservation {
    base_port: u16,
    ports: Vec<u16>,
}

impl PortReservation {
    /// Reserve `count` consecutive port numbers starting at `base_port`
    #[must_use]
    pub fn new(base_port: u16, count: u16) -> Self {
        let ports = (0..count).map(|i| base_port.saturating_add(i)).collect();
        Self { base_port, ports }
    }

    /// First reserved port
    #[must_use]
    pub const fn base_port(&self) -> u16 {
        self.base_port
    }

    /// All reserved ports
    #[must_use]
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }
}
