//! ICE engine boundary: candidate model, engine trait and local address
//! ordering
//!
//! The connectivity engine itself (STUN/TURN wire protocol, check
//! scheduling) is an external collaborator; this module defines the
//! interface the negotiation core consumes, plus the candidate and
//! feature types that cross it.

use crate::types::{LocalAddress, MediaType};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Components per media stream: RTP plus RTCP.
pub const COMPONENTS: usize = 2;

/// ICE errors surfaced by an engine
#[derive(Error, Debug, Clone)]
pub enum IceError {
    /// Engine failed internally
    #[error("ICE engine error: {0}")]
    Engine(String),

    /// Operation before `start`
    #[error("ICE engine not started")]
    NotStarted,

    /// Component index out of range
    #[error("invalid component index: {0}")]
    InvalidComponent(usize),
}

/// Transport kind negotiated for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// ICE over UDP
    IceUdp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IceUdp => write!(f, "ice-udp"),
        }
    }
}

/// Candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateKind {
    /// Local interface address
    #[serde(rename = "host")]
    Host,
    /// Server-reflexive (STUN-discovered)
    #[serde(rename = "srflx")]
    ServerReflexive,
    /// Peer-reflexive (check-discovered)
    #[serde(rename = "prflx")]
    PeerReflexive,
    /// Relayed (TURN-allocated)
    #[serde(rename = "relay")]
    Relayed,
}

/// One concrete (address, port, transport) tuple offered for a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Component index, 1-based on the wire
    pub component: u8,
    /// Foundation string grouping related candidates
    pub foundation: String,
    /// Generation counter
    pub generation: u32,
    /// Optional unique id
    pub id: Option<String>,
    /// Candidate address
    pub ip: IpAddr,
    /// Network interface index
    pub network: u32,
    /// Candidate port
    pub port: u16,
    /// Priority for check ordering
    pub priority: u32,
    /// Transport protocol, normally "udp"
    pub protocol: String,
    /// Related (base) address for reflexive/relayed candidates
    pub related_addr: Option<IpAddr>,
    /// Related (base) port
    pub related_port: Option<u16>,
    /// Candidate type
    pub kind: CandidateKind,
}

impl Candidate {
    /// Whether two candidates describe the same transport endpoint
    ///
    /// Used for de-duplication across repeated trickle messages; id,
    /// priority and foundation may differ between restatements of the
    /// same endpoint.
    #[must_use]
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.component == other.component
            && self.ip == other.ip
            && self.port == other.port
            && self.protocol == other.protocol
    }
}

/// Capability flags exchanged between the two engines of one stream
///
/// Computed from the transport kind and version so that both sides of a
/// stream derive identical flags without negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceFeatures {
    /// Incremental candidate delivery
    pub trickle: bool,
    /// Aggressive nomination during checks
    pub aggressive_nomination: bool,
    /// RTP-optimized component handling
    pub rtp_optimization: bool,
    /// Data on not-yet-nominated pairs
    pub not_nominated_data: bool,
    /// End-of-candidates signalling
    pub gathering_complete: bool,
}

impl IceFeatures {
    /// Flags for a given transport kind and version
    #[must_use]
    pub const fn for_transport(kind: TransportKind, version: u32) -> Self {
        match kind {
            TransportKind::IceUdp => Self {
                trickle: version >= 1,
                aggressive_nomination: false,
                rtp_optimization: false,
                not_nominated_data: false,
                gathering_complete: version >= 1,
            },
        }
    }
}

/// Role an engine plays during connectivity checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    /// Controlling side
    Initiator,
    /// Controlled side
    Responder,
}

/// A TURN relay endpoint with resolved address and credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    /// Resolved relay address
    pub addr: SocketAddr,
    /// Long-term credential user
    pub username: String,
    /// Long-term credential password
    pub password: String,
}

/// Everything an engine needs to gather candidates for one stream
#[derive(Debug, Clone)]
pub struct IceConfig {
    /// Media type this engine serves
    pub media: MediaType,
    /// Component count, normally [`COMPONENTS`]
    pub components: usize,
    /// Local addresses in priority order (see [`order_local_addresses`])
    pub local_addresses: Vec<LocalAddress>,
    /// Resolved external (NATed) address, if configured
    pub external_address: Option<IpAddr>,
    /// Resolved STUN bind server
    pub stun: Option<SocketAddr>,
    /// Resolved TURN-over-UDP relay
    pub turn_udp: Option<TurnServer>,
    /// Resolved TURN-over-TCP relay
    pub turn_tcp: Option<TurnServer>,
    /// Base port of the shared reservation, if one exists
    pub base_port: Option<u16>,
}

/// Events emitted by an engine
#[derive(Debug, Clone)]
pub enum IceEngineEvent {
    /// Engine finished starting; local credentials available
    Started,
    /// A batch of freshly gathered local candidates
    LocalCandidatesReady(Vec<Candidate>),
    /// Local gathering finished
    LocalGatheringComplete,
    /// A usable path exists; media may be sent. Idempotent, may repeat
    /// as better paths are nominated.
    ReadyToSendMedia,
    /// A datagram is waiting on the given component
    DatagramReady {
        /// Component index, 0-based
        component: usize,
    },
    /// Unrecoverable engine failure
    Error(String),
    /// Engine fully stopped; resources released
    Stopped,
}

/// Per-media-type connectivity engine, one per active stream
///
/// Events are delivered over a broadcast channel so that consumers can
/// re-subscribe when engine ownership moves to another execution context
/// (negotiation → RTP channel → teardown).
#[async_trait::async_trait]
pub trait IceEngine: Send + Sync {
    /// Media type this engine serves
    fn media(&self) -> MediaType;

    /// Set this side's capability flags; call before `start`
    fn set_local_features(&self, features: IceFeatures);

    /// Set the remote side's capability flags
    fn set_remote_features(&self, features: IceFeatures);

    /// Begin gathering; emits `Started` once local credentials exist
    async fn start(&self, role: IceRole) -> Result<(), IceError>;

    /// Set peer ufrag/password once known
    fn set_peer_credentials(&self, ufrag: &str, password: &str);

    /// Feed remote candidates
    fn add_remote_candidates(&self, candidates: Vec<Candidate>);

    /// Remote signalled end-of-candidates
    fn set_remote_gathering_complete(&self);

    /// Begin connectivity checks
    fn start_checks(&self);

    /// Request asynchronous shutdown; emits `Stopped` when done
    async fn stop(&self);

    /// Whether the engine has fully stopped
    fn is_stopped(&self) -> bool;

    /// Local short-lived username fragment
    fn local_ufrag(&self) -> String;

    /// Local short-lived password
    fn local_password(&self) -> String;

    /// Number of components
    fn component_count(&self) -> usize;

    /// Queue a datagram for sending on a component
    fn write_datagram(&self, component: usize, data: Bytes) -> Result<(), IceError>;

    /// Take the next received datagram on a component, if any
    fn read_datagram(&self, component: usize) -> Option<Bytes>;

    /// Whether received datagrams are waiting on a component
    fn has_pending_datagrams(&self, component: usize) -> bool;

    /// Subscribe to engine events
    fn subscribe(&self) -> broadcast::Receiver<IceEngineEvent>;
}

/// Creates engines; the production implementation wraps the real
/// connectivity stack, tests substitute mocks.
pub trait IceEngineFactory: Send + Sync {
    /// Create an engine for one media stream
    fn create(&self, config: IceConfig) -> Arc<dyn IceEngine>;
}

/// Scope rank used by the address ordering; lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum AddressScope {
    Global,
    Private,
    LinkLocal,
}

fn address_scope(ip: &IpAddr) -> AddressScope {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_link_local() {
                AddressScope::LinkLocal
            } else if v4.is_private() {
                AddressScope::Private
            } else {
                AddressScope::Global
            }
        }
        IpAddr::V6(v6) => {
            // fe80::/10
            if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                AddressScope::LinkLocal
            // fc00::/7 unique-local
            } else if (v6.segments()[0] & 0xfe00) == 0xfc00 {
                AddressScope::Private
            } else {
                AddressScope::Global
            }
        }
    }
}

/// Order local addresses for candidate gathering.
///
/// Loopback is excluded entirely. Remaining addresses sort by scope
/// (global, then private, then link-local) and, within one scope, IPv6
/// before IPv4. Ties keep their discovery order, which makes the order
/// total and transitive regardless of the input.
#[must_use]
pub fn order_local_addresses(addrs: &[LocalAddress]) -> Vec<LocalAddress> {
    let mut out: Vec<LocalAddress> = addrs
        .iter()
        .filter(|a| !a.ip.is_loopback())
        .cloned()
        .collect();
    out.sort_by_key(|a| {
        let family = match a.ip {
            IpAddr::V6(_) => 0u8,
            IpAddr::V4(_) => 1u8,
        };
        (address_scope(&a.ip), family)
    });
    out
}
