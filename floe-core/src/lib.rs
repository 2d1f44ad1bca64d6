//! Floe - NAT-traversed peer-to-peer media session negotiation
//!
//! This library implements the negotiation core of a peer-to-peer calling
//! stack: ICE connectivity with trickled candidates, store-and-forward
//! signaling with correlated acknowledgements, per-media session state,
//! and the exactly-once hand-off of established transports to an RTP
//! packet channel. It features:
//!
//! - **Trickle ICE**: Candidates flow incrementally in both directions,
//!   buffered until their preconditions hold and delivered exactly once
//! - **Pluggable Signaling**: Any correlated request/response transport
//!   works via the [`SignalingTransport`] trait
//! - **Pluggable Connectivity**: The ICE engine is abstracted behind
//!   [`IceEngine`] so the checking stack can be swapped or mocked
//! - **Asynchronous Teardown**: Engines and port reservations are always
//!   released in the background, never on a caller's stack
//!
//! # Examples
//!
//! ```rust,ignore
//! use floe_core::{SessionManager, MediaSelection};
//! use std::sync::Arc;
//!
//! # async fn example(signaling: Arc<MySignaling>, factory: Arc<MyFactory>) {
//! let manager = SessionManager::new(signaling, factory);
//! manager.set_stun_host(Some(floe_core::HostPort {
//!     host: "stun.example.org".to_owned(),
//!     port: 3478,
//! }));
//!
//! let session = manager.create_outgoing(peer).await;
//! session.start(MediaSelection::audio_only(), my_payloads)?;
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core negotiation types and data structures
pub mod types;

/// ICE engine boundary and candidate model
pub mod ice;

/// Signaling envelopes and the pluggable transport trait
pub mod signaling;

/// Helper address resolution
pub mod resolver;

/// Per-call negotiation state machine
pub mod session;

/// Session registry and request routing
pub mod manager;

/// Cross-context RTP packet channel
pub mod rtp;

/// Background teardown of transport resources
pub mod teardown;

mod trickle;

// Re-export main types at crate root
pub use ice::{
    Candidate, CandidateKind, IceConfig, IceEngine, IceEngineEvent, IceEngineFactory, IceError,
    IceFeatures, IceRole, TransportKind, TurnServer,
};
pub use manager::{ManagerEvent, SessionManager};
pub use resolver::{AddressResolver, NameResolver, ResolveError, ResolvedAddresses, SystemResolver};
pub use rtp::{ChannelError, RtpChannel, RtpPacket, TransportSet};
pub use session::{CallSession, SessionError};
pub use signaling::{
    error_codes, ContentBlock, MediaDescription, SignalingAction, SignalingEnvelope,
    SignalingError, SignalingTransport, TransportBlock,
};
pub use teardown::{TeardownCoordinator, TEARDOWN_TIMEOUT};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::manager::{ManagerEvent, SessionManager};
    pub use crate::session::CallSession;
    pub use crate::signaling::{SignalingEnvelope, SignalingTransport};
    pub use crate::types::{
        Direction, FailureReason, MediaSelection, MediaType, PayloadType, SessionConfig,
        SessionEvent, SessionId, SessionState,
    };
}
