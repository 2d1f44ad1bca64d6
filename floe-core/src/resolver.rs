//! Concurrent resolution of the configured helper addresses
//!
//! External address, STUN host and both TURN hosts resolve in parallel;
//! a failed or absent lookup degrades the session to fewer candidate
//! sources rather than failing it.

use crate::types::SessionConfig;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Name resolution failure
#[derive(Error, Debug, Clone)]
#[error("failed to resolve {host}: {message}")]
pub struct ResolveError {
    /// Host that failed
    pub host: String,
    /// Underlying error text
    pub message: String,
}

/// Pluggable hostname resolver
#[async_trait::async_trait]
pub trait NameResolver: Send + Sync {
    /// Resolve a hostname to its addresses
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Resolver backed by the system's lookup facility
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait::async_trait]
impl NameResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| ResolveError {
                host: host.to_owned(),
                message: e.to_string(),
            })?
            .map(|sa| sa.ip())
            .collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(ResolveError {
                host: host.to_owned(),
                message: "no addresses".to_owned(),
            });
        }
        Ok(addrs)
    }
}

/// Outcome of resolving a session's helper addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAddresses {
    /// Externally visible (NATed) address
    pub external: Option<IpAddr>,
    /// STUN bind server
    pub stun: Option<SocketAddr>,
    /// TURN-over-UDP relay
    pub turn_udp: Option<SocketAddr>,
    /// TURN-over-TCP relay
    pub turn_tcp: Option<SocketAddr>,
}

/// Resolves the helper addresses a [`SessionConfig`] names
#[derive(Clone)]
pub struct AddressResolver {
    resolver: Arc<dyn NameResolver>,
}

impl AddressResolver {
    /// Wrap a name resolver
    #[must_use]
    pub fn new(resolver: Arc<dyn NameResolver>) -> Self {
        Self { resolver }
    }

    /// System-resolver-backed instance
    #[must_use]
    pub fn system() -> Self {
        Self::new(Arc::new(SystemResolver))
    }

    /// Resolve every helper address the config names, concurrently.
    ///
    /// Lookups that fail are logged and left as `None`; the session
    /// proceeds with whatever resolved.
    pub async fn resolve(&self, config: &SessionConfig) -> ResolvedAddresses {
        let (external, stun, turn_udp, turn_tcp) = tokio::join!(
            self.lookup_ip(config.external_host.as_deref()),
            self.lookup_sock(
                config.stun_host.as_ref().map(|h| h.host.as_str()),
                config.stun_host.as_ref().map_or(3478, |h| h.port)
            ),
            self.lookup_sock(
                config.turn_udp.as_ref().map(|t| t.host.as_str()),
                config.turn_udp.as_ref().map_or(3478, |t| t.port)
            ),
            self.lookup_sock(
                config.turn_tcp.as_ref().map(|t| t.host.as_str()),
                config.turn_tcp.as_ref().map_or(3478, |t| t.port)
            ),
        );
        ResolvedAddresses {
            external,
            stun,
            turn_udp,
            turn_tcp,
        }
    }

    async fn lookup_ip(&self, host: Option<&str>) -> Option<IpAddr> {
        let host = host?;
        match self.resolver.resolve(host).await {
            Ok(addrs) => addrs.first().copied(),
            Err(e) => {
                warn!(%host, error = %e, "address lookup failed, continuing without it");
                None
            }
        }
    }

    async fn lookup_sock(&self, host: Option<&str>, port: u16) -> Option<SocketAddr> {
        let ip = self.lookup_ip(host).await?;
        Some(SocketAddr::new(ip, port))
    }
}

impl std::fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressResolver").finish_non_exhaustive()
    }
}
