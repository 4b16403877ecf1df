//! # Service Discovery
//!
//! Resolves logical service ids to network addresses and keeps the backend's
//! registry in step with the actors this gateway hosts.
//!
//! Two backends exist, chosen once from configuration through the tagged
//! [`Discovery`] enum:
//!
//! - [`catalog::CatalogResolver`]: a consensus-backed catalog with health
//!   filtering (the Consul agent API).
//! - [`registry::RegistryResolver`]: a long-lived registry client with its own
//!   cached endpoint table and heartbeats.
//!
//! Each backend keeps a mutex-guarded shadow map of what it registered, so the
//! gateway can answer "do we host this" without a round trip. Resolution never
//! reads the shadow map.

pub mod catalog;
pub mod consul;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use crate::config::ResolverConfig;

pub use catalog::CatalogClient;
pub use catalog::CatalogResolver;
pub use consul::ConsulClient;
pub use registry::RegistryClient;
pub use registry::RegistryResolver;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no healthy instances of {0:?}")]
    NotFound(String),
    #[error("{service_id:?} found but {key:?} is missing from its metadata")]
    MetadataMissing { service_id: String, key: String },
    #[error("{0:?} advertises neither a service nor a node address")]
    AddressUnavailable(String),
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("discovery backend: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Health check attached to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheck {
    pub interval: Duration,
    pub timeout: Duration,
    /// How long an instance may stay critical before the backend drops it.
    pub deregister_after: Duration,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(5),
            deregister_after: Duration::from_secs(120),
        }
    }
}

/// What a listener advertises to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub service_id: String,
    /// Host part of `address`.
    pub host: String,
    /// Externally reachable `host:port`.
    pub address: String,
    pub health_check: HealthCheck,
}

impl ServiceRegistration {
    pub fn new(service_id: impl Into<String>, address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        let (host, _) = split_host_port(&address)?;
        Ok(Self {
            service_id: service_id.into(),
            host,
            address,
            health_check: HealthCheck::default(),
        })
    }
}

/// One resolution result. Never cached by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub service_id: String,
    pub address: String,
}

#[async_trait::async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, service_id: &str) -> Result<ResolvedEndpoint>;

    /// Publishes the registration; the shadow map is updated only on success.
    async fn register(&self, registration: ServiceRegistration) -> Result<()>;

    /// Forgets the service locally and at the backend. Backend errors are
    /// logged, never returned.
    async fn deregister(&self, service_id: &str);

    fn hosted(&self, service_id: &str) -> bool;

    fn hosted_ids(&self) -> Vec<String>;
}

/// The configured backend.
pub enum Discovery {
    Catalog(CatalogResolver),
    Registry(RegistryResolver),
}

impl Discovery {
    /// Builds the backend named by `config`.
    ///
    /// The catalog backend talks to its agent over HTTP. The registry backend's
    /// client is proprietary and must be supplied by the embedder.
    pub fn from_config(
        config: &ResolverConfig,
        registry_client: Option<Arc<dyn RegistryClient>>,
    ) -> Result<Self> {
        match config {
            ResolverConfig::Catalog(catalog) => {
                let client = ConsulClient::new(catalog)?;
                Ok(Self::Catalog(CatalogResolver::from_config(
                    Arc::new(client),
                    catalog,
                )))
            }
            ResolverConfig::Registry(registry) => {
                let client = registry_client.ok_or_else(|| {
                    Error::Backend("registry backend selected but no client supplied".into())
                })?;
                Ok(Self::Registry(RegistryResolver::new(client, registry.clone())))
            }
        }
    }

    pub fn with_span(self, span: tracing::Span) -> Self {
        match self {
            Self::Catalog(r) => Self::Catalog(r.with_span(span)),
            Self::Registry(r) => Self::Registry(r.with_span(span)),
        }
    }

    /// Validates connectivity to the backend. The registry client manages its
    /// own connection, so only the catalog agent is checked.
    pub async fn check(&self) -> Result<()> {
        match self {
            Self::Catalog(r) => r.check().await,
            Self::Registry(_) => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Resolver for Discovery {
    async fn resolve(&self, service_id: &str) -> Result<ResolvedEndpoint> {
        match self {
            Self::Catalog(r) => r.resolve(service_id).await,
            Self::Registry(r) => r.resolve(service_id).await,
        }
    }

    async fn register(&self, registration: ServiceRegistration) -> Result<()> {
        match self {
            Self::Catalog(r) => r.register(registration).await,
            Self::Registry(r) => r.register(registration).await,
        }
    }

    async fn deregister(&self, service_id: &str) {
        match self {
            Self::Catalog(r) => r.deregister(service_id).await,
            Self::Registry(r) => r.deregister(service_id).await,
        }
    }

    fn hosted(&self, service_id: &str) -> bool {
        match self {
            Self::Catalog(r) => r.hosted(service_id),
            Self::Registry(r) => r.hosted(service_id),
        }
    }

    fn hosted_ids(&self) -> Vec<String> {
        match self {
            Self::Catalog(r) => r.hosted_ids(),
            Self::Registry(r) => r.hosted_ids(),
        }
    }
}

/// Joins a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: impl std::fmt::Display) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Splits `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(address: &str) -> Result<(String, u16)> {
    let invalid = || Error::InvalidAddress(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']').ok_or_else(invalid)?,
        None if host.contains(':') => return Err(invalid()),
        None => host,
    };
    let port = port.parse().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("10.0.0.1:50001").unwrap(), ("10.0.0.1".into(), 50001));
        assert_eq!(split_host_port("[::1]:80").unwrap(), ("::1".into(), 80));
        assert_eq!(split_host_port(":8080").unwrap(), ("".into(), 8080));
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port("::1:80").is_err());
        assert!(split_host_port("host:http").is_err());
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("10.0.0.1", 80), "10.0.0.1:80");
        assert_eq!(join_host_port("::1", "80"), "[::1]:80");
        assert_eq!(join_host_port("[::1]", 80), "[::1]:80");
    }

    #[test]
    fn test_registration_derives_host() {
        let reg = ServiceRegistration::new("orders", "10.1.2.3:4000").unwrap();
        assert_eq!(reg.host, "10.1.2.3");
        assert_eq!(reg.health_check.interval, Duration::from_secs(15));
        assert_eq!(reg.health_check.deregister_after, Duration::from_secs(120));
    }
}
