//! # Catalog Resolver
//!
//! Resolution against a health-filtering service catalog. The types below
//! mirror the catalog agent's JSON so a [`CatalogClient`] can hand them
//! through untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde::Serialize;
use tracing::Span;

use super::Error;
use super::ResolvedEndpoint;
use super::Resolver;
use super::Result;
use super::ServiceRegistration;
use super::join_host_port;
use super::split_host_port;
use crate::config::CatalogConfig;

/// Tag attached to every registration this gateway makes.
pub const SERVICE_TAG: &str = "meshgate";

const PASSING: &str = "passing";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Only return instances whose checks all pass.
    pub passing_only: bool,
    pub use_cache: bool,
    pub tag: Option<String>,
    pub datacenter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    #[serde(default)]
    pub node: CatalogNode,
    pub service: AgentService,
    #[serde(default)]
    pub checks: Vec<CheckStatus>,
}

impl ServiceEntry {
    pub fn is_passing(&self) -> bool {
        self.checks.iter().all(|c| c.status == PASSING)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogNode {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub meta: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckStatus {
    #[serde(default, rename = "CheckID")]
    pub check_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
    pub meta: HashMap<String, String>,
    pub check: AgentServiceCheck,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    pub name: String,
    #[serde(rename = "HTTP")]
    pub http: String,
    pub interval: String,
    pub timeout: String,
    pub deregister_critical_service_after: String,
}

/// The catalog agent operations the resolver needs.
#[async_trait::async_trait]
pub trait CatalogClient: Send + Sync + 'static {
    async fn healthy_service(&self, service: &str, options: &QueryOptions) -> Result<Vec<ServiceEntry>>;

    async fn register_service(&self, registration: &AgentServiceRegistration) -> Result<()>;

    async fn deregister_service(&self, service_id: &str) -> Result<()>;

    /// Fails when the agent cannot be reached.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

pub struct CatalogResolver {
    client: Arc<dyn CatalogClient>,
    port_meta_key: String,
    query: QueryOptions,
    registered: Mutex<HashMap<String, ServiceRegistration>>,
    span: Span,
}

impl CatalogResolver {
    pub fn new(client: Arc<dyn CatalogClient>) -> Self {
        Self {
            client,
            port_meta_key: "DAPR_PORT".to_string(),
            query: QueryOptions {
                passing_only: true,
                use_cache: true,
                ..QueryOptions::default()
            },
            registered: Mutex::new(HashMap::new()),
            span: tracing::info_span!("catalog_resolver"),
        }
    }

    pub fn from_config(client: Arc<dyn CatalogClient>, config: &CatalogConfig) -> Self {
        Self::new(client)
            .with_port_meta_key(config.port_meta_key.clone())
            .with_query(QueryOptions {
                passing_only: true,
                use_cache: config.use_cache,
                tag: None,
                datacenter: config.datacenter.clone(),
            })
    }

    pub fn with_port_meta_key(mut self, key: impl Into<String>) -> Self {
        self.port_meta_key = key.into();
        self
    }

    pub fn with_query(mut self, query: QueryOptions) -> Self {
        self.query = query;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Confirms the agent answers before any link registers against it.
    pub async fn check(&self) -> Result<()> {
        if let Err(e) = self.client.ping().await {
            tracing::error!(parent: &self.span, error = %e, "catalog agent unreachable");
            return Err(e);
        }
        tracing::debug!(parent: &self.span, "catalog agent reachable");
        Ok(())
    }

    /// The agent-side shape of a registration.
    pub fn agent_registration(
        &self,
        registration: &ServiceRegistration,
    ) -> Result<AgentServiceRegistration> {
        let (host, port) = split_host_port(&registration.address)?;
        let check = &registration.health_check;
        Ok(AgentServiceRegistration {
            id: registration.service_id.clone(),
            name: registration.service_id.clone(),
            tags: vec![SERVICE_TAG.to_string()],
            address: host,
            port,
            meta: HashMap::from([(self.port_meta_key.clone(), port.to_string())]),
            check: AgentServiceCheck {
                check_id: format!("health:{}", registration.service_id),
                name: format!("{} health", registration.service_id),
                http: format!("http://{}/v1.0/healthz", registration.address),
                interval: seconds(check.interval),
                timeout: seconds(check.timeout),
                deregister_critical_service_after: seconds(check.deregister_after),
            },
        })
    }
}

#[async_trait::async_trait]
impl Resolver for CatalogResolver {
    async fn resolve(&self, service_id: &str) -> Result<ResolvedEndpoint> {
        let mut entries = self.client.healthy_service(service_id, &self.query).await?;
        if self.query.passing_only {
            entries.retain(ServiceEntry::is_passing);
        }
        entries.shuffle(&mut rand::thread_rng());
        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(service_id.to_string()))?;

        let port = entry
            .service
            .meta
            .as_ref()
            .and_then(|meta| meta.get(&self.port_meta_key))
            .ok_or_else(|| Error::MetadataMissing {
                service_id: service_id.to_string(),
                key: self.port_meta_key.clone(),
            })?;

        let host = if !entry.service.address.is_empty() {
            &entry.service.address
        } else if !entry.node.address.is_empty() {
            &entry.node.address
        } else {
            return Err(Error::AddressUnavailable(service_id.to_string()));
        };

        let address = join_host_port(host, port);
        tracing::debug!(parent: &self.span, service_id, %address, "resolved");
        Ok(ResolvedEndpoint {
            service_id: service_id.to_string(),
            address,
        })
    }

    async fn register(&self, registration: ServiceRegistration) -> Result<()> {
        let agent = self.agent_registration(&registration)?;
        if let Err(e) = self.client.register_service(&agent).await {
            tracing::error!(parent: &self.span, service_id = %registration.service_id, error = %e, "registration failed");
            return Err(e);
        }
        tracing::info!(
            parent: &self.span,
            service_id = %registration.service_id,
            address = %registration.address,
            "registered"
        );
        self.registered
            .lock()
            .insert(registration.service_id.clone(), registration);
        Ok(())
    }

    async fn deregister(&self, service_id: &str) {
        self.registered.lock().remove(service_id);
        match self.client.deregister_service(service_id).await {
            Ok(()) => tracing::info!(parent: &self.span, service_id, "deregistered"),
            Err(e) => {
                tracing::warn!(parent: &self.span, service_id, error = %e, "deregistration failed")
            }
        }
    }

    fn hosted(&self, service_id: &str) -> bool {
        self.registered.lock().contains_key(service_id)
    }

    fn hosted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registered.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Formats a duration the way the agent expects (`"15s"`).
fn seconds(d: Duration) -> String {
    format!("{}s", d.as_secs())
}
