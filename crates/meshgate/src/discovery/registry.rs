//! # Registry Resolver
//!
//! Adapter over a long-lived registry client. The client owns the cached
//! endpoint table and heartbeat renewal; this resolver only translates
//! registrations into the client's instance shape and keeps a shadow map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;
use tracing::Span;

use super::Error;
use super::ResolvedEndpoint;
use super::Resolver;
use super::Result;
use super::ServiceRegistration;
use crate::config::RegistryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Registered but not accepting traffic yet.
    NotReceive,
    Receive,
}

/// An instance as the registry client understands it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub zone: String,
    pub env: String,
    pub app_id: String,
    pub region: String,
    pub addrs: Vec<String>,
    /// Unix seconds at registration.
    pub last_ts: i64,
    pub hostname: String,
    pub status: InstanceStatus,
    pub version: String,
}

/// An endpoint from the client's cached table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
}

#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync + 'static {
    /// Looks `app_id` up in the client's cached endpoint table.
    async fn endpoint(&self, app_id: &str) -> Result<Option<Endpoint>>;

    async fn register(&self, instance: Instance) -> Result<()>;

    async fn cancel(&self, app_id: &str) -> Result<()>;
}

pub struct RegistryResolver {
    client: Arc<dyn RegistryClient>,
    settings: RegistryConfig,
    registered: Mutex<HashMap<String, ServiceRegistration>>,
    span: Span,
}

impl RegistryResolver {
    pub fn new(client: Arc<dyn RegistryClient>, settings: RegistryConfig) -> Self {
        Self {
            client,
            settings,
            registered: Mutex::new(HashMap::new()),
            span: tracing::info_span!("registry_resolver"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Registrations go live immediately unless `receive_on_register` is off.
    pub fn instance(&self, registration: &ServiceRegistration) -> Instance {
        let last_ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        Instance {
            zone: self.settings.zone.clone(),
            env: self.settings.env.clone(),
            app_id: registration.service_id.clone(),
            region: self.settings.region.clone(),
            addrs: vec![registration.address.clone()],
            last_ts,
            hostname: registration.service_id.clone(),
            status: if self.settings.receive_on_register {
                InstanceStatus::Receive
            } else {
                InstanceStatus::NotReceive
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Resolver for RegistryResolver {
    async fn resolve(&self, service_id: &str) -> Result<ResolvedEndpoint> {
        let endpoint = self
            .client
            .endpoint(service_id)
            .await?
            .ok_or_else(|| Error::NotFound(service_id.to_string()))?;
        if endpoint.host.is_empty() {
            return Err(Error::AddressUnavailable(service_id.to_string()));
        }
        Ok(ResolvedEndpoint {
            service_id: service_id.to_string(),
            address: endpoint.host,
        })
    }

    async fn register(&self, registration: ServiceRegistration) -> Result<()> {
        let instance = self.instance(&registration);
        if let Err(e) = self.client.register(instance).await {
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
        if let Err(e) = self.client.cancel(service_id).await {
            tracing::warn!(parent: &self.span, service_id, error = %e, "cancel failed");
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
