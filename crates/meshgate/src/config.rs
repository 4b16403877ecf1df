//! # Gateway Configuration
//!
//! Loaded once at startup, from a TOML file or from the JSON blob a host hands
//! the gateway. Durations are whole seconds.
//!
//! ```toml
//! external_host = "10.0.0.7"
//!
//! [resolver]
//! kind = "catalog"
//! address = "127.0.0.1:8500"
//!
//! [timeouts]
//! actor_rpc = 5
//! ```
//!
//! The JSON form also accepts the flat `resolver_address` / `external_address`
//! keys older hosts send; a bare `resolver_address` selects the catalog backend.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use meshwire::invoke::MAX_MESSAGE_BYTES;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Host advertised to discovery, joined with each listener's bound port.
    #[serde(alias = "external_address")]
    pub external_host: String,
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

/// Which discovery backend to use, chosen once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverConfig {
    Catalog(CatalogConfig),
    Registry(RegistryConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// `host:port` of the catalog agent.
    #[serde(default = "default_catalog_address")]
    pub address: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Metadata key holding an instance's invocation port.
    #[serde(default = "default_port_meta_key")]
    pub port_meta_key: String,
    /// Allow the agent to answer health queries from its cache.
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            address: default_catalog_address(),
            scheme: default_scheme(),
            port_meta_key: default_port_meta_key(),
            use_cache: true,
            datacenter: None,
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub nodes: Vec<String>,
    #[serde(default)]
    pub zone: String,
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub region: String,
    /// Seconds between heartbeat renewals, performed by the registry client.
    #[serde(default = "default_renew_gap")]
    pub renew_gap: u64,
    /// Whether new instances take traffic as soon as they register. When
    /// false they register as not receiving and the embedder flips them.
    #[serde(default = "default_true")]
    pub receive_on_register: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            zone: String::new(),
            env: default_env(),
            region: String::new(),
            renew_gap: default_renew_gap(),
            receive_on_register: true,
        }
    }
}

/// Paths to mTLS material. The gateway carries these for the embedder's
/// dialer; it never negotiates TLS itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub actor_rpc: u64,
    pub dial: u64,
    pub call: u64,
    pub shutdown_grace: u64,
    pub deregister: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            actor_rpc: 5,
            dial: 30,
            call: 30,
            shutdown_grace: 5,
            deregister: 2,
        }
    }
}

impl Timeouts {
    pub fn actor_rpc(&self) -> Duration {
        Duration::from_secs(self.actor_rpc)
    }

    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial)
    }

    pub fn call(&self) -> Duration {
        Duration::from_secs(self.call)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }

    pub fn deregister(&self) -> Duration {
        Duration::from_secs(self.deregister)
    }
}

/// The flat JSON shape, accepted alongside the structured one.
#[derive(Deserialize)]
struct HostData {
    #[serde(alias = "external_address")]
    external_host: String,
    #[serde(default)]
    resolver: Option<ResolverConfig>,
    #[serde(default)]
    resolver_address: Option<String>,
    #[serde(default)]
    tls: Option<TlsConfig>,
    #[serde(default)]
    timeouts: Timeouts,
    #[serde(default = "default_max_message_bytes")]
    max_message_bytes: usize,
}

impl GatewayConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: HostData = serde_json::from_str(text)?;
        let resolver = match (raw.resolver, raw.resolver_address) {
            (Some(resolver), _) => resolver,
            (None, Some(address)) => ResolverConfig::Catalog(CatalogConfig {
                address,
                ..CatalogConfig::default()
            }),
            (None, None) => {
                return Err(Error::Invalid(
                    "either `resolver` or `resolver_address` is required".into(),
                ));
            }
        };
        let config = Self {
            external_host: raw.external_host,
            resolver,
            tls: raw.tls,
            timeouts: raw.timeouts,
            max_message_bytes: raw.max_message_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads a file, picking the format from its extension (`.json`, else TOML).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.external_host.trim().is_empty() {
            return Err(Error::Invalid("external_host must not be empty".into()));
        }
        if self.max_message_bytes == 0 {
            return Err(Error::Invalid("max_message_bytes must be positive".into()));
        }
        let t = &self.timeouts;
        if t.actor_rpc == 0 || t.dial == 0 || t.call == 0 {
            return Err(Error::Invalid(
                "actor_rpc, dial and call timeouts must be positive".into(),
            ));
        }
        match &self.resolver {
            ResolverConfig::Catalog(catalog) => {
                if catalog.address.is_empty() {
                    return Err(Error::Invalid("catalog address must not be empty".into()));
                }
                if catalog.port_meta_key.is_empty() {
                    return Err(Error::Invalid("port_meta_key must not be empty".into()));
                }
            }
            ResolverConfig::Registry(registry) => {
                if registry.nodes.is_empty() {
                    return Err(Error::Invalid("registry needs at least one node".into()));
                }
            }
        }
        Ok(())
    }
}

fn default_max_message_bytes() -> usize {
    MAX_MESSAGE_BYTES
}

fn default_catalog_address() -> String {
    "127.0.0.1:8500".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_port_meta_key() -> String {
    "DAPR_PORT".to_string()
}

fn default_env() -> String {
    "release".to_string()
}

fn default_renew_gap() -> u64 {
    30
}

fn default_true() -> bool {
    true
}
