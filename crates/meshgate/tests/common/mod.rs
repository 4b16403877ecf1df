//! Shared fakes for the integration suites: in-memory discovery backends,
//! a counting dialer, and an echo actor.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;

use meshgate::discovery;
use meshgate::discovery::catalog::AgentService;
use meshgate::discovery::catalog::AgentServiceRegistration;
use meshgate::discovery::catalog::CatalogClient;
use meshgate::discovery::catalog::CatalogNode;
use meshgate::discovery::catalog::CheckStatus;
use meshgate::discovery::catalog::QueryOptions;
use meshgate::discovery::catalog::ServiceEntry;
use meshgate::discovery::registry::Endpoint;
use meshgate::discovery::registry::Instance;
use meshgate::discovery::registry::RegistryClient;
use meshgate::pool::Connection;
use meshgate::remote;
use meshgate::remote::Dialer;
use meshgate::remote::RemoteConnection;
use meshgate::transport;
use meshgate::transport::ChannelTransport;
use meshwire::InvokeRequest;
use meshwire::InvokeResponse;
use meshwire::WireResponse;
use meshwire::envelope;

// --- Catalog ---

/// Builds a catalog entry. `port` goes into the `DAPR_PORT` meta key when set.
pub fn entry(service: &str, address: &str, node_address: &str, port: Option<u16>, status: &str) -> ServiceEntry {
    ServiceEntry {
        node: CatalogNode {
            node: format!("node-{node_address}"),
            address: node_address.to_string(),
        },
        service: AgentService {
            id: service.to_string(),
            service: service.to_string(),
            address: address.to_string(),
            port: port.unwrap_or_default(),
            tags: Some(vec!["meshgate".to_string()]),
            meta: port.map(|p| HashMap::from([("DAPR_PORT".to_string(), p.to_string())])),
        },
        checks: vec![CheckStatus {
            check_id: format!("health:{service}"),
            status: status.to_string(),
        }],
    }
}

/// A catalog agent held in memory.
#[derive(Default)]
pub struct MemoryCatalog {
    pub entries: Mutex<HashMap<String, Vec<ServiceEntry>>>,
    pub registrations: Mutex<Vec<AgentServiceRegistration>>,
    pub deregistered: Mutex<Vec<String>>,
    pub fail_register: AtomicBool,
    pub fail_deregister: AtomicBool,
    pub queries: AtomicUsize,
    /// Registrations that have reached the agent, finished or not.
    pub register_calls: AtomicUsize,
    /// How long each registration takes, in milliseconds.
    pub register_delay_ms: AtomicU64,
}

impl MemoryCatalog {
    pub fn add(&self, entry: ServiceEntry) {
        self.entries
            .lock()
            .entry(entry.service.service.clone())
            .or_default()
            .push(entry);
    }
}

#[async_trait::async_trait]
impl CatalogClient for MemoryCatalog {
    async fn healthy_service(
        &self,
        service: &str,
        _: &QueryOptions,
    ) -> discovery::Result<Vec<ServiceEntry>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.lock().get(service).cloned().unwrap_or_default())
    }

    async fn register_service(&self, registration: &AgentServiceRegistration) -> discovery::Result<()> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.register_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(discovery::Error::Backend("agent refused registration".into()));
        }
        self.registrations.lock().push(registration.clone());
        // Registered services resolve right away, as if their check passed.
        self.add(ServiceEntry {
            node: CatalogNode::default(),
            service: AgentService {
                id: registration.id.clone(),
                service: registration.name.clone(),
                address: registration.address.clone(),
                port: registration.port,
                tags: Some(registration.tags.clone()),
                meta: Some(registration.meta.clone()),
            },
            checks: vec![CheckStatus {
                check_id: registration.check.check_id.clone(),
                status: "passing".into(),
            }],
        });
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> discovery::Result<()> {
        for entries in self.entries.lock().values_mut() {
            entries.retain(|e| e.service.id != service_id);
        }
        self.deregistered.lock().push(service_id.to_string());
        if self.fail_deregister.load(Ordering::SeqCst) {
            return Err(discovery::Error::Backend("agent unreachable".into()));
        }
        Ok(())
    }
}

// --- Registry ---

#[derive(Default)]
pub struct MemoryRegistry {
    pub endpoints: Mutex<HashMap<String, Endpoint>>,
    pub instances: Mutex<Vec<Instance>>,
    pub cancelled: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl RegistryClient for MemoryRegistry {
    async fn endpoint(&self, app_id: &str) -> discovery::Result<Option<Endpoint>> {
        Ok(self.endpoints.lock().get(app_id).cloned())
    }

    async fn register(&self, instance: Instance) -> discovery::Result<()> {
        self.instances.lock().push(instance);
        Ok(())
    }

    async fn cancel(&self, app_id: &str) -> discovery::Result<()> {
        self.cancelled.lock().push(app_id.to_string());
        Ok(())
    }
}

// --- Dialer ---

/// What a [`FakeConnection`] does with each frame.
pub type Script = Arc<dyn Fn(&InvokeRequest) -> remote::Result<InvokeResponse> + Send + Sync>;

pub struct FakeConnection {
    pub id: usize,
    script: Script,
    closes: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl std::fmt::Debug for FakeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl FakeConnection {
    pub fn new(id: usize, closes: Arc<AtomicUsize>) -> Self {
        Self {
            id,
            script: ok_script(),
            closes,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for FakeConnection {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RemoteConnection for FakeConnection {
    async fn invoke(&self, request: InvokeRequest) -> remote::Result<InvokeResponse> {
        if self.is_closed() {
            return Err(remote::Error::Unavailable("connection closed".into()));
        }
        (self.script)(&request)
    }
}

/// Answers every frame with 200 and the frame's path as body.
pub fn ok_script() -> Script {
    Arc::new(|request: &InvokeRequest| {
        Ok(InvokeResponse {
            status: 200,
            headers: Default::default(),
            content_type: "text/plain".into(),
            data: request.method.clone().into_bytes(),
        })
    })
}

/// Counts dials and closes; each connection runs `script`.
#[derive(Clone)]
pub struct CountingDialer {
    pub dials: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    pub delay: Duration,
    pub fail: Option<String>,
    script: Script,
}

impl CountingDialer {
    pub fn new() -> Self {
        Self {
            dials: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            fail: None,
            script: ok_script(),
        }
    }

    pub fn with_script(mut self, script: Script) -> Self {
        self.script = script;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, reason: &str) -> Self {
        self.fail = Some(reason.to_string());
        self
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Dials directly, for pool tests that bypass the [`Dialer`] trait.
    pub async fn connect(&self) -> meshgate::pool::Result<FakeConnection> {
        self.dial("fake:0")
            .await
            .map_err(|e| meshgate::pool::Error::Dial {
                address: "fake:0".into(),
                reason: e.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl Dialer for CountingDialer {
    type Connection = FakeConnection;

    async fn dial(&self, _: &str) -> remote::Result<FakeConnection> {
        let id = self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(reason) = &self.fail {
            return Err(remote::Error::Other(reason.clone()));
        }
        Ok(FakeConnection {
            id,
            script: self.script.clone(),
            closes: self.closes.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

// --- Actors ---

/// Spawns an actor that answers every request with a 200 whose body is the
/// msgpack encoding of the request it saw.
pub fn spawn_echo_actor() -> ChannelTransport {
    let (transport, mut inbox) = transport::channel(16);
    tokio::spawn(async move {
        while let Some(call) = inbox.recv().await {
            let reply = match envelope::decode_request(&call.message.arg) {
                Ok(_) => {
                    let echoed = WireResponse::new(200).with_body(call.message.arg.clone());
                    envelope::encode_response(&echoed)
                        .map_err(|e| transport::Error::Actor(e.to_string()))
                }
                Err(e) => Err(transport::Error::Actor(e.to_string())),
            };
            call.respond(reply);
        }
    });
    transport
}

/// A transport whose actor has already gone away.
pub fn dead_actor() -> ChannelTransport {
    let (transport, inbox) = transport::channel(1);
    drop(inbox);
    transport
}
