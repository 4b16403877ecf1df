//! # Link Manager
//!
//! Owns the per-actor bindings: one listener plus one discovery registration
//! for each linked actor.
//!
//! ## Lifecycle
//! `Created -> Running -> ShuttingDown -> Stopped`
//!
//! - `put_link` binds the listener, registers `external_host:bound_port`, and
//!   only then installs the binding as `Running`. A registration failure closes
//!   the listener again. A binding already present for the actor is fully torn
//!   down before the new listener binds.
//! - `delete_link` removes the binding at once and tears it down in the
//!   background. Deregistration and listener shutdown are each best-effort.
//!   A finished teardown drops its own entry from the table.
//! - A delete that lands while a `put_link` for the same actor is still
//!   starting cancels that put: the new binding is rolled back instead of
//!   installed.
//! - After `shutdown_all` the manager is closed. Puts still starting roll
//!   back, and later puts fail with [`Error::Closed`].
//!
//! ## Invariants
//! - At most one binding per actor id.
//! - Calls for the same actor are serialized by a per-actor gate; different
//!   actors proceed independently. A gate lives only while someone holds it.
//! - The binding table lock is never held across I/O.

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::bridge::RequestBridge;
use crate::discovery;
use crate::discovery::Resolver;
use crate::discovery::ServiceRegistration;
use crate::discovery::join_host_port;
use crate::server;
use crate::server::Listener;
use crate::server::ListenerSettings;
use crate::server::Protocol;
use crate::transport::ActorTransport;

/// Link value holding the listen address.
pub const ADDRESS_KEY: &str = "address";
/// Link value holding the id the binding registers under.
pub const UNIQUE_ID_KEY: &str = "unique_id";
/// Link value selecting the listener protocol.
pub const PROTOCOL_KEY: &str = "protocol";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("link for {0:?} has no \"address\" value")]
    MissingAddress(String),
    #[error(transparent)]
    Listener(#[from] server::Error),
    #[error("registering {service_id:?} failed: {source}")]
    Registration {
        service_id: String,
        #[source]
        source: discovery::Error,
    },
    #[error("link for {0:?} was deleted while starting")]
    Cancelled(String),
    #[error("link manager is shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A link as the host describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDefinition {
    pub actor_id: String,
    /// Registration id; the actor id when empty.
    pub unique_id: String,
    pub listen_address: String,
    pub protocol: Protocol,
    pub values: HashMap<String, String>,
}

impl LinkDefinition {
    pub fn new(actor_id: impl Into<String>, listen_address: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            unique_id: String::new(),
            listen_address: listen_address.into(),
            protocol: Protocol::default(),
            values: HashMap::new(),
        }
    }

    /// Reads the well-known keys out of the link's values.
    pub fn from_values(actor_id: impl Into<String>, values: HashMap<String, String>) -> Result<Self> {
        let actor_id = actor_id.into();
        let listen_address = values
            .get(ADDRESS_KEY)
            .filter(|a| !a.is_empty())
            .cloned()
            .ok_or_else(|| Error::MissingAddress(actor_id.clone()))?;
        let protocol = match values.get(PROTOCOL_KEY) {
            Some(name) => name.parse()?,
            None => Protocol::default(),
        };
        Ok(Self {
            unique_id: values.get(UNIQUE_ID_KEY).cloned().unwrap_or_default(),
            actor_id,
            listen_address,
            protocol,
            values,
        })
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = unique_id.into();
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn service_id(&self) -> &str {
        if self.unique_id.is_empty() {
            &self.actor_id
        } else {
            &self.unique_id
        }
    }
}

/// Produces the transport a new binding uses to reach its actor.
pub trait TransportFactory: Send + Sync + 'static {
    fn transport(&self, link: &LinkDefinition) -> Arc<dyn ActorTransport>;
}

impl<F> TransportFactory for F
where
    F: Fn(&LinkDefinition) -> Arc<dyn ActorTransport> + Send + Sync + 'static,
{
    fn transport(&self, link: &LinkDefinition) -> Arc<dyn ActorTransport> {
        self(link)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// A snapshot of one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub actor_id: String,
    pub service_id: String,
    pub listen_address: SocketAddr,
    pub external_address: String,
    pub protocol: Protocol,
    pub state: LinkState,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub rpc_timeout: Duration,
    pub grace: Duration,
    pub deregister_timeout: Duration,
    pub max_message_bytes: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            rpc_timeout: crate::bridge::DEFAULT_TIMEOUT,
            grace: Duration::from_secs(5),
            deregister_timeout: Duration::from_secs(2),
            max_message_bytes: meshwire::invoke::MAX_MESSAGE_BYTES,
        }
    }
}

struct Binding {
    actor_id: String,
    service_id: String,
    external_address: String,
    listener: Listener,
}

impl Binding {
    fn info(&self, state: LinkState) -> LinkInfo {
        LinkInfo {
            actor_id: self.actor_id.clone(),
            service_id: self.service_id.clone(),
            listen_address: self.listener.local_addr(),
            external_address: self.external_address.clone(),
            protocol: self.listener.protocol(),
            state,
        }
    }
}

struct Draining {
    info: LinkInfo,
    /// Tells this teardown apart from a later one for the same actor.
    token: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    active: HashMap<String, Binding>,
    draining: HashMap<String, Draining>,
    /// Actors with a `put_link` past its gate but not yet installed.
    starting: HashSet<String>,
    /// Starting actors deleted before their binding was installed.
    cancelled: HashSet<String>,
    closed: bool,
    next_token: u64,
}

impl Table {
    /// Installs `binding` unless the manager closed or the actor was deleted
    /// while it started. A refused binding is handed back.
    fn install(&mut self, binding: Binding) -> std::result::Result<(), (Error, Binding)> {
        if self.closed {
            return Err((Error::Closed, binding));
        }
        if self.cancelled.remove(&binding.actor_id) {
            return Err((Error::Cancelled(binding.actor_id.clone()), binding));
        }
        self.active.insert(binding.actor_id.clone(), binding);
        Ok(())
    }

    fn drained(&mut self, actor_id: &str, token: u64) {
        if self.draining.get(actor_id).is_some_and(|d| d.token == token) {
            self.draining.remove(actor_id);
        }
    }
}

/// Clears an actor's starting marks when its `put_link` ends, however it ends.
struct Starting<'a> {
    table: &'a Mutex<Table>,
    actor_id: &'a str,
}

impl Drop for Starting<'_> {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        table.starting.remove(self.actor_id);
        table.cancelled.remove(self.actor_id);
    }
}

pub struct LinkManager {
    external_host: String,
    resolver: Arc<dyn Resolver>,
    transports: Arc<dyn TransportFactory>,
    settings: LinkSettings,
    table: Arc<Mutex<Table>>,
    gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    span: Span,
}

impl LinkManager {
    pub fn new(
        external_host: impl Into<String>,
        resolver: Arc<dyn Resolver>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            external_host: external_host.into(),
            resolver,
            transports,
            settings: LinkSettings::default(),
            table: Arc::new(Mutex::new(Table::default())),
            gates: DashMap::new(),
            span: tracing::info_span!("link_manager"),
        }
    }

    pub fn with_settings(mut self, settings: LinkSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    fn gate(&self, actor_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gates.entry(actor_id.to_string()).or_default().clone()
    }

    /// Drops the gate for `actor_id` unless someone still holds a handle to it.
    fn release_gate(&self, actor_id: &str) {
        self.gates
            .remove_if(actor_id, |_, gate| Arc::strong_count(gate) == 1);
    }

    /// Number of per-actor gates currently allocated.
    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }

    /// Starts (or restarts) the binding for `link.actor_id`.
    pub async fn put_link(&self, link: LinkDefinition) -> Result<LinkInfo> {
        let actor_id = link.actor_id.clone();
        let result = {
            let gate = self.gate(&actor_id);
            let _serial = gate.lock().await;
            self.start(link).await
        };
        self.release_gate(&actor_id);
        result
    }

    async fn start(&self, link: LinkDefinition) -> Result<LinkInfo> {
        {
            let mut table = self.table.lock();
            if table.closed {
                return Err(Error::Closed);
            }
            table.starting.insert(link.actor_id.clone());
        }
        let _starting = Starting {
            table: &self.table,
            actor_id: &link.actor_id,
        };

        self.settle(&link.actor_id).await;
        let prior = self.table.lock().active.remove(&link.actor_id);
        if let Some(prior) = prior {
            tracing::info!(parent: &self.span, actor_id = %link.actor_id, "replacing existing link");
            teardown(
                self.resolver.clone(),
                prior,
                self.settings.deregister_timeout,
                self.span.clone(),
            )
            .await;
        }

        let link_span = tracing::info_span!(parent: &self.span, "link", actor_id = %link.actor_id);
        let bridge = RequestBridge::new(link.actor_id.clone(), self.transports.transport(&link))
            .with_timeout(self.settings.rpc_timeout)
            .with_span(link_span.clone());
        let listener = Listener::bind(
            &link.listen_address,
            link.protocol,
            Arc::new(bridge),
            ListenerSettings {
                max_message_bytes: self.settings.max_message_bytes,
                grace: self.settings.grace,
                span: link_span,
            },
        )
        .await?;

        let service_id = link.service_id().to_string();
        let external_address = join_host_port(&self.external_host, listener.local_addr().port());
        let registered = match ServiceRegistration::new(service_id.clone(), external_address.clone()) {
            Ok(registration) => self.resolver.register(registration).await,
            Err(e) => Err(e),
        };
        if let Err(source) = registered {
            tracing::error!(
                parent: &self.span,
                actor_id = %link.actor_id,
                %service_id,
                error = %source,
                "registration failed, closing listener"
            );
            listener.shutdown().await;
            return Err(Error::Registration { service_id, source });
        }

        let binding = Binding {
            actor_id: link.actor_id.clone(),
            service_id,
            external_address,
            listener,
        };
        let info = binding.info(LinkState::Running);
        let installed = self.table.lock().install(binding);
        if let Err((err, binding)) = installed {
            tracing::info!(
                parent: &self.span,
                actor_id = %link.actor_id,
                reason = %err,
                "rolling back new link"
            );
            teardown(
                self.resolver.clone(),
                binding,
                self.settings.deregister_timeout,
                self.span.clone(),
            )
            .await;
            return Err(err);
        }
        tracing::info!(
            parent: &self.span,
            actor_id = %info.actor_id,
            address = %info.external_address,
            "link running"
        );
        Ok(info)
    }

    /// Removes the binding and tears it down in the background.
    /// Returns false for an unknown actor id. An actor whose `put_link` is
    /// still starting has that put cancelled instead.
    pub fn delete_link(&self, actor_id: &str) -> bool {
        let mut table = self.table.lock();
        let Some(binding) = table.active.remove(actor_id) else {
            if table.starting.contains(actor_id) {
                tracing::info!(parent: &self.span, actor_id, "link still starting, cancelling it");
                table.cancelled.insert(actor_id.to_string());
                return true;
            }
            tracing::debug!(parent: &self.span, actor_id, "no link to delete");
            return false;
        };
        let info = binding.info(LinkState::ShuttingDown);
        table.next_token += 1;
        let token = table.next_token;
        let done = teardown(
            self.resolver.clone(),
            binding,
            self.settings.deregister_timeout,
            self.span.clone(),
        );
        let owner = self.table.clone();
        let actor = actor_id.to_string();
        let handle = tokio::spawn(async move {
            done.await;
            owner.lock().drained(&actor, token);
        });
        table
            .draining
            .insert(actor_id.to_string(), Draining { info, token, handle });
        true
    }

    /// Waits for a background teardown of `actor_id`, if one is pending.
    pub async fn settle(&self, actor_id: &str) {
        let draining = self.table.lock().draining.remove(actor_id);
        if let Some(draining) = draining {
            self.reap(actor_id, draining.handle).await;
        }
    }

    async fn reap(&self, actor_id: &str, handle: JoinHandle<()>) {
        if let Err(e) = handle.await {
            tracing::warn!(parent: &self.span, actor_id, error = %e, "teardown task failed");
        }
    }

    /// Tears down every binding and waits for all pending teardowns. Puts
    /// still starting are rolled back and awaited; later puts fail.
    pub async fn shutdown_all(&self) {
        let (active, draining, starting) = {
            let mut table = self.table.lock();
            table.closed = true;
            (
                std::mem::take(&mut table.active),
                std::mem::take(&mut table.draining),
                table.starting.iter().cloned().collect::<Vec<_>>(),
            )
        };
        let count = active.len();
        let teardowns = active.into_values().map(|binding| {
            teardown(
                self.resolver.clone(),
                binding,
                self.settings.deregister_timeout,
                self.span.clone(),
            )
        });
        futures::future::join_all(teardowns).await;
        let reaps = draining
            .into_iter()
            .map(|(actor_id, d)| async move { self.reap(&actor_id, d.handle).await });
        futures::future::join_all(reaps).await;

        // A starting put holds its actor's gate until it has rolled back.
        for actor_id in &starting {
            let gate = self.gate(actor_id);
            drop(gate.lock().await);
            drop(gate);
            self.release_gate(actor_id);
        }
        tracing::info!(
            parent: &self.span,
            count,
            rolled_back = starting.len(),
            "all links shut down"
        );
    }

    pub fn link(&self, actor_id: &str) -> Option<LinkInfo> {
        let table = self.table.lock();
        if let Some(binding) = table.active.get(actor_id) {
            return Some(binding.info(LinkState::Running));
        }
        table.draining.get(actor_id).map(Draining::snapshot)
    }

    /// Running bindings followed by any still being torn down.
    pub fn links(&self) -> Vec<LinkInfo> {
        let table = self.table.lock();
        let mut running: Vec<LinkInfo> = table
            .active
            .values()
            .map(|b| b.info(LinkState::Running))
            .collect();
        running.sort_by(|a, b| a.actor_id.cmp(&b.actor_id));
        let mut draining: Vec<LinkInfo> = table.draining.values().map(Draining::snapshot).collect();
        draining.sort_by(|a, b| a.actor_id.cmp(&b.actor_id));
        running.extend(draining);
        running
    }
}

impl Draining {
    /// A finished teardown removes its own entry, so a finished handle still
    /// listed here belongs to a teardown task that died.
    fn snapshot(&self) -> LinkInfo {
        let mut info = self.info.clone();
        if self.handle.is_finished() {
            info.state = LinkState::Stopped;
        }
        info
    }
}

async fn teardown(
    resolver: Arc<dyn Resolver>,
    binding: Binding,
    deregister_timeout: Duration,
    span: Span,
) {
    let deregister = resolver.deregister(&binding.service_id);
    if tokio::time::timeout(deregister_timeout, deregister).await.is_err() {
        tracing::warn!(
            parent: &span,
            service_id = %binding.service_id,
            ?deregister_timeout,
            "deregistration timed out"
        );
    }
    binding.listener.shutdown().await;
    tracing::info!(parent: &span, actor_id = %binding.actor_id, "link stopped");
}
