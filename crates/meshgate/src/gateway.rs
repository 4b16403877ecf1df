//! # Gateway Driver
//!
//! Ties the inbound and outbound halves to the host: link events start and
//! stop listeners, actor actions are forwarded across the mesh.
//!
//! Link events are applied one at a time, in order. Actions run concurrently,
//! one task each. Shutdown tears down every link and closes the pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use meshwire::WireRequest;
use meshwire::envelope;

use crate::config::GatewayConfig;
use crate::discovery::Discovery;
use crate::discovery::RegistryClient;
use crate::discovery::Resolver;
use crate::error::Error;
use crate::error::Result;
use crate::invoker::RemoteInvoker;
use crate::link::LinkDefinition;
use crate::link::LinkManager;
use crate::link::LinkSettings;
use crate::link::TransportFactory;
use crate::pool::ConnectionPool;
use crate::remote::Dialer;
use crate::remote::H2Dialer;

/// A change to the set of linked actors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Put(LinkDefinition),
    Delete(String),
}

/// What the gateway hands back to an actor: reply bytes or an error message.
pub type ActionReply = std::result::Result<Vec<u8>, String>;

/// An operation an actor asked the gateway to perform.
pub struct ActorAction {
    pub operation: String,
    pub msg: Vec<u8>,
    respond: oneshot::Sender<ActionReply>,
}

impl ActorAction {
    pub fn new(
        operation: impl Into<String>,
        msg: Vec<u8>,
    ) -> (Self, oneshot::Receiver<ActionReply>) {
        let (respond, rx) = oneshot::channel();
        (
            Self {
                operation: operation.into(),
                msg,
                respond,
            },
            rx,
        )
    }

    pub fn respond(self, reply: ActionReply) {
        let _ = self.respond.send(reply);
    }
}

pub struct Gateway<D: Dialer = H2Dialer> {
    links: LinkManager,
    invoker: RemoteInvoker<D>,
    grace: Duration,
    span: Span,
}

impl Gateway<H2Dialer> {
    /// Builds a gateway with the configured discovery backend and the HTTP/2 dialer.
    pub fn from_config(
        config: &GatewayConfig,
        transports: Arc<dyn TransportFactory>,
        registry_client: Option<Arc<dyn RegistryClient>>,
    ) -> Result<Self> {
        let span = tracing::info_span!("gateway");
        let discovery = Discovery::from_config(&config.resolver, registry_client)?
            .with_span(tracing::info_span!(parent: &span, "discovery"));
        Ok(Self::assemble(config, discovery, transports, span))
    }

    /// Like [`Gateway::from_config`], but fails unless the discovery backend
    /// answers first.
    pub async fn connect(
        config: &GatewayConfig,
        transports: Arc<dyn TransportFactory>,
        registry_client: Option<Arc<dyn RegistryClient>>,
    ) -> Result<Self> {
        let span = tracing::info_span!("gateway");
        let discovery = Discovery::from_config(&config.resolver, registry_client)?
            .with_span(tracing::info_span!(parent: &span, "discovery"));
        discovery.check().await?;
        Ok(Self::assemble(config, discovery, transports, span))
    }

    fn assemble(
        config: &GatewayConfig,
        discovery: Discovery,
        transports: Arc<dyn TransportFactory>,
        span: Span,
    ) -> Self {
        let dialer = H2Dialer::new()
            .with_connect_timeout(config.timeouts.dial())
            .with_call_timeout(config.timeouts.call())
            .with_max_message_bytes(config.max_message_bytes)
            .with_span(tracing::info_span!(parent: &span, "dialer"));
        Self::new(config, Arc::new(discovery), transports, dialer, span)
    }
}

impl<D: Dialer> Gateway<D> {
    pub fn new(
        config: &GatewayConfig,
        resolver: Arc<dyn Resolver>,
        transports: Arc<dyn TransportFactory>,
        dialer: D,
        span: Span,
    ) -> Self {
        let timeouts = &config.timeouts;
        let links = LinkManager::new(config.external_host.clone(), resolver.clone(), transports)
            .with_settings(LinkSettings {
                rpc_timeout: timeouts.actor_rpc(),
                grace: timeouts.shutdown_grace(),
                deregister_timeout: timeouts.deregister(),
                max_message_bytes: config.max_message_bytes,
            })
            .with_span(tracing::info_span!(parent: &span, "links"));
        let pool =
            Arc::new(ConnectionPool::new().with_span(tracing::info_span!(parent: &span, "pool")));
        let invoker = RemoteInvoker::new(resolver, pool, dialer)
            .with_dial_timeout(timeouts.dial())
            .with_span(tracing::info_span!(parent: &span, "invoker"));
        Self {
            links,
            invoker,
            grace: timeouts.shutdown_grace(),
            span,
        }
    }

    pub fn links(&self) -> &LinkManager {
        &self.links
    }

    pub fn invoker(&self) -> &RemoteInvoker<D> {
        &self.invoker
    }

    /// Performs one actor-originated operation.
    ///
    /// `HandleRequest` operations carry an encoded wire request that is
    /// forwarded to the service named by its routing header; the reply is the
    /// encoded wire response. Anything else is an invalid operation.
    pub async fn evaluate(&self, operation: &str, msg: &[u8]) -> Result<Vec<u8>> {
        if !envelope::is_handle_request(operation) {
            return Err(Error::InvalidOperation(operation.to_string()));
        }
        let request = envelope::decode_request(msg)?;
        let request = WireRequest {
            headers: request.headers.without_empty_values(),
            ..request
        };
        let response = self.invoker.invoke(request).await?;
        Ok(envelope::encode_response(&response)?)
    }

    pub async fn handle_action(&self, action: ActorAction) {
        let reply = match self.evaluate(&action.operation, &action.msg).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                tracing::warn!(parent: &self.span, operation = %action.operation, error = %e, "actor action failed");
                Err(e.to_string())
            }
        };
        action.respond(reply);
    }

    pub async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Put(link) => {
                let actor_id = link.actor_id.clone();
                if let Err(e) = self.links.put_link(link).await {
                    tracing::error!(parent: &self.span, %actor_id, error = %e, "put link failed");
                }
            }
            LinkEvent::Delete(actor_id) => {
                self.links.delete_link(&actor_id);
            }
        }
    }

    /// Serves link events and actor actions until `shutdown` fires or both
    /// channels close, then shuts everything down.
    pub async fn run(
        self: Arc<Self>,
        mut links: mpsc::Receiver<LinkEvent>,
        mut actions: mpsc::Receiver<ActorAction>,
        shutdown: CancellationToken,
    ) {
        let mut in_flight = JoinSet::new();
        let mut links_open = true;
        let mut actions_open = true;
        tracing::info!(parent: &self.span, "ready for link definitions");

        while links_open || actions_open {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = links.recv(), if links_open => match event {
                    Some(event) => self.handle_link_event(event).await,
                    None => links_open = false,
                },
                action = actions.recv(), if actions_open => match action {
                    Some(action) => {
                        let gateway = self.clone();
                        in_flight.spawn(async move { gateway.handle_action(action).await });
                    }
                    None => actions_open = false,
                },
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        let drain = async { while in_flight.join_next().await.is_some() {} };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            tracing::warn!(parent: &self.span, "abandoning in-flight actor actions");
            in_flight.abort_all();
        }
        self.shutdown().await;
    }

    /// Tears down every link and closes every pooled connection.
    pub async fn shutdown(&self) {
        self.links.shutdown_all().await;
        self.invoker.pool().close_all();
        tracing::info!(parent: &self.span, "gateway stopped");
    }
}
