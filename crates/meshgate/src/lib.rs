//! # meshgate
//!
//! A gateway that lets actors, which only answer an in-process RPC message,
//! serve and consume traffic on a service-invocation mesh.
//!
//! ## Architecture
//!
//! - **Inbound**: a [`link::LinkManager`] owns one listener per linked actor.
//!   Each listener lowers HTTP or invocation frames into a
//!   [`meshwire::WireRequest`] and hands it to a [`bridge::RequestBridge`],
//!   which calls the actor over its [`transport::ActorTransport`].
//! - **Outbound**: a [`invoker::RemoteInvoker`] resolves the target service
//!   through a [`discovery::Resolver`], borrows a connection from the
//!   [`pool::ConnectionPool`] and forwards the request.
//! - **Driver**: [`gateway::Gateway`] ties both halves to the host's link and
//!   action channels.
//!
//! Every long-lived component owns the `tracing::Span` it logs under; nothing
//! here installs a global subscriber (see [`telemetry`] for a helper that does).

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod invoker;
pub mod link;
pub mod pool;
pub mod remote;
pub mod server;
pub mod telemetry;
pub mod transport;

pub use config::GatewayConfig;
pub use error::Error;
pub use error::Result;
pub use gateway::Gateway;
