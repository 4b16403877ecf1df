//! # Remote Invocation
//!
//! How a gateway calls another mesh participant: dial an address once, then
//! send invocation frames over the resulting connection.
//!
//! Failures are classified so the caller can decide what to do with the
//! connection: [`Error::is_connection_level`] failures mean the connection
//! should be destroyed; anything else leaves it usable.

mod h2;

use std::time::Duration;

use meshwire::InvokeRequest;
use meshwire::InvokeResponse;

use crate::pool::Connection;

pub use h2::H2Connection;
pub use h2::H2Dialer;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("message exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the connection that produced this error must be discarded.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Unauthenticated(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A pooled connection able to carry invocation frames.
#[async_trait::async_trait]
pub trait RemoteConnection: Connection {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse>;
}

/// Opens connections to remote gateways.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: RemoteConnection;

    async fn dial(&self, address: &str) -> Result<Self::Connection>;
}
