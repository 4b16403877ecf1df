//! # Remote Invoker
//!
//! Forwards a wire request to another mesh participant.
//!
//! ## Flow
//! 1. Read the target service from [`TARGET_HEADER`].
//! 2. Resolve it (never cached here).
//! 3. Borrow a pooled connection, dialing under a deadline if needed.
//! 4. Send the invocation frame.
//! 5. Connection-level failures destroy the connection so the next call
//!    redials; every other outcome releases it.

use std::sync::Arc;
use std::time::Duration;

use tracing::Span;

use meshwire::InvokeRequest;
use meshwire::WireRequest;
use meshwire::WireResponse;

use crate::discovery::Resolver;
use crate::error::Error;
use crate::error::Result;
use crate::pool;
use crate::pool::ConnectionPool;
use crate::remote::Dialer;
use crate::remote::RemoteConnection;

/// Header naming the service a request is routed to.
pub const TARGET_HEADER: &str = "mesh-app-id";

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RemoteInvoker<D: Dialer> {
    resolver: Arc<dyn Resolver>,
    pool: Arc<ConnectionPool<D::Connection>>,
    dialer: D,
    dial_timeout: Duration,
    span: Span,
}

impl<D: Dialer> RemoteInvoker<D> {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        pool: Arc<ConnectionPool<D::Connection>>,
        dialer: D,
    ) -> Self {
        Self {
            resolver,
            pool,
            dialer,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            span: tracing::info_span!("remote_invoker"),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<D::Connection>> {
        &self.pool
    }

    pub async fn invoke(&self, request: WireRequest) -> Result<WireResponse> {
        let target = request
            .headers
            .get(TARGET_HEADER)
            .filter(|v| !v.is_empty())
            .ok_or(Error::MissingTarget(TARGET_HEADER))?
            .to_string();

        let endpoint = self.resolver.resolve(&target).await?;
        let address = endpoint.address;

        let lease = self
            .pool
            .lease(&address, || self.dial(&address))
            .await?;

        let frame = InvokeRequest::from_wire(&request);
        match lease.invoke(frame).await {
            Ok(response) => {
                drop(lease);
                tracing::debug!(
                    parent: &self.span,
                    service_id = %target,
                    %address,
                    status = response.status,
                    "remote call completed"
                );
                Ok(response.into_wire())
            }
            Err(e) => {
                if e.is_connection_level() {
                    lease.destroy();
                } else {
                    drop(lease);
                }
                tracing::warn!(parent: &self.span, service_id = %target, %address, error = %e, "remote call failed");
                Err(e.into())
            }
        }
    }

    async fn dial(&self, address: &str) -> pool::Result<D::Connection> {
        let dial_err = |reason: String| pool::Error::Dial {
            address: address.to_string(),
            reason,
        };
        match tokio::time::timeout(self.dial_timeout, self.dialer.dial(address)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(dial_err(e.to_string())),
            Err(_) => Err(dial_err(format!("timed out after {:?}", self.dial_timeout))),
        }
    }
}
