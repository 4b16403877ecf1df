//! # Request Bridge
//!
//! Per-actor translator between wire requests and the actor RPC envelope.
//!
//! ## Flow
//! 1. Reject verbs the actor cannot represent (empty, `CONNECT`).
//! 2. Wrap the request in a `HandleRequest` message and send it over the
//!    actor transport under a deadline.
//! 3. Decode the reply. A msgpack body the caller did not ask for is
//!    re-encoded as JSON when it converts cleanly; otherwise it passes through.
//!
//! Any failure becomes a plain-text response carrying the error's status.
//! Nothing is retried.

use std::sync::Arc;
use std::time::Duration;

use tracing::Span;

use meshwire::Message;
use meshwire::WireRequest;
use meshwire::WireResponse;
use meshwire::envelope;
use meshwire::reencode;

use crate::error::Error;
use crate::error::Result;
use crate::transport::ActorTransport;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RequestBridge {
    actor_id: String,
    transport: Arc<dyn ActorTransport>,
    timeout: Duration,
    span: Span,
}

impl RequestBridge {
    pub fn new(actor_id: impl Into<String>, transport: Arc<dyn ActorTransport>) -> Self {
        let actor_id = actor_id.into();
        let span = tracing::info_span!("request_bridge", actor_id = %actor_id);
        Self {
            actor_id,
            transport,
            timeout: DEFAULT_TIMEOUT,
            span,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Runs one request through the actor, folding failures into a response.
    pub async fn handle(&self, request: WireRequest) -> WireResponse {
        let method = request.method.clone();
        let path = request.path.clone();
        match self.dispatch(request).await {
            Ok(response) => {
                tracing::debug!(
                    parent: &self.span,
                    %method,
                    %path,
                    status = response.status_code,
                    "actor answered"
                );
                response
            }
            Err(e) => {
                let status = e.status_code();
                tracing::warn!(parent: &self.span, %method, %path, status, error = %e, "request failed");
                WireResponse::error(status, &e)
            }
        }
    }

    /// Runs one request through the actor.
    pub async fn dispatch(&self, request: WireRequest) -> Result<WireResponse> {
        if request.method.is_empty() || request.method.eq_ignore_ascii_case("CONNECT") {
            return Err(Error::UnsupportedVerb(request.method));
        }
        let wants_msgpack = request
            .headers
            .get("accept")
            .is_some_and(reencode::is_msgpack);

        let message = Message::handle_request(&request)?;
        let reply = tokio::time::timeout(self.timeout, self.transport.send(message))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let mut response = envelope::decode_response(&reply)?;
        if !wants_msgpack {
            json_body(&mut response);
        }
        Ok(response)
    }
}

/// Replaces a msgpack map body with its JSON text when that conversion works.
/// Bodies already labelled as something other than msgpack are left alone.
fn json_body(response: &mut WireResponse) {
    let eligible = response
        .headers
        .content_type()
        .is_none_or(reencode::is_msgpack);
    if !eligible {
        return;
    }
    if let Some(json) = reencode::msgpack_to_json(&response.body) {
        response.body = json;
        response.headers.insert("content-type", reencode::JSON);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transport;
    use crate::transport::FnTransport;

    fn bridge_with(
        handler: impl Fn(Message) -> transport::Result<Vec<u8>> + Send + Sync + 'static,
    ) -> RequestBridge {
        RequestBridge::new("actor-1", Arc::new(FnTransport::new(handler)))
    }

    fn reply(response: WireResponse) -> transport::Result<Vec<u8>> {
        Ok(envelope::encode_response(&response).unwrap())
    }

    #[tokio::test]
    async fn test_connect_is_rejected_before_the_actor() {
        let bridge = bridge_with(|_| panic!("actor must not be called"));
        let response = bridge.handle(WireRequest::new("CONNECT", "/")).await;
        assert_eq!(response.status_code, 405);
    }

    #[tokio::test]
    async fn test_labelled_bodies_pass_through() {
        let body = rmp_serde::to_vec_named(&json!({"a": 1})).unwrap();
        let sent = body.clone();
        let bridge = bridge_with(move |_| {
            reply(
                WireResponse::new(200)
                    .with_header("content-type", "application/octet-stream")
                    .with_body(sent.clone()),
            )
        });
        let response = bridge.handle(WireRequest::new("GET", "/")).await;
        assert_eq!(response.body, body);
    }

    #[tokio::test]
    async fn test_msgpack_kept_when_caller_asks_for_it() {
        let body = rmp_serde::to_vec_named(&json!({"a": 1})).unwrap();
        let sent = body.clone();
        let bridge = bridge_with(move |_| reply(WireResponse::new(200).with_body(sent.clone())));
        let request = WireRequest::new("GET", "/").with_header("Accept", "application/msgpack");
        let response = bridge.handle(request).await;
        assert_eq!(response.body, body);
        assert!(response.headers.content_type().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_reply_is_502() {
        let bridge = bridge_with(|_| Ok(vec![0xc1]));
        let response = bridge.handle(WireRequest::new("GET", "/")).await;
        assert_eq!(response.status_code, 502);
        assert!(String::from_utf8_lossy(&response.body).contains("decode"));
    }

    #[tokio::test]
    async fn test_slow_actor_times_out() {
        struct Stalled;

        #[async_trait::async_trait]
        impl ActorTransport for Stalled {
            async fn send(&self, _: Message) -> transport::Result<Vec<u8>> {
                std::future::pending().await
            }
        }

        let bridge = RequestBridge::new("actor-1", Arc::new(Stalled))
            .with_timeout(Duration::from_millis(20));
        let err = bridge.dispatch(WireRequest::new("GET", "/")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(err.status_code(), 502);
    }
}
