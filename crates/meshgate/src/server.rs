//! # Listeners
//!
//! One TCP listener per link, serving either plain HTTP or invocation frames
//! from other gateways. Both speak HTTP/1.1 and HTTP/2 with prior knowledge.
//!
//! ## Lifecycle
//! - [`Listener::bind`] binds the socket and starts the accept loop; the
//!   bound address is known as soon as it returns.
//! - [`Listener::shutdown`] stops accepting, asks every open connection to
//!   finish its in-flight requests, and force-closes whatever is still open
//!   once the grace period ends. The socket is released before the drain.
//! - Dropping a `Listener` cancels it without waiting.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use bytes::Bytes;
use http::HeaderName;
use http::HeaderValue;
use http::StatusCode;
use http::header;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use meshwire::Headers;
use meshwire::InvokeRequest;
use meshwire::InvokeResponse;
use meshwire::WireRequest;
use meshwire::WireResponse;
use meshwire::invoke::CALL_LOCAL_PATH;
use meshwire::invoke::FRAME_CONTENT_TYPE;
use meshwire::invoke::MAX_MESSAGE_BYTES;

use crate::bridge::RequestBridge;

/// Answered with 204 on every listener, without involving the actor.
pub const HEALTHZ_PATH: &str = "/v1.0/healthz";

const MAX_HEADER_LIST_BYTES: u32 = 64 << 10;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown listener protocol {0:?} (expected \"http\" or \"invoke\")")]
    UnknownProtocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a listener speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protocol {
    /// Plain HTTP; every path goes to the actor.
    Http,
    /// Invocation frames at [`CALL_LOCAL_PATH`].
    #[default]
    Invoke,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "invoke" | "grpc" => Ok(Self::Invoke),
            _ => Err(Error::UnknownProtocol(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Ceiling for request bodies and response frames.
    pub max_message_bytes: usize,
    /// How long in-flight requests get after shutdown begins.
    pub grace: Duration,
    pub span: Span,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            max_message_bytes: MAX_MESSAGE_BYTES,
            grace: Duration::from_secs(5),
            span: tracing::info_span!("listener"),
        }
    }
}

#[derive(Clone)]
struct ListenerState {
    bridge: Arc<RequestBridge>,
    max_message_bytes: usize,
    span: Span,
}

/// A running listener.
pub struct Listener {
    local_addr: SocketAddr,
    protocol: Protocol,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    pub async fn bind(
        address: &str,
        protocol: Protocol,
        bridge: Arc<RequestBridge>,
        settings: ListenerSettings,
    ) -> Result<Self> {
        let bind_err = |source| Error::Bind {
            address: address.to_string(),
            source,
        };
        let listener = TcpListener::bind(address).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let state = ListenerState {
            bridge,
            max_message_bytes: settings.max_message_bytes,
            span: settings.span.clone(),
        };
        let router = match protocol {
            Protocol::Http => http_router(state),
            Protocol::Invoke => invoke_router(state),
        };

        let cancel = CancellationToken::new();
        tracing::info!(parent: &settings.span, %local_addr, ?protocol, "listening");
        let task = tokio::spawn(accept_loop(
            listener,
            router,
            cancel.clone(),
            settings.grace,
            settings.span,
        ));

        Ok(Self {
            local_addr,
            protocol,
            cancel,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Stops the listener and waits for its connections to drain.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
    grace: Duration,
    span: Span,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(parent: &span, %peer, "accepted");
                    connections.spawn(serve_connection(
                        stream,
                        router.clone(),
                        cancel.clone(),
                        span.clone(),
                    ));
                }
                Err(e) => tracing::warn!(parent: &span, error = %e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);

    let open = connections.len();
    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!(parent: &span, open, ?grace, "grace period elapsed, closing connections");
        connections.abort_all();
    }
    tracing::info!(parent: &span, "listener stopped");
}

async fn serve_connection(
    stream: TcpStream,
    router: Router,
    cancel: CancellationToken,
    span: Span,
) {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http2().max_header_list_size(MAX_HEADER_LIST_BYTES);
    let service = TowerToHyperService::new(router);
    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        tracing::debug!(parent: &span, error = %e, "connection ended with error");
    }
}

fn http_router(state: ListenerState) -> Router {
    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .fallback(forward_http)
        .with_state(state)
}

fn invoke_router(state: ListenerState) -> Router {
    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(CALL_LOCAL_PATH, post(call_local))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn forward_http(State(state): State<ListenerState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match read_body(body, state.max_message_bytes).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let mut headers = Headers::new();
    for (name, value) in parts.headers.iter() {
        match std::str::from_utf8(value.as_bytes()) {
            Ok(value) => headers.append(name.as_str(), value),
            Err(_) => {
                tracing::debug!(parent: &state.span, header = %name, "dropping non-UTF-8 header value")
            }
        }
    }
    let request = WireRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query_string: parts.uri.query().unwrap_or_default().to_string(),
        headers,
        body: body.to_vec(),
    };

    into_http_response(state.bridge.handle(request).await)
}

async fn call_local(State(state): State<ListenerState>, request: Request) -> Response {
    let body = match read_body(request.into_body(), state.max_message_bytes).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let frame = match InvokeRequest::decode(&body) {
        Ok(frame) => frame,
        Err(e) => return plain(StatusCode::BAD_REQUEST, e),
    };
    let request = match frame.into_wire() {
        Ok(request) => request,
        Err(e) => return plain(StatusCode::METHOD_NOT_ALLOWED, e),
    };

    let response = match state.bridge.dispatch(request).await {
        Ok(response) => response,
        Err(e) => {
            let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
            return plain(status, e);
        }
    };

    let frame = match InvokeResponse::from_wire(response).encode() {
        Ok(frame) => frame,
        Err(e) => return plain(StatusCode::BAD_GATEWAY, e),
    };
    if frame.len() > state.max_message_bytes {
        return plain(
            StatusCode::BAD_GATEWAY,
            format!(
                "response frame of {} bytes exceeds the {} byte limit",
                frame.len(),
                state.max_message_bytes
            ),
        );
    }
    ([(header::CONTENT_TYPE, FRAME_CONTENT_TYPE)], frame).into_response()
}

async fn read_body(body: Body, limit: usize) -> std::result::Result<Bytes, Response> {
    axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| plain(StatusCode::BAD_GATEWAY, format!("failed to read request body: {e}")))
}

/// Single-valued headers, first value wins. Framing headers are recomputed.
fn into_http_response(response: WireResponse) -> Response {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;

    for (name, values) in response.headers.iter() {
        if matches!(name, "content-length" | "transfer-encoding" | "connection") {
            continue;
        }
        let Some(first) = values.first() else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(first),
        ) {
            out.headers_mut().insert(name, value);
        }
    }
    out
}

fn plain(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, message.to_string()).into_response()
}
