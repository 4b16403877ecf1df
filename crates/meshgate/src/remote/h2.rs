//! HTTP/2 (prior knowledge) transport for invocation frames.
//!
//! One handshake per address; requests multiplex over it. The connection is
//! driven by a spawned task that `close()` aborts, after which every call on
//! the handle fails as unavailable.
//!
//! The dialer speaks plaintext. Deployments that need mTLS supply their own
//! [`Dialer`] built from the configured certificate material.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http::header;
use http_body_util::BodyExt;
use http_body_util::Full;
use http_body_util::LengthLimitError;
use http_body_util::Limited;
use hyper::client::conn::http2;
use hyper::client::conn::http2::SendRequest;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::Span;

use meshwire::InvokeRequest;
use meshwire::InvokeResponse;
use meshwire::invoke::CALL_LOCAL_PATH;
use meshwire::invoke::FRAME_CONTENT_TYPE;
use meshwire::invoke::MAX_MESSAGE_BYTES;

use super::Dialer;
use super::Error;
use super::RemoteConnection;
use super::Result;
use crate::pool::Connection;

pub struct H2Dialer {
    connect_timeout: Duration,
    call_timeout: Duration,
    max_message_bytes: usize,
    span: Span,
}

impl Default for H2Dialer {
    fn default() -> Self {
        Self::new()
    }
}

impl H2Dialer {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            max_message_bytes: MAX_MESSAGE_BYTES,
            span: tracing::info_span!("h2_dialer"),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

#[async_trait::async_trait]
impl Dialer for H2Dialer {
    type Connection = H2Connection;

    async fn dial(&self, address: &str) -> Result<H2Connection> {
        let connect = async {
            let stream = TcpStream::connect(address)
                .await
                .map_err(|e| Error::Unavailable(format!("connect to {address}: {e}")))?;
            let _ = stream.set_nodelay(true);
            http2::handshake::<_, _, Full<Bytes>>(TokioExecutor::new(), TokioIo::new(stream))
                .await
                .map_err(|e| Error::Unavailable(format!("handshake with {address}: {e}")))
        };
        let (sender, conn) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| Error::Timeout(self.connect_timeout))??;

        let span = self.span.clone();
        let peer = address.to_string();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(parent: &span, address = %peer, error = %e, "connection driver stopped");
            }
        });

        Ok(H2Connection {
            address: address.to_string(),
            sender,
            driver,
            closed: AtomicBool::new(false),
            call_timeout: self.call_timeout,
            max_message_bytes: self.max_message_bytes,
        })
    }
}

pub struct H2Connection {
    address: String,
    sender: SendRequest<Full<Bytes>>,
    driver: JoinHandle<()>,
    closed: AtomicBool,
    call_timeout: Duration,
    max_message_bytes: usize,
}

impl H2Connection {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    async fn call(&self, payload: Vec<u8>) -> Result<InvokeResponse> {
        let request = http::Request::post(format!("http://{}{}", self.address, CALL_LOCAL_PATH))
            .header(header::CONTENT_TYPE, FRAME_CONTENT_TYPE)
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| Error::Other(e.to_string()))?;

        let mut sender = self.sender.clone();
        sender.ready().await.map_err(classify)?;
        let response = sender.send_request(request).await.map_err(classify)?;

        let status = response.status();
        let limit = self.max_message_bytes;
        let body = Limited::new(response.into_body(), limit)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    Error::TooLarge { limit }
                } else {
                    Error::Unavailable(format!("reading response: {e}"))
                }
            })?
            .to_bytes();

        match status {
            StatusCode::OK => {
                InvokeResponse::decode(&body).map_err(|e| Error::Other(e.to_string()))
            }
            StatusCode::SERVICE_UNAVAILABLE => Err(Error::Unavailable(text(&body))),
            StatusCode::UNAUTHORIZED => Err(Error::Unauthenticated(text(&body))),
            other => Err(Error::Other(format!("{other}: {}", text(&body)))),
        }
    }
}

#[async_trait::async_trait]
impl RemoteConnection for H2Connection {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse> {
        if self.is_closed() {
            return Err(Error::Unavailable(format!("connection to {} is closed", self.address)));
        }
        let payload = request.encode().map_err(|e| Error::Other(e.to_string()))?;
        if payload.len() > self.max_message_bytes {
            return Err(Error::TooLarge {
                limit: self.max_message_bytes,
            });
        }
        tokio::time::timeout(self.call_timeout, self.call(payload))
            .await
            .map_err(|_| Error::Timeout(self.call_timeout))?
    }
}

impl Connection for H2Connection {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.driver.abort();
    }
}

impl Drop for H2Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn classify(e: hyper::Error) -> Error {
    if e.is_closed() || e.is_canceled() {
        Error::Unavailable(e.to_string())
    } else {
        Error::Other(e.to_string())
    }
}

fn text(body: &[u8]) -> String {
    String::from_utf8_lossy(body).trim().to_string()
}
