//! # Invocation Frames
//!
//! What one gateway sends another when a request crosses the mesh. The frame
//! carries the HTTP extension separately from the path (`method` is the path,
//! `verb` the HTTP verb), plus metadata, content type and the raw payload.
//!
//! ## Invariants
//! - Both directions are bounded by [`MAX_MESSAGE_BYTES`] unless configured otherwise.
//! - Lowering a frame into a [`WireRequest`] rejects verbs the actor side cannot
//!   represent (`NONE`, `CONNECT`).

use serde::Deserialize;
use serde::Serialize;

use crate::envelope::decode;
use crate::envelope::encode;
use crate::error::Error;
use crate::error::Result;
use crate::headers::Headers;
use crate::wire::WireRequest;
use crate::wire::WireResponse;

/// Route a service-invocation listener serves frames on.
pub const CALL_LOCAL_PATH: &str = "/internal.v1.ServiceInvocation/CallLocal";

/// Content type of an encoded frame.
pub const FRAME_CONTENT_TYPE: &str = "application/msgpack";

/// Default ceiling for a frame in either direction (4 MiB).
pub const MAX_MESSAGE_BYTES: usize = 4 << 20;

/// HTTP verb carried by an invocation frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    None,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Verb {
    /// Maps a method string onto a verb; anything unknown is `None`.
    pub fn from_method(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "CONNECT" => Self::Connect,
            "OPTIONS" => Self::Options,
            "TRACE" => Self::Trace,
            "PATCH" => Self::Patch,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
        }
    }

    /// Whether an actor can be handed a request with this verb.
    pub fn is_representable(&self) -> bool {
        !matches!(self, Self::None | Self::Connect)
    }
}

/// A request frame sent to a remote gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// The invoked path.
    pub method: String,
    pub verb: Verb,
    #[serde(default)]
    pub query_string: String,
    #[serde(default)]
    pub metadata: Headers,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl InvokeRequest {
    /// Builds a frame from a wire request. Empty header values are dropped.
    pub fn from_wire(request: &WireRequest) -> Self {
        let metadata = request.headers.without_empty_values();
        let content_type = metadata.content_type().unwrap_or_default().to_string();
        Self {
            method: request.path.clone(),
            verb: Verb::from_method(&request.method),
            query_string: request.query_string.clone(),
            metadata,
            content_type,
            data: request.body.clone(),
        }
    }

    /// Lowers the frame into a wire request for a local actor.
    ///
    /// Metadata becomes single-valued headers (first value wins) and the frame's
    /// content type, when present, overrides any metadata copy.
    pub fn into_wire(self) -> Result<WireRequest> {
        if !self.verb.is_representable() {
            return Err(Error::UnsupportedVerb(self.verb.as_str().to_string()));
        }

        let mut headers = Headers::new();
        for (name, values) in self.metadata.iter() {
            if let Some(first) = values.first() {
                headers.insert(name, first.as_str());
            }
        }
        if !self.content_type.is_empty() {
            headers.insert("content-type", self.content_type);
        }

        Ok(WireRequest {
            method: self.verb.as_str().to_string(),
            path: self.method,
            query_string: self.query_string,
            headers,
            body: self.data,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode("invoke request", self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode("invoke request", bytes)
    }
}

/// A response frame returned by a remote gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl InvokeResponse {
    pub fn from_wire(response: WireResponse) -> Self {
        let content_type = response.headers.content_type().unwrap_or_default().to_string();
        Self {
            status: response.status_code,
            headers: response.headers,
            content_type,
            data: response.body,
        }
    }

    pub fn into_wire(self) -> WireResponse {
        let mut headers = self.headers;
        if !self.content_type.is_empty() {
            headers.insert("content-type", self.content_type);
        }
        WireResponse {
            status_code: self.status,
            headers,
            body: self.data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode("invoke response", self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode("invoke response", bytes)
    }
}
