//! # Actor Envelope
//!
//! The message an actor receives over its RPC transport: an operation name and
//! an opaque argument. For HTTP-shaped traffic the argument is a msgpack
//! encoded [`WireRequest`] and the reply a msgpack encoded [`WireResponse`].
//!
//! Structs are written as named maps so any msgpack reader sees field names.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::error::Result;
use crate::wire::WireRequest;
use crate::wire::WireResponse;

/// Operation an actor implements to serve HTTP-shaped requests.
pub const HANDLE_REQUEST: &str = "HttpServer.HandleRequest";

/// A single RPC message for an actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub method: String,
    pub arg: Vec<u8>,
}

impl Message {
    pub fn new(method: impl Into<String>, arg: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            arg,
        }
    }

    /// Wraps a request for the actor's `HandleRequest` operation.
    pub fn handle_request(request: &WireRequest) -> Result<Self> {
        Ok(Self::new(HANDLE_REQUEST, encode_request(request)?))
    }
}

/// True if `operation` names the request handler, with or without the
/// interface prefix (`HttpServer.HandleRequest` or `HandleRequest`).
pub fn is_handle_request(operation: &str) -> bool {
    operation.rsplit('.').next() == Some("HandleRequest")
}

pub fn encode_request(request: &WireRequest) -> Result<Vec<u8>> {
    encode("request", request)
}

pub fn decode_request(bytes: &[u8]) -> Result<WireRequest> {
    decode("request", bytes)
}

pub fn encode_response(response: &WireResponse) -> Result<Vec<u8>> {
    encode("response", response)
}

pub fn decode_response(bytes: &[u8]) -> Result<WireResponse> {
    decode("response", bytes)
}

pub(crate) fn encode<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|source| Error::Encode { what, source })
}

pub(crate) fn decode<T: DeserializeOwned>(what: &'static str, bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|source| Error::Decode { what, source })
}
