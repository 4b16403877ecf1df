//! # Wire Envelopes
//!
//! The canonical intermediate form every translator produces and consumes.
//! Field names on the wire follow the actor interface (`queryString`,
//! `statusCode`, `header`), so an actor sees the same shape whichever
//! listener the request arrived on.

use serde::Deserialize;
use serde::Serialize;

use crate::headers::Headers;

/// A protocol-neutral request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query_string: String,
    #[serde(default, rename = "header")]
    pub headers: Headers,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl WireRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query_string: impl Into<String>) -> Self {
        self.query_string = query_string.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// A protocol-neutral response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    pub status_code: u16,
    #[serde(default, rename = "header")]
    pub headers: Headers,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// A plain-text failure response carrying the error message as body.
    pub fn error(status_code: u16, message: impl std::fmt::Display) -> Self {
        Self::new(status_code)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(message.to_string())
    }
}
