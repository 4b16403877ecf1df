//! # Error Definitions
//!
//! Failures raised while moving the wire model in and out of bytes.

/// Codec and protocol failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The value could not be written as msgpack.
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: rmp_serde::encode::Error,
    },
    /// The bytes were not a valid encoding of the expected shape.
    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: rmp_serde::decode::Error,
    },
    /// The verb has no equivalent on the actor side (e.g. CONNECT).
    #[error("unsupported verb: {0:?}")]
    UnsupportedVerb(String),
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
