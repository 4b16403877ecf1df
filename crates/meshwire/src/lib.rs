//! # meshwire
//!
//! The protocol-neutral wire model shared by every part of the gateway.
//!
//! ## Architecture
//!
//! Inbound traffic (plain HTTP or a service-invocation frame) is lowered into a
//! [`WireRequest`]; actors answer with a [`WireResponse`]. Neither shape carries
//! transport types. Two encodings sit on top of that model:
//!
//! - **Actor envelope** ([`envelope`]): the msgpack `Message { method, arg }` an
//!   actor receives over its RPC transport.
//! - **Invocation frames** ([`invoke`]): what one gateway sends another when a
//!   call crosses the mesh.

pub mod envelope;
pub mod error;
pub mod headers;
pub mod invoke;
pub mod reencode;
pub mod wire;

pub use envelope::Message;
pub use error::Error;
pub use error::Result;
pub use headers::Headers;
pub use invoke::InvokeRequest;
pub use invoke::InvokeResponse;
pub use invoke::Verb;
pub use wire::WireRequest;
pub use wire::WireResponse;
