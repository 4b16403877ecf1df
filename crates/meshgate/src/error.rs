//! # Gateway Errors
//!
//! The request-level taxonomy. Every failure that reaches a caller, whether
//! an HTTP client or an actor, is one of these kinds and carries a status.

use std::time::Duration;

use crate::discovery;
use crate::pool;
use crate::remote;
use crate::transport;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Resolution failed (`NotFound`, `MetadataMissing`, `AddressUnavailable`, ...).
    #[error(transparent)]
    Discovery(#[from] discovery::Error),
    #[error(transparent)]
    DialFailure(#[from] pool::Error),
    #[error("remote unavailable: {0}")]
    TransportUnavailable(String),
    #[error("remote rejected credentials: {0}")]
    Unauthenticated(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    DecodeFailure(meshwire::Error),
    #[error("unsupported verb: {0:?}")]
    UnsupportedVerb(String),
    /// The named routing header was absent.
    #[error("missing target: no {0:?} header")]
    MissingTarget(&'static str),
    #[error("message exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
    #[error("actor transport: {0}")]
    Transport(transport::Error),
    #[error("remote call failed: {0}")]
    Remote(String),
    #[error("invalid operation: {0:?}")]
    InvalidOperation(String),
}

impl Error {
    /// The status a wire-facing listener answers with for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnsupportedVerb(_) => 405,
            Self::MissingTarget(_) => 400,
            _ => 502,
        }
    }
}

impl From<meshwire::Error> for Error {
    fn from(e: meshwire::Error) -> Self {
        match e {
            meshwire::Error::UnsupportedVerb(verb) => Self::UnsupportedVerb(verb),
            other => Self::DecodeFailure(other),
        }
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        match e {
            transport::Error::Timeout(after) => Self::Timeout(after),
            other => Self::Transport(other),
        }
    }
}

impl From<remote::Error> for Error {
    fn from(e: remote::Error) -> Self {
        match e {
            remote::Error::Unavailable(msg) => Self::TransportUnavailable(msg),
            remote::Error::Unauthenticated(msg) => Self::Unauthenticated(msg),
            remote::Error::Timeout(after) => Self::Timeout(after),
            remote::Error::TooLarge { limit } => Self::TooLarge { limit },
            remote::Error::Other(msg) => Self::Remote(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
