use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{provider::PrimitiveTag, transport::TransportError};

/// Result type used throughout the crate.
pub type MpcResult<T> = Result<T, MpcError>;

/// Any failure of an operation on secret-shared values.
/// None of these are retried internally: a consumed primitive must never be reused.
#[derive(Debug, Error)]
pub enum MpcError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("party {party} rejected request: {source}")]
    Party {
        party: usize,
        #[source]
        source: PartyError,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MpcError {
    /// Wrap an error reported by a party, lifting protocol-level failures to [`ProtocolError`].
    pub fn from_party(party: usize, source: PartyError) -> Self {
        match source {
            PartyError::PrimitiveExhausted { tag, key } => {
                ProtocolError::PrimitiveExhausted { tag, key }.into()
            }
            PartyError::SetupIncomplete => ConfigError::SetupIncomplete.into(),
            PartyError::InvalidSecret(reason) => MpcError::Argument(reason),
            source => MpcError::Party { party, source },
        }
    }
}

/// Missing or invalid session configuration.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("session setup handshake has not completed")]
    SetupIncomplete,

    #[error("no primitive generator registered for `{0}`")]
    UnregisteredOperation(PrimitiveTag),

    #[error("session has no comparison protocol")]
    MissingComparisonProtocol,

    #[error("{0}")]
    Invalid(String),
}

/// Unset or incompatible tensor shapes.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("shape of an operand is unset for `{op}`")]
    Unset { op: String },

    #[error("incompatible shapes for `{op}`: {lhs:?} and {rhs:?}")]
    Incompatible {
        op: String,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    #[error("{primitives} primitives generated for {sessions} parties")]
    CountMismatch { primitives: usize, sessions: usize },

    #[error("`{op}` does not support shape {shape:?}")]
    Unsupported { op: String, shape: Vec<usize> },
}

/// Misuse of the sharing protocols.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("operands belong to different sessions ({lhs} and {rhs})")]
    SessionMismatch { lhs: Uuid, rhs: Uuid },

    #[error("primitive store exhausted for `{tag}` with key {key}")]
    PrimitiveExhausted { tag: PrimitiveTag, key: String },

    #[error("division by a private value is not implemented")]
    PrivateDivision,

    #[error("negative exponent {0} is not allowed")]
    NegativeExponent(i64),

    #[error("division by zero")]
    DivisionByZero,
}

/// Error returned by a party over the wire.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartyError {
    #[error("no object with id {0}")]
    UnknownObject(u64),

    #[error("object {0} was fetched without being requested first")]
    NotRequested(u64),

    #[error("object {id} is not a {expected}")]
    WrongObjectKind { id: u64, expected: String },

    #[error("primitive store exhausted for `{tag}` with key {key}")]
    PrimitiveExhausted { tag: PrimitiveTag, key: String },

    #[error("primitive stored for `{0}` has the wrong kind")]
    WrongPrimitiveKind(PrimitiveTag),

    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("{0}")]
    Shape(String),

    #[error("party has not been set up")]
    SetupIncomplete,

    #[error("party has no PRZS generators")]
    MissingPrzsGenerators,
}

impl From<ShapeError> for PartyError {
    fn from(err: ShapeError) -> Self {
        PartyError::Shape(err.to_string())
    }
}
