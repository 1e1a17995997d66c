//! Tensor arithmetic over additive secret sharing.
//!
//! An orchestrator holds [`MpcTensor`]s, which are handles to shares stored at the
//! parties of a [`Session`]. Linear operations are evaluated locally by every party,
//! products use SPDZ with Beaver triples generated by a [`PrimitiveProvider`].

pub mod comparison;
pub mod config;
pub mod encoding;
pub mod error;
pub mod handle;
pub mod ops;
pub mod party;
pub mod plaintext;
pub mod provider;
pub mod session;
pub mod share;
pub mod sharing;
pub mod spdz;
pub mod store;
pub mod tensor;
pub mod transport;

#[cfg(test)]
mod testing;

pub use comparison::ComparisonProtocol;
pub use config::SessionConfig;
pub use encoding::{FixedPointEncoder, Ring, RingElement, RingTensor};
pub use error::{MpcError, MpcResult};
pub use handle::{SecretHandle, ShareHandle};
pub use ops::{Conv2dParams, Op};
pub use plaintext::PlaintextComparison;
pub use provider::{PrimitiveProvider, PrimitiveRegistry, PrimitiveTag};
pub use session::Session;
pub use share::Share;
pub use sharing::Secret;
pub use tensor::{MpcTensor, Operand, PublicValue};
pub use transport::{LocalTransport, Transport};
