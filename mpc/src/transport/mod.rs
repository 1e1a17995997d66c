//! Request/response protocol between the orchestrator and the parties.

mod local;

pub use local::LocalTransport;

use async_trait::async_trait;
use futures::{stream, Future, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_serde::formats::Bincode;
use tokio_util::codec::LengthDelimitedCodec;
use uuid::Uuid;

use crate::{
    config::SessionConfig,
    encoding::RingTensor,
    error::{MpcResult, PartyError},
    ops::Op,
    party::{ObjectId, PartyObject},
    provider::{Primitive, PrimitiveParams, PrimitiveTag},
    tensor::ForwardedCall,
};

/// Maximum number of parties contacted concurrently by a single fan-out.
pub const FAN_OUT_LIMIT: usize = 16;

/// Error type for party links.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("error while sending message to party {0}")]
    Send(usize),
    #[error("error while receiving message from party {0}")]
    Recv(usize),
    #[error("no link to party {0}")]
    UnknownParty(usize),
}

/// Instruction executed by a single party.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PartyRequest {
    /// Session handshake.
    Setup {
        session: Uuid,
        rank: usize,
        nr_parties: usize,
        config: SessionConfig,
    },
    /// Build PRZS generators from the seeds in the primitive store.
    InitPrzs,
    Store { id: ObjectId, object: PartyObject },
    /// Make object fetchable.
    Request { id: ObjectId },
    Fetch { id: ObjectId },
    /// Share-wise add or sub of two shares.
    Linear {
        op: Op,
        lhs: ObjectId,
        rhs: ObjectId,
        out: ObjectId,
    },
    /// Operation with a public encoded value. Only rank 0 absorbs additive constants.
    Public {
        op: Op,
        share: ObjectId,
        value: RingTensor,
        /// Public value is the left operand.
        reversed: bool,
        out: ObjectId,
    },
    /// Local truncation of a two-party sharing.
    Truncate {
        id: ObjectId,
        divisor: u64,
        out: ObjectId,
    },
    /// Draw a share of zero from the PRZS generators.
    Przs { shape: Vec<usize>, out: ObjectId },
    /// Add a secret stored at this party to a share.
    AddSecret {
        share: ObjectId,
        secret: ObjectId,
        out: ObjectId,
    },
    /// Mask both operands with the Beaver triple reserved for `out`.
    /// Answered with `[x - a, y - b]`.
    SpdzMask {
        op: Op,
        x: ObjectId,
        y: ObjectId,
        out: ObjectId,
    },
    /// Consume the triple reserved for `out` and combine it with the opened values.
    SpdzFinish {
        op: Op,
        eps: RingTensor,
        delta: RingTensor,
        truncate: Option<u64>,
        out: ObjectId,
    },
    /// Mask a share with the truncation pair reserved for `out`. Answered with `[x - r]`.
    TruncationMask {
        id: ObjectId,
        divisor: u64,
        out: ObjectId,
    },
    /// Consume the truncation pair reserved for `out` and combine it with the opened value.
    TruncationFinish {
        opened: RingTensor,
        divisor: u64,
        out: ObjectId,
    },
    Populate {
        tag: PrimitiveTag,
        key: PrimitiveParams,
        primitive: Primitive,
    },
    PrimitiveCount { tag: PrimitiveTag },
    /// Forwarded share method. Calls producing a share store it under `out`.
    Forward {
        call: ForwardedCall,
        id: ObjectId,
        out: Option<ObjectId>,
    },
}

impl PartyRequest {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            PartyRequest::Setup { .. } => "setup",
            PartyRequest::InitPrzs => "init_przs",
            PartyRequest::Store { .. } => "store",
            PartyRequest::Request { .. } => "request",
            PartyRequest::Fetch { .. } => "fetch",
            PartyRequest::Linear { .. } => "linear",
            PartyRequest::Public { .. } => "public",
            PartyRequest::Truncate { .. } => "truncate",
            PartyRequest::Przs { .. } => "przs",
            PartyRequest::AddSecret { .. } => "add_secret",
            PartyRequest::SpdzMask { .. } => "spdz_mask",
            PartyRequest::SpdzFinish { .. } => "spdz_finish",
            PartyRequest::TruncationMask { .. } => "truncation_mask",
            PartyRequest::TruncationFinish { .. } => "truncation_finish",
            PartyRequest::Populate { .. } => "populate",
            PartyRequest::PrimitiveCount { .. } => "primitive_count",
            PartyRequest::Forward { .. } => "forward",
        }
    }
}

/// Answer of a party to a [`PartyRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PartyResponse {
    Done,
    Object(PartyObject),
    Masked(Vec<RingTensor>),
    Count(usize),
    Error(PartyError),
}

impl PartyResponse {
    /// Unexpected response kind, reported as a receive failure.
    pub(crate) fn unexpected(party: usize) -> TransportError {
        TransportError::Recv(party)
    }
}

/// Connection of the orchestrator to all parties of a session.
#[async_trait]
pub trait Transport: Send + Sync {
    fn num_parties(&self) -> usize;

    /// Send request to one party and wait for its answer.
    /// Party-side errors are returned as [`MpcError`](crate::MpcError).
    ///
    /// Must be cancel-safe: dropping the returned future must not affect the answers
    /// of later calls to the same party.
    async fn call(&self, party: usize, request: PartyRequest) -> MpcResult<PartyResponse>;

    /// Send the i-th request to the i-th party. Answers are returned in rank order.
    async fn call_all(&self, requests: Vec<PartyRequest>) -> MpcResult<Vec<PartyResponse>> {
        fan_out(
            requests
                .into_iter()
                .enumerate()
                .map(|(party, request)| self.call(party, request)),
        )
        .await
    }
}

/// Run calls concurrently within [`FAN_OUT_LIMIT`] and collect results in input order.
/// The first failure aborts the whole fan-out.
pub async fn fan_out<I, F, T>(calls: I) -> MpcResult<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = MpcResult<T>>,
{
    stream::iter(calls)
        .buffered(FAN_OUT_LIMIT)
        .try_collect()
        .await
}

/// Length-framed Bincode-encoded messages channel reading `In` and writing `Out`.
pub type BincodeStreamSink<In, Out, C> = tokio_serde::Framed<
    tokio_util::codec::Framed<C, LengthDelimitedCodec>,
    In,
    Out,
    Bincode<In, Out>,
>;

/// Orchestrator end of a party link.
pub type OrchestratorLink = BincodeStreamSink<PartyResponse, PartyRequest, DuplexStream>;

/// Party end of a party link.
pub type PartyLink = BincodeStreamSink<PartyRequest, PartyResponse, DuplexStream>;

/// Create length-framed Bincode-encoded message channel from AsyncRead/Write.
pub fn wrap_channel_with_bincode<In, Out, C>(channel: C) -> BincodeStreamSink<In, Out, C>
where
    C: AsyncRead + AsyncWrite,
{
    let length_delimited = tokio_util::codec::Framed::new(channel, LengthDelimitedCodec::new());
    tokio_serde::Framed::new(length_delimited, Bincode::default())
}

/// Create in-process link between the orchestrator and one party.
pub fn bincode_link(max_buf_size: usize) -> (OrchestratorLink, PartyLink) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (wrap_channel_with_bincode(a), wrap_channel_with_bincode(b))
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};

    use super::*;

    #[tokio::test]
    async fn test_bincode_link() {
        let (mut orchestrator, mut party) = bincode_link(1024);
        orchestrator
            .send(PartyRequest::Request { id: 7 })
            .await
            .unwrap();
        match party.next().await {
            Some(Ok(PartyRequest::Request { id })) => assert_eq!(id, 7),
            other => panic!("unexpected message {other:?}"),
        }
        party.send(PartyResponse::Count(3)).await.unwrap();
        assert!(matches!(
            orchestrator.next().await,
            Some(Ok(PartyResponse::Count(3)))
        ));
    }

    #[tokio::test]
    async fn test_fan_out_keeps_order() {
        let results = fan_out((0..40u64).map(|i| async move {
            tokio::time::sleep(std::time::Duration::from_millis(40 - i)).await;
            Ok(i)
        }))
        .await
        .unwrap();
        assert_eq!(results, (0..40).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_fan_out_fails_fast() {
        let result: MpcResult<Vec<u64>> = fan_out((0..4u64).map(|i| async move {
            if i == 2 {
                Err(TransportError::Send(2).into())
            } else {
                Ok(i)
            }
        }))
        .await;
        assert!(matches!(
            result,
            Err(crate::MpcError::Transport(TransportError::Send(2)))
        ));
    }
}
