//! SPDZ multiplication of shared tensors with dealer-supplied Beaver triples.

mod division;

pub use division::public_divide;

use crate::{
    encoding::RingTensor,
    error::{MpcError, MpcResult, ProtocolError},
    ops::Op,
    provider::{PrimitiveParams, PrimitiveTag},
    tensor::MpcTensor,
    transport::{PartyRequest, PartyResponse},
};

/// Multiply two shared tensors with `op`, consuming exactly one Beaver triple.
///
/// Every party masks its shares as `x_i - a_i` and `y_i - b_i`. The orchestrator opens
/// `eps = x - a` and `delta = y - b`, and every party computes
/// `z_i = c_i + op(eps, b_i) + op(a_i, delta)`, with rank 0 also adding `op(eps, delta)`.
/// In a two-party session each party truncates its product share locally.
pub async fn mul_master(x: &MpcTensor, y: &MpcTensor, op: Op) -> MpcResult<MpcTensor> {
    let session = x.session();
    if session.id() != y.session().id() {
        return Err(ProtocolError::SessionMismatch {
            lhs: session.id(),
            rhs: y.session().id(),
        }
        .into());
    }
    let tag = PrimitiveTag::beaver(&op)
        .ok_or_else(|| MpcError::Argument(format!("`{op}` is not a multiplicative operation")))?;
    let x_shape = x.shape_for(op.name())?.to_vec();
    let y_shape = y.shape_for(op.name())?.to_vec();
    let shape = session.infer_shape(&op, Some(x_shape.as_slice()), Some(y_shape.as_slice()))?;

    let out = session.next_object_id();
    session
        .deal(
            tag,
            PrimitiveParams::Beaver {
                op,
                a_shape: x_shape,
                b_shape: y_shape,
                slot: out,
            },
        )
        .await?;

    let masked = session
        .transport()
        .call_all(
            x.ids()
                .zip(y.ids())
                .map(|(x, y)| PartyRequest::SpdzMask { op, x, y, out })
                .collect(),
        )
        .await?;
    let [eps, delta] = open(masked)?;
    tracing::debug!(session = %session.id(), %op, ?shape, "opened beaver masks");

    let truncate = (session.nr_parties() == 2).then(|| session.encoder().scale());
    session
        .transport()
        .call_all(
            (0..session.nr_parties())
                .map(|_| PartyRequest::SpdzFinish {
                    op,
                    eps: eps.clone(),
                    delta: delta.clone(),
                    truncate,
                    out,
                })
                .collect(),
        )
        .await?;
    Ok(MpcTensor::placed(session, out, Some(shape)))
}

/// Sum masked values sent by all parties. Each party must send exactly `N` tensors.
pub(crate) fn open<const N: usize>(responses: Vec<PartyResponse>) -> MpcResult<[RingTensor; N]> {
    let mut sums: Option<[RingTensor; N]> = None;
    for (party, response) in responses.into_iter().enumerate() {
        let masked: [RingTensor; N] = match response {
            PartyResponse::Masked(masked) => masked
                .try_into()
                .map_err(|_| PartyResponse::unexpected(party))?,
            _ => return Err(PartyResponse::unexpected(party).into()),
        };
        sums = Some(match sums {
            None => masked,
            Some(mut sums) => {
                for (sum, part) in sums.iter_mut().zip(&masked) {
                    *sum += part;
                }
                sums
            }
        });
    }
    sums.ok_or_else(|| MpcError::Argument("nothing to open".into()))
}

#[cfg(test)]
mod tests {
    use std::num::Wrapping;

    use ndarray::array;

    use super::*;
    use crate::transport::TransportError;

    #[test]
    fn test_open_sums_in_rank_order() {
        let responses = vec![
            PartyResponse::Masked(vec![array![Wrapping(1u64), Wrapping(2)].into_dyn()]),
            PartyResponse::Masked(vec![array![Wrapping(u64::MAX), Wrapping(3)].into_dyn()]),
        ];
        let [opened] = open(responses).unwrap();
        assert_eq!(opened, array![Wrapping(0u64), Wrapping(5)].into_dyn());
    }

    #[test]
    fn test_open_rejects_wrong_count() {
        let responses = vec![
            PartyResponse::Masked(vec![]),
            PartyResponse::Done,
        ];
        assert!(matches!(
            open::<1>(responses),
            Err(MpcError::Transport(TransportError::Recv(0)))
        ));
    }
}
