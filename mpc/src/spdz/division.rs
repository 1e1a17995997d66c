use super::open;
use crate::{
    error::{MpcResult, ProtocolError},
    provider::{PrimitiveParams, PrimitiveTag},
    tensor::MpcTensor,
    transport::PartyRequest,
};

/// Divide shared tensor by a public positive integer.
///
/// Two parties truncate their shares locally. With more parties, local truncation
/// does not commute with the sum, so a dealer pair `(r, floor(r / divisor))` is used:
/// the parties open `c = x - r` and rank 0 adds `floor(c / divisor)` to its share of
/// `floor(r / divisor)`. Either way the result may be off by one unit in the last place.
pub async fn public_divide(x: &MpcTensor, divisor: u64) -> MpcResult<MpcTensor> {
    if divisor == 0 {
        return Err(ProtocolError::DivisionByZero.into());
    }
    let session = x.session();
    let transport = session.transport();
    let out = session.next_object_id();

    if session.nr_parties() == 2 {
        transport
            .call_all(
                x.ids()
                    .map(|id| PartyRequest::Truncate { id, divisor, out })
                    .collect(),
            )
            .await?;
        return Ok(MpcTensor::placed(session, out, x.shape().map(<[usize]>::to_vec)));
    }

    let shape = x.shape_for("div")?.to_vec();
    session
        .deal(
            PrimitiveTag::Truncation,
            PrimitiveParams::Truncation {
                shape: shape.clone(),
                divisor,
                slot: out,
            },
        )
        .await?;
    let masked = transport
        .call_all(
            x.ids()
                .map(|id| PartyRequest::TruncationMask { id, divisor, out })
                .collect(),
        )
        .await?;
    let [opened] = open(masked)?;
    tracing::debug!(session = %session.id(), divisor, ?shape, "opened truncation mask");

    transport
        .call_all(
            (0..session.nr_parties())
                .map(|_| PartyRequest::TruncationFinish {
                    opened: opened.clone(),
                    divisor,
                    out,
                })
                .collect(),
        )
        .await?;
    Ok(MpcTensor::placed(session, out, Some(shape)))
}
