//! Orchestrator view of a secret-shared tensor.

mod forward;
mod operand;

pub use forward::{ForwardStrategy, Forwarded, ForwardedCall};
pub use operand::{Operand, PublicValue};

use std::{fmt, sync::Arc};

use ndarray::{ArrayD, IxDyn};
use rand::thread_rng;

use crate::{
    encoding::RingTensor,
    error::{MpcError, MpcResult, ProtocolError, ShapeError},
    handle::{SecretHandle, ShareHandle},
    ops::{Conv2dParams, Op},
    party::{ObjectId, PartyObject},
    session::Session,
    share::Share,
    sharing::{generate_shares, Secret},
    spdz::{mul_master, public_divide},
    transport::{fan_out, PartyRequest, PartyResponse},
};

/// Shares to build a tensor from.
pub enum Shares {
    /// Shares already stored at the parties, in rank order.
    Placed(Vec<ShareHandle>),
    /// Shares held by the orchestrator, sent to the parties in rank order.
    Local(Vec<Share>),
}

/// Result of a forwarded call.
#[derive(Clone, Debug)]
pub enum ForwardResult {
    Value(usize),
    Tensor(MpcTensor),
}

/// Secret-shared tensor. Holds one handle per party, never share values.
#[derive(Clone)]
pub struct MpcTensor {
    session: Arc<Session>,
    shares: Vec<ShareHandle>,
    shape: Option<Vec<usize>>,
}

impl MpcTensor {
    /// Split a secret known to the orchestrator and send one share to every party.
    pub async fn share(session: &Arc<Session>, secret: impl Into<Secret>) -> MpcResult<Self> {
        session.ensure_setup()?;
        let secret = secret.into();
        let shape = secret.shape();
        let shares = {
            let mut rng = thread_rng();
            generate_shares(&mut rng, secret, session.nr_parties(), session.encoder())?
        };
        Self::from_shares(session, Shares::Local(shares), Some(shape)).await
    }

    /// Share a secret held by one of the parties without revealing it to anyone.
    /// All parties draw PRZS shares of zero and the owner adds its secret to its share.
    pub async fn share_remote(
        session: &Arc<Session>,
        secret: &SecretHandle,
        shape: &[usize],
    ) -> MpcResult<Self> {
        session.ensure_setup()?;
        if secret.session() != session.id() {
            return Err(ProtocolError::SessionMismatch {
                lhs: session.id(),
                rhs: secret.session(),
            }
            .into());
        }
        let transport = session.transport();
        let zero = session.next_object_id();
        transport
            .call_all(
                (0..session.nr_parties())
                    .map(|_| PartyRequest::Przs {
                        shape: shape.to_vec(),
                        out: zero,
                    })
                    .collect(),
            )
            .await?;

        let owned = session.next_object_id();
        transport
            .call(
                secret.party(),
                PartyRequest::AddSecret {
                    share: zero,
                    secret: secret.id(),
                    out: owned,
                },
            )
            .await?;
        tracing::debug!(
            session = %session.id(),
            owner = secret.party(),
            ?shape,
            "shared remote secret"
        );

        let shares = (0..session.nr_parties())
            .map(|party| {
                let id = if party == secret.party() { owned } else { zero };
                session.handle(party, id)
            })
            .collect();
        Ok(Self {
            session: session.clone(),
            shares,
            shape: Some(shape.to_vec()),
        })
    }

    /// Wrap shares, distributing them first if they are held locally.
    pub async fn from_shares(
        session: &Arc<Session>,
        shares: Shares,
        shape: Option<Vec<usize>>,
    ) -> MpcResult<Self> {
        session.ensure_setup()?;
        let nr_parties = session.nr_parties();
        let count = match &shares {
            Shares::Placed(handles) => handles.len(),
            Shares::Local(shares) => shares.len(),
        };
        if count != nr_parties {
            return Err(MpcError::Argument(format!(
                "{count} shares given for {nr_parties} parties"
            )));
        }
        let shares = match shares {
            Shares::Placed(handles) => {
                if let Some((rank, handle)) = handles
                    .iter()
                    .enumerate()
                    .find(|(rank, handle)| handle.party() != *rank)
                {
                    return Err(MpcError::Argument(format!(
                        "share of party {} given at rank {rank}",
                        handle.party()
                    )));
                }
                handles
            }
            Shares::Local(shares) => {
                let id = session.next_object_id();
                session
                    .transport()
                    .call_all(
                        shares
                            .into_iter()
                            .map(|share| PartyRequest::Store {
                                id,
                                object: PartyObject::Share(share),
                            })
                            .collect(),
                    )
                    .await?;
                (0..nr_parties)
                    .map(|party| session.handle(party, id))
                    .collect()
            }
        };
        Ok(Self {
            session: session.clone(),
            shares,
            shape,
        })
    }

    /// Tensor whose shares are stored under the same id at every party.
    pub(crate) fn placed(session: &Arc<Session>, id: ObjectId, shape: Option<Vec<usize>>) -> Self {
        Self {
            session: session.clone(),
            shares: (0..session.nr_parties())
                .map(|party| session.handle(party, id))
                .collect(),
            shape,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn shares(&self) -> &[ShareHandle] {
        &self.shares
    }

    pub fn shape(&self) -> Option<&[usize]> {
        self.shape.as_deref()
    }

    pub(crate) fn shape_for(&self, op: &str) -> Result<&[usize], ShapeError> {
        self.shape().ok_or_else(|| ShapeError::Unset { op: op.to_string() })
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.shares.iter().map(ShareHandle::id)
    }

    fn check_session(&self, other: &MpcTensor) -> Result<(), ProtocolError> {
        if self.session.id() == other.session.id() {
            Ok(())
        } else {
            Err(ProtocolError::SessionMismatch {
                lhs: self.session.id(),
                rhs: other.session.id(),
            })
        }
    }

    pub async fn add<'a>(&self, other: impl Into<Operand<'a>>) -> MpcResult<MpcTensor> {
        self.apply_op(other.into(), Op::Add).await
    }

    pub async fn sub<'a>(&self, other: impl Into<Operand<'a>>) -> MpcResult<MpcTensor> {
        self.apply_op(other.into(), Op::Sub).await
    }

    /// `other - self`
    pub async fn rsub<'a>(&self, other: impl Into<Operand<'a>>) -> MpcResult<MpcTensor> {
        match other.into() {
            Operand::Private(other) => other.sub(self).await,
            Operand::Public(value) => {
                let shape = self.session.infer_shape(
                    &Op::Sub,
                    Some(value.shape().as_slice()),
                    self.shape(),
                )?;
                self.apply_public_op(&value, Op::Sub, true, shape).await
            }
        }
    }

    pub async fn mul<'a>(&self, other: impl Into<Operand<'a>>) -> MpcResult<MpcTensor> {
        self.apply_op(other.into(), Op::Mul).await
    }

    pub async fn matmul<'a>(&self, other: impl Into<Operand<'a>>) -> MpcResult<MpcTensor> {
        self.apply_op(other.into(), Op::Matmul).await
    }

    /// `other @ self` for a public `other`.
    pub async fn rmatmul(&self, other: impl Into<PublicValue>) -> MpcResult<MpcTensor> {
        let value = other.into();
        let shape = self
            .session
            .infer_shape(&Op::Matmul, Some(value.shape().as_slice()), self.shape())?;
        let result = self.apply_public_op(&value, Op::Matmul, true, shape).await?;
        public_divide(&result, self.session.encoder().scale()).await
    }

    /// 2D convolution with `weight`, followed by an optional public per-channel bias.
    pub async fn conv2d<'a>(
        &self,
        weight: impl Into<Operand<'a>>,
        bias: Option<ArrayD<f64>>,
        params: Conv2dParams,
    ) -> MpcResult<MpcTensor> {
        let convolution = self.apply_op(weight.into(), Op::Conv2d(params)).await?;
        match bias {
            Some(bias) => {
                let channels = bias.len();
                let bias = ArrayD::from_shape_vec(
                    IxDyn(&[channels, 1, 1]),
                    bias.iter().copied().collect(),
                )
                .map_err(|err| MpcError::Argument(format!("invalid conv2d bias: {err}")))?;
                convolution.add(bias).await
            }
            None => Ok(convolution),
        }
    }

    /// Division by a public value. Positive integers use [`public_divide`],
    /// anything else is multiplied by its reciprocal.
    pub async fn div<'a>(&self, other: impl Into<Operand<'a>>) -> MpcResult<MpcTensor> {
        match other.into() {
            Operand::Private(_) => Err(ProtocolError::PrivateDivision.into()),
            Operand::Public(PublicValue::Scalar(divisor)) => {
                if divisor == 0.0 {
                    return Err(ProtocolError::DivisionByZero.into());
                }
                if divisor.fract() == 0.0 && divisor.abs() < u64::MAX as f64 {
                    let result = public_divide(self, divisor.abs() as u64).await?;
                    if divisor < 0.0 {
                        return result.neg().await;
                    }
                    return Ok(result);
                }
                self.mul(1.0 / divisor).await
            }
            Operand::Public(PublicValue::Tensor(divisor)) => {
                if divisor.iter().any(|x| *x == 0.0) {
                    return Err(ProtocolError::DivisionByZero.into());
                }
                self.mul(divisor.mapv(|x| 1.0 / x)).await
            }
        }
    }

    /// Non-negative integer power by square-and-multiply.
    pub async fn pow(&self, exponent: i64) -> MpcResult<MpcTensor> {
        if exponent < 0 {
            return Err(ProtocolError::NegativeExponent(exponent).into());
        }
        let mut result: Option<MpcTensor> = None;
        let mut base = self.clone();
        let mut power = exponent;
        while power > 0 {
            if power % 2 == 1 {
                result = Some(match result {
                    None => base.clone(),
                    Some(acc) => acc.mul(&base).await?,
                });
            }
            power /= 2;
            if power > 0 {
                base = base.mul(&base).await?;
            }
        }
        match result {
            Some(result) => Ok(result),
            None => {
                let shape = self.shape_for("pow")?;
                MpcTensor::share(&self.session, ArrayD::<f64>::ones(IxDyn(shape))).await
            }
        }
    }

    pub async fn le<'a>(&self, other: impl Into<Operand<'a>>) -> MpcResult<MpcTensor> {
        let protocol = self.session.protocol()?.clone();
        let other = self.comparison_operand(other.into()).await?;
        protocol.le(self, &other).await
    }

    pub async fn ge<'a>(&self, other: impl Into<Operand<'a>>) -> MpcResult<MpcTensor> {
        let protocol = self.session.protocol()?.clone();
        let other = self.comparison_operand(other.into()).await?;
        protocol.le(&other, self).await
    }

    /// `self < other`, evaluated as `self + 1 unit <= other`.
    pub async fn lt<'a>(&self, other: impl Into<Operand<'a>>) -> MpcResult<MpcTensor> {
        let protocol = self.session.protocol()?.clone();
        let other = self.comparison_operand(other.into()).await?;
        let shifted = self.add(self.unit()).await?;
        protocol.le(&shifted, &other).await
    }

    /// `self > other`, evaluated as `other + 1 unit <= self`.
    pub async fn gt<'a>(&self, other: impl Into<Operand<'a>>) -> MpcResult<MpcTensor> {
        let protocol = self.session.protocol()?.clone();
        let other = self.comparison_operand(other.into()).await?;
        let shifted = other.add(self.unit()).await?;
        protocol.le(&shifted, self).await
    }

    pub async fn eq<'a>(&self, other: impl Into<Operand<'a>>) -> MpcResult<MpcTensor> {
        let protocol = self.session.protocol()?.clone();
        let other = self.comparison_operand(other.into()).await?;
        protocol.eq(self, &other).await
    }

    /// `1 - (self == other)`
    pub async fn ne<'a>(&self, other: impl Into<Operand<'a>>) -> MpcResult<MpcTensor> {
        self.eq(other).await?.rsub(1.0).await
    }

    /// Smallest positive value representable by the session encoder.
    fn unit(&self) -> f64 {
        self.session.encoder().decode(std::num::Wrapping(1))
    }

    async fn comparison_operand(&self, other: Operand<'_>) -> MpcResult<MpcTensor> {
        match other {
            Operand::Private(other) => {
                self.check_session(other)?;
                Ok(other.clone())
            }
            Operand::Public(value) => MpcTensor::share(&self.session, value).await,
        }
    }

    async fn apply_op(&self, other: Operand<'_>, op: Op) -> MpcResult<MpcTensor> {
        let other_shape = other.shape();
        let shape = self
            .session
            .infer_shape(&op, self.shape(), other_shape.as_deref())?;
        let (result, is_private) = match &other {
            Operand::Private(other) => (self.apply_private_op(other, op, shape).await?, true),
            Operand::Public(value) => (self.apply_public_op(value, op, false, shape).await?, false),
        };
        // Two-party products are rescaled inside the multiplication protocol.
        if op.is_multiplicative() && !(is_private && self.session.nr_parties() == 2) {
            return public_divide(&result, self.session.encoder().scale()).await;
        }
        Ok(result)
    }

    async fn apply_private_op(
        &self,
        other: &MpcTensor,
        op: Op,
        shape: Vec<usize>,
    ) -> MpcResult<MpcTensor> {
        self.check_session(other)?;
        if op.is_multiplicative() {
            return mul_master(self, other, op).await;
        }
        let out = self.session.next_object_id();
        self.session
            .transport()
            .call_all(
                self.ids()
                    .zip(other.ids())
                    .map(|(lhs, rhs)| PartyRequest::Linear { op, lhs, rhs, out })
                    .collect(),
            )
            .await?;
        Ok(MpcTensor::placed(&self.session, out, Some(shape)))
    }

    async fn apply_public_op(
        &self,
        value: &PublicValue,
        op: Op,
        reversed: bool,
        shape: Vec<usize>,
    ) -> MpcResult<MpcTensor> {
        let encoded = value.encode(self.session.encoder())?;
        let out = self.session.next_object_id();
        self.session
            .transport()
            .call_all(
                self.ids()
                    .map(|share| PartyRequest::Public {
                        op,
                        share,
                        value: encoded.clone(),
                        reversed,
                        out,
                    })
                    .collect(),
            )
            .await?;
        Ok(MpcTensor::placed(&self.session, out, Some(shape)))
    }

    /// Execute a share method according to its forwarding strategy.
    pub async fn forward(&self, call: ForwardedCall) -> MpcResult<ForwardResult> {
        let transport = self.session.transport();
        match call.strategy() {
            ForwardStrategy::Representative => {
                let handle = &self.shares[0];
                let request = PartyRequest::Forward {
                    call,
                    id: handle.id(),
                    out: None,
                };
                match transport.call(handle.party(), request).await? {
                    PartyResponse::Count(value) => Ok(ForwardResult::Value(value)),
                    _ => Err(PartyResponse::unexpected(handle.party()).into()),
                }
            }
            ForwardStrategy::AllShares => {
                let shape = self
                    .shape()
                    .map(|shape| call.output_shape(shape))
                    .transpose()?;
                let out = self.session.next_object_id();
                transport
                    .call_all(
                        self.ids()
                            .map(|id| PartyRequest::Forward {
                                call: call.clone(),
                                id,
                                out: Some(out),
                            })
                            .collect(),
                    )
                    .await?;
                Ok(ForwardResult::Tensor(MpcTensor::placed(
                    &self.session,
                    out,
                    shape,
                )))
            }
        }
    }

    async fn forward_value(&self, call: ForwardedCall) -> MpcResult<usize> {
        match self.forward(call).await? {
            ForwardResult::Value(value) => Ok(value),
            ForwardResult::Tensor(_) => {
                Err(PartyResponse::unexpected(self.shares[0].party()).into())
            }
        }
    }

    async fn forward_tensor(&self, call: ForwardedCall) -> MpcResult<MpcTensor> {
        match self.forward(call).await? {
            ForwardResult::Tensor(tensor) => Ok(tensor),
            ForwardResult::Value(_) => {
                Err(PartyResponse::unexpected(self.shares[0].party()).into())
            }
        }
    }

    pub async fn numel(&self) -> MpcResult<usize> {
        self.forward_value(ForwardedCall::Numel).await
    }

    pub async fn ndim(&self) -> MpcResult<usize> {
        self.forward_value(ForwardedCall::Ndim).await
    }

    /// Transpose, reversing all axes.
    pub async fn t(&self) -> MpcResult<MpcTensor> {
        self.forward_tensor(ForwardedCall::Transpose).await
    }

    pub async fn reshape(&self, shape: &[usize]) -> MpcResult<MpcTensor> {
        self.forward_tensor(ForwardedCall::Reshape(shape.to_vec()))
            .await
    }

    pub async fn unsqueeze(&self, axis: usize) -> MpcResult<MpcTensor> {
        self.forward_tensor(ForwardedCall::Unsqueeze(axis)).await
    }

    pub async fn neg(&self) -> MpcResult<MpcTensor> {
        self.forward_tensor(ForwardedCall::Neg).await
    }

    /// Fetch every party's share. Shares are returned in rank order.
    pub async fn get_shares(&self) -> MpcResult<Vec<RingTensor>> {
        let shares = fan_out(self.shares.iter().cloned().map(fetch_share)).await?;
        Ok(shares.into_iter().map(Share::into_tensor).collect())
    }

    /// Sum of all shares, reduced into the session ring.
    pub async fn reconstruct_raw(&self) -> MpcResult<RingTensor> {
        let ring = self.session.ring();
        let sum = self
            .get_shares()
            .await?
            .into_iter()
            .reduce(|acc, share| acc + share)
            .ok_or_else(|| MpcError::Argument("tensor has no shares".into()))?;
        Ok(sum.mapv(|x| ring.reduce(x)))
    }

    /// Reconstruct and decode the secret.
    pub async fn reconstruct(&self) -> MpcResult<ArrayD<f64>> {
        let raw = self.reconstruct_raw().await?;
        Ok(self.session.encoder().decode_array(&raw))
    }

    pub async fn get(&self) -> MpcResult<ArrayD<f64>> {
        self.reconstruct().await
    }
}

async fn fetch_share(handle: ShareHandle) -> MpcResult<Share> {
    handle.request().await?.get().await
}

impl fmt::Display for MpcTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[MpcTensor]\nShape: {:?}", self.shape)?;
        for share in &self.shares {
            write!(f, "\n\t| {share}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MpcTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpcTensor")
            .field("session", &self.session.id())
            .field("shape", &self.shape)
            .field("shares", &self.shares)
            .finish()
    }
}
