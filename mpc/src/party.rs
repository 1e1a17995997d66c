//! Party side of the protocols: an object table, a primitive store and PRZS generators,
//! driven by [`PartyRequest`]s from the orchestrator.

use std::collections::{HashMap, HashSet};

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    encoding::{FixedPointEncoder, RingTensor},
    error::PartyError,
    ops::{self, Op},
    provider::{Primitive, PrimitiveParams, PrimitiveTag},
    share::Share,
    sharing::{PrzsGenerators, Secret},
    store::PrimitiveStore,
    tensor::Forwarded,
    transport::{PartyRequest, PartyResponse},
};

/// Identifier of an object stored at a party.
pub type ObjectId = u64;

/// Value stored at a party.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PartyObject {
    Share(Share),
    /// Plaintext owned by this party, never revealed to the orchestrator.
    Secret(Secret),
}

/// Session parameters received during setup.
#[derive(Copy, Clone, Debug)]
struct Membership {
    session: Uuid,
    rank: usize,
    nr_parties: usize,
    encoder: FixedPointEncoder,
}

/// State of a single party.
#[derive(Default)]
pub struct PartyNode {
    membership: Option<Membership>,
    objects: HashMap<ObjectId, PartyObject>,
    requested: HashSet<ObjectId>,
    store: PrimitiveStore,
    przs: Option<PrzsGenerators>,
}

impl PartyNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve requests until the link is closed.
    pub async fn serve<C, E>(mut self, mut link: C)
    where
        C: Stream<Item = Result<PartyRequest, E>> + Sink<PartyResponse> + Unpin,
    {
        while let Some(request) = link.next().await {
            let request = match request {
                Ok(request) => request,
                Err(_) => {
                    tracing::warn!(rank = ?self.rank(), "malformed request, closing link");
                    break;
                }
            };
            let name = request.name();
            tracing::trace!(rank = ?self.rank(), request = name, "handling request");
            let response = self.handle(request).unwrap_or_else(|err| {
                tracing::warn!(rank = ?self.rank(), request = name, %err, "rejected request");
                PartyResponse::Error(err)
            });
            if link.send(response).await.is_err() {
                break;
            }
        }
        tracing::debug!(
            session = ?self.membership.map(|m| m.session),
            rank = ?self.rank(),
            "party link closed"
        );
    }

    fn rank(&self) -> Option<usize> {
        self.membership.map(|m| m.rank)
    }

    fn membership(&self) -> Result<Membership, PartyError> {
        self.membership.ok_or(PartyError::SetupIncomplete)
    }

    fn share(&self, id: ObjectId) -> Result<&Share, PartyError> {
        match self.objects.get(&id) {
            Some(PartyObject::Share(share)) => Ok(share),
            Some(_) => Err(PartyError::WrongObjectKind {
                id,
                expected: "share".into(),
            }),
            None => Err(PartyError::UnknownObject(id)),
        }
    }

    fn secret(&self, id: ObjectId) -> Result<&Secret, PartyError> {
        match self.objects.get(&id) {
            Some(PartyObject::Secret(secret)) => Ok(secret),
            Some(_) => Err(PartyError::WrongObjectKind {
                id,
                expected: "secret".into(),
            }),
            None => Err(PartyError::UnknownObject(id)),
        }
    }

    fn insert(&mut self, id: ObjectId, share: Share) -> PartyResponse {
        self.objects.insert(id, PartyObject::Share(share));
        PartyResponse::Done
    }

    /// Execute a single request.
    pub fn handle(&mut self, request: PartyRequest) -> Result<PartyResponse, PartyError> {
        match request {
            PartyRequest::Setup {
                session,
                rank,
                nr_parties,
                config,
            } => {
                self.membership = Some(Membership {
                    session,
                    rank,
                    nr_parties,
                    encoder: config.encoder(),
                });
                tracing::debug!(%session, rank, nr_parties, "party joined session");
                Ok(PartyResponse::Done)
            }
            PartyRequest::InitPrzs => {
                let nr_parties = self.membership()?.nr_parties;
                let key = PrimitiveParams::Przs { nr_parties };
                match self.store.take(PrimitiveTag::Przs, &key)? {
                    Primitive::PrzsSeeds { next, prev } => {
                        self.przs = Some(PrzsGenerators::from_seeds(next, prev));
                        Ok(PartyResponse::Done)
                    }
                    _ => Err(PartyError::WrongPrimitiveKind(PrimitiveTag::Przs)),
                }
            }
            PartyRequest::Store { id, object } => {
                self.objects.insert(id, object);
                Ok(PartyResponse::Done)
            }
            PartyRequest::Request { id } => {
                if !self.objects.contains_key(&id) {
                    return Err(PartyError::UnknownObject(id));
                }
                self.requested.insert(id);
                Ok(PartyResponse::Done)
            }
            PartyRequest::Fetch { id } => {
                if !self.requested.contains(&id) {
                    return Err(PartyError::NotRequested(id));
                }
                let object = self
                    .objects
                    .get(&id)
                    .cloned()
                    .ok_or(PartyError::UnknownObject(id))?;
                Ok(PartyResponse::Object(object))
            }
            PartyRequest::Linear { op, lhs, rhs, out } => {
                if op.is_multiplicative() {
                    return Err(PartyError::Shape(format!(
                        "`{op}` of two shares needs a Beaver triple"
                    )));
                }
                let result = self.share(lhs)?.apply(&op, self.share(rhs)?.tensor())?;
                Ok(self.insert(out, result))
            }
            PartyRequest::Public {
                op,
                share,
                value,
                reversed,
                out,
            } => {
                let rank = self.membership()?.rank;
                let value = if op.is_multiplicative() || rank == 0 {
                    value
                } else {
                    RingTensor::zeros(value.raw_dim())
                };
                let share = self.share(share)?;
                let result = if reversed {
                    share.apply_right(&op, &value)?
                } else {
                    share.apply(&op, &value)?
                };
                Ok(self.insert(out, result))
            }
            PartyRequest::Truncate { id, divisor, out } => {
                let rank = self.membership()?.rank;
                let result = self.share(id)?.truncate(divisor, rank);
                Ok(self.insert(out, result))
            }
            PartyRequest::Przs { shape, out } => {
                let encoder = self.membership()?.encoder;
                let generators = self
                    .przs
                    .as_mut()
                    .ok_or(PartyError::MissingPrzsGenerators)?;
                let share = generators.zero_share(&shape, encoder);
                Ok(self.insert(out, share))
            }
            PartyRequest::AddSecret { share, secret, out } => {
                let share = self.share(share)?;
                let encoded = self
                    .secret(secret)?
                    .clone()
                    .encode(share.encoder())
                    .map_err(|err| PartyError::InvalidSecret(err.to_string()))?;
                if encoded.shape() != share.shape() {
                    return Err(PartyError::Shape(format!(
                        "secret of shape {:?} cannot be added to a share of shape {:?}",
                        encoded.shape(),
                        share.shape()
                    )));
                }
                let result = share.apply(&Op::Add, encoded.tensor())?;
                Ok(self.insert(out, result))
            }
            PartyRequest::SpdzMask { op, x, y, out } => {
                let (x, y) = (self.share(x)?, self.share(y)?);
                let (tag, key) = beaver_key(&op, x.shape(), y.shape(), out)?;
                match self.store.peek(tag, &key)? {
                    Primitive::Beaver { a, b, .. } => Ok(PartyResponse::Masked(vec![
                        x.tensor() - a,
                        y.tensor() - b,
                    ])),
                    _ => Err(PartyError::WrongPrimitiveKind(tag)),
                }
            }
            PartyRequest::SpdzFinish {
                op,
                eps,
                delta,
                truncate,
                out,
            } => {
                let Membership { rank, encoder, .. } = self.membership()?;
                let (tag, key) = beaver_key(&op, eps.shape(), delta.shape(), out)?;
                let (a, b, c) = match self.store.take(tag, &key)? {
                    Primitive::Beaver { a, b, c } => (a, b, c),
                    _ => return Err(PartyError::WrongPrimitiveKind(tag)),
                };
                let mut product =
                    c + ops::apply(&op, &eps, &b)? + ops::apply(&op, &a, &delta)?;
                if rank == 0 {
                    product = product + ops::apply(&op, &eps, &delta)?;
                }
                let mut share = Share::new(product, encoder);
                if let Some(divisor) = truncate {
                    share = share.truncate(divisor, rank);
                }
                Ok(self.insert(out, share))
            }
            PartyRequest::TruncationMask { id, divisor, out } => {
                let x = self.share(id)?;
                let key = PrimitiveParams::Truncation {
                    shape: x.shape().to_vec(),
                    divisor,
                    slot: out,
                };
                match self.store.peek(PrimitiveTag::Truncation, &key)? {
                    Primitive::Truncation { r, .. } => {
                        Ok(PartyResponse::Masked(vec![x.tensor() - r]))
                    }
                    _ => Err(PartyError::WrongPrimitiveKind(PrimitiveTag::Truncation)),
                }
            }
            PartyRequest::TruncationFinish {
                opened,
                divisor,
                out,
            } => {
                let Membership { rank, encoder, .. } = self.membership()?;
                let key = PrimitiveParams::Truncation {
                    shape: opened.shape().to_vec(),
                    divisor,
                    slot: out,
                };
                let mut result = match self.store.take(PrimitiveTag::Truncation, &key)? {
                    Primitive::Truncation { r_div, .. } => r_div,
                    _ => return Err(PartyError::WrongPrimitiveKind(PrimitiveTag::Truncation)),
                };
                if rank == 0 {
                    let ring = encoder.ring();
                    result = result + opened.mapv(|c| ring.floor_div(c, divisor));
                }
                Ok(self.insert(out, Share::new(result, encoder)))
            }
            PartyRequest::Populate {
                tag,
                key,
                primitive,
            } => {
                self.store.populate(tag, key, primitive);
                Ok(PartyResponse::Done)
            }
            PartyRequest::PrimitiveCount { tag } => Ok(PartyResponse::Count(self.store.count(tag))),
            PartyRequest::Forward { call, id, out } => match call.apply(self.share(id)?)? {
                Forwarded::Value(value) => Ok(PartyResponse::Count(value)),
                Forwarded::Share(share) => {
                    let out = out.ok_or_else(|| {
                        PartyError::Shape(format!("no output object for `{}`", call.name()))
                    })?;
                    Ok(self.insert(out, share))
                }
            },
        }
    }
}

fn beaver_key(
    op: &Op,
    x_shape: &[usize],
    y_shape: &[usize],
    slot: ObjectId,
) -> Result<(PrimitiveTag, PrimitiveParams), PartyError> {
    let tag = PrimitiveTag::beaver(op)
        .ok_or_else(|| PartyError::Shape(format!("`{op}` does not use Beaver triples")))?;
    let key = PrimitiveParams::Beaver {
        op: *op,
        a_shape: x_shape.to_vec(),
        b_shape: y_shape.to_vec(),
        slot,
    };
    Ok((tag, key))
}

#[cfg(test)]
mod tests {
    use std::num::Wrapping;

    use ndarray::array;

    use super::*;
    use crate::config::SessionConfig;

    fn joined(rank: usize) -> PartyNode {
        let mut node = PartyNode::new();
        node.handle(PartyRequest::Setup {
            session: Uuid::new_v4(),
            rank,
            nr_parties: 2,
            config: SessionConfig::default(),
        })
        .unwrap();
        node
    }

    fn store_share(node: &mut PartyNode, id: ObjectId, values: ndarray::ArrayD<f64>) {
        let share = Share::from_plain(&values, FixedPointEncoder::default());
        node.handle(PartyRequest::Store {
            id,
            object: PartyObject::Share(share),
        })
        .unwrap();
    }

    fn fetch(node: &mut PartyNode, id: ObjectId) -> Share {
        node.handle(PartyRequest::Request { id }).unwrap();
        match node.handle(PartyRequest::Fetch { id }).unwrap() {
            PartyResponse::Object(PartyObject::Share(share)) => share,
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_fetch_requires_request() {
        let mut node = joined(0);
        store_share(&mut node, 1, array![1.0].into_dyn());
        assert_eq!(
            node.handle(PartyRequest::Fetch { id: 1 }).unwrap_err(),
            PartyError::NotRequested(1)
        );
        assert_eq!(
            node.handle(PartyRequest::Request { id: 2 }).unwrap_err(),
            PartyError::UnknownObject(2)
        );
        assert_eq!(fetch(&mut node, 1).decode(), array![1.0].into_dyn());
    }

    #[test]
    fn test_public_add_only_at_rank_zero() {
        let encoder = FixedPointEncoder::default();
        let value = encoder.encode_array(&array![[1.0, 2.0]].into_dyn());
        for rank in 0..2 {
            let mut node = joined(rank);
            store_share(&mut node, 1, array![0.5].into_dyn());
            node.handle(PartyRequest::Public {
                op: Op::Add,
                share: 1,
                value: value.clone(),
                reversed: false,
                out: 2,
            })
            .unwrap();
            let expected = if rank == 0 {
                array![[1.5, 2.5]]
            } else {
                array![[0.5, 0.5]]
            };
            assert_eq!(fetch(&mut node, 2).decode(), expected.into_dyn());
        }
    }

    #[test]
    fn test_requires_setup() {
        let mut node = PartyNode::new();
        store_share(&mut node, 1, array![1.0].into_dyn());
        assert_eq!(
            node.handle(PartyRequest::Truncate {
                id: 1,
                divisor: 2,
                out: 2
            })
            .unwrap_err(),
            PartyError::SetupIncomplete
        );
        assert_eq!(
            node.handle(PartyRequest::InitPrzs).unwrap_err(),
            PartyError::SetupIncomplete
        );
    }

    #[test]
    fn test_przs_requires_generators() {
        let mut node = joined(0);
        assert_eq!(
            node.handle(PartyRequest::Przs {
                shape: vec![2],
                out: 1
            })
            .unwrap_err(),
            PartyError::MissingPrzsGenerators
        );
        assert!(matches!(
            node.handle(PartyRequest::InitPrzs).unwrap_err(),
            PartyError::PrimitiveExhausted {
                tag: PrimitiveTag::Przs,
                ..
            }
        ));
    }

    #[test]
    fn test_spdz_mask_requires_triple() {
        let mut node = joined(0);
        store_share(&mut node, 1, array![1.0, 2.0].into_dyn());
        store_share(&mut node, 2, array![3.0, 4.0].into_dyn());
        assert!(matches!(
            node.handle(PartyRequest::SpdzMask {
                op: Op::Mul,
                x: 1,
                y: 2,
                out: 3,
            })
            .unwrap_err(),
            PartyError::PrimitiveExhausted {
                tag: PrimitiveTag::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_spdz_uses_triple_reserved_for_output() {
        let mut node = joined(0);
        store_share(&mut node, 1, array![1.0, 2.0].into_dyn());
        store_share(&mut node, 2, array![3.0, 4.0].into_dyn());
        let filled = |value: u64| RingTensor::from_elem(ndarray::IxDyn(&[2]), Wrapping(value));
        for slot in [8, 7] {
            let (tag, key) = beaver_key(&Op::Mul, &[2], &[2], slot).unwrap();
            let primitive = Primitive::Beaver {
                a: filled(slot),
                b: filled(slot),
                c: filled(slot),
            };
            node.handle(PartyRequest::Populate {
                tag,
                key,
                primitive,
            })
            .unwrap();
        }

        let mask = PartyRequest::SpdzMask {
            op: Op::Mul,
            x: 1,
            y: 2,
            out: 7,
        };
        let masked = match node.handle(mask.clone()).unwrap() {
            PartyResponse::Masked(masked) => masked,
            other => panic!("unexpected response {other:?}"),
        };
        assert_eq!(masked[0], node.share(1).unwrap().tensor() - &filled(7));
        assert_eq!(masked[1], node.share(2).unwrap().tensor() - &filled(7));

        node.handle(PartyRequest::SpdzFinish {
            op: Op::Mul,
            eps: masked[0].clone(),
            delta: masked[1].clone(),
            truncate: None,
            out: 7,
        })
        .unwrap();
        assert_eq!(node.store.count(PrimitiveTag::Mul), 1);
        assert!(matches!(
            node.handle(mask).unwrap_err(),
            PartyError::PrimitiveExhausted { .. }
        ));
    }

    #[test]
    fn test_add_secret() {
        let mut node = joined(1);
        store_share(&mut node, 1, array![1.0, 2.0].into_dyn());
        node.handle(PartyRequest::Store {
            id: 2,
            object: PartyObject::Secret(Secret::Tensor(array![0.5, -1.0].into_dyn())),
        })
        .unwrap();
        node.handle(PartyRequest::AddSecret {
            share: 1,
            secret: 2,
            out: 3,
        })
        .unwrap();
        assert_eq!(fetch(&mut node, 3).decode(), array![1.5, 1.0].into_dyn());
        assert!(matches!(
            node.handle(PartyRequest::AddSecret {
                share: 2,
                secret: 1,
                out: 4
            })
            .unwrap_err(),
            PartyError::WrongObjectKind { id: 2, .. }
        ));
    }

    #[test]
    fn test_add_secret_requires_matching_shape() {
        let mut node = joined(1);
        store_share(&mut node, 1, array![0.0].into_dyn());
        node.handle(PartyRequest::Store {
            id: 2,
            object: PartyObject::Secret(Secret::Tensor(array![1.0, 2.0, 3.0].into_dyn())),
        })
        .unwrap();
        assert!(matches!(
            node.handle(PartyRequest::AddSecret {
                share: 1,
                secret: 2,
                out: 3,
            })
            .unwrap_err(),
            PartyError::Shape(_)
        ));
        assert!(matches!(
            node.handle(PartyRequest::Request { id: 3 }).unwrap_err(),
            PartyError::UnknownObject(3)
        ));
    }

    #[test]
    fn test_linear_rejects_products() {
        let mut node = joined(0);
        store_share(&mut node, 1, array![1.0].into_dyn());
        assert!(matches!(
            node.handle(PartyRequest::Linear {
                op: Op::Mul,
                lhs: 1,
                rhs: 1,
                out: 2
            }),
            Err(PartyError::Shape(_))
        ));
    }
}
