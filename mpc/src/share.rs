use std::ops::Neg;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::{
    encoding::{FixedPointEncoder, Ring, RingTensor},
    error::ShapeError,
    ops::{self, Op},
};

/// One party's additive share of a fixed-point encoded tensor.
/// Sharing is linear and supports operations with public values without communication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Share {
    tensor: RingTensor,
    encoder: FixedPointEncoder,
}

impl Share {
    /// Wrap raw ring tensor.
    pub fn new(tensor: RingTensor, encoder: FixedPointEncoder) -> Self {
        Self { tensor, encoder }
    }

    /// Trivial sharing of a public value held entirely by one party.
    pub fn from_plain(values: &ArrayD<f64>, encoder: FixedPointEncoder) -> Self {
        Self::new(encoder.encode_array(values), encoder)
    }

    pub fn tensor(&self) -> &RingTensor {
        &self.tensor
    }

    pub fn into_tensor(self) -> RingTensor {
        self.tensor
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }

    pub fn encoder(&self) -> FixedPointEncoder {
        self.encoder
    }

    pub fn ring(&self) -> Ring {
        self.encoder.ring()
    }

    /// Apply binary operation share-wise.
    pub fn apply(&self, op: &Op, rhs: &RingTensor) -> Result<Share, ShapeError> {
        Ok(self.with_tensor(ops::apply(op, &self.tensor, rhs)?))
    }

    /// Apply binary operation with this share on the right-hand side.
    pub fn apply_right(&self, op: &Op, lhs: &RingTensor) -> Result<Share, ShapeError> {
        Ok(self.with_tensor(ops::apply(op, lhs, &self.tensor)?))
    }

    /// Local truncation of a two-party sharing by a public divisor.
    /// Rank 0 rounds its share down, rank 1 rounds the negation of its share down,
    /// so the reconstructed value is off by at most one unit with overwhelming probability.
    pub fn truncate(&self, divisor: u64, rank: usize) -> Share {
        let ring = self.ring();
        let tensor = if rank == 0 {
            self.tensor.mapv(|x| ring.floor_div(x, divisor))
        } else {
            self.tensor.mapv(|x| -ring.floor_div(-x, divisor))
        };
        self.with_tensor(tensor)
    }

    /// Decode share as if it was a plaintext value.
    pub fn decode(&self) -> ArrayD<f64> {
        self.encoder.decode_array(&self.tensor)
    }

    pub(crate) fn with_tensor(&self, tensor: RingTensor) -> Share {
        Share::new(tensor, self.encoder)
    }
}

impl Neg for Share {
    type Output = Share;
    fn neg(self) -> Self::Output {
        Share {
            tensor: self.tensor.mapv(|x| -x),
            encoder: self.encoder,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::Wrapping;

    use ndarray::array;

    use super::*;

    #[test]
    fn test_public_ops() {
        let encoder = FixedPointEncoder::default();
        let share = Share::from_plain(&array![1.5, -2.0].into_dyn(), encoder);
        let two = encoder.encode_array(&array![2.0].into_dyn());

        let sum = share.apply(&Op::Add, &two).unwrap();
        assert_eq!(sum.decode(), array![3.5, 0.0].into_dyn());

        let product = share.apply(&Op::Mul, &two).unwrap();
        let rescaled = product.truncate(encoder.scale(), 0);
        assert_eq!(rescaled.decode(), array![3.0, -4.0].into_dyn());

        let difference = share.apply_right(&Op::Sub, &two).unwrap();
        assert_eq!(difference.decode(), array![0.5, 4.0].into_dyn());
    }

    #[test]
    fn test_two_party_truncation() {
        let encoder = FixedPointEncoder::default();
        let ring = encoder.ring();
        let secret = ring.from_signed(-1000);
        let r = Wrapping(0x1234_5678_9abc_def0u64);
        let shares = [
            Share::new(array![r].into_dyn(), encoder),
            Share::new(array![secret - r].into_dyn(), encoder),
        ];
        let truncated: Vec<_> = shares
            .iter()
            .enumerate()
            .map(|(rank, share)| share.truncate(10, rank))
            .collect();
        let sum = truncated[0].tensor()[0] + truncated[1].tensor()[0];
        assert!((ring.to_signed(sum) + 100).abs() <= 1);
    }

    #[test]
    fn test_neg() {
        let encoder = FixedPointEncoder::default();
        let share = -Share::from_plain(&array![1.0, -3.0].into_dyn(), encoder);
        assert_eq!(share.decode(), array![-1.0, 3.0].into_dyn());
    }
}
