use ndarray::{ArrayD, IxDyn};

use super::MpcTensor;
use crate::{
    encoding::{FixedPointEncoder, RingTensor},
    error::{MpcError, MpcResult},
    sharing::Secret,
};

/// Plaintext known to the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub enum PublicValue {
    Scalar(f64),
    Tensor(ArrayD<f64>),
}

impl PublicValue {
    /// Shape of the value. Scalars are treated as one-element tensors.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            PublicValue::Scalar(_) => vec![1],
            PublicValue::Tensor(values) => values.shape().to_vec(),
        }
    }

    pub fn to_array(&self) -> ArrayD<f64> {
        match self {
            PublicValue::Scalar(x) => ArrayD::from_elem(IxDyn(&[1]), *x),
            PublicValue::Tensor(values) => values.clone(),
        }
    }

    pub fn encode(&self, encoder: FixedPointEncoder) -> MpcResult<RingTensor> {
        let values = self.to_array();
        if values.iter().any(|x| !x.is_finite()) {
            return Err(MpcError::Argument(
                "public value must contain only finite values".into(),
            ));
        }
        Ok(encoder.encode_array(&values))
    }
}

impl From<f64> for PublicValue {
    fn from(value: f64) -> Self {
        PublicValue::Scalar(value)
    }
}

impl From<i64> for PublicValue {
    fn from(value: i64) -> Self {
        PublicValue::Scalar(value as f64)
    }
}

impl From<i32> for PublicValue {
    fn from(value: i32) -> Self {
        PublicValue::Scalar(value.into())
    }
}

impl From<ArrayD<f64>> for PublicValue {
    fn from(value: ArrayD<f64>) -> Self {
        PublicValue::Tensor(value)
    }
}

impl From<PublicValue> for Secret {
    fn from(value: PublicValue) -> Self {
        match value {
            PublicValue::Scalar(x) => Secret::Scalar(x),
            PublicValue::Tensor(values) => Secret::Tensor(values),
        }
    }
}

/// Right-hand side of an operation on a shared tensor.
#[derive(Clone, Debug)]
pub enum Operand<'a> {
    Private(&'a MpcTensor),
    Public(PublicValue),
}

impl<'a> Operand<'a> {
    /// Shape of the operand, if known.
    pub fn shape(&self) -> Option<Vec<usize>> {
        match self {
            Operand::Private(tensor) => tensor.shape().map(<[usize]>::to_vec),
            Operand::Public(value) => Some(value.shape()),
        }
    }
}

impl<'a> From<&'a MpcTensor> for Operand<'a> {
    fn from(value: &'a MpcTensor) -> Self {
        Operand::Private(value)
    }
}

impl From<PublicValue> for Operand<'_> {
    fn from(value: PublicValue) -> Self {
        Operand::Public(value)
    }
}

impl From<f64> for Operand<'_> {
    fn from(value: f64) -> Self {
        Operand::Public(value.into())
    }
}

impl From<i64> for Operand<'_> {
    fn from(value: i64) -> Self {
        Operand::Public(value.into())
    }
}

impl From<i32> for Operand<'_> {
    fn from(value: i32) -> Self {
        Operand::Public(value.into())
    }
}

impl From<ArrayD<f64>> for Operand<'_> {
    fn from(value: ArrayD<f64>) -> Self {
        Operand::Public(value.into())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_public_value_shape() {
        assert_eq!(PublicValue::from(2).shape(), vec![1]);
        assert_eq!(PublicValue::from(array![[1.0, 2.0]].into_dyn()).shape(), vec![1, 2]);
        assert_eq!(Operand::from(1.5).shape(), Some(vec![1]));
    }

    #[test]
    fn test_encode_rejects_non_finite() {
        let encoder = FixedPointEncoder::default();
        assert!(PublicValue::from(f64::INFINITY).encode(encoder).is_err());
        assert_eq!(
            PublicValue::from(-1.5).encode(encoder).unwrap(),
            encoder.encode_array(&array![-1.5].into_dyn())
        );
    }
}
