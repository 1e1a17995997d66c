use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

use crate::{error::ShapeError, share::Share};

/// Share method that the orchestrator forwards to the parties.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForwardedCall {
    /// Number of elements.
    Numel,
    /// Number of dimensions.
    Ndim,
    /// Reverse the order of all axes.
    Transpose,
    Reshape(Vec<usize>),
    /// Insert axis of length one at given position.
    Unsqueeze(usize),
    Neg,
}

/// Where a forwarded call is executed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ForwardStrategy {
    /// Result does not depend on the sharing, so one share answers for all.
    Representative,
    /// Every share is transformed and the results form a new tensor.
    AllShares,
}

/// Result of a forwarded call at one party.
#[derive(Clone, Debug, PartialEq)]
pub enum Forwarded {
    Value(usize),
    Share(Share),
}

impl ForwardedCall {
    pub fn name(&self) -> &'static str {
        match self {
            ForwardedCall::Numel => "numel",
            ForwardedCall::Ndim => "ndim",
            ForwardedCall::Transpose => "transpose",
            ForwardedCall::Reshape(_) => "reshape",
            ForwardedCall::Unsqueeze(_) => "unsqueeze",
            ForwardedCall::Neg => "neg",
        }
    }

    pub fn strategy(&self) -> ForwardStrategy {
        match self {
            ForwardedCall::Numel | ForwardedCall::Ndim => ForwardStrategy::Representative,
            ForwardedCall::Transpose
            | ForwardedCall::Reshape(_)
            | ForwardedCall::Unsqueeze(_)
            | ForwardedCall::Neg => ForwardStrategy::AllShares,
        }
    }

    /// Shape of the tensor produced by an [`ForwardStrategy::AllShares`] call.
    pub fn output_shape(&self, shape: &[usize]) -> Result<Vec<usize>, ShapeError> {
        match self {
            ForwardedCall::Numel | ForwardedCall::Ndim => Err(self.unsupported(shape)),
            ForwardedCall::Transpose => Ok(shape.iter().rev().copied().collect()),
            ForwardedCall::Reshape(target) => {
                if target.iter().product::<usize>() == shape.iter().product::<usize>() {
                    Ok(target.clone())
                } else {
                    Err(ShapeError::Incompatible {
                        op: self.name().to_string(),
                        lhs: shape.to_vec(),
                        rhs: target.clone(),
                    })
                }
            }
            ForwardedCall::Unsqueeze(axis) => {
                if *axis > shape.len() {
                    return Err(self.unsupported(shape));
                }
                let mut result = shape.to_vec();
                result.insert(*axis, 1);
                Ok(result)
            }
            ForwardedCall::Neg => Ok(shape.to_vec()),
        }
    }

    /// Execute call on one share.
    pub fn apply(&self, share: &Share) -> Result<Forwarded, ShapeError> {
        let tensor = share.tensor();
        let result = match self {
            ForwardedCall::Numel => return Ok(Forwarded::Value(tensor.len())),
            ForwardedCall::Ndim => return Ok(Forwarded::Value(tensor.ndim())),
            ForwardedCall::Transpose => tensor.clone().reversed_axes(),
            ForwardedCall::Reshape(target) => {
                self.output_shape(tensor.shape())?;
                ArrayD::from_shape_vec(IxDyn(target), tensor.iter().copied().collect())
                    .map_err(|_| self.unsupported(tensor.shape()))?
            }
            ForwardedCall::Unsqueeze(axis) => {
                self.output_shape(tensor.shape())?;
                tensor.clone().insert_axis(Axis(*axis))
            }
            ForwardedCall::Neg => return Ok(Forwarded::Share(-share.clone())),
        };
        Ok(Forwarded::Share(share.with_tensor(result)))
    }

    fn unsupported(&self, shape: &[usize]) -> ShapeError {
        ShapeError::Unsupported {
            op: self.name().to_string(),
            shape: shape.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::encoding::FixedPointEncoder;

    fn share() -> Share {
        Share::from_plain(
            &array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]].into_dyn(),
            FixedPointEncoder::default(),
        )
    }

    fn apply_share(call: ForwardedCall) -> Share {
        match call.apply(&share()).unwrap() {
            Forwarded::Share(share) => share,
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_strategies() {
        assert_eq!(ForwardedCall::Numel.strategy(), ForwardStrategy::Representative);
        assert_eq!(ForwardedCall::Transpose.strategy(), ForwardStrategy::AllShares);
        assert_eq!(ForwardedCall::Numel.apply(&share()), Ok(Forwarded::Value(6)));
        assert_eq!(ForwardedCall::Ndim.apply(&share()), Ok(Forwarded::Value(2)));
    }

    #[test]
    fn test_shape_calls() {
        let transposed = apply_share(ForwardedCall::Transpose);
        assert_eq!(transposed.decode(), array![[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]].into_dyn());

        let reshaped = apply_share(ForwardedCall::Reshape(vec![3, 2]));
        assert_eq!(reshaped.decode(), array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]].into_dyn());

        let unsqueezed = apply_share(ForwardedCall::Unsqueeze(1));
        assert_eq!(unsqueezed.shape(), &[2, 1, 3]);

        assert_eq!(
            ForwardedCall::Transpose.output_shape(&[2, 3, 4]),
            Ok(vec![4, 3, 2])
        );
    }

    #[test]
    fn test_invalid_shapes() {
        assert!(matches!(
            ForwardedCall::Reshape(vec![4]).apply(&share()),
            Err(ShapeError::Incompatible { .. })
        ));
        assert!(matches!(
            ForwardedCall::Unsqueeze(3).apply(&share()),
            Err(ShapeError::Unsupported { .. })
        ));
    }
}
