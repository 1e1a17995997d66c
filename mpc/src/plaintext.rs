use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn, Zip};

use crate::{
    comparison::ComparisonProtocol,
    error::{MpcResult, ShapeError},
    ops::{broadcast_shape, Op},
    tensor::MpcTensor,
};

/// Mock comparison protocol that reconstructs both operands at the orchestrator,
/// compares them in plain and shares the result again.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlaintextComparison;

impl PlaintextComparison {
    pub fn new() -> Self {
        Self
    }

    async fn compare(
        &self,
        op: &str,
        lhs: &MpcTensor,
        rhs: &MpcTensor,
        predicate: fn(f64, f64) -> bool,
    ) -> MpcResult<MpcTensor> {
        let (x, y) = futures::try_join!(lhs.reconstruct(), rhs.reconstruct())?;
        // Comparisons broadcast like the difference of their operands.
        let shape = broadcast_shape(&Op::Sub, x.shape(), y.shape())?;
        let unsupported = || ShapeError::Unsupported {
            op: op.to_string(),
            shape: shape.clone(),
        };
        let x = x.broadcast(IxDyn(&shape)).ok_or_else(unsupported)?;
        let y = y.broadcast(IxDyn(&shape)).ok_or_else(unsupported)?;
        let result: ArrayD<f64> =
            Zip::from(&x)
                .and(&y)
                .map_collect(|x, y| if predicate(*x, *y) { 1.0 } else { 0.0 });
        tracing::trace!(op, ?shape, "compared in plain");
        MpcTensor::share(lhs.session(), result).await
    }
}

#[async_trait]
impl ComparisonProtocol for PlaintextComparison {
    fn name(&self) -> &'static str {
        "plaintext"
    }

    async fn le(&self, lhs: &MpcTensor, rhs: &MpcTensor) -> MpcResult<MpcTensor> {
        self.compare("le", lhs, rhs, |x, y| x <= y).await
    }

    async fn eq(&self, lhs: &MpcTensor, rhs: &MpcTensor) -> MpcResult<MpcTensor> {
        self.compare("eq", lhs, rhs, |x, y| x == y).await
    }
}
