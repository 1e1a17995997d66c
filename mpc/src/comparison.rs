use async_trait::async_trait;

use crate::{error::MpcResult, tensor::MpcTensor};

/// Protocol evaluating comparisons of shared tensors.
/// Results are shared tensors holding 0 or 1 elementwise.
#[async_trait]
pub trait ComparisonProtocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// `lhs <= rhs`
    async fn le(&self, lhs: &MpcTensor, rhs: &MpcTensor) -> MpcResult<MpcTensor>;

    /// `lhs == rhs`
    async fn eq(&self, lhs: &MpcTensor, rhs: &MpcTensor) -> MpcResult<MpcTensor>;
}
