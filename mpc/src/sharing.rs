//! Additive secret sharing and pseudo-random zero sharing (PRZS).

use std::num::Wrapping;

use ndarray::{ArrayD, IxDyn};
use rand::{CryptoRng, Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::{
    encoding::{FixedPointEncoder, RingTensor},
    error::{MpcError, MpcResult},
    share::Share,
};

/// Value that can be secret shared by its holder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Secret {
    Scalar(f64),
    Tensor(ArrayD<f64>),
    /// Value that was already encoded into the ring.
    Encoded(Share),
}

impl Secret {
    /// Shape of the secret. Scalars are treated as one-element tensors.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Secret::Scalar(_) => vec![1],
            Secret::Tensor(values) => values.shape().to_vec(),
            Secret::Encoded(share) => share.shape().to_vec(),
        }
    }

    /// Encode secret into the ring.
    pub fn encode(self, encoder: FixedPointEncoder) -> MpcResult<Share> {
        let values = match self {
            Secret::Encoded(share) => return Ok(share),
            Secret::Scalar(x) => ArrayD::from_elem(IxDyn(&[1]), x),
            Secret::Tensor(values) => values,
        };
        if values.iter().any(|x| !x.is_finite()) {
            return Err(MpcError::Argument(
                "secret must contain only finite values".into(),
            ));
        }
        Ok(Share::from_plain(&values, encoder))
    }
}

impl From<f64> for Secret {
    fn from(value: f64) -> Self {
        Secret::Scalar(value)
    }
}

impl From<i64> for Secret {
    fn from(value: i64) -> Self {
        Secret::Scalar(value as f64)
    }
}

impl From<ArrayD<f64>> for Secret {
    fn from(value: ArrayD<f64>) -> Self {
        Secret::Tensor(value)
    }
}

impl From<Share> for Secret {
    fn from(value: Share) -> Self {
        Secret::Encoded(value)
    }
}

/// Uniformly random ring tensor of given shape.
pub fn random_tensor(rng: &mut (impl Rng + CryptoRng), shape: &[usize]) -> RingTensor {
    ArrayD::from_shape_simple_fn(IxDyn(shape), || Wrapping(rng.gen()))
}

/// Split ring tensor into `nr_parties` additive shares.
/// The first share is random, middle shares are differences of consecutive random values
/// and the last share completes the sum to `value`.
pub fn split_tensor(
    rng: &mut (impl Rng + CryptoRng),
    value: &RingTensor,
    nr_parties: usize,
) -> Vec<RingTensor> {
    let random: Vec<_> = (1..nr_parties)
        .map(|_| random_tensor(rng, value.shape()))
        .collect();
    (0..nr_parties)
        .map(|i| match i {
            0 if nr_parties == 1 => value.clone(),
            0 => random[0].clone(),
            i if i < nr_parties - 1 => &random[i] - &random[i - 1],
            i => value - &random[i - 1],
        })
        .collect()
}

/// Split secret into additive shares, one for each party.
pub fn generate_shares(
    rng: &mut (impl Rng + CryptoRng),
    secret: impl Into<Secret>,
    nr_parties: usize,
    encoder: FixedPointEncoder,
) -> MpcResult<Vec<Share>> {
    if nr_parties < 2 {
        return Err(MpcError::Argument(format!(
            "cannot share a secret among {nr_parties} parties"
        )));
    }
    let encoded = secret.into().encode(encoder)?;
    Ok(split_tensor(rng, encoded.tensor(), nr_parties)
        .into_iter()
        .map(|tensor| encoded.with_tensor(tensor))
        .collect())
}

/// Pair of generators that party `i` shares with its neighbours `i + 1` and `i - 1`.
pub struct PrzsGenerators {
    next: ChaCha20Rng,
    prev: ChaCha20Rng,
}

impl PrzsGenerators {
    pub fn from_seeds(next: [u8; 32], prev: [u8; 32]) -> Self {
        Self {
            next: ChaCha20Rng::from_seed(next),
            prev: ChaCha20Rng::from_seed(prev),
        }
    }

    /// Draw this party's share of zero. Shares drawn by all parties in the same
    /// order sum to zero, without any communication.
    pub fn zero_share(&mut self, shape: &[usize], encoder: FixedPointEncoder) -> Share {
        let tensor = ArrayD::from_shape_simple_fn(IxDyn(shape), || {
            Wrapping(self.next.gen::<u64>()) - Wrapping(self.prev.gen::<u64>())
        });
        Share::new(tensor, encoder)
    }
}

/// Assign seed pairs so that party `i` holds seeds `i` and `i - 1` (cyclically).
pub fn przs_seed_pairs(seeds: &[[u8; 32]]) -> Vec<([u8; 32], [u8; 32])> {
    let n = seeds.len();
    (0..n).map(|i| (seeds[i], seeds[(i + n - 1) % n])).collect()
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use proptest::prelude::*;
    use rand::Rng;

    use super::*;

    fn sum(shares: &[Share]) -> RingTensor {
        shares
            .iter()
            .skip(1)
            .fold(shares[0].tensor().clone(), |acc, share| acc + share.tensor())
    }

    #[test]
    fn test_shares_reconstruct_tensor() {
        let encoder = FixedPointEncoder::default();
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let secret = array![[1.25, -3.5], [0.0, 1000.0]].into_dyn();
        let shares = generate_shares(&mut rng, secret.clone(), 3, encoder).unwrap();
        assert_eq!(shares.len(), 3);
        assert!(shares.iter().all(|share| share.shape() == [2, 2]));
        assert_eq!(encoder.decode_array(&sum(&shares)), secret);
    }

    #[test]
    fn test_rejects_invalid_secrets() {
        let encoder = FixedPointEncoder::default();
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        assert!(matches!(
            generate_shares(&mut rng, f64::NAN, 2, encoder),
            Err(MpcError::Argument(_))
        ));
        assert!(matches!(
            generate_shares(&mut rng, 1.0, 1, encoder),
            Err(MpcError::Argument(_))
        ));
    }

    #[test]
    fn test_encoded_secret_is_not_reencoded() {
        let encoder = FixedPointEncoder::default();
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let share = Share::from_plain(&array![2.0].into_dyn(), encoder);
        let shares = generate_shares(&mut rng, share.clone(), 2, encoder).unwrap();
        assert_eq!(&sum(&shares), share.tensor());
    }

    proptest! {
        #[test]
        fn prop_shares_reconstruct(x in -1.0e6f64..1.0e6, nr_parties in 2usize..7, seed: u64) {
            let encoder = FixedPointEncoder::default();
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let shares = generate_shares(&mut rng, x, nr_parties, encoder).unwrap();
            let decoded = encoder.decode_array(&sum(&shares))[0];
            prop_assert!((decoded - x).abs() <= 1.0 / (2.0 * encoder.scale() as f64));
        }

        #[test]
        fn prop_przs_sums_to_zero(
            nr_parties in 2usize..7,
            rows in 1usize..4,
            cols in 1usize..4,
            seed: u64,
        ) {
            let encoder = FixedPointEncoder::default();
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let seeds: Vec<[u8; 32]> = (0..nr_parties).map(|_| rng.gen()).collect();
            let mut generators: Vec<_> = przs_seed_pairs(&seeds)
                .into_iter()
                .map(|(next, prev)| PrzsGenerators::from_seeds(next, prev))
                .collect();
            for _ in 0..2 {
                let shares: Vec<_> = generators
                    .iter_mut()
                    .map(|g| g.zero_share(&[rows, cols], encoder))
                    .collect();
                prop_assert!(sum(&shares).iter().all(|x| x.0 == 0));
            }
        }
    }
}
