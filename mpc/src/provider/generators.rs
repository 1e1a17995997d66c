use rand::Rng;
use rand_chacha::ChaCha20Rng;

use super::{GenerateArgs, Primitive, PrimitiveParams};
use crate::{
    error::{MpcError, MpcResult},
    ops,
    sharing::{przs_seed_pairs, random_tensor, split_tensor},
};

/// Shares of random `a`, `b` and `c = op(a, b)` for a Beaver multiplication.
pub fn beaver_triples(args: &GenerateArgs, rng: &mut ChaCha20Rng) -> MpcResult<Vec<Primitive>> {
    let (op, a_shape, b_shape) = match &args.params {
        PrimitiveParams::Beaver {
            op,
            a_shape,
            b_shape,
            ..
        } => (op, a_shape, b_shape),
        params => return Err(unexpected("beaver triples", params)),
    };
    let a = random_tensor(rng, a_shape);
    let b = random_tensor(rng, b_shape);
    let c = ops::apply(op, &a, &b)?;

    let a_shares = split_tensor(rng, &a, args.nr_parties);
    let b_shares = split_tensor(rng, &b, args.nr_parties);
    let c_shares = split_tensor(rng, &c, args.nr_parties);
    Ok(itertools::izip!(a_shares, b_shares, c_shares)
        .map(|(a, b, c)| Primitive::Beaver { a, b, c })
        .collect())
}

/// One fresh seed per party, handed out so that neighbours share a generator.
pub fn przs_seeds(args: &GenerateArgs, rng: &mut ChaCha20Rng) -> MpcResult<Vec<Primitive>> {
    match &args.params {
        PrimitiveParams::Przs { nr_parties } if *nr_parties == args.nr_parties => {}
        params => return Err(unexpected("przs seeds", params)),
    }
    let seeds: Vec<[u8; 32]> = (0..args.nr_parties).map(|_| rng.gen()).collect();
    Ok(przs_seed_pairs(&seeds)
        .into_iter()
        .map(|(next, prev)| Primitive::PrzsSeeds { next, prev })
        .collect())
}

/// Shares of random `r` and `floor(r / divisor)`, with `r` interpreted as signed.
pub fn truncation_pairs(args: &GenerateArgs, rng: &mut ChaCha20Rng) -> MpcResult<Vec<Primitive>> {
    let (shape, divisor) = match &args.params {
        PrimitiveParams::Truncation { shape, divisor, .. } => (shape, *divisor),
        params => return Err(unexpected("truncation pairs", params)),
    };
    if divisor == 0 {
        return Err(MpcError::Argument("truncation divisor must be positive".into()));
    }
    let ring = args.ring;
    // Keep |r| well below the ring bound so that x - r does not wrap for small x.
    let bound = ring.max_signed() / 4;
    let r = random_tensor(rng, shape).mapv(|x| ring.from_signed(ring.to_signed(x) % bound.max(1)));
    let r_div = r.mapv(|x| ring.floor_div(x, divisor));

    let r_shares = split_tensor(rng, &r, args.nr_parties);
    let r_div_shares = split_tensor(rng, &r_div, args.nr_parties);
    Ok(r_shares
        .into_iter()
        .zip(r_div_shares)
        .map(|(r, r_div)| Primitive::Truncation { r, r_div })
        .collect())
}

fn unexpected(generator: &str, params: &PrimitiveParams) -> MpcError {
    MpcError::Argument(format!("{generator} cannot be generated for {params}"))
}
