//! Trusted dealer producing correlated randomness for the parties.

mod generators;

use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::{
    encoding::{Ring, RingTensor},
    error::{ConfigError, MpcError, MpcResult, ShapeError},
    ops::Op,
    party::ObjectId,
    store::PrimitiveStore,
    transport::fan_out,
};

pub use generators::{beaver_triples, przs_seeds, truncation_pairs};

/// Conventional name of the primitive log file.
pub const PRIMITIVE_LOG_FILE: &str = "primitive_log.json";

/// Operation a primitive is generated for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveTag {
    Mul,
    Matmul,
    Conv2d,
    Przs,
    Truncation,
}

impl PrimitiveTag {
    /// Tag of the Beaver triples consumed by a multiplicative operation.
    pub fn beaver(op: &Op) -> Option<Self> {
        match op {
            Op::Mul => Some(PrimitiveTag::Mul),
            Op::Matmul => Some(PrimitiveTag::Matmul),
            Op::Conv2d(_) => Some(PrimitiveTag::Conv2d),
            Op::Add | Op::Sub => None,
        }
    }
}

impl fmt::Display for PrimitiveTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimitiveTag::Mul => "mul",
            PrimitiveTag::Matmul => "matmul",
            PrimitiveTag::Conv2d => "conv2d",
            PrimitiveTag::Przs => "przs",
            PrimitiveTag::Truncation => "truncation",
        };
        f.write_str(name)
    }
}

/// Parameters identifying a batch of primitives in the party stores.
///
/// Batches consumed by a single operation carry the `slot` of the object the operation
/// produces, so concurrent operations over equal shapes never share a batch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveParams {
    Beaver {
        op: Op,
        a_shape: Vec<usize>,
        b_shape: Vec<usize>,
        slot: ObjectId,
    },
    Przs {
        nr_parties: usize,
    },
    Truncation {
        shape: Vec<usize>,
        divisor: u64,
        slot: ObjectId,
    },
}

impl fmt::Display for PrimitiveParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveParams::Beaver {
                op,
                a_shape,
                b_shape,
                slot,
            } => write!(
                f,
                "{op}(a_shape={a_shape:?}, b_shape={b_shape:?}, slot={slot})"
            ),
            PrimitiveParams::Przs { nr_parties } => write!(f, "przs(nr_parties={nr_parties})"),
            PrimitiveParams::Truncation {
                shape,
                divisor,
                slot,
            } => {
                write!(f, "truncation(shape={shape:?}, divisor={divisor}, slot={slot})")
            }
        }
    }
}

/// Whether generated primitives are handed to the parties.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Populate {
    /// Only return the primitives.
    Skip,
    /// Store each party's primitive under this key.
    Key(PrimitiveParams),
}

impl Populate {
    fn key(&self) -> Option<&PrimitiveParams> {
        match self {
            Populate::Skip => None,
            Populate::Key(key) => Some(key),
        }
    }
}

/// Arguments passed to a primitive generator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateArgs {
    pub nr_parties: usize,
    pub ring: Ring,
    pub params: PrimitiveParams,
}

/// One party's part of a primitive batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Primitive {
    /// Additive shares of random `a`, `b` and `c = op(a, b)`.
    Beaver {
        a: RingTensor,
        b: RingTensor,
        c: RingTensor,
    },
    /// Seeds of the generators shared with the next and previous party.
    PrzsSeeds { next: [u8; 32], prev: [u8; 32] },
    /// Additive shares of random `r` and `floor(r / divisor)`.
    Truncation { r: RingTensor, r_div: RingTensor },
}

/// Generator of a primitive batch, one entry per party.
pub trait PrimitiveGenerator: Send + Sync {
    fn generate(&self, args: &GenerateArgs, rng: &mut ChaCha20Rng) -> MpcResult<Vec<Primitive>>;
}

impl<F> PrimitiveGenerator for F
where
    F: Fn(&GenerateArgs, &mut ChaCha20Rng) -> MpcResult<Vec<Primitive>> + Send + Sync,
{
    fn generate(&self, args: &GenerateArgs, rng: &mut ChaCha20Rng) -> MpcResult<Vec<Primitive>> {
        self(args, rng)
    }
}

/// Mapping from operation tag to primitive generator.
#[derive(Default)]
pub struct PrimitiveRegistry {
    generators: HashMap<PrimitiveTag, Box<dyn PrimitiveGenerator>>,
}

impl PrimitiveRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with generators for all operations used by the protocols in this crate.
    pub fn with_defaults() -> Self {
        Self::new()
            .with(PrimitiveTag::Mul, beaver_triples)
            .with(PrimitiveTag::Matmul, beaver_triples)
            .with(PrimitiveTag::Conv2d, beaver_triples)
            .with(PrimitiveTag::Przs, przs_seeds)
            .with(PrimitiveTag::Truncation, truncation_pairs)
    }

    /// Register generator, replacing any previous one for the same tag.
    pub fn with(mut self, tag: PrimitiveTag, generator: impl PrimitiveGenerator + 'static) -> Self {
        self.generators.insert(tag, Box::new(generator));
        self
    }

    pub fn get(&self, tag: PrimitiveTag) -> Option<&dyn PrimitiveGenerator> {
        self.generators.get(&tag).map(|generator| generator.as_ref())
    }

    /// Registered tags in sorted order.
    pub fn tags(&self) -> Vec<PrimitiveTag> {
        let mut tags: Vec<_> = self.generators.keys().copied().collect();
        tags.sort();
        tags
    }
}

/// Destination of one party's primitives.
#[async_trait]
pub trait PrimitiveSink: Send + Sync {
    async fn populate(
        &self,
        tag: PrimitiveTag,
        key: PrimitiveParams,
        primitive: Primitive,
    ) -> MpcResult<()>;
}

#[async_trait]
impl PrimitiveSink for Mutex<PrimitiveStore> {
    async fn populate(
        &self,
        tag: PrimitiveTag,
        key: PrimitiveParams,
        primitive: Primitive,
    ) -> MpcResult<()> {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .populate(tag, key, primitive);
        Ok(())
    }
}

/// Populate keys used since logging started, grouped by operation.
pub type PrimitiveLog = BTreeMap<PrimitiveTag, Vec<Option<PrimitiveParams>>>;

/// Trusted dealer. Generates primitive batches and distributes them to party stores.
///
/// Logging is diagnostic only. Interleaving [`generate_primitives`](Self::generate_primitives)
/// with [`stop_logging`](Self::stop_logging) from concurrent tasks is left to the caller to order.
pub struct PrimitiveProvider {
    registry: PrimitiveRegistry,
    rng: Mutex<ChaCha20Rng>,
    logging: AtomicBool,
    log: Mutex<PrimitiveLog>,
}

impl PrimitiveProvider {
    /// Create provider with an entropy-seeded generator.
    pub fn new(registry: PrimitiveRegistry) -> Self {
        Self::with_rng(registry, ChaCha20Rng::from_entropy())
    }

    /// Create provider with a deterministic generator. Only suitable for tests.
    pub fn with_seed(registry: PrimitiveRegistry, seed: u64) -> Self {
        Self::with_rng(registry, ChaCha20Rng::seed_from_u64(seed))
    }

    fn with_rng(registry: PrimitiveRegistry, rng: ChaCha20Rng) -> Self {
        Self {
            registry,
            rng: Mutex::new(rng),
            logging: AtomicBool::new(false),
            log: Mutex::new(PrimitiveLog::new()),
        }
    }

    pub fn registry(&self) -> &PrimitiveRegistry {
        &self.registry
    }

    /// Operations this provider can generate primitives for.
    pub fn registered_tags(&self) -> Vec<PrimitiveTag> {
        self.registry.tags()
    }

    /// Generate primitives for `tag` and, unless `populate` is [`Populate::Skip`],
    /// hand the i-th primitive to the i-th store.
    pub async fn generate_primitives<S: PrimitiveSink>(
        &self,
        tag: PrimitiveTag,
        stores: &[S],
        args: &GenerateArgs,
        populate: Populate,
    ) -> MpcResult<Vec<Primitive>> {
        let generator = self
            .registry
            .get(tag)
            .ok_or(ConfigError::UnregisteredOperation(tag))?;

        let primitives = {
            let mut rng = lock(&self.rng);
            generator.generate(args, &mut rng)?
        };
        tracing::debug!(
            %tag,
            params = %args.params,
            count = primitives.len(),
            "generated primitives"
        );

        if self.logging.load(Ordering::SeqCst) {
            lock(&self.log)
                .entry(tag)
                .or_default()
                .push(populate.key().cloned());
        }

        if let Populate::Key(key) = populate {
            if primitives.len() != stores.len() {
                return Err(ShapeError::CountMismatch {
                    primitives: primitives.len(),
                    sessions: stores.len(),
                }
                .into());
            }
            fan_out(stores.iter().zip(primitives.iter()).map(|(store, primitive)| {
                store.populate(tag, key.clone(), primitive.clone())
            }))
            .await?;
            tracing::debug!(%tag, %key, "distributed primitives");
        }

        Ok(primitives)
    }

    pub fn start_logging(&self) {
        self.logging.store(true, Ordering::SeqCst);
    }

    pub fn is_logging(&self) -> bool {
        self.logging.load(Ordering::SeqCst)
    }

    /// Copy of the current log.
    pub fn log_snapshot(&self) -> PrimitiveLog {
        lock(&self.log).clone()
    }

    /// Stop logging and return the log as JSON, optionally writing it to `file`.
    /// The in-memory log is cleared even if writing the file fails.
    pub fn stop_logging(&self, file: Option<&Path>) -> MpcResult<String> {
        self.logging.store(false, Ordering::SeqCst);
        let log = std::mem::take(&mut *lock(&self.log));
        let json = serde_json::to_string(&log)?;
        if let Some(path) = file {
            fs::write(path, &json).map_err(MpcError::Io)?;
        }
        Ok(json)
    }
}

impl Default for PrimitiveProvider {
    fn default() -> Self {
        Self::new(PrimitiveRegistry::with_defaults())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores(count: usize) -> Vec<Mutex<PrimitiveStore>> {
        (0..count).map(|_| Mutex::new(PrimitiveStore::new())).collect()
    }

    fn mul_params() -> PrimitiveParams {
        PrimitiveParams::Beaver {
            op: Op::Mul,
            a_shape: vec![2],
            b_shape: vec![2],
            slot: 0,
        }
    }

    fn mul_args(nr_parties: usize) -> GenerateArgs {
        GenerateArgs {
            nr_parties,
            ring: Ring::default(),
            params: mul_params(),
        }
    }

    #[tokio::test]
    async fn test_unregistered_operation() {
        let provider = PrimitiveProvider::with_seed(PrimitiveRegistry::new(), 1);
        let result = provider
            .generate_primitives(PrimitiveTag::Mul, &stores(2), &mul_args(2), Populate::Skip)
            .await;
        assert!(matches!(
            result,
            Err(MpcError::Configuration(ConfigError::UnregisteredOperation(
                PrimitiveTag::Mul
            )))
        ));
    }

    #[tokio::test]
    async fn test_distributes_to_stores() {
        let provider = PrimitiveProvider::with_seed(PrimitiveRegistry::with_defaults(), 1);
        let stores = stores(3);
        let primitives = provider
            .generate_primitives(
                PrimitiveTag::Mul,
                &stores,
                &mul_args(3),
                Populate::Key(mul_params()),
            )
            .await
            .unwrap();
        assert_eq!(primitives.len(), 3);
        for (store, primitive) in stores.iter().zip(&primitives) {
            let mut store = store.lock().unwrap();
            assert_eq!(store.take(PrimitiveTag::Mul, &mul_params()).as_ref(), Ok(primitive));
        }
    }

    #[tokio::test]
    async fn test_skip_does_not_distribute() {
        let provider = PrimitiveProvider::with_seed(PrimitiveRegistry::with_defaults(), 1);
        let stores = stores(2);
        let primitives = provider
            .generate_primitives(PrimitiveTag::Mul, &stores, &mul_args(2), Populate::Skip)
            .await
            .unwrap();
        assert_eq!(primitives.len(), 2);
        assert!(stores
            .iter()
            .all(|store| store.lock().unwrap().count(PrimitiveTag::Mul) == 0));
    }

    #[tokio::test]
    async fn test_count_mismatch() {
        let provider = PrimitiveProvider::with_seed(PrimitiveRegistry::with_defaults(), 1);
        let result = provider
            .generate_primitives(
                PrimitiveTag::Mul,
                &stores(2),
                &mul_args(3),
                Populate::Key(mul_params()),
            )
            .await;
        assert!(matches!(
            result,
            Err(MpcError::Shape(ShapeError::CountMismatch {
                primitives: 3,
                sessions: 2
            }))
        ));
    }

    #[tokio::test]
    async fn test_logging_lifecycle() {
        let provider = PrimitiveProvider::with_seed(PrimitiveRegistry::with_defaults(), 1);
        let stores = stores(2);

        provider
            .generate_primitives(PrimitiveTag::Mul, &stores, &mul_args(2), Populate::Skip)
            .await
            .unwrap();
        assert!(provider.log_snapshot().is_empty());

        provider.start_logging();
        assert!(provider.is_logging());
        provider
            .generate_primitives(
                PrimitiveTag::Mul,
                &stores,
                &mul_args(2),
                Populate::Key(mul_params()),
            )
            .await
            .unwrap();
        provider
            .generate_primitives(PrimitiveTag::Mul, &stores, &mul_args(2), Populate::Skip)
            .await
            .unwrap();

        let json = provider.stop_logging(None).unwrap();
        assert!(!provider.is_logging());
        assert!(provider.log_snapshot().is_empty());

        let log: PrimitiveLog = serde_json::from_str(&json).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[&PrimitiveTag::Mul], vec![Some(mul_params()), None]);
    }

    #[tokio::test]
    async fn test_log_file() {
        let provider = PrimitiveProvider::with_seed(PrimitiveRegistry::with_defaults(), 1);
        provider.start_logging();
        provider
            .generate_primitives(PrimitiveTag::Mul, &stores(2), &mul_args(2), Populate::Skip)
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PRIMITIVE_LOG_FILE);
        let json = provider.stop_logging(Some(&path)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), json);
        assert!(json.starts_with(r#"{"mul":[null"#));
        assert!(provider.log_snapshot().is_empty());
    }

    #[test]
    fn test_registered_tags() {
        let provider = PrimitiveProvider::with_seed(PrimitiveRegistry::with_defaults(), 1);
        assert_eq!(
            provider.registered_tags(),
            vec![
                PrimitiveTag::Mul,
                PrimitiveTag::Matmul,
                PrimitiveTag::Conv2d,
                PrimitiveTag::Przs,
                PrimitiveTag::Truncation
            ]
        );
        let empty = PrimitiveProvider::with_seed(PrimitiveRegistry::new(), 1);
        assert!(empty.registered_tags().is_empty());
    }
}
