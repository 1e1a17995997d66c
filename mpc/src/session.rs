use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    comparison::ComparisonProtocol,
    config::SessionConfig,
    encoding::{FixedPointEncoder, Ring},
    error::{ConfigError, MpcResult, ShapeError},
    handle::{SecretHandle, ShareHandle},
    ops::{self, Op},
    party::{ObjectId, PartyObject},
    provider::{
        GenerateArgs, Populate, Primitive, PrimitiveParams, PrimitiveProvider, PrimitiveSink,
        PrimitiveTag,
    },
    sharing::Secret,
    transport::{PartyRequest, PartyResponse, Transport},
};

type ShapeKey = (Op, Vec<usize>, Vec<usize>);

/// Primitive store of one party, reached through the transport.
pub struct PartyStore {
    party: usize,
    transport: Arc<dyn Transport>,
}

impl PartyStore {
    pub fn party(&self) -> usize {
        self.party
    }
}

#[async_trait]
impl PrimitiveSink for PartyStore {
    async fn populate(
        &self,
        tag: PrimitiveTag,
        key: PrimitiveParams,
        primitive: Primitive,
    ) -> MpcResult<()> {
        self.transport
            .call(
                self.party,
                PartyRequest::Populate {
                    tag,
                    key,
                    primitive,
                },
            )
            .await?;
        Ok(())
    }
}

/// Parties, parameters and collaborators of one computation.
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    provider: Arc<PrimitiveProvider>,
    protocol: Option<Arc<dyn ComparisonProtocol>>,
    stores: Vec<PartyStore>,
    setup_done: AtomicBool,
    next_object: AtomicU64,
    shapes: Mutex<HashMap<ShapeKey, Vec<usize>>>,
}

impl Session {
    /// Create session over the parties reachable through `transport`.
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        provider: Arc<PrimitiveProvider>,
    ) -> MpcResult<Self> {
        config.validate()?;
        let nr_parties = transport.num_parties();
        if nr_parties < 2 {
            return Err(ConfigError::Invalid(format!(
                "a session needs at least 2 parties, got {nr_parties}"
            ))
            .into());
        }
        let stores = (0..nr_parties)
            .map(|party| PartyStore {
                party,
                transport: transport.clone(),
            })
            .collect();
        Ok(Self {
            id: Uuid::new_v4(),
            config,
            transport,
            provider,
            protocol: None,
            stores,
            setup_done: AtomicBool::new(false),
            next_object: AtomicU64::new(0),
            shapes: Mutex::new(HashMap::new()),
        })
    }

    /// Attach comparison protocol used by `le`, `lt`, `eq` and friends.
    pub fn with_comparison(mut self, protocol: Arc<dyn ComparisonProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Send session parameters to every party and set up PRZS generators.
    pub async fn setup(&self) -> MpcResult<()> {
        let nr_parties = self.nr_parties();
        self.transport
            .call_all(
                (0..nr_parties)
                    .map(|rank| PartyRequest::Setup {
                        session: self.id,
                        rank,
                        nr_parties,
                        config: self.config,
                    })
                    .collect(),
            )
            .await?;

        self.deal(PrimitiveTag::Przs, PrimitiveParams::Przs { nr_parties })
            .await?;
        self.transport
            .call_all(vec![PartyRequest::InitPrzs; nr_parties])
            .await?;

        self.setup_done.store(true, Ordering::SeqCst);
        tracing::debug!(session = %self.id, nr_parties, "session setup complete");
        Ok(())
    }

    pub fn is_setup(&self) -> bool {
        self.setup_done.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_setup(&self) -> Result<(), ConfigError> {
        if self.is_setup() {
            Ok(())
        } else {
            Err(ConfigError::SetupIncomplete)
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn nr_parties(&self) -> usize {
        self.stores.len()
    }

    pub fn encoder(&self) -> FixedPointEncoder {
        self.config.encoder()
    }

    pub fn ring(&self) -> Ring {
        self.config.ring()
    }

    pub fn provider(&self) -> &Arc<PrimitiveProvider> {
        &self.provider
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Comparison protocol of this session.
    pub fn protocol(&self) -> Result<&Arc<dyn ComparisonProtocol>, ConfigError> {
        self.protocol
            .as_ref()
            .ok_or(ConfigError::MissingComparisonProtocol)
    }

    /// Primitive stores of all parties in rank order.
    pub fn primitive_stores(&self) -> &[PartyStore] {
        &self.stores
    }

    /// Number of unused primitives for `tag` at party `rank`.
    pub async fn primitive_count(&self, rank: usize, tag: PrimitiveTag) -> MpcResult<usize> {
        match self
            .transport
            .call(rank, PartyRequest::PrimitiveCount { tag })
            .await?
        {
            PartyResponse::Count(count) => Ok(count),
            _ => Err(PartyResponse::unexpected(rank).into()),
        }
    }

    /// Place a plaintext at party `rank`. The orchestrator only keeps a handle to it.
    pub async fn send_secret(
        &self,
        rank: usize,
        secret: impl Into<Secret>,
    ) -> MpcResult<SecretHandle> {
        let id = self.next_object_id();
        self.transport
            .call(
                rank,
                PartyRequest::Store {
                    id,
                    object: PartyObject::Secret(secret.into()),
                },
            )
            .await?;
        Ok(SecretHandle::new(self.id, rank, id))
    }

    /// Shape of `op(lhs, rhs)`, memoised per session.
    pub fn infer_shape(
        &self,
        op: &Op,
        lhs: Option<&[usize]>,
        rhs: Option<&[usize]>,
    ) -> Result<Vec<usize>, ShapeError> {
        let (lhs, rhs) = match (lhs, rhs) {
            (Some(lhs), Some(rhs)) => (lhs, rhs),
            _ => return ops::infer_shape(op, lhs, rhs),
        };
        let key = (*op, lhs.to_vec(), rhs.to_vec());
        let mut shapes = self
            .shapes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(shape) = shapes.get(&key) {
            return Ok(shape.clone());
        }
        let shape = ops::infer_shape(op, Some(lhs), Some(rhs))?;
        shapes.insert(key, shape.clone());
        Ok(shape)
    }

    /// Have the provider generate one primitive batch and distribute it to all parties.
    pub(crate) async fn deal(&self, tag: PrimitiveTag, params: PrimitiveParams) -> MpcResult<()> {
        let args = GenerateArgs {
            nr_parties: self.nr_parties(),
            ring: self.ring(),
            params: params.clone(),
        };
        self.provider
            .generate_primitives(tag, &self.stores, &args, Populate::Key(params))
            .await?;
        Ok(())
    }

    pub(crate) fn next_object_id(&self) -> ObjectId {
        self.next_object.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn handle(&self, party: usize, id: ObjectId) -> ShareHandle {
        ShareHandle::new(party, id, self.transport.clone())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("nr_parties", &self.nr_parties())
            .field("protocol", &self.protocol.as_ref().map(|p| p.name()))
            .field("setup", &self.is_setup())
            .finish()
    }
}
