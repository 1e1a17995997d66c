use std::collections::{HashMap, VecDeque};

use crate::{
    error::PartyError,
    provider::{Primitive, PrimitiveParams, PrimitiveTag},
};

/// Party-local store of crypto primitives handed out by the dealer.
/// Primitives are served in the order they were populated, and each one is served at most once.
#[derive(Debug, Default)]
pub struct PrimitiveStore {
    entries: HashMap<PrimitiveTag, HashMap<PrimitiveParams, VecDeque<Primitive>>>,
}

impl PrimitiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add primitive for the given operation and key.
    pub fn populate(&mut self, tag: PrimitiveTag, key: PrimitiveParams, primitive: Primitive) {
        self.entries
            .entry(tag)
            .or_default()
            .entry(key)
            .or_default()
            .push_back(primitive);
    }

    /// Look at the next primitive without consuming it.
    pub fn peek(&self, tag: PrimitiveTag, key: &PrimitiveParams) -> Result<&Primitive, PartyError> {
        self.entries
            .get(&tag)
            .and_then(|queues| queues.get(key))
            .and_then(|queue| queue.front())
            .ok_or_else(|| exhausted(tag, key))
    }

    /// Remove and return the next primitive.
    pub fn take(
        &mut self,
        tag: PrimitiveTag,
        key: &PrimitiveParams,
    ) -> Result<Primitive, PartyError> {
        let queues = self.entries.get_mut(&tag).ok_or_else(|| exhausted(tag, key))?;
        let primitive = queues
            .get_mut(key)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| exhausted(tag, key))?;
        if queues.get(key).map_or(false, VecDeque::is_empty) {
            queues.remove(key);
        }
        Ok(primitive)
    }

    /// Number of unused primitives for the given operation.
    pub fn count(&self, tag: PrimitiveTag) -> usize {
        self.entries
            .get(&tag)
            .map_or(0, |queues| queues.values().map(VecDeque::len).sum())
    }
}

fn exhausted(tag: PrimitiveTag, key: &PrimitiveParams) -> PartyError {
    PartyError::PrimitiveExhausted {
        tag,
        key: key.to_string(),
    }
}
