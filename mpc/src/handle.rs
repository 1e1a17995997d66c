//! Handles to values held by remote parties.

use std::{fmt, marker::PhantomData, sync::Arc};

use uuid::Uuid;

use crate::{
    error::{MpcError, MpcResult, PartyError},
    party::{ObjectId, PartyObject},
    share::Share,
    transport::{PartyRequest, PartyResponse, Transport},
};

/// Handle whose value has not been requested from the party yet.
#[derive(Copy, Clone, Debug)]
pub struct Pending;

/// Handle whose value the party agreed to hand out.
#[derive(Copy, Clone, Debug)]
pub struct Ready;

/// Reference to a share stored at one party.
pub struct ShareHandle<S = Pending> {
    party: usize,
    id: ObjectId,
    transport: Arc<dyn Transport>,
    _state: PhantomData<S>,
}

impl<S> ShareHandle<S> {
    pub fn party(&self) -> usize {
        self.party
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }
}

impl ShareHandle<Pending> {
    pub(crate) fn new(party: usize, id: ObjectId, transport: Arc<dyn Transport>) -> Self {
        Self {
            party,
            id,
            transport,
            _state: PhantomData,
        }
    }

    /// Ask the party to make the share fetchable.
    pub async fn request(&self) -> MpcResult<ShareHandle<Ready>> {
        self.transport
            .call(self.party, PartyRequest::Request { id: self.id })
            .await?;
        Ok(ShareHandle {
            party: self.party,
            id: self.id,
            transport: self.transport.clone(),
            _state: PhantomData,
        })
    }
}

impl ShareHandle<Ready> {
    /// Fetch a copy of the share.
    pub async fn get(&self) -> MpcResult<Share> {
        let response = self
            .transport
            .call(self.party, PartyRequest::Fetch { id: self.id })
            .await?;
        match response {
            PartyResponse::Object(PartyObject::Share(share)) => Ok(share),
            PartyResponse::Object(_) => Err(MpcError::from_party(
                self.party,
                PartyError::WrongObjectKind {
                    id: self.id,
                    expected: "share".into(),
                },
            )),
            _ => Err(PartyResponse::unexpected(self.party).into()),
        }
    }
}

impl<S> Clone for ShareHandle<S> {
    fn clone(&self) -> Self {
        Self {
            party: self.party,
            id: self.id,
            transport: self.transport.clone(),
            _state: PhantomData,
        }
    }
}

impl<S> fmt::Debug for ShareHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareHandle")
            .field("party", &self.party)
            .field("id", &self.id)
            .finish()
    }
}

impl<S> fmt::Display for ShareHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "party {} -> object {}", self.party, self.id)
    }
}

/// Plaintext owned by one party. Only its owner ever sees the value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SecretHandle {
    session: Uuid,
    party: usize,
    id: ObjectId,
}

impl SecretHandle {
    pub(crate) fn new(session: Uuid, party: usize, id: ObjectId) -> Self {
        Self { session, party, id }
    }

    /// Session the secret was placed in.
    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn party(&self) -> usize {
        self.party
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }
}
