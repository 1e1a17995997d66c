use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};

use super::{bincode_link, OrchestratorLink, PartyRequest, PartyResponse, Transport, TransportError};
use crate::{
    error::{MpcError, MpcResult},
    party::PartyNode,
};

/// Buffer size of each in-process party link.
const LINK_BUFFER_SIZE: usize = 1 << 16;

type Exchange = (PartyRequest, oneshot::Sender<Option<PartyResponse>>);

/// Parties running as tasks of the current tokio runtime, connected by in-memory pipes.
///
/// Every link is owned by a driver task that completes each request/response exchange
/// even if the caller stops waiting, so a dropped call never leaves its reply in the pipe.
/// Calls to one party are answered in order, calls to different parties run concurrently.
pub struct LocalTransport {
    links: Vec<mpsc::UnboundedSender<Exchange>>,
}

impl LocalTransport {
    /// Spawn `nr_parties` party tasks. Must be called from within a tokio runtime.
    pub fn spawn(nr_parties: usize) -> Self {
        let links = (0..nr_parties)
            .map(|party| {
                let (orchestrator, link) = bincode_link(LINK_BUFFER_SIZE);
                tokio::spawn(PartyNode::new().serve(link));
                let (sender, receiver) = mpsc::unbounded_channel();
                tokio::spawn(drive_link(party, orchestrator, receiver));
                tracing::debug!(party, "spawned local party");
                sender
            })
            .collect();
        Self { links }
    }
}

async fn drive_link(
    party: usize,
    mut link: OrchestratorLink,
    mut exchanges: mpsc::UnboundedReceiver<Exchange>,
) {
    while let Some((request, reply)) = exchanges.recv().await {
        let response = match link.send(request).await {
            Ok(()) => link.next().await.and_then(Result::ok),
            Err(_) => None,
        };
        let closed = response.is_none();
        if reply.send(response).is_err() {
            tracing::trace!(party, "caller dropped before the reply arrived");
        }
        if closed {
            tracing::warn!(party, "party link failed");
            break;
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn num_parties(&self) -> usize {
        self.links.len()
    }

    async fn call(&self, party: usize, request: PartyRequest) -> MpcResult<PartyResponse> {
        let link = self
            .links
            .get(party)
            .ok_or(TransportError::UnknownParty(party))?;
        let (reply, response) = oneshot::channel();
        link.send((request, reply))
            .map_err(|_| TransportError::Send(party))?;
        match response.await {
            Ok(Some(PartyResponse::Error(err))) => Err(MpcError::from_party(party, err)),
            Ok(Some(response)) => Ok(response),
            _ => Err(TransportError::Recv(party).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::{
        encoding::FixedPointEncoder, party::PartyObject, provider::PrimitiveTag, share::Share,
        transport::fan_out,
    };

    fn count_mul() -> PartyRequest {
        PartyRequest::PrimitiveCount {
            tag: PrimitiveTag::Mul,
        }
    }

    #[tokio::test]
    async fn test_dropped_call_does_not_desync_link() {
        let transport = LocalTransport::spawn(1);
        // The fetch fails while the count is still queued, so the count's caller is dropped.
        let result = fan_out(vec![
            transport.call(0, PartyRequest::Fetch { id: 9 }),
            transport.call(0, count_mul()),
        ])
        .await;
        assert!(result.is_err());

        assert!(matches!(
            transport.call(0, count_mul()).await,
            Ok(PartyResponse::Count(0))
        ));
        let share = Share::from_plain(&array![1.0].into_dyn(), FixedPointEncoder::default());
        let store = PartyRequest::Store {
            id: 1,
            object: PartyObject::Share(share),
        };
        assert!(matches!(
            transport.call(0, store).await,
            Ok(PartyResponse::Done)
        ));
        assert!(matches!(
            transport.call(3, PartyRequest::Request { id: 1 }).await,
            Err(MpcError::Transport(TransportError::UnknownParty(3)))
        ));
    }
}
