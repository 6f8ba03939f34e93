//! Best-Effort Broadcast: if the sender is correct, every correct peer
//! eventually delivers (spec.md §4.4). Grounded in
//! `examples/original_source/basic_abstraction/broadcast.py`'s
//! `BestEffortBroadcast`, which simply fans a send out to every known peer
//! over the link.
//!
//! `BestEffortBroadcast` is itself Registrable: several upper-layer clients
//! can share one broadcast channel over the link, each addressed by its own
//! `client_id` — this is how a single best-effort channel serves both the
//! main consensus instance and the dedicated leader-election consensus
//! instance in `voting`, mirroring
//! `examples/original_source/basic_abstraction/voting.py`'s single
//! `self.beb` passed to both `self.hco` and `self.lel_hco`.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::LinkError;
use crate::link::Link;
use crate::peer::PeerId;
use crate::runtime::registrable::ChannelRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BebFrame {
    origin: PeerId,
    client_id: u32,
    payload: Vec<u8>,
}

pub type Inbound = (PeerId, Vec<u8>);

pub struct BestEffortBroadcast {
    local_peer: PeerId,
    link: Arc<Link>,
    link_callback_id: u32,
    peers: Mutex<HashSet<PeerId>>,
    registry: Arc<ChannelRegistry<Inbound>>,
}

impl BestEffortBroadcast {
    pub fn new(link: Arc<Link>, local_peer: PeerId) -> Arc<Self> {
        let (link_callback_id, mut inbox) = link.register();
        let registry = Arc::new(ChannelRegistry::new());

        let registry_for_task = registry.clone();
        tokio::spawn(async move {
            while let Some((source, bytes)) = inbox.recv().await {
                match bincode::deserialize::<BebFrame>(&bytes) {
                    Ok(frame) => {
                        if !registry_for_task.dispatch(frame.client_id, (frame.origin, frame.payload)) {
                            log::warn!(
                                "beb: no registrant for client_id {} (from {source})",
                                frame.client_id
                            );
                        }
                    }
                    Err(e) => log::warn!("beb: malformed frame from {source}: {e}"),
                }
            }
        });

        Arc::new(BestEffortBroadcast {
            local_peer,
            link,
            link_callback_id,
            peers: Mutex::new(HashSet::new()),
            registry,
        })
    }

    /// Idempotent: adding the same peer twice leaves membership unchanged.
    pub fn add_peers(&self, peers: impl IntoIterator<Item = PeerId>) {
        let mut guard = self.peers.lock();
        for peer in peers {
            guard.insert(peer);
        }
    }

    /// Removes a peer from the fan-out set, e.g. once it's been detected as
    /// crashed (spec.md §4.8 "remove p from ERB membership").
    pub fn remove_peer(&self, peer: PeerId) {
        self.peers.lock().remove(&peer);
    }

    pub fn register(&self) -> (u32, mpsc::UnboundedReceiver<Inbound>) {
        self.registry.register()
    }

    /// Sends `receive(payload)` to every peer in the membership set,
    /// including self if self was added (matching the reference
    /// implementation's pattern of adding one's own process number so a
    /// broadcaster also delivers to itself over the loopback link).
    ///
    /// An oversized payload fails the whole call (spec.md §7 "oversized
    /// serialized msg: fatal to the sending call"), distinct from a plain
    /// transport write failure to one peer, which `Link::send` itself
    /// already logs and drops without surfacing an error here.
    pub async fn broadcast(&self, client_id: u32, payload: Vec<u8>) -> Result<(), LinkError> {
        let frame = BebFrame {
            origin: self.local_peer,
            client_id,
            payload,
        };
        let bytes = bincode::serialize(&frame).map_err(LinkError::Encode)?;

        let targets: Vec<PeerId> = self.peers.lock().iter().copied().collect();
        for peer in targets {
            self.link.send(peer, self.link_callback_id, &bytes).await?;
        }
        Ok(())
    }

    /// The link-level frame size `broadcast(client_id, payload)` would
    /// produce, without sending anything — lets upper layers reject an
    /// oversized payload before it's queued for a broadcast that might
    /// only happen much later (spec.md §7).
    pub fn check_payload(&self, client_id: u32, payload: &[u8]) -> Result<(), LinkError> {
        let frame = BebFrame {
            origin: self.local_peer,
            client_id,
            payload: payload.to_vec(),
        };
        let bytes = bincode::serialize(&frame).map_err(LinkError::Encode)?;
        crate::link::check_budget(crate::link::frame_len(self.link_callback_id, &bytes)?)
    }
}
