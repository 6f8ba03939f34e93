//! Hierarchical Leader Election: reuses a dedicated Hierarchical Consensus
//! instance to agree on `min(peers \ detected)` (spec.md §4.7). Grounded in
//! `examples/original_source/basic_abstraction/leader.py`'s `LeaderElection`
//! — subscribes to PFD crash notifications and to its HCO's decisions,
//! re-proposing whenever the decided value turns out to already be detected.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::consensus::HierarchicalConsensus;
use crate::peer::PeerId;
use crate::pfd::PerfectFailureDetector;
use crate::runtime::subscribable::Subscribers;
use crate::runtime::{self, EventQueue};

#[derive(Debug, Clone)]
enum LelEvent {
    Start,
    AddPeers(Vec<PeerId>),
    PeerFailure(PeerId),
    Decided(Value),
}

struct LelState {
    peers: HashSet<PeerId>,
    detected: HashSet<PeerId>,
    leader: Option<PeerId>,
    in_election: bool,
}

/// Eventually settles on the highest-ranked surviving peer as leader at
/// every correct peer (spec.md §4.7 Guarantee).
pub struct LeaderElection {
    hco: Arc<HierarchicalConsensus>,
    queue: EventQueue<LelEvent>,
    subscribers: Arc<Subscribers<PeerId>>,
}

impl LeaderElection {
    pub fn new(
        pfd: &Arc<PerfectFailureDetector>,
        hco: Arc<HierarchicalConsensus>,
        local_peer: PeerId,
        tick: Duration,
    ) -> Arc<Self> {
        let (queue, event_loop) = runtime::channel::<LelEvent>(tick);
        let subscribers = Arc::new(Subscribers::new());

        pfd.subscribe_abstraction(queue.sender_handle(), LelEvent::PeerFailure);
        hco.subscribe_abstraction(queue.sender_handle(), LelEvent::Decided);

        let lel = Arc::new(LeaderElection {
            hco: hco.clone(),
            queue: queue.clone(),
            subscribers,
        });

        let lel_for_loop = lel.clone();
        let mut state = LelState {
            peers: [local_peer].into_iter().collect(),
            detected: HashSet::new(),
            leader: None,
            in_election: false,
        };
        event_loop.spawn(move |event| {
            let lel = lel_for_loop.clone();
            async move {
                lel.handle(&mut state, event).await;
            }
        });

        lel
    }

    pub fn add_peers(&self, peers: impl IntoIterator<Item = PeerId>) {
        let peers: Vec<PeerId> = peers.into_iter().collect();
        self.hco.add_peers(peers.iter().copied());
        self.queue.trigger(LelEvent::AddPeers(peers));
    }

    /// Kicks off the first election. Idempotent with the crash-triggered
    /// re-elections that follow.
    pub fn start(&self) {
        self.queue.trigger(LelEvent::Start);
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback);
    }

    pub fn subscribe_abstraction<E, F>(&self, sender: mpsc::UnboundedSender<E>, wrap: F)
    where
        E: Send + 'static,
        F: Fn(PeerId) -> E + Send + Sync + 'static,
    {
        self.subscribers.subscribe_abstraction(sender, wrap);
    }

    async fn handle(&self, state: &mut LelState, event: LelEvent) {
        match event {
            LelEvent::Start => {
                self.election(state);
            }
            LelEvent::AddPeers(peers) => {
                state.peers.extend(peers);
            }
            LelEvent::PeerFailure(peer) => {
                state.detected.insert(peer);
                self.election(state);
            }
            LelEvent::Decided(value) => {
                state.in_election = false;
                let Some(decided) = value.as_u64().map(PeerId::new) else {
                    log::warn!("election: non-integer decision {value:?}, restarting election");
                    self.election(state);
                    return;
                };
                if state.peers.contains(&decided) && !state.detected.contains(&decided) {
                    log::debug!("election: new leader {decided}");
                    state.leader = Some(decided);
                    self.subscribers.notify(decided);
                } else {
                    self.election(state);
                }
            }
        }
    }

    fn election(&self, state: &mut LelState) {
        if state.in_election {
            return;
        }
        let candidate = state.peers.difference(&state.detected).min().copied();
        let Some(candidate) = candidate else {
            log::warn!("election: no surviving peer to elect");
            return;
        };
        state.in_election = true;
        state.leader = None;
        if let Err(e) = self
            .hco
            .propose(Value::Number(serde_json::Number::from(candidate.number())))
        {
            log::error!("election: proposal dropped: {e}");
            state.in_election = false;
        }
    }
}
