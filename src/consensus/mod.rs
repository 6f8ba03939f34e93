//! Hierarchical Consensus: rotating-coordinator consensus over PFD + BEB,
//! one instance per decision (spec.md §4.6). The rank order is peer id,
//! ascending — the lowest id is the highest-ranked coordinator.
//!
//! spec.md §4.6 is more complete than the single surviving
//! `examples/original_source/basic_abstraction/consensus.py` on disk (that
//! file lacks the `finished`/`finished_peers` handshake); spec.md states it
//! consolidates several superseded iterations, so its prose — not the
//! on-disk file — is the source of truth for the round/finished state
//! machine below. `consensus.py` still grounds the shape of the per-instance
//! state (`round`, `proposal`, `proposer`, `delivered`, `peers`) and its
//! `propose`/`receive`/`peer_failure` handler names.
//!
//! All state is owned by the single serial event-loop task (spec.md §5), so
//! no mutex guards it — only the worker ever touches `round`/`proposal`/etc.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::beb::BestEffortBroadcast;
use crate::errors::LinkError;
use crate::peer::PeerId;
use crate::pfd::PerfectFailureDetector;
use crate::runtime::subscribable::Subscribers;
use crate::runtime::{self, EventQueue};

#[derive(Debug, Clone)]
enum HcoEvent {
    AddPeers(Vec<PeerId>),
    Propose(Value),
    Receive(PeerId, Value),
    PeerFailure(PeerId),
    Finished(PeerId),
}

/// `Value` is JSON-encoded to bytes before crossing the wire: bincode
/// cannot deserialize a self-describing type like `serde_json::Value`
/// (its `Deserialize` impl relies on `deserialize_any`, which bincode's
/// format does not support), so the outer bincode frame just carries an
/// opaque `Vec<u8>` holding the JSON encoding.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum WireEvent {
    Receive(Vec<u8>),
    Finished,
}

struct HcoState {
    peers: HashSet<PeerId>,
    detected: HashSet<PeerId>,
    round: u64,
    proposal: Option<Value>,
    proposer: Option<i64>,
    delivered: HashMap<PeerId, bool>,
    finished_peers: HashMap<PeerId, bool>,
    broadcasting: bool,
    decided: Option<Value>,
}

impl HcoState {
    fn new(local_peer: PeerId) -> Self {
        let mut peers = HashSet::new();
        peers.insert(local_peer);
        let delivered = peers.iter().map(|p| (*p, false)).collect();
        HcoState {
            peers,
            detected: HashSet::new(),
            round: 0,
            proposal: None,
            proposer: None,
            delivered,
            finished_peers: HashMap::new(),
            broadcasting: false,
            decided: None,
        }
    }

    fn reset(&mut self) {
        self.round = 0;
        self.proposal = None;
        self.proposer = None;
        self.delivered = self.peers.iter().map(|p| (*p, false)).collect();
        self.broadcasting = false;
        self.decided = None;
    }
}

/// Rotating-coordinator consensus over a shared BEB/PFD pair. Fires
/// subscribers exactly once per instance (until `reset` via `round_update`)
/// with the decided value (spec.md §4.6 "Integrity").
pub struct HierarchicalConsensus {
    local_peer: PeerId,
    beb: Arc<BestEffortBroadcast>,
    beb_client_id: u32,
    queue: EventQueue<HcoEvent>,
    subscribers: Arc<Subscribers<Value>>,
}

impl HierarchicalConsensus {
    pub fn new(
        beb: Arc<BestEffortBroadcast>,
        pfd: &Arc<PerfectFailureDetector>,
        local_peer: PeerId,
        tick: Duration,
    ) -> Arc<Self> {
        let (beb_client_id, mut beb_inbox) = beb.register();
        // The coordinator's own `receive(decided)`/`finished` broadcasts must
        // loop back to itself, exactly like
        // `examples/original_source/basic_abstraction/consensus.py`'s
        // `self.beb.add_peers(self.process_number)`: without it `delivered[self]`
        // can only be set by an inbound `Receive` whose source is this peer,
        // which never arrives, and `round_update` can never advance past
        // `round == local_peer`.
        beb.add_peers([local_peer]);
        let (queue, event_loop) = runtime::channel::<HcoEvent>(tick);
        let subscribers = Arc::new(Subscribers::new());

        let hco = Arc::new(HierarchicalConsensus {
            local_peer,
            beb: beb.clone(),
            beb_client_id,
            queue: queue.clone(),
            subscribers,
        });

        pfd.subscribe_abstraction(queue.sender_handle(), HcoEvent::PeerFailure);

        let beb_forward_queue = queue.clone();
        tokio::spawn(async move {
            while let Some((source, bytes)) = beb_inbox.recv().await {
                match bincode::deserialize::<WireEvent>(&bytes) {
                    Ok(WireEvent::Receive(json)) => match serde_json::from_slice(&json) {
                        Ok(value) => beb_forward_queue.trigger(HcoEvent::Receive(source, value)),
                        Err(e) => log::warn!("consensus: malformed value from {source}: {e}"),
                    },
                    Ok(WireEvent::Finished) => {
                        beb_forward_queue.trigger(HcoEvent::Finished(source));
                    }
                    Err(e) => log::warn!("consensus: malformed frame from {source}: {e}"),
                }
            }
        });

        let hco_for_loop = hco.clone();
        let mut state = HcoState::new(local_peer);
        event_loop.spawn(move |event| {
            let hco = hco_for_loop.clone();
            async move {
                hco.handle(&mut state, event).await;
            }
        });

        hco
    }

    pub fn add_peers(&self, peers: impl IntoIterator<Item = PeerId>) {
        let peers: Vec<PeerId> = peers.into_iter().collect();
        self.beb.add_peers(peers.iter().copied());
        self.queue.trigger(HcoEvent::AddPeers(peers));
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback);
    }

    pub fn subscribe_abstraction<E, F>(&self, sender: mpsc::UnboundedSender<E>, wrap: F)
    where
        E: Send + 'static,
        F: Fn(Value) -> E + Send + Sync + 'static,
    {
        self.subscribers.subscribe_abstraction(sender, wrap);
    }

    /// Proposes `value` for the current decision instance. Ignored (spec.md
    /// §4.6) if a proposal is already recorded for this instance.
    ///
    /// Fails the call outright if `value` would not fit the 1024-byte link
    /// budget once it's eventually wrapped and broadcast (spec.md §7
    /// "oversized serialized msg: fatal to the sending call"), rather than
    /// queuing a proposal that could only be silently dropped much later,
    /// from inside the serial event loop, with no caller left to tell.
    pub fn propose(&self, value: Value) -> Result<(), LinkError> {
        let json = match serde_json::to_vec(&value) {
            Ok(json) => json,
            Err(e) => {
                log::error!("consensus: failed to encode proposed value: {e}");
                return Ok(());
            }
        };
        let wire_bytes = bincode::serialize(&WireEvent::Receive(json)).map_err(LinkError::Encode)?;
        self.beb.check_payload(self.beb_client_id, &wire_bytes)?;

        self.queue.trigger(HcoEvent::Propose(value));
        Ok(())
    }

    async fn handle(&self, state: &mut HcoState, event: HcoEvent) {
        match event {
            HcoEvent::AddPeers(peers) => {
                for peer in peers {
                    if state.peers.insert(peer) {
                        state.delivered.insert(peer, false);
                    }
                }
            }
            HcoEvent::Propose(value) => {
                if state.proposal.is_none() {
                    state.proposal = Some(value);
                }
                self.round_update(state).await;
            }
            HcoEvent::Receive(source, value) => {
                if state.detected.contains(&source) {
                    return;
                }
                let rank = source.number() as i64;
                let self_rank = self.local_peer.number() as i64;
                if rank < self_rank && rank > state.proposer.unwrap_or(-1) {
                    state.proposal = Some(value);
                    state.proposer = Some(rank);
                }
                state.delivered.insert(source, true);
                self.round_update(state).await;
            }
            HcoEvent::PeerFailure(peer) => {
                state.detected.insert(peer);
                self.round_update(state).await;
                state.finished_peers.insert(peer, true);
                self.maybe_decide(state);
            }
            HcoEvent::Finished(source) => {
                state.finished_peers.insert(source, true);
                self.maybe_decide(state);
            }
        }
    }

    async fn round_update(&self, state: &mut HcoState) {
        while (state.round as usize) < state.peers.len()
            && (state.detected.contains(&PeerId::new(state.round))
                || *state.delivered.get(&PeerId::new(state.round)).unwrap_or(&false))
        {
            state.round += 1;
        }

        if state.round as usize == state.peers.len() {
            let decided = state.decided.clone();
            state.reset();
            if let Some(decided) = decided {
                state.decided = Some(decided);
            }
            if let Err(e) = self.send_frame(&WireEvent::Finished).await {
                log::error!("consensus: finished broadcast dropped: {e}");
            }
            self.maybe_decide(state);
            return;
        }

        if state.round == self.local_peer.number()
            && state.proposal.is_some()
            && !state.broadcasting
        {
            state.broadcasting = true;
            let decided = state.proposal.clone().unwrap();
            state.decided = Some(decided.clone());
            match serde_json::to_vec(&decided) {
                Ok(json) => {
                    // `propose` already validated this value fits the link
                    // budget; an error here would mean it changed shape
                    // since then, which can't happen — logged defensively.
                    if let Err(e) = self.send_frame(&WireEvent::Receive(json)).await {
                        log::error!("consensus: broadcast dropped: {e}");
                    }
                }
                Err(e) => log::error!("consensus: failed to encode value: {e}"),
            }
        }
    }

    fn maybe_decide(&self, state: &mut HcoState) {
        let live_peers: Vec<PeerId> = state
            .peers
            .iter()
            .filter(|p| !state.detected.contains(p))
            .copied()
            .collect();
        let all_finished = !live_peers.is_empty()
            && live_peers
                .iter()
                .all(|p| *state.finished_peers.get(p).unwrap_or(&false));

        if all_finished {
            if let Some(decided) = state.decided.take() {
                state.finished_peers.clear();
                self.subscribers.notify(decided);
            }
        }
    }

    async fn send_frame(&self, frame: &WireEvent) -> Result<(), LinkError> {
        let bytes = bincode::serialize(frame).map_err(LinkError::Encode)?;
        self.beb.broadcast(self.beb_client_id, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::oneshot;

    fn unique_dir(label: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "flight-consensus-hco-test-{label}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct Peer {
        pfd: Arc<PerfectFailureDetector>,
        hco: Arc<HierarchicalConsensus>,
    }

    fn spawn_peer(dir: &std::path::Path, id: u64, tick: Duration) -> Peer {
        let link = Arc::new(Link::bind(PeerId::new(id), dir.to_path_buf(), tick).unwrap());
        link.start();
        let pfd = PerfectFailureDetector::new(link.clone(), PeerId::new(id), tick);
        let beb = BestEffortBroadcast::new(link, PeerId::new(id));
        let hco = HierarchicalConsensus::new(beb, &pfd, PeerId::new(id), tick);
        Peer { pfd, hco }
    }

    fn subscribe_once(hco: &HierarchicalConsensus) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let tx = StdMutex::new(Some(tx));
        hco.subscribe(move |value| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(value);
            }
        });
        rx
    }

    #[tokio::test]
    async fn all_correct_peers_decide_the_highest_ranked_proposal() {
        let dir = unique_dir("agree");
        let tick = Duration::from_millis(30);

        let p0 = spawn_peer(&dir, 0, tick);
        let p1 = spawn_peer(&dir, 1, tick);
        let p2 = spawn_peer(&dir, 2, tick);

        for (peer, others) in [
            (&p0, [1u64, 2]),
            (&p1, [0, 2]),
            (&p2, [0, 1]),
        ] {
            let others: Vec<PeerId> = others.into_iter().map(PeerId::new).collect();
            peer.hco.add_peers(others.iter().copied());
            peer.pfd.add_peers(others);
            peer.pfd.start();
        }

        let rx0 = subscribe_once(&p0.hco);
        let rx1 = subscribe_once(&p1.hco);
        let rx2 = subscribe_once(&p2.hco);

        p0.hco.propose(Value::String("A".into())).unwrap();
        p1.hco.propose(Value::String("B".into())).unwrap();
        p2.hco.propose(Value::String("C".into())).unwrap();

        let timeout = Duration::from_secs(2);
        let v0 = tokio::time::timeout(timeout, rx0).await.unwrap().unwrap();
        let v1 = tokio::time::timeout(timeout, rx1).await.unwrap().unwrap();
        let v2 = tokio::time::timeout(timeout, rx2).await.unwrap().unwrap();

        assert_eq!(v0, Value::String("A".into()));
        assert_eq!(v1, Value::String("A".into()));
        assert_eq!(v2, Value::String("A".into()));
    }

    #[tokio::test]
    async fn surviving_peers_decide_next_highest_rank_after_leader_crash() {
        let dir = unique_dir("leader-crash");
        let tick = Duration::from_millis(30);

        // Peer 0 never joins: its socket does not exist, so peers 1 and 2
        // detect it as crashed on their very first probe, matching
        // spec.md §8 scenario 4's "peer 0 stops before the decision fires".
        let p1 = spawn_peer(&dir, 1, tick);
        let p2 = spawn_peer(&dir, 2, tick);

        for (peer, others) in [(&p1, [0u64, 2]), (&p2, [0, 1])] {
            let others: Vec<PeerId> = others.into_iter().map(PeerId::new).collect();
            peer.hco.add_peers(others.iter().copied());
            peer.pfd.add_peers(others);
            peer.pfd.start();
        }

        let rx1 = subscribe_once(&p1.hco);
        let rx2 = subscribe_once(&p2.hco);

        p1.hco.propose(Value::String("B".into())).unwrap();
        p2.hco.propose(Value::String("C".into())).unwrap();

        let timeout = Duration::from_secs(3);
        let v1 = tokio::time::timeout(timeout, rx1).await.unwrap().unwrap();
        let v2 = tokio::time::timeout(timeout, rx2).await.unwrap().unwrap();

        assert_eq!(v1, Value::String("B".into()));
        assert_eq!(v2, Value::String("B".into()));
    }
}
