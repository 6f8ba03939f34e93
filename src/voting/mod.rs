//! Majority Voting: the top-level orchestrator. Owns one Link, PFD, BEB,
//! ERB, and two Hierarchical Consensus instances (one for the vote itself,
//! one dedicated to leader election) sharing that BEB — exactly the wiring
//! in `examples/original_source/basic_abstraction/voting.py`'s
//! `MajorityVoting.__init__` (`self.hco` and `self.lel_hco` both built over
//! the same `self.beb`).
//!
//! `vote`/`get_leader` are the two entry points (spec.md §4.8); everything
//! else is a per-peer handler invoked serially by this abstraction's own
//! event loop, fed by ERB deliveries and by PFD/consensus/election
//! subscriptions.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::beb::BestEffortBroadcast;
use crate::consensus::HierarchicalConsensus;
use crate::election::LeaderElection;
use crate::erb::EagerReliableBroadcast;
use crate::errors::LinkError;
use crate::link::Link;
use crate::peer::PeerId;
use crate::pfd::PerfectFailureDetector;
use crate::runtime::{self, EventQueue};

/// `Value` crosses the wire JSON-encoded to a `Vec<u8>` first — see the
/// note on `consensus::WireEvent` for why bincode can't carry a
/// self-describing `serde_json::Value` directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum VoteFrame {
    NewVote(Vec<u8>),
    VoteReceive(bool),
}

#[derive(Debug, Clone)]
enum VotingEvent {
    AddPeers(Vec<PeerId>),
    PeerFailure(PeerId),
    NewLeader(PeerId),
    ConsensusDecided(Value),
    Wire(PeerId, VoteFrame),
}

struct VotingState {
    peers: HashSet<PeerId>,
    detected: HashSet<PeerId>,
    leader: Option<PeerId>,
    votes: Vec<(bool, u64)>,
    voted: std::collections::HashMap<PeerId, bool>,
    proposition: Option<Value>,
    consensus_result: Option<bool>,
}

/// Shared snapshot readable from the `vote`/`get_leader` entry points
/// without going through the serial event queue: spec.md's
/// `threading.Event`-based waits become `tokio::sync::watch` channels here,
/// and the last-known leader/consensus result are mirrored into a small
/// mutex the entry points can read directly once the wait resolves.
struct Shared {
    leader: Mutex<Option<PeerId>>,
    consensus_result: Mutex<Option<bool>>,
    alive: AtomicBool,
    finished_election: watch::Sender<bool>,
    finished_consensus: watch::Sender<bool>,
}

pub struct MajorityVoting {
    local_peer: PeerId,
    link: Arc<Link>,
    pfd: Arc<PerfectFailureDetector>,
    erb: Arc<EagerReliableBroadcast>,
    erb_client_id: u32,
    hco: Arc<HierarchicalConsensus>,
    lel: Arc<LeaderElection>,
    queue: EventQueue<VotingEvent>,
    shared: Arc<Shared>,
    decide_callback: Arc<dyn Fn(Value) -> bool + Send + Sync>,
    deliver_callback: Arc<dyn Fn(Value) + Send + Sync>,
}

impl MajorityVoting {
    pub fn bind(
        process_number: PeerId,
        socket_dir: impl Into<PathBuf>,
        tick: Duration,
        ring_buffer_capacity: usize,
        decide_callback: impl Fn(Value) -> bool + Send + Sync + 'static,
        deliver_callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> Result<Arc<Self>, LinkError> {
        let link = Arc::new(Link::bind(process_number, socket_dir, tick)?);

        let pfd = PerfectFailureDetector::new(link.clone(), process_number, tick);
        let beb = BestEffortBroadcast::new(link.clone(), process_number);
        let erb = EagerReliableBroadcast::new(beb.clone(), process_number, ring_buffer_capacity);
        erb.add_peers([process_number]);

        let hco = HierarchicalConsensus::new(beb.clone(), &pfd, process_number, tick);
        let lel_hco = HierarchicalConsensus::new(beb, &pfd, process_number, tick);
        let lel = LeaderElection::new(&pfd, lel_hco, process_number, tick);

        let (erb_client_id, mut erb_inbox) = erb.register();
        let (queue, event_loop) = runtime::channel::<VotingEvent>(tick);

        pfd.subscribe_abstraction(queue.sender_handle(), VotingEvent::PeerFailure);
        lel.subscribe_abstraction(queue.sender_handle(), VotingEvent::NewLeader);
        hco.subscribe_abstraction(queue.sender_handle(), VotingEvent::ConsensusDecided);

        let (finished_election, _finished_election_rx) = watch::channel(false);
        let (finished_consensus, _finished_consensus_rx) = watch::channel(true);
        let shared = Arc::new(Shared {
            leader: Mutex::new(None),
            consensus_result: Mutex::new(None),
            alive: AtomicBool::new(true),
            finished_election,
            finished_consensus,
        });

        let voting = Arc::new(MajorityVoting {
            local_peer: process_number,
            link: link.clone(),
            pfd: pfd.clone(),
            erb: erb.clone(),
            erb_client_id,
            hco,
            lel: lel.clone(),
            queue: queue.clone(),
            shared,
            decide_callback: Arc::new(decide_callback),
            deliver_callback: Arc::new(deliver_callback),
        });

        let wire_queue = queue.clone();
        tokio::spawn(async move {
            while let Some((source, bytes)) = erb_inbox.recv().await {
                match bincode::deserialize::<VoteFrame>(&bytes) {
                    Ok(frame) => wire_queue.trigger(VotingEvent::Wire(source, frame)),
                    Err(e) => log::warn!("voting: malformed frame from {source}: {e}"),
                }
            }
        });

        let voting_for_loop = voting.clone();
        let mut state = VotingState {
            peers: [process_number].into_iter().collect(),
            detected: HashSet::new(),
            leader: None,
            votes: Vec::new(),
            voted: [(process_number, false)].into_iter().collect(),
            proposition: None,
            consensus_result: None,
        };
        event_loop.spawn(move |event| {
            let voting = voting_for_loop.clone();
            async move {
                voting.handle(&mut state, event).await;
            }
        });

        link.start();
        pfd.start();

        Ok(voting)
    }

    pub fn add_peers(&self, peers: impl IntoIterator<Item = PeerId>) {
        let peers: Vec<PeerId> = peers.into_iter().collect();
        self.pfd.add_peers(peers.iter().copied());
        self.erb.add_peers(peers.iter().copied());
        self.hco.add_peers(peers.iter().copied());
        self.lel.add_peers(peers.iter().copied());
        self.queue.trigger(VotingEvent::AddPeers(peers));
    }

    pub fn start(&self) {
        self.lel.start();
    }

    pub fn stop(&self) {
        self.shared.alive.store(false, Ordering::Release);
        self.link.stop();
        self.pfd.stop();
        self.queue.stop();
    }

    /// Leader-only. Waits for a settled election, then for the previous
    /// consensus round to finish, then ERB-broadcasts `new_vote(value)` and
    /// waits for the new consensus round to settle (spec.md §4.8).
    ///
    /// Fails the call outright if `value` cannot fit the link budget once
    /// wrapped and broadcast (spec.md §7 "oversized serialized msg: fatal to
    /// the sending call"), surfaced via `send_frame`'s `?` rather than
    /// silently returning a timeout-indistinguishable `false`.
    pub async fn vote(&self, value: Value, timeout: Duration) -> Result<bool, LinkError> {
        let third = timeout / 3;

        let mut election_rx = self.shared.finished_election.subscribe();
        if tokio::time::timeout(third, election_rx.wait_for(|v| *v))
            .await
            .is_err()
        {
            return Ok(false);
        }

        if *self.shared.leader.lock() != Some(self.local_peer)
            || !self.shared.alive.load(Ordering::Acquire)
        {
            return Ok(false);
        }

        let mut consensus_rx = self.shared.finished_consensus.subscribe();
        if tokio::time::timeout(third, consensus_rx.wait_for(|v| *v))
            .await
            .is_err()
        {
            return Ok(false);
        }
        let _ = self.shared.finished_consensus.send(false);

        let json = match serde_json::to_vec(&value) {
            Ok(json) => json,
            Err(e) => {
                log::error!("voting: failed to encode vote value: {e}");
                return Ok(false);
            }
        };
        self.send_frame(&VoteFrame::NewVote(json)).await?;

        if tokio::time::timeout(third, consensus_rx.wait_for(|v| *v))
            .await
            .is_err()
        {
            return Ok(false);
        }

        Ok((*self.shared.consensus_result.lock()).unwrap_or(false))
    }

    pub async fn get_leader(&self, timeout: Duration) -> Option<PeerId> {
        let third = timeout / 3;
        let mut election_rx = self.shared.finished_election.subscribe();
        if tokio::time::timeout(third, election_rx.wait_for(|v| *v))
            .await
            .is_err()
        {
            return None;
        }
        *self.shared.leader.lock()
    }

    async fn handle(&self, state: &mut VotingState, event: VotingEvent) {
        match event {
            VotingEvent::AddPeers(peers) => {
                for peer in peers {
                    state.peers.insert(peer);
                    state.voted.entry(peer).or_insert(false);
                }
            }
            VotingEvent::PeerFailure(peer) => {
                log::debug!("voting({}): peer {peer} crashed", self.local_peer);
                if state.leader == Some(peer) {
                    state.leader = None;
                    let _ = self.shared.finished_election.send(false);
                }
                state.detected.insert(peer);
                self.erb.remove_peer(peer);
                self.finished_vote(state, peer);
            }
            VotingEvent::NewLeader(peer) => {
                log::debug!("voting({}): new leader {peer}", self.local_peer);
                state.leader = Some(peer);
                *self.shared.leader.lock() = Some(peer);
                let _ = self.shared.finished_election.send(true);
            }
            VotingEvent::Wire(source, VoteFrame::NewVote(json)) => {
                if Some(source) != state.leader {
                    return;
                }
                let value = match serde_json::from_slice::<Value>(&json) {
                    Ok(value) => value,
                    Err(e) => {
                        log::warn!("voting: malformed vote value from {source}: {e}");
                        return;
                    }
                };
                let _ = self.shared.finished_consensus.send(false);
                state.proposition = Some(value.clone());
                let vote = (self.decide_callback)(value);
                if let Err(e) = self.send_frame(&VoteFrame::VoteReceive(vote)).await {
                    log::error!("voting: failed to send vote_receive: {e}");
                }
            }
            VotingEvent::Wire(source, VoteFrame::VoteReceive(vote)) => {
                match state.votes.iter_mut().find(|(v, _)| *v == vote) {
                    Some((_, count)) => *count += 1,
                    None => state.votes.push((vote, 1)),
                }
                self.finished_vote(state, source);
            }
            VotingEvent::ConsensusDecided(value) => {
                let decided = value.as_bool().unwrap_or(false);
                log::debug!("voting({}): consensus decided {decided}", self.local_peer);
                state.consensus_result = Some(decided);
                *self.shared.consensus_result.lock() = Some(decided);
                if decided {
                    if let Some(proposition) = state.proposition.clone() {
                        (self.deliver_callback)(proposition);
                    }
                }
                let _ = self.shared.finished_consensus.send(true);
            }
        }
    }

    fn finished_vote(&self, state: &mut VotingState, peer: PeerId) {
        state.voted.insert(peer, true);
        let live: Vec<PeerId> = state.peers.difference(&state.detected).copied().collect();
        let all_voted = !live.is_empty() && live.iter().all(|p| *state.voted.get(p).unwrap_or(&false));
        if !all_voted {
            return;
        }

        let winner = state
            .votes
            .iter()
            .max_by_key(|(_, count)| *count)
            .map(|(vote, _)| *vote)
            .unwrap_or(false);
        log::debug!("voting({}): voting finished: {:?} -> {winner}", self.local_peer, state.votes);
        state.votes.clear();
        state.voted = live.iter().map(|p| (*p, false)).collect();
        if let Err(e) = self.hco.propose(Value::Bool(winner)) {
            log::error!("voting: winner proposal dropped: {e}");
        }
    }

    async fn send_frame(&self, frame: &VoteFrame) -> Result<(), LinkError> {
        let bytes = bincode::serialize(frame).map_err(LinkError::Encode)?;
        self.erb.broadcast(self.erb_client_id, bytes).await
    }
}
