//! Perfect Failure Detector: periodic heartbeats over the link, eventually
//! detecting every crashed peer and never permanently accusing a correct one
//! (spec.md §4.3). Grounded in
//! `examples/original_source/basic_abstraction/failure_detectors.py`: a
//! `TimeoutThread` wakes every `timeout_time`, sends a heartbeat request to
//! every peer not yet detected, then reclassifies anyone who didn't reply
//! since the last tick as crashed.
//!
//! `peers`/`detected`/`correct` are guarded by one `parking_lot::Mutex`
//! (spec.md §5 "Shared resources") because they're touched both by this
//! periodic task and by the link's direct dispatch of inbound
//! request/reply messages — unlike the other abstractions in this crate,
//! the failure detector does not route its own messages through a serial
//! event queue first.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::errors::LinkError;
use crate::link::Link;
use crate::peer::PeerId;
use crate::runtime::subscribable::Subscribers;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum Heartbeat {
    Request,
    Reply,
}

#[derive(Default)]
struct PfdState {
    peers: HashSet<PeerId>,
    detected: HashSet<PeerId>,
    correct: HashSet<PeerId>,
}

pub struct PerfectFailureDetector {
    local_peer: PeerId,
    link: Arc<Link>,
    callback_id: u32,
    state: Arc<Mutex<PfdState>>,
    subscribers: Arc<Subscribers<PeerId>>,
    alive: Arc<AtomicBool>,
    tick: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PerfectFailureDetector {
    pub fn new(link: Arc<Link>, local_peer: PeerId, tick: Duration) -> Arc<Self> {
        let (callback_id, mut inbox) = link.register();
        let state = Arc::new(Mutex::new(PfdState::default()));
        let subscribers = Arc::new(Subscribers::new());
        let alive = Arc::new(AtomicBool::new(false));

        let pfd = Arc::new(PerfectFailureDetector {
            local_peer,
            link: link.clone(),
            callback_id,
            state: state.clone(),
            subscribers,
            alive: alive.clone(),
            tick,
            tasks: Mutex::new(Vec::new()),
        });

        let link_for_receive = link.clone();
        let state_for_receive = state.clone();
        let alive_for_receive = alive.clone();
        let receive_task = tokio::spawn(async move {
            while let Some((source, payload)) = inbox.recv().await {
                if !alive_for_receive.load(Ordering::Acquire) {
                    continue;
                }
                match bincode::deserialize::<Heartbeat>(&payload) {
                    Ok(Heartbeat::Request) => {
                        if let Err(e) = link_for_receive
                            .send(
                                source,
                                callback_id,
                                &bincode::serialize(&Heartbeat::Reply).unwrap(),
                            )
                            .await
                        {
                            match e {
                                LinkError::MessageTooLarge { .. } => {
                                    log::error!("pfd: heartbeat reply to {source} exceeds link budget: {e}")
                                }
                                _ => log::debug!("pfd: reply to {source} dropped: {e}"),
                            }
                        }
                    }
                    Ok(Heartbeat::Reply) => {
                        state_for_receive.lock().correct.insert(source);
                    }
                    Err(e) => log::warn!("pfd: malformed heartbeat from {source}: {e}"),
                }
            }
        });
        pfd.tasks.lock().push(receive_task);

        pfd
    }

    pub fn add_peers(&self, peers: impl IntoIterator<Item = PeerId>) {
        let mut state = self.state.lock();
        for peer in peers {
            state.peers.insert(peer);
        }
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback);
    }

    pub fn subscribe_abstraction<E, F>(&self, sender: tokio::sync::mpsc::UnboundedSender<E>, wrap: F)
    where
        E: Send + 'static,
        F: Fn(PeerId) -> E + Send + Sync + 'static,
    {
        self.subscribers.subscribe_abstraction(sender, wrap);
    }

    pub fn detected(&self) -> HashSet<PeerId> {
        self.state.lock().detected.clone()
    }

    pub fn is_detected(&self, peer: PeerId) -> bool {
        self.state.lock().detected.contains(&peer)
    }

    /// Starts the periodic probe task, following spec.md §4.3's four steps
    /// in order: (1) request a heartbeat from every peer not yet detected,
    /// (2) sleep one tick to give the request/reply round trip time to
    /// complete, (3) under the shared mutex, move anyone who didn't reply
    /// during that sleep into `detected` and notify subscribers exactly
    /// once per (observer, suspect) pair, (4) clear `correct` for the next
    /// round. The classification in step 3 must only ever judge replies
    /// collected during the step-2 sleep that follows the matching step-1
    /// request — doing it any earlier would flag a live peer that simply
    /// hasn't had time to reply yet.
    pub fn start(self: &Arc<Self>) {
        self.alive.store(true, Ordering::Release);
        let pfd = self.clone();
        let period = self.tick / 10;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // tokio::time::interval's first tick resolves immediately; consume
            // it here so the step-2 sleep below always spans a full period.
            interval.tick().await;
            loop {
                if !pfd.alive.load(Ordering::Acquire) {
                    break;
                }

                // 1. request a heartbeat from every peer not yet detected.
                let targets: Vec<PeerId> = {
                    let state = pfd.state.lock();
                    state.peers.difference(&state.detected).copied().collect()
                };
                for peer in &targets {
                    if let Err(e) = pfd
                        .link
                        .send(
                            *peer,
                            pfd.callback_id,
                            &bincode::serialize(&Heartbeat::Request).unwrap(),
                        )
                        .await
                    {
                        match e {
                            LinkError::MessageTooLarge { .. } => {
                                log::error!("pfd: heartbeat request to {peer} exceeds link budget: {e}")
                            }
                            _ => log::debug!("pfd: request to {peer} dropped: {e}"),
                        }
                    }
                }

                // 2. sleep one tick, giving replies time to arrive.
                interval.tick().await;
                if !pfd.alive.load(Ordering::Acquire) {
                    break;
                }

                // 3. classify against replies collected during that sleep,
                // then 4. clear `correct` for the next round. The mutex stays
                // held through subscriber notification (spec.md §5) so a
                // concurrent add_peers/classification can't interleave with
                // a partially-delivered notification round.
                {
                    let mut state = pfd.state.lock();
                    let correct = std::mem::take(&mut state.correct);
                    let mut newly = Vec::new();
                    for peer in state.peers.difference(&state.detected).copied().collect::<Vec<_>>() {
                        if !correct.contains(&peer) {
                            state.detected.insert(peer);
                            newly.push(peer);
                        }
                    }
                    for peer in newly {
                        log::debug!("pfd({}): peer {peer} crashed", pfd.local_peer);
                        pfd.subscribers.notify(peer);
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    pub fn stop(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn unique_dir(label: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "flight-consensus-pfd-test-{label}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn correct_peers_are_never_detected() {
        let dir = unique_dir("correct");
        let tick = Duration::from_millis(40);

        let link0 = Arc::new(Link::bind(PeerId::new(0), dir.clone(), tick).unwrap());
        let link1 = Arc::new(Link::bind(PeerId::new(1), dir.clone(), tick).unwrap());
        link0.start();
        link1.start();

        let pfd0 = PerfectFailureDetector::new(link0.clone(), PeerId::new(0), tick);
        let pfd1 = PerfectFailureDetector::new(link1.clone(), PeerId::new(1), tick);
        pfd0.add_peers([PeerId::new(1)]);
        pfd1.add_peers([PeerId::new(0)]);
        pfd0.start();
        pfd1.start();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(pfd0.detected().is_empty());
        assert!(pfd1.detected().is_empty());

        pfd0.stop();
        pfd1.stop();
        link0.stop();
        link1.stop();
    }

    #[tokio::test]
    async fn crashed_peer_is_eventually_detected_exactly_once() {
        let dir = unique_dir("crash");
        let tick = Duration::from_millis(40);

        let link0 = Arc::new(Link::bind(PeerId::new(0), dir.clone(), tick).unwrap());
        let link1 = Arc::new(Link::bind(PeerId::new(1), dir.clone(), tick).unwrap());
        let link2 = Arc::new(Link::bind(PeerId::new(2), dir.clone(), tick).unwrap());
        link0.start();
        link2.start();

        let pfd0 = PerfectFailureDetector::new(link0.clone(), PeerId::new(0), tick);
        pfd0.add_peers([PeerId::new(1), PeerId::new(2)]);
        pfd0.start();

        let pfd2 = PerfectFailureDetector::new(link2.clone(), PeerId::new(2), tick);
        pfd2.add_peers([PeerId::new(0), PeerId::new(1)]);
        pfd2.start();

        let crashes0 = Arc::new(AtomicUsize::new(0));
        let crashes0_task = crashes0.clone();
        pfd0.subscribe(move |peer| {
            assert_eq!(peer, PeerId::new(1));
            crashes0_task.fetch_add(1, Ordering::SeqCst);
        });

        let crashes2 = Arc::new(AtomicUsize::new(0));
        let crashes2_task = crashes2.clone();
        pfd2.subscribe(move |peer| {
            assert_eq!(peer, PeerId::new(1));
            crashes2_task.fetch_add(1, Ordering::SeqCst);
        });

        // peer 1 never starts its own failure detector loop, so it won't
        // reply to heartbeat requests - simulating a crashed peer.
        link1.start();

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(pfd0.is_detected(PeerId::new(1)));
        assert!(pfd2.is_detected(PeerId::new(1)));
        assert!(!pfd0.is_detected(PeerId::new(2)));
        assert!(!pfd2.is_detected(PeerId::new(0)));
        assert_eq!(crashes0.load(Ordering::SeqCst), 1);
        assert_eq!(crashes2.load(Ordering::SeqCst), 1);

        pfd0.stop();
        pfd2.stop();
        link0.stop();
        link1.stop();
        link2.stop();
    }
}
