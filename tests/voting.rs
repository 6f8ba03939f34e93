//! Cross-process scenarios for leader election and majority voting, wiring
//! several full `MajorityVoting` stacks together over real Unix datagram
//! sockets in one test process (spec.md §8 scenarios 5 and 6).

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flight_consensus::peer::PeerId;
use flight_consensus::voting::MajorityVoting;
use serde_json::Value;

fn unique_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "flight-consensus-voting-it-{label}-{}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn spawn_peer(
    dir: &std::path::Path,
    id: u64,
    members: &[u64],
    tick: Duration,
    decide: impl Fn(Value) -> bool + Send + Sync + 'static,
    deliver: impl Fn(Value) + Send + Sync + 'static,
) -> Arc<MajorityVoting> {
    let voting = MajorityVoting::bind(PeerId::new(id), dir.to_path_buf(), tick, 20, decide, deliver).unwrap();
    let others: Vec<PeerId> = members
        .iter()
        .copied()
        .filter(|m| *m != id)
        .map(PeerId::new)
        .collect();
    voting.add_peers(others);
    voting.start();
    voting
}

#[tokio::test]
async fn leader_election_settles_on_peer_1_after_peer_0_crashes() {
    let dir = unique_dir("election-crash");
    let tick = Duration::from_millis(30);
    let members = [0u64, 1, 2];

    let p0 = spawn_peer(&dir, 0, &members, tick, |_| true, |_| {});
    let p1 = spawn_peer(&dir, 1, &members, tick, |_| true, |_| {});
    let p2 = spawn_peer(&dir, 2, &members, tick, |_| true, |_| {});

    let initial_timeout = Duration::from_secs(2);
    let leader0 = p0.get_leader(initial_timeout).await;
    let leader1 = p1.get_leader(initial_timeout).await;
    let leader2 = p2.get_leader(initial_timeout).await;
    assert_eq!(leader0, Some(PeerId::new(0)));
    assert_eq!(leader1, Some(PeerId::new(0)));
    assert_eq!(leader2, Some(PeerId::new(0)));

    p0.stop();

    let settle_timeout = Duration::from_secs(3);
    let new_leader1 = wait_for_new_leader(&p1, PeerId::new(0), settle_timeout).await;
    let new_leader2 = wait_for_new_leader(&p2, PeerId::new(0), settle_timeout).await;
    assert_eq!(new_leader1, Some(PeerId::new(1)));
    assert_eq!(new_leader2, Some(PeerId::new(1)));

    p1.stop();
    p2.stop();
}

/// Polls `get_leader` until it returns something other than `stale`, since a
/// single call may race the in-flight crash notification and return the old
/// value from before `finished_election` was cleared.
async fn wait_for_new_leader(voting: &MajorityVoting, stale: PeerId, timeout: Duration) -> Option<PeerId> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return voting.get_leader(Duration::from_millis(1)).await;
        }
        let poll = remaining.min(Duration::from_millis(200));
        match voting.get_leader(poll).await {
            Some(leader) if leader != stale => return Some(leader),
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
}

#[tokio::test]
async fn majority_vote_with_one_dissenter_still_delivers_everywhere() {
    let dir = unique_dir("dissenter");
    let tick = Duration::from_millis(30);
    let members = [0u64, 1, 2];

    let delivered0 = Arc::new(AtomicUsize::new(0));
    let delivered1 = Arc::new(AtomicUsize::new(0));
    let delivered2 = Arc::new(AtomicUsize::new(0));

    let d0 = delivered0.clone();
    let p0 = spawn_peer(&dir, 0, &members, tick, |_| false, move |_| {
        d0.fetch_add(1, Ordering::SeqCst);
    });
    let d1 = delivered1.clone();
    let p1 = spawn_peer(&dir, 1, &members, tick, |_| true, move |_| {
        d1.fetch_add(1, Ordering::SeqCst);
    });
    let d2 = delivered2.clone();
    let p2 = spawn_peer(&dir, 2, &members, tick, |_| true, move |_| {
        d2.fetch_add(1, Ordering::SeqCst);
    });

    let election_timeout = Duration::from_secs(2);
    assert_eq!(p0.get_leader(election_timeout).await, Some(PeerId::new(0)));
    assert_eq!(p1.get_leader(election_timeout).await, Some(PeerId::new(0)));
    assert_eq!(p2.get_leader(election_timeout).await, Some(PeerId::new(0)));

    let vote_timeout = Duration::from_secs(3);
    let result = p0.vote(Value::String("ignite".into()), vote_timeout).await.unwrap();
    assert!(result, "majority (2 of 3) accepted the value");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(delivered0.load(Ordering::SeqCst), 1);
    assert_eq!(delivered1.load(Ordering::SeqCst), 1);
    assert_eq!(delivered2.load(Ordering::SeqCst), 1);

    p0.stop();
    p1.stop();
    p2.stop();
}

#[tokio::test]
async fn non_leader_vote_call_returns_false() {
    let dir = unique_dir("non-leader");
    let tick = Duration::from_millis(30);
    let members = [0u64, 1, 2];

    let p0 = spawn_peer(&dir, 0, &members, tick, |_| true, |_| {});
    let p1 = spawn_peer(&dir, 1, &members, tick, |_| true, |_| {});
    let p2 = spawn_peer(&dir, 2, &members, tick, |_| true, |_| {});

    let election_timeout = Duration::from_secs(2);
    assert_eq!(p0.get_leader(election_timeout).await, Some(PeerId::new(0)));

    let result = p1
        .vote(Value::String("should-not-apply".into()), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(!result, "peer 1 is not the leader and must not be able to initiate a vote");

    p0.stop();
    p1.stop();
    p2.stop();
}
