//! Perfect Link: non-duplicating, no-creation point-to-point message
//! delivery over host-local Unix domain datagram sockets (spec.md §4.2,
//! §6). Grounded directly in
//! `examples/original_source/basic_abstraction/link.py`'s
//! `socket.AF_UNIX, socket.SOCK_DGRAM` transport: a peer's address is
//! `{socket_dir}/fairlosslink{process_number}.socket`, `os.unlink` then
//! bind handles a stale socket file left behind by a crashed previous run,
//! and the 1024-byte cap is enforced at send time.
//!
//! Several independent upper-layer clients (the failure detector, one or
//! more broadcast channels) share a single link; each registers once and
//! gets back a `callback_id` plus its own inbound channel (see
//! `runtime::registrable`).

mod codec;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::MAX_MESSAGE_BYTES;
use crate::errors::LinkError;
use crate::peer::PeerId;
use crate::runtime::registrable::ChannelRegistry;

pub use codec::LinkFrame;

/// An inbound `(source, payload)` pair delivered to a registered client.
pub type Inbound = (PeerId, Vec<u8>);

pub struct Link {
    process_number: PeerId,
    socket_dir: PathBuf,
    socket: Arc<UnixDatagram>,
    registry: Arc<ChannelRegistry<Inbound>>,
    alive: Arc<std::sync::atomic::AtomicBool>,
    tick: std::time::Duration,
}

impl Link {
    /// Binds this peer's own socket, unlinking a stale path first
    /// (spec.md §7 "socket bind collision: unlink stale path once, then
    /// fail").
    pub fn bind(
        process_number: PeerId,
        socket_dir: impl Into<PathBuf>,
        tick: std::time::Duration,
    ) -> Result<Self, LinkError> {
        let socket_dir = socket_dir.into();
        let address = socket_address(&socket_dir, process_number);

        match std::fs::remove_file(&address) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LinkError::BindFailed(e)),
        }

        let socket = UnixDatagram::bind(&address).map_err(LinkError::BindFailed)?;

        Ok(Link {
            process_number,
            socket_dir,
            socket: Arc::new(socket),
            registry: Arc::new(ChannelRegistry::new()),
            alive: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            tick,
        })
    }

    pub fn process_number(&self) -> PeerId {
        self.process_number
    }

    /// Registers a new upper-layer client, returning its `callback_id` and
    /// the channel it should drain for inbound `(source, payload)` pairs.
    pub fn register(&self) -> (u32, mpsc::UnboundedReceiver<Inbound>) {
        self.registry.register()
    }

    /// Fire-and-forget send. Enforces the 1024-byte cap at call time
    /// (spec.md §3, §7 "oversized serialized msg: fatal to the sending
    /// call"); a transport write failure is logged and dropped, never
    /// retried at this layer (spec.md §7, §9 Open Question 1).
    pub async fn send(&self, destination: PeerId, callback_id: u32, payload: &[u8]) -> Result<(), LinkError> {
        let bytes = codec::encode(&LinkFrame {
            callback_id,
            payload: payload.to_vec(),
        })?;
        check_budget(bytes.len())?;

        let address = socket_address(&self.socket_dir, destination);
        match self.socket.send_to(&bytes, &address).await {
            Ok(_) => Ok(()),
            Err(e) => {
                log::debug!("link: send to {destination} dropped: {e}");
                Ok(())
            }
        }
    }

    /// Starts the dedicated listener task. Each arrival is parsed to a
    /// `LinkFrame` and routed to its registered client by `callback_id`; a
    /// malformed blob or an id with no registrant is logged and skipped
    /// (spec.md §7).
    pub fn start(&self) -> JoinHandle<()> {
        self.alive.store(true, std::sync::atomic::Ordering::Release);
        let socket = self.socket.clone();
        let registry = self.registry.clone();
        let alive = self.alive.clone();
        let tick = self.tick;
        let socket_dir = self.socket_dir.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_MESSAGE_BYTES * 2];
            loop {
                if !alive.load(std::sync::atomic::Ordering::Acquire) {
                    break;
                }
                match tokio::time::timeout(tick, socket.recv_from(&mut buf)).await {
                    Ok(Ok((len, addr))) => {
                        let Some(source) = addr.as_pathname().and_then(|p| peer_from_path(p, &socket_dir)) else {
                            log::warn!("link: could not determine sender for datagram, skipping");
                            continue;
                        };
                        match codec::decode(&buf[..len]) {
                            Ok(frame) => {
                                if !registry.dispatch(frame.callback_id, (source, frame.payload)) {
                                    log::warn!(
                                        "link: no registrant for callback_id {} (from {source})",
                                        frame.callback_id
                                    );
                                }
                            }
                            Err(e) => log::warn!("link: malformed datagram from {source}: {e}"),
                        }
                    }
                    Ok(Err(e)) => log::warn!("link: receive error: {e}"),
                    Err(_elapsed) => continue,
                }
            }
        })
    }

    pub fn stop(&self) {
        self.alive.store(false, std::sync::atomic::Ordering::Release);
    }
}

/// The wire size `send(_, callback_id, payload)` would produce, without
/// sending anything — lets upper layers validate a payload is within the
/// 1024-byte budget before it's queued for a send that might only happen
/// much later (spec.md §7 "oversized serialized msg: fatal to the sending
/// call").
pub(crate) fn frame_len(callback_id: u32, payload: &[u8]) -> Result<usize, LinkError> {
    let bytes = codec::encode(&LinkFrame {
        callback_id,
        payload: payload.to_vec(),
    })?;
    Ok(bytes.len())
}

/// Fatal per spec.md §7 if `len` exceeds [`MAX_MESSAGE_BYTES`]; distinct
/// from a transport write failure, which is logged and dropped instead.
pub(crate) fn check_budget(len: usize) -> Result<(), LinkError> {
    if len > MAX_MESSAGE_BYTES {
        Err(LinkError::MessageTooLarge {
            len,
            max: MAX_MESSAGE_BYTES,
        })
    } else {
        Ok(())
    }
}

fn socket_address(socket_dir: &Path, process_number: PeerId) -> PathBuf {
    socket_dir.join(format!("fairlosslink{}.socket", process_number.number()))
}

fn peer_from_path(path: &Path, socket_dir: &Path) -> Option<PeerId> {
    let file_name = path.file_name()?.to_str()?;
    let digits: String = file_name
        .strip_prefix("fairlosslink")?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let _ = socket_dir;
    digits.parse::<u64>().ok().map(PeerId::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unique_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "flight-consensus-link-test-{label}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn ping_delivers_exactly_once_with_correct_source() {
        let dir = unique_dir("ping");
        let tick = Duration::from_millis(50);

        let link0 = Link::bind(PeerId::new(0), dir.clone(), tick).unwrap();
        let link1 = Link::bind(PeerId::new(1), dir.clone(), tick).unwrap();

        let (cb0, mut inbox0) = link0.register();
        let (_cb1, _inbox1) = link1.register();

        link0.start();
        link1.start();

        link1.send(PeerId::new(0), cb0, b"hello").await.unwrap();

        let (source, payload) = tokio::time::timeout(Duration::from_secs(1), inbox0.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source, PeerId::new(1));
        assert_eq!(payload, b"hello");

        assert!(tokio::time::timeout(Duration::from_millis(100), inbox0.recv())
            .await
            .is_err());

        link0.stop();
        link1.stop();
    }

    #[tokio::test]
    async fn oversized_message_is_rejected_at_send_time() {
        let dir = unique_dir("oversized");
        let link = Link::bind(PeerId::new(5), dir, Duration::from_millis(50)).unwrap();
        let huge = vec![0u8; MAX_MESSAGE_BYTES * 4];
        let result = link.send(PeerId::new(5), 0, &huge).await;
        assert_matches::assert_matches!(result, Err(LinkError::MessageTooLarge { .. }));
    }

    #[test]
    fn stale_socket_path_is_unlinked_before_bind() {
        let dir = unique_dir("stale");
        let address = socket_address(&dir, PeerId::new(9));
        std::fs::write(&address, b"stale").unwrap();
        assert!(Link::bind(PeerId::new(9), dir, Duration::from_millis(50)).is_ok());
    }
}
