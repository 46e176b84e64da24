//! Outbound connections to other servers.
//!
//! Every known peer gets one long-lived link task that owns a TCP connection
//! and a queue of [`PeerMessage`]s for all groups. A link opens with a server
//! preamble and then only writes; replies come back over the link the peer
//! keeps towards us. Messages queued while a peer is unreachable are dropped:
//! the protocol retries on its own through heartbeats and elections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::message::{PeerMessage, Preamble, write_message};
use crate::types::{PeerInfo, ServerId};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    me: PeerInfo,
    rpc_timeout: Duration,
    links: Mutex<HashMap<ServerId, PeerLink>>,
}

struct PeerLink {
    info: PeerInfo,
    queue: mpsc::UnboundedSender<PeerMessage>,
    task: JoinHandle<()>,
}

impl Transport {
    pub fn new(me: PeerInfo, rpc_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                me,
                rpc_timeout,
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn me(&self) -> &PeerInfo {
        &self.inner.me
    }

    /// Records `peer` in the address book, (re)starting its link when the
    /// address is new or changed.
    pub async fn learn(&self, peer: PeerInfo) {
        if peer.id == self.inner.me.id {
            return;
        }
        let mut links = self.inner.links.lock().await;
        if links.get(&peer.id).is_some_and(|link| link.info == peer) {
            return;
        }

        let known: Vec<PeerInfo> = links.values().map(|link| link.info.clone()).collect();
        if let Some(old) = links.remove(&peer.id) {
            info!(peer = peer.id, old = %old.info.addr, new = %peer.addr, "peer address changed");
            old.task.abort();
        } else {
            debug!(peer = peer.id, addr = %peer.addr, "learned peer");
        }

        let (queue, rx) = mpsc::unbounded_channel();
        let preamble = Preamble::Server {
            id: self.inner.me.id,
            addr: self.inner.me.addr.clone(),
            community: self.inner.me.community.clone(),
            peers: known,
        };
        let task = tokio::spawn(run_link(
            peer.clone(),
            preamble,
            rx,
            self.inner.rpc_timeout,
        ));
        links.insert(peer.id, PeerLink { info: peer, queue, task });
    }

    /// Queues `message` for `to`; false when the peer's address is unknown.
    pub async fn send(&self, to: ServerId, message: PeerMessage) -> bool {
        let links = self.inner.links.lock().await;
        match links.get(&to) {
            Some(link) => link.queue.send(message).is_ok(),
            None => {
                debug!(peer = to, group = %message.group_id, "no address for peer; dropping message");
                false
            }
        }
    }

    pub async fn known_peers(&self) -> Vec<PeerInfo> {
        let links = self.inner.links.lock().await;
        let mut peers: Vec<PeerInfo> = links.values().map(|link| link.info.clone()).collect();
        peers.sort_by_key(|peer| peer.id);
        peers
    }

    pub async fn shutdown(&self) {
        let mut links = self.inner.links.lock().await;
        for (_, link) in links.drain() {
            link.task.abort();
        }
    }
}

async fn run_link(
    peer: PeerInfo,
    preamble: Preamble,
    mut rx: mpsc::UnboundedReceiver<PeerMessage>,
    rpc_timeout: Duration,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let mut stream = match connect(&peer, &preamble, rpc_timeout).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(peer = peer.id, addr = %peer.addr, error = %err, "peer unreachable");
                // Stale messages would only confuse the peer later.
                while rx.try_recv().is_ok() {}
                sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;
        debug!(peer = peer.id, addr = %peer.addr, "peer link established");

        loop {
            let Some(message) = rx.recv().await else {
                return;
            };
            match timeout(rpc_timeout, write_message(&mut stream, &message)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(peer = peer.id, error = %err, "peer link failed");
                    break;
                }
                Err(_) => {
                    warn!(peer = peer.id, "peer write timed out");
                    break;
                }
            }
        }
    }
}

async fn connect(
    peer: &PeerInfo,
    preamble: &Preamble,
    rpc_timeout: Duration,
) -> std::io::Result<TcpStream> {
    let mut stream = timeout(rpc_timeout, TcpStream::connect(&peer.addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    write_message(&mut stream, preamble).await?;
    Ok(stream)
}
