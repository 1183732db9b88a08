use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use super::client::DhtClient;
use super::message::DhtResponse;
use super::node::{Node, NodeId};
use crate::info_hash::InfoHash;

/// The well-known entry point into the public DHT.
pub const DEFAULT_BOOTSTRAP: &str = "router.bittorrent.com:6881";

const RESEED_DELAY: Duration = Duration::from_secs(10);

/// Iterative `get_peers` walks over the DHT.
///
/// A walk keeps one query outstanding, follows returned nodes
/// closest-first toward the info hash, and emits every peer address it
/// learns, deduplicated, on a stream. It never finishes on its own;
/// drop the [`DiscoveredPeers`] handle to stop it.
pub struct PeerDiscovery {
    client: Arc<DhtClient>,
    bootstrap: String,
}

impl PeerDiscovery {
    pub fn new(client: Arc<DhtClient>) -> Self {
        Self::with_bootstrap(client, DEFAULT_BOOTSTRAP)
    }

    /// Uses a different bootstrap endpoint (host:port).
    pub fn with_bootstrap(client: Arc<DhtClient>, bootstrap: impl Into<String>) -> Self {
        Self {
            client,
            bootstrap: bootstrap.into(),
        }
    }

    /// Starts a walk for `info_hash`.
    pub fn start(&self, info_hash: InfoHash) -> DiscoveredPeers {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(walk(
            self.client.clone(),
            self.bootstrap.clone(),
            info_hash,
            tx,
        ));
        DiscoveredPeers { peers: rx, task }
    }
}

/// A running walk's output. Dropping it cancels the walk.
pub struct DiscoveredPeers {
    peers: mpsc::Receiver<SocketAddr>,
    task: JoinHandle<()>,
}

impl DiscoveredPeers {
    /// The next newly-discovered peer. Pends until one turns up.
    pub async fn next(&mut self) -> Option<SocketAddr> {
        self.peers.recv().await
    }
}

impl Drop for DiscoveredPeers {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn walk(
    client: Arc<DhtClient>,
    bootstrap: String,
    info_hash: InfoHash,
    tx: mpsc::Sender<SocketAddr>,
) {
    let target = NodeId::from(info_hash);
    let mut candidates: VecDeque<Node> = VecDeque::new();
    let mut walked: HashSet<NodeId> = HashSet::new();
    let mut seen_peers: HashSet<SocketAddr> = HashSet::new();

    loop {
        let Some(node) = candidates.pop_front() else {
            // Out of leads: go back to the bootstrap node. The public
            // swarm changes constantly, so this re-walks fresh ground.
            if !walked.is_empty() {
                sleep(RESEED_DELAY).await;
            }
            match seed(&client, &bootstrap).await {
                Some(node) => candidates.push_back(node),
                None => sleep(RESEED_DELAY).await,
            }
            continue;
        };
        walked.insert(node.id);

        match client.get_peers(node.addr, info_hash).await {
            Ok(DhtResponse::Peers { peers, .. }) => {
                client.routing_table().update_goodness(&[node.id], &[]);
                for peer in peers {
                    if seen_peers.insert(peer) && tx.send(peer).await.is_err() {
                        return;
                    }
                }
            }
            Ok(DhtResponse::Nodes { mut nodes, .. }) => {
                client.routing_table().update_goodness(&[node.id], &[]);
                nodes.retain(|n| !walked.contains(&n.id));
                nodes.sort_by_key(|n| n.id.distance(&target));
                for next in nodes.into_iter().rev() {
                    walked.insert(next.id);
                    candidates.push_front(next);
                }
            }
            Ok(other) => {
                debug!(addr = %node.addr, ?other, "useless get_peers response");
            }
            Err(err) => {
                debug!(addr = %node.addr, %err, "get_peers failed");
                client.routing_table().update_goodness(&[], &[node.id]);
            }
        }
    }
}

/// Resolves and pings the bootstrap endpoint once.
async fn seed(client: &DhtClient, bootstrap: &str) -> Option<Node> {
    let addr = match tokio::net::lookup_host(bootstrap).await {
        Ok(mut addrs) => addrs.next()?,
        Err(err) => {
            debug!(bootstrap, %err, "bootstrap resolution failed");
            return None;
        }
    };
    match client.ping(addr).await {
        Ok(response) => Some(Node::new(response.sender_id(), addr)),
        Err(err) => {
            debug!(%addr, %err, "bootstrap ping failed");
            None
        }
    }
}
