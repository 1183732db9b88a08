use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use super::error::DhtError;
use super::message::{DhtMessage, DhtQuery, DhtResponse, MessageBody, TransactionId};
use super::node::{Node, NodeId};
use super::routing::RoutingTable;
use crate::info_hash::InfoHash;

#[derive(Debug, Clone, Copy)]
pub struct DhtConfig {
    /// How long an outbound query waits for its response.
    pub query_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(5),
        }
    }
}

type Waiter = mpsc::Sender<Result<DhtResponse, DhtError>>;

/// The DHT query transport: one UDP socket, a routing table, and a map
/// of in-flight transactions.
///
/// [`run`](Self::run) drives the receive side: responses are matched to
/// their waiter by transaction id, remote errors resolve the waiter with
/// [`DhtError::Remote`], and incoming queries are answered from the
/// routing table (inserting the querier first).
pub struct DhtClient {
    socket: UdpSocket,
    self_id: NodeId,
    table: RoutingTable,
    pending: Arc<Mutex<HashMap<TransactionId, Waiter>>>,
    next_tid: AtomicU16,
    config: DhtConfig,
}

impl DhtClient {
    pub async fn bind(port: u16) -> Result<Self, DhtError> {
        Self::bind_with(port, DhtConfig::default()).await
    }

    pub async fn bind_with(port: u16, config: DhtConfig) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        let self_id = NodeId::generate();
        info!(addr = %socket.local_addr()?, id = %self_id, "dht client bound");

        Ok(Self {
            socket,
            self_id,
            table: RoutingTable::new(self_id),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_tid: AtomicU16::new(0),
            config,
        })
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<DhtResponse, DhtError> {
        self.send_query(addr, DhtQuery::Ping).await
    }

    pub async fn find_node(
        &self,
        addr: SocketAddr,
        target: NodeId,
    ) -> Result<DhtResponse, DhtError> {
        self.send_query(addr, DhtQuery::FindNode { target }).await
    }

    pub async fn get_peers(
        &self,
        addr: SocketAddr,
        info_hash: InfoHash,
    ) -> Result<DhtResponse, DhtError> {
        self.send_query(addr, DhtQuery::GetPeers { info_hash }).await
    }

    /// The receive loop; run it on its own task for as long as the
    /// client lives. Returns only on a socket error.
    pub async fn run(&self) -> Result<(), DhtError> {
        let mut buf = vec![0u8; 65535];
        loop {
            let (n, addr) = self.socket.recv_from(&mut buf).await?;
            match DhtMessage::parse(&buf[..n]) {
                Ok(message) => self.dispatch(message, addr).await,
                Err(err) => {
                    debug!(%addr, %err, "dropping undecodable datagram");
                }
            }
        }
    }

    async fn dispatch(&self, message: DhtMessage, addr: SocketAddr) {
        match message.body {
            MessageBody::Response(response) => {
                self.table.insert(Node::new(response.sender_id(), addr));
                self.resolve(&message.transaction_id, Ok(response));
            }
            MessageBody::Error { code, message: text } => {
                debug!(%addr, code, "dht error message");
                self.resolve(
                    &message.transaction_id,
                    Err(DhtError::Remote {
                        code,
                        message: text,
                    }),
                );
            }
            MessageBody::Query { id, query } => {
                self.table.insert(Node::new(id, addr));
                let response = self.answer(&query);
                let reply = DhtMessage::response(message.transaction_id, response);
                if let Err(err) = self.socket.send_to(&reply.encode(), addr).await {
                    debug!(%addr, %err, "failed to answer query");
                }
            }
        }
    }

    fn resolve(&self, tid: &TransactionId, result: Result<DhtResponse, DhtError>) {
        let waiter = self.pending.lock().get(tid).cloned();
        match waiter {
            Some(waiter) => {
                let _ = waiter.try_send(result);
            }
            None => debug!("response for unknown transaction"),
        }
    }

    /// We are a plain DHT participant, not a tracker: `get_peers` is
    /// answered with nodes, never with peers.
    fn answer(&self, query: &DhtQuery) -> DhtResponse {
        match query {
            DhtQuery::Ping => DhtResponse::Ping { id: self.self_id },
            DhtQuery::FindNode { target } => DhtResponse::Nodes {
                id: self.self_id,
                nodes: self.table.find_bucket(target),
            },
            DhtQuery::GetPeers { info_hash } => DhtResponse::Nodes {
                id: self.self_id,
                nodes: self.table.find_bucket(&NodeId::from(*info_hash)),
            },
        }
    }

    async fn send_query(
        &self,
        addr: SocketAddr,
        query: DhtQuery,
    ) -> Result<DhtResponse, DhtError> {
        let tid = self.next_transaction_id();
        let (tx, mut rx) = mpsc::channel(1);
        // The guard deregisters the transaction even if this future is
        // dropped mid-await.
        let _guard = PendingGuard::register(&self.pending, tid.clone(), tx);

        let message = DhtMessage::query(tid, self.self_id, query);
        self.socket.send_to(&message.encode(), addr).await?;

        match timeout(self.config.query_timeout, rx.recv()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(DhtError::Cancelled),
            Err(_) => Err(DhtError::Timeout),
        }
    }

    /// Fresh id per query so concurrent queries to one endpoint cannot
    /// alias.
    fn next_transaction_id(&self) -> TransactionId {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        TransactionId::copy_from_slice(&tid.to_be_bytes())
    }
}

struct PendingGuard {
    pending: Arc<Mutex<HashMap<TransactionId, Waiter>>>,
    tid: TransactionId,
}

impl PendingGuard {
    fn register(
        pending: &Arc<Mutex<HashMap<TransactionId, Waiter>>>,
        tid: TransactionId,
        waiter: Waiter,
    ) -> Self {
        pending.lock().insert(tid.clone(), waiter);
        Self {
            pending: pending.clone(),
            tid,
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.tid);
    }
}
