use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;

use super::error::DhtError;
use super::node::{peer_from_compact, peer_to_compact, Node, NodeId};
use crate::bencode::{decode, encode, Value};
use crate::info_hash::InfoHash;

pub type TransactionId = Bytes;

/// The queries this node sends and answers (BEP-5 subset; this client
/// never announces).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtQuery {
    Ping,
    FindNode { target: NodeId },
    GetPeers { info_hash: InfoHash },
}

impl DhtQuery {
    fn name(&self) -> &'static str {
        match self {
            DhtQuery::Ping => "ping",
            DhtQuery::FindNode { .. } => "find_node",
            DhtQuery::GetPeers { .. } => "get_peers",
        }
    }
}

/// A response, classified by what it carries: a bare id, a compact node
/// list, or a peer list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtResponse {
    Ping { id: NodeId },
    Nodes { id: NodeId, nodes: Vec<Node> },
    Peers { id: NodeId, peers: Vec<SocketAddr> },
}

impl DhtResponse {
    pub fn sender_id(&self) -> NodeId {
        match self {
            DhtResponse::Ping { id }
            | DhtResponse::Nodes { id, .. }
            | DhtResponse::Peers { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Query { id: NodeId, query: DhtQuery },
    Response(DhtResponse),
    Error { code: i64, message: String },
}

/// One KRPC datagram: a transaction id and a query, response, or error
/// body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtMessage {
    pub transaction_id: TransactionId,
    pub body: MessageBody,
}

impl DhtMessage {
    pub fn query(transaction_id: TransactionId, id: NodeId, query: DhtQuery) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Query { id, query },
        }
    }

    pub fn response(transaction_id: TransactionId, response: DhtResponse) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Response(response),
        }
    }

    pub fn error(transaction_id: TransactionId, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Error {
                code,
                message: message.into(),
            },
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"t"),
            Value::Bytes(self.transaction_id.clone()),
        );

        match &self.body {
            MessageBody::Query { id, query } => {
                dict.insert(Bytes::from_static(b"y"), Value::string("q"));
                dict.insert(Bytes::from_static(b"q"), Value::string(query.name()));

                let mut args = BTreeMap::new();
                args.insert(Bytes::from_static(b"id"), id_value(id));
                match query {
                    DhtQuery::Ping => {}
                    DhtQuery::FindNode { target } => {
                        args.insert(Bytes::from_static(b"target"), id_value(target));
                    }
                    DhtQuery::GetPeers { info_hash } => {
                        args.insert(
                            Bytes::from_static(b"info_hash"),
                            Value::Bytes(Bytes::copy_from_slice(info_hash.as_bytes())),
                        );
                    }
                }
                dict.insert(Bytes::from_static(b"a"), Value::Dict(args));
            }
            MessageBody::Response(response) => {
                dict.insert(Bytes::from_static(b"y"), Value::string("r"));

                let mut reply = BTreeMap::new();
                reply.insert(Bytes::from_static(b"id"), id_value(&response.sender_id()));
                match response {
                    DhtResponse::Ping { .. } => {}
                    DhtResponse::Nodes { nodes, .. } => {
                        let compact: Vec<u8> = nodes
                            .iter()
                            .filter_map(|n| n.to_compact())
                            .flatten()
                            .collect();
                        reply.insert(
                            Bytes::from_static(b"nodes"),
                            Value::Bytes(Bytes::from(compact)),
                        );
                    }
                    DhtResponse::Peers { peers, .. } => {
                        let values = peers
                            .iter()
                            .filter_map(|addr| {
                                peer_to_compact(addr)
                                    .map(|c| Value::Bytes(Bytes::copy_from_slice(&c)))
                            })
                            .collect();
                        reply.insert(Bytes::from_static(b"values"), Value::List(values));
                    }
                }
                dict.insert(Bytes::from_static(b"r"), Value::Dict(reply));
            }
            MessageBody::Error { code, message } => {
                dict.insert(Bytes::from_static(b"y"), Value::string("e"));
                dict.insert(
                    Bytes::from_static(b"e"),
                    Value::List(vec![Value::Integer(*code), Value::string(message)]),
                );
            }
        }

        encode(&Value::Dict(dict))
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| DhtError::Malformed("not a dictionary".into()))?;

        let transaction_id = dict
            .get(b"t".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or_else(|| DhtError::Malformed("missing transaction id".into()))?;

        let body = match dict.get(b"y".as_slice()).and_then(|v| v.as_str()) {
            Some("q") => parse_query(dict)?,
            Some("r") => parse_response(dict)?,
            Some("e") => parse_error(dict)?,
            Some(other) => {
                return Err(DhtError::Malformed(format!("unknown type: {}", other)))
            }
            None => return Err(DhtError::Malformed("missing message type".into())),
        };

        Ok(Self {
            transaction_id,
            body,
        })
    }
}

fn id_value(id: &NodeId) -> Value {
    Value::Bytes(Bytes::copy_from_slice(id.as_bytes()))
}

fn parse_query(dict: &BTreeMap<Bytes, Value>) -> Result<MessageBody, DhtError> {
    let args = dict
        .get(b"a".as_slice())
        .and_then(|v| v.as_dict())
        .ok_or_else(|| DhtError::Malformed("missing query args".into()))?;

    let id = args
        .get(b"id".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| DhtError::Malformed("missing sender id".into()))
        .and_then(|b| NodeId::from_bytes(b))?;

    let query = match dict.get(b"q".as_slice()).and_then(|v| v.as_str()) {
        Some("ping") => DhtQuery::Ping,
        Some("find_node") => {
            let target = args
                .get(b"target".as_slice())
                .and_then(|v| v.as_bytes())
                .ok_or_else(|| DhtError::Malformed("missing target".into()))
                .and_then(|b| NodeId::from_bytes(b))?;
            DhtQuery::FindNode { target }
        }
        Some("get_peers") => {
            let info_hash = args
                .get(b"info_hash".as_slice())
                .and_then(|v| v.as_bytes())
                .and_then(|b| InfoHash::from_bytes(b).ok())
                .ok_or_else(|| DhtError::Malformed("missing info_hash".into()))?;
            DhtQuery::GetPeers { info_hash }
        }
        Some(other) => {
            return Err(DhtError::Malformed(format!("unknown query: {}", other)))
        }
        None => return Err(DhtError::Malformed("missing query name".into())),
    };

    Ok(MessageBody::Query { id, query })
}

fn parse_response(dict: &BTreeMap<Bytes, Value>) -> Result<MessageBody, DhtError> {
    let reply = dict
        .get(b"r".as_slice())
        .and_then(|v| v.as_dict())
        .ok_or_else(|| DhtError::Malformed("missing response dict".into()))?;

    let id = reply
        .get(b"id".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| DhtError::Malformed("missing responder id".into()))
        .and_then(|b| NodeId::from_bytes(b))?;

    let peers: Option<Vec<SocketAddr>> = reply
        .get(b"values".as_slice())
        .and_then(|v| v.as_list())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_bytes())
                .filter_map(|b| peer_from_compact(b))
                .collect()
        });

    let nodes: Option<Vec<Node>> = reply
        .get(b"nodes".as_slice())
        .and_then(|v| v.as_bytes())
        .map(|data| data.chunks_exact(26).filter_map(Node::from_compact).collect());

    let response = if let Some(peers) = peers {
        DhtResponse::Peers { id, peers }
    } else if let Some(nodes) = nodes {
        DhtResponse::Nodes { id, nodes }
    } else {
        DhtResponse::Ping { id }
    };

    Ok(MessageBody::Response(response))
}

fn parse_error(dict: &BTreeMap<Bytes, Value>) -> Result<MessageBody, DhtError> {
    let error = dict
        .get(b"e".as_slice())
        .and_then(|v| v.as_list())
        .ok_or_else(|| DhtError::Malformed("missing error list".into()))?;

    let code = error.first().and_then(|v| v.as_integer()).unwrap_or(0);
    let message = error
        .get(1)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error")
        .to_string();

    Ok(MessageBody::Error { code, message })
}
