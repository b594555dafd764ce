//! KRPC message model
//!
//! Bencoded DHT RPC messages (BEP 5): queries, responses and errors, plus
//! the compact node/peer encodings they carry. Ids, info hashes and
//! transaction ids are raw byte strings on the wire, so messages are built
//! on `serde_bencode::value::Value` dictionaries rather than serde derives.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Result;
use serde_bencode::value::Value;

use crate::dht::node::{Contact, NodeId};
use crate::error::FetchError;

/// A bencoded dictionary keyed by raw byte strings
pub type Dict = HashMap<Vec<u8>, Value>;

/// KRPC query methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMethod {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl QueryMethod {
    /// Wire name of the method
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            QueryMethod::Ping => b"ping",
            QueryMethod::FindNode => b"find_node",
            QueryMethod::GetPeers => b"get_peers",
            QueryMethod::AnnouncePeer => b"announce_peer",
        }
    }

    /// Parse a wire method name
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"ping" => Some(QueryMethod::Ping),
            b"find_node" => Some(QueryMethod::FindNode),
            b"get_peers" => Some(QueryMethod::GetPeers),
            b"announce_peer" => Some(QueryMethod::AnnouncePeer),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// A KRPC message
#[derive(Debug, Clone)]
pub enum KrpcMessage {
    Query {
        transaction_id: Vec<u8>,
        method: QueryMethod,
        args: Dict,
    },
    Response {
        transaction_id: Vec<u8>,
        body: Dict,
    },
    Error {
        transaction_id: Vec<u8>,
        code: i64,
        message: String,
    },
}

impl KrpcMessage {
    /// The message's transaction id
    pub fn transaction_id(&self) -> &[u8] {
        match self {
            KrpcMessage::Query { transaction_id, .. } => transaction_id,
            KrpcMessage::Response { transaction_id, .. } => transaction_id,
            KrpcMessage::Error { transaction_id, .. } => transaction_id,
        }
    }

    /// Serialize to bencoded bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut root = Dict::new();
        match self {
            KrpcMessage::Query { transaction_id, method, args } => {
                root.insert(b"t".to_vec(), Value::Bytes(transaction_id.clone()));
                root.insert(b"y".to_vec(), Value::Bytes(b"q".to_vec()));
                root.insert(b"q".to_vec(), Value::Bytes(method.as_bytes().to_vec()));
                root.insert(b"a".to_vec(), Value::Dict(args.clone()));
            }
            KrpcMessage::Response { transaction_id, body } => {
                root.insert(b"t".to_vec(), Value::Bytes(transaction_id.clone()));
                root.insert(b"y".to_vec(), Value::Bytes(b"r".to_vec()));
                root.insert(b"r".to_vec(), Value::Dict(body.clone()));
            }
            KrpcMessage::Error { transaction_id, code, message } => {
                root.insert(b"t".to_vec(), Value::Bytes(transaction_id.clone()));
                root.insert(b"y".to_vec(), Value::Bytes(b"e".to_vec()));
                root.insert(
                    b"e".to_vec(),
                    Value::List(vec![
                        Value::Int(*code),
                        Value::Bytes(message.as_bytes().to_vec()),
                    ]),
                );
            }
        }
        serde_bencode::to_bytes(&Value::Dict(root)).map_err(|e| FetchError::from(e).into())
    }

    /// Parse a bencoded KRPC message
    pub fn decode(data: &[u8]) -> Result<Self> {
        let value: Value = serde_bencode::from_bytes(data).map_err(FetchError::from)?;
        let Value::Dict(root) = value else {
            return Err(FetchError::dht_error("KRPC message is not a dictionary").into());
        };

        let transaction_id = match root.get(b"t".as_ref()) {
            Some(Value::Bytes(t)) => t.clone(),
            _ => return Err(FetchError::dht_error("KRPC message has no transaction id").into()),
        };
        let message_type = match root.get(b"y".as_ref()) {
            Some(Value::Bytes(y)) => y.as_slice(),
            _ => return Err(FetchError::dht_error("KRPC message has no type").into()),
        };

        match message_type {
            b"q" => {
                let method = match root.get(b"q".as_ref()) {
                    Some(Value::Bytes(q)) => QueryMethod::from_bytes(q).ok_or_else(|| {
                        FetchError::dht_error(format!(
                            "Unknown query method: {}",
                            String::from_utf8_lossy(q)
                        ))
                    })?,
                    _ => return Err(FetchError::dht_error("Query has no method").into()),
                };
                let args = match root.get(b"a".as_ref()) {
                    Some(Value::Dict(a)) => a.clone(),
                    _ => return Err(FetchError::dht_error("Query has no arguments").into()),
                };
                Ok(KrpcMessage::Query { transaction_id, method, args })
            }
            b"r" => {
                let body = match root.get(b"r".as_ref()) {
                    Some(Value::Dict(r)) => r.clone(),
                    _ => return Err(FetchError::dht_error("Response has no body").into()),
                };
                Ok(KrpcMessage::Response { transaction_id, body })
            }
            b"e" => {
                let (code, message) = match root.get(b"e".as_ref()) {
                    Some(Value::List(items)) => {
                        let code = match items.first() {
                            Some(Value::Int(code)) => *code,
                            _ => 0,
                        };
                        let message = match items.get(1) {
                            Some(Value::Bytes(msg)) => String::from_utf8_lossy(msg).into_owned(),
                            _ => String::new(),
                        };
                        (code, message)
                    }
                    _ => (0, String::new()),
                };
                Ok(KrpcMessage::Error { transaction_id, code, message })
            }
            other => Err(FetchError::dht_error(format!(
                "Unknown KRPC message type: {}",
                String::from_utf8_lossy(other)
            ))
            .into()),
        }
    }

    /// Create a ping query
    pub fn ping_query(transaction_id: Vec<u8>, our_id: NodeId) -> Self {
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::Bytes(our_id.as_bytes().to_vec()));
        KrpcMessage::Query {
            transaction_id,
            method: QueryMethod::Ping,
            args,
        }
    }

    /// Create a find_node query
    pub fn find_node_query(transaction_id: Vec<u8>, our_id: NodeId, target: NodeId) -> Self {
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::Bytes(our_id.as_bytes().to_vec()));
        args.insert(b"target".to_vec(), Value::Bytes(target.as_bytes().to_vec()));
        KrpcMessage::Query {
            transaction_id,
            method: QueryMethod::FindNode,
            args,
        }
    }

    /// Create a get_peers query
    pub fn get_peers_query(transaction_id: Vec<u8>, our_id: NodeId, info_hash: [u8; 20]) -> Self {
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::Bytes(our_id.as_bytes().to_vec()));
        args.insert(b"info_hash".to_vec(), Value::Bytes(info_hash.to_vec()));
        KrpcMessage::Query {
            transaction_id,
            method: QueryMethod::GetPeers,
            args,
        }
    }

    /// Create a response with the given body
    pub fn response(transaction_id: Vec<u8>, body: Dict) -> Self {
        KrpcMessage::Response { transaction_id, body }
    }

    /// Create an error reply
    pub fn error(transaction_id: Vec<u8>, code: i64, message: impl Into<String>) -> Self {
        KrpcMessage::Error {
            transaction_id,
            code,
            message: message.into(),
        }
    }
}

/// Generate a short random transaction id
pub fn generate_transaction_id() -> Vec<u8> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let id: u16 = rng.gen();
    id.to_be_bytes().to_vec()
}

/// Fetch a byte-string value out of a KRPC dictionary
pub fn dict_bytes<'a>(dict: &'a Dict, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key) {
        Some(Value::Bytes(bytes)) => Some(bytes),
        _ => None,
    }
}

/// Fetch an integer value out of a KRPC dictionary
pub fn dict_int(dict: &Dict, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(Value::Int(value)) => Some(*value),
        _ => None,
    }
}

/// Fetch a 20-byte node id out of a KRPC dictionary
pub fn dict_node_id(dict: &Dict, key: &[u8]) -> Option<NodeId> {
    dict_bytes(dict, key).and_then(NodeId::from_slice)
}

/// Parse compact node info: 26 bytes per node (20-byte id, 4-byte IPv4,
/// 2-byte port)
pub fn parse_compact_nodes(data: &[u8]) -> Result<Vec<(NodeId, SocketAddr)>> {
    if data.len() % 26 != 0 {
        return Err(FetchError::dht_error("Invalid compact nodes data length").into());
    }

    let mut nodes = Vec::with_capacity(data.len() / 26);
    for chunk in data.chunks_exact(26) {
        let id = NodeId::from_slice(&chunk[0..20]).expect("chunk is 20 bytes");
        let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = u16::from_be_bytes([chunk[24], chunk[25]]);
        nodes.push((id, SocketAddr::new(IpAddr::V4(ip), port)));
    }
    Ok(nodes)
}

/// Serialize contacts to compact node info; non-IPv4 contacts are skipped
pub fn serialize_compact_nodes(contacts: &[Contact]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(contacts.len() * 26);
    for contact in contacts {
        let SocketAddr::V4(addr) = contact.addr else {
            continue;
        };
        buffer.extend_from_slice(contact.id.as_bytes());
        buffer.extend_from_slice(&addr.ip().octets());
        buffer.extend_from_slice(&addr.port().to_be_bytes());
    }
    buffer
}

/// Parse a compact peer entry: 4-byte IPv4 plus 2-byte port
pub fn parse_compact_peer(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Serialize a peer endpoint to its 6-byte compact form; None for IPv6
pub fn serialize_compact_peer(addr: &SocketAddr) -> Option<[u8; 6]> {
    let SocketAddr::V4(addr) = addr else {
        return None;
    };
    let mut out = [0u8; 6];
    out[0..4].copy_from_slice(&addr.ip().octets());
    out[4..6].copy_from_slice(&addr.port().to_be_bytes());
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_query_round_trip() {
        let our_id = NodeId::new([1u8; 20]);
        let query = KrpcMessage::ping_query(b"aa".to_vec(), our_id);
        let encoded = query.encode().unwrap();

        match KrpcMessage::decode(&encoded).unwrap() {
            KrpcMessage::Query { transaction_id, method, args } => {
                assert_eq!(transaction_id, b"aa");
                assert_eq!(method, QueryMethod::Ping);
                assert_eq!(dict_node_id(&args, b"id"), Some(our_id));
            }
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_get_peers_query_round_trip() {
        let our_id = NodeId::new([1u8; 20]);
        let info_hash = [3u8; 20];
        let query = KrpcMessage::get_peers_query(b"gp".to_vec(), our_id, info_hash);
        let encoded = query.encode().unwrap();

        match KrpcMessage::decode(&encoded).unwrap() {
            KrpcMessage::Query { method, args, .. } => {
                assert_eq!(method, QueryMethod::GetPeers);
                assert_eq!(dict_bytes(&args, b"info_hash"), Some(info_hash.as_slice()));
            }
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_response_round_trip() {
        let mut body = Dict::new();
        body.insert(b"id".to_vec(), Value::Bytes(vec![9u8; 20]));
        body.insert(b"token".to_vec(), Value::Bytes(b"tok".to_vec()));
        let response = KrpcMessage::response(b"rr".to_vec(), body);
        let encoded = response.encode().unwrap();

        match KrpcMessage::decode(&encoded).unwrap() {
            KrpcMessage::Response { transaction_id, body } => {
                assert_eq!(transaction_id, b"rr");
                assert_eq!(dict_bytes(&body, b"token"), Some(b"tok".as_ref()));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_error_round_trip() {
        let error = KrpcMessage::error(b"ee".to_vec(), 201, "Generic Error");
        let encoded = error.encode().unwrap();

        match KrpcMessage::decode(&encoded).unwrap() {
            KrpcMessage::Error { code, message, .. } => {
                assert_eq!(code, 201);
                assert_eq!(message, "Generic Error");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_real_world_get_peers_response() {
        // A response as another implementation would emit it: raw binary
        // id, nodes and token
        let mut body = Dict::new();
        body.insert(b"id".to_vec(), Value::Bytes(vec![0xfe; 20]));
        let mut nodes = vec![0xaau8; 20];
        nodes.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.insert(b"nodes".to_vec(), Value::Bytes(nodes));
        body.insert(b"token".to_vec(), Value::Bytes(vec![0x01, 0x02]));
        let encoded = KrpcMessage::response(b"xy".to_vec(), body).encode().unwrap();

        match KrpcMessage::decode(&encoded).unwrap() {
            KrpcMessage::Response { body, .. } => {
                let nodes = parse_compact_nodes(dict_bytes(&body, b"nodes").unwrap()).unwrap();
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].1, "127.0.0.1:6881".parse().unwrap());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(KrpcMessage::decode(b"not bencode").is_err());
        assert!(KrpcMessage::decode(b"i42e").is_err());
        assert!(KrpcMessage::decode(b"d1:yl1:qee").is_err());
    }

    #[test]
    fn test_decode_rejects_missing_transaction_id() {
        // {"y": "r", "r": {}}
        assert!(KrpcMessage::decode(b"d1:rde1:y1:re").is_err());
    }

    #[test]
    fn test_parse_compact_nodes() {
        let mut data = Vec::new();
        data.extend_from_slice(&[1u8; 20]);
        data.extend_from_slice(&[127, 0, 0, 1]);
        data.extend_from_slice(&[26, 225]); // 6881

        let nodes = parse_compact_nodes(&data).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].0, NodeId::new([1u8; 20]));
        assert_eq!(nodes[0].1, "127.0.0.1:6881".parse().unwrap());
    }

    #[test]
    fn test_parse_compact_nodes_invalid_length() {
        assert!(parse_compact_nodes(&[0u8; 25]).is_err());
    }

    #[test]
    fn test_serialize_compact_nodes() {
        let contacts = vec![Contact::new(
            NodeId::new([1u8; 20]),
            "127.0.0.1:6881".parse().unwrap(),
        )];
        let data = serialize_compact_nodes(&contacts);
        assert_eq!(data.len(), 26);
        let parsed = parse_compact_nodes(&data).unwrap();
        assert_eq!(parsed[0].0, contacts[0].id);
        assert_eq!(parsed[0].1, contacts[0].addr);
    }

    #[test]
    fn test_compact_peer_round_trip() {
        let addr: SocketAddr = "10.1.2.3:6881".parse().unwrap();
        let compact = serialize_compact_peer(&addr).unwrap();
        assert_eq!(parse_compact_peer(&compact), Some(addr));
        assert_eq!(parse_compact_peer(&[0u8; 5]), None);
    }

    #[test]
    fn test_generate_transaction_id() {
        let id = generate_transaction_id();
        assert_eq!(id.len(), 2);
    }
}
