// Copyright (c) 2026 LibreSeed
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! KRPC wire messages for the mainline DHT (BEP-0005).
//!
//! Messages are bencoded dictionaries. Queries carry `q` + `a`, responses
//! carry `r`, errors carry `e = [code, message]`. Node lists use the
//! compact format: 26 bytes per node (20-byte id + 4-byte IPv4 + 2-byte
//! port); peer values are 6-byte IPv4+port strings.
//!
//! Struct fields are declared in bencode key order so encoded dictionaries
//! come out sorted.

use crate::networking::routing::NodeId;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// Compact node info length: 20-byte id + 6-byte address.
pub const COMPACT_NODE_LEN: usize = 26;
/// Compact peer info length: 4-byte IPv4 + 2-byte port.
pub const COMPACT_PEER_LEN: usize = 6;

/// KRPC codec errors.
#[derive(Debug, Error)]
pub enum KrpcError {
    /// Message failed to encode.
    #[error("krpc encode")]
    Encode,
    /// Datagram is not a well-formed KRPC dictionary.
    #[error("krpc decode")]
    Decode,
}

/// Query arguments (`a` dictionary).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KrpcArgs {
    /// Querying node's id.
    pub id: ByteBuf,
    /// For `announce_peer`: ignore `port` and use the UDP source port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implied_port: Option<i64>,
    /// For `get_peers`/`announce_peer`: the target infohash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<ByteBuf>,
    /// For `announce_peer`: the data-plane port being advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    /// For `find_node`: the target node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ByteBuf>,
    /// For `announce_peer`: the write token from a prior `get_peers`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
}

/// Response body (`r` dictionary).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KrpcResponse {
    /// Responding node's id.
    pub id: ByteBuf,
    /// Compact node info for the closest known nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,
    /// Write token for a later `announce_peer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
    /// Compact peer values for the queried infohash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,
}

/// KRPC error payload: `[code, message]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KrpcErrorBody(
    /// Numeric error code.
    pub i64,
    /// Human-readable message.
    pub String,
);

/// A full KRPC datagram.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KrpcMessage {
    /// Query arguments; present when `y == "q"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<KrpcArgs>,
    /// Error body; present when `y == "e"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<KrpcErrorBody>,
    /// Query name; present when `y == "q"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    /// Response body; present when `y == "r"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<KrpcResponse>,
    /// Transaction id, echoed by the responder.
    pub t: ByteBuf,
    /// Message kind: `"q"`, `"r"` or `"e"`.
    pub y: String,
}

impl KrpcMessage {
    /// Encode to a bencoded datagram.
    pub fn to_bytes(&self) -> Result<Vec<u8>, KrpcError> {
        serde_bencode::to_bytes(self).map_err(|_| KrpcError::Encode)
    }

    /// Decode from a bencoded datagram.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KrpcError> {
        serde_bencode::from_bytes(bytes).map_err(|_| KrpcError::Decode)
    }

    /// True for responses.
    pub fn is_response(&self) -> bool {
        self.y == "r"
    }

    /// True for queries.
    pub fn is_query(&self) -> bool {
        self.y == "q"
    }

    fn query(t: Vec<u8>, q: &str, a: KrpcArgs) -> Self {
        Self { a: Some(a), e: None, q: Some(q.to_string()), r: None, t: ByteBuf::from(t), y: "q".into() }
    }

    /// Build a `ping` query.
    pub fn ping(t: Vec<u8>, id: &NodeId) -> Self {
        Self::query(t, "ping", KrpcArgs { id: ByteBuf::from(id.as_bytes().to_vec()), ..Default::default() })
    }

    /// Build a `find_node` query.
    pub fn find_node(t: Vec<u8>, id: &NodeId, target: &NodeId) -> Self {
        Self::query(
            t,
            "find_node",
            KrpcArgs {
                id: ByteBuf::from(id.as_bytes().to_vec()),
                target: Some(ByteBuf::from(target.as_bytes().to_vec())),
                ..Default::default()
            },
        )
    }

    /// Build a `get_peers` query.
    pub fn get_peers(t: Vec<u8>, id: &NodeId, info_hash: &[u8; 20]) -> Self {
        Self::query(
            t,
            "get_peers",
            KrpcArgs {
                id: ByteBuf::from(id.as_bytes().to_vec()),
                info_hash: Some(ByteBuf::from(info_hash.to_vec())),
                ..Default::default()
            },
        )
    }

    /// Build an `announce_peer` query.
    pub fn announce_peer(
        t: Vec<u8>,
        id: &NodeId,
        info_hash: &[u8; 20],
        port: u16,
        token: Vec<u8>,
    ) -> Self {
        Self::query(
            t,
            "announce_peer",
            KrpcArgs {
                id: ByteBuf::from(id.as_bytes().to_vec()),
                implied_port: Some(0),
                info_hash: Some(ByteBuf::from(info_hash.to_vec())),
                port: Some(i64::from(port)),
                token: Some(ByteBuf::from(token)),
                ..Default::default()
            },
        )
    }

    /// Build a plain response carrying only our id.
    pub fn response(t: ByteBuf, id: &NodeId) -> Self {
        Self::response_with(t, KrpcResponse { id: ByteBuf::from(id.as_bytes().to_vec()), ..Default::default() })
    }

    /// Build a response with a full body.
    pub fn response_with(t: ByteBuf, r: KrpcResponse) -> Self {
        Self { a: None, e: None, q: None, r: Some(r), t, y: "r".into() }
    }

    /// Build an error reply.
    pub fn error(t: ByteBuf, code: i64, message: &str) -> Self {
        Self {
            a: None,
            e: Some(KrpcErrorBody(code, message.to_string())),
            q: None,
            r: None,
            t,
            y: "e".into(),
        }
    }
}

/// Encode nodes into the compact 26-byte-per-node format.
pub fn encode_compact_nodes(nodes: &[(NodeId, SocketAddrV4)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for (id, addr) in nodes {
        out.extend_from_slice(id.as_bytes());
        out.extend_from_slice(&addr.ip().octets());
        out.extend_from_slice(&addr.port().to_be_bytes());
    }
    out
}

/// Decode compact node info; trailing partial chunks are ignored.
pub fn decode_compact_nodes(bytes: &[u8]) -> Vec<(NodeId, SocketAddrV4)> {
    bytes
        .chunks_exact(COMPACT_NODE_LEN)
        .filter_map(|chunk| {
            let id = NodeId::from_bytes(&chunk[..20])?;
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            if port == 0 {
                return None;
            }
            Some((id, SocketAddrV4::new(ip, port)))
        })
        .collect()
}

/// Decode compact peer values from a `get_peers` response.
pub fn decode_compact_peers(values: &[ByteBuf]) -> Vec<SocketAddrV4> {
    values
        .iter()
        .filter_map(|v| {
            if v.len() != COMPACT_PEER_LEN {
                return None;
            }
            let ip = Ipv4Addr::new(v[0], v[1], v[2], v[3]);
            let port = u16::from_be_bytes([v[4], v[5]]);
            if port == 0 {
                return None;
            }
            Some(SocketAddrV4::new(ip, port))
        })
        .collect()
}
