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

//! Kademlia routing table: 160-bit node ids, XOR metric, k-buckets.
//! Bookkeeping is deterministic and integer-only.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

/// Bucket capacity (Kademlia k).
pub const BUCKET_SIZE: usize = 20;
/// Number of buckets (one per possible shared-prefix length).
pub const NUM_BUCKETS: usize = 160;
/// A node is questionable once silent for this long.
pub const NODE_FRESH_FOR: Duration = Duration::from_secs(15 * 60);
/// Consecutive failures before a node counts as bad.
pub const MAX_FAILURES: u32 = 3;

/// A 160-bit DHT node identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; 20]);

impl NodeId {
    /// A uniformly random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 20];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self(bytes)
    }

    /// Construct from exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 20 {
            return None;
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to another id.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bucket index for `other` relative to this id: 159 minus the number
    /// of leading zero bits of the XOR distance. `None` for `other == self`.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let dist = self.distance(other);
        for (i, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                let leading = i * 8 + byte.leading_zeros() as usize;
                return Some(NUM_BUCKETS - 1 - leading);
            }
        }
        None
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

/// One known remote node.
#[derive(Clone, Debug)]
pub struct NodeEntry {
    /// The node's id.
    pub id: NodeId,
    /// Its UDP endpoint.
    pub addr: SocketAddrV4,
    last_seen: Instant,
    failures: u32,
}

impl NodeEntry {
    fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        Self { id, addr, last_seen: Instant::now(), failures: 0 }
    }

    /// A good node has responded recently and not failed repeatedly.
    pub fn is_good(&self) -> bool {
        self.failures < MAX_FAILURES && self.last_seen.elapsed() < NODE_FRESH_FOR
    }

    /// True once the failure budget is exhausted.
    pub fn is_bad(&self) -> bool {
        self.failures >= MAX_FAILURES
    }
}

/// K-bucket routing table centred on the local node id.
pub struct RoutingTable {
    local: NodeId,
    buckets: Vec<Vec<NodeEntry>>,
}

impl RoutingTable {
    /// Empty table for `local`.
    pub fn new(local: NodeId) -> Self {
        Self { local, buckets: vec![Vec::new(); NUM_BUCKETS] }
    }

    /// The local id this table is centred on.
    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// Record a sighting of `id` at `addr`. Known nodes are refreshed; new
    /// nodes fill free bucket slots or evict a bad occupant.
    pub fn insert(&mut self, id: NodeId, addr: SocketAddrV4) -> bool {
        let Some(index) = self.local.bucket_index(&id) else {
            return false; // our own id
        };
        let bucket = &mut self.buckets[index];

        if let Some(entry) = bucket.iter_mut().find(|e| e.id == id) {
            entry.addr = addr;
            entry.last_seen = Instant::now();
            entry.failures = 0;
            return true;
        }

        if bucket.len() < BUCKET_SIZE {
            bucket.push(NodeEntry::new(id, addr));
            return true;
        }

        if let Some(pos) = bucket.iter().position(|e| e.is_bad()) {
            bucket[pos] = NodeEntry::new(id, addr);
            return true;
        }
        false
    }

    /// Count a query failure against `id`.
    pub fn mark_failed(&mut self, id: &NodeId) {
        if let Some(entry) = self.find_mut(id) {
            entry.failures = entry.failures.saturating_add(1);
        }
    }

    /// Record a successful response from `id`.
    pub fn mark_responded(&mut self, id: &NodeId) {
        if let Some(entry) = self.find_mut(id) {
            entry.failures = 0;
            entry.last_seen = Instant::now();
        }
    }

    fn find_mut(&mut self, id: &NodeId) -> Option<&mut NodeEntry> {
        let index = self.local.bucket_index(id)?;
        self.buckets[index].iter_mut().find(|e| e.id == *id)
    }

    /// The `n` good nodes closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<NodeEntry> {
        let mut all: Vec<&NodeEntry> =
            self.buckets.iter().flatten().filter(|e| e.is_good()).collect();
        all.sort_by_key(|e| e.id.distance(target));
        all.into_iter().take(n).cloned().collect()
    }

    /// Total tracked nodes.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// True when no nodes are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// Number of good nodes.
    pub fn good_len(&self) -> usize {
        self.buckets.iter().flatten().filter(|e| e.is_good()).count()
    }

    /// Drop nodes whose failure budget is exhausted; returns how many.
    pub fn prune_bad(&mut self) -> usize {
        let mut dropped = 0;
        for bucket in &mut self.buckets {
            let before = bucket.len();
            bucket.retain(|e| !e.is_bad());
            dropped += before - bucket.len();
        }
        dropped
    }
}
