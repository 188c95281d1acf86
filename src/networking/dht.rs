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

//! Mainline DHT client: UDP endpoint, bootstrap, iterative lookups,
//! announces and inbound query serving.
//!
//! Individual query failures are logged and counted; they never abort an
//! announce or lookup campaign. An empty routing table after bootstrap is
//! not fatal either: bootstrap retries on a schedule until nodes appear.

use crate::networking::discovery::PeerManager;
use crate::networking::krpc::{
    decode_compact_nodes, decode_compact_peers, encode_compact_nodes, KrpcMessage, KrpcResponse,
};
use crate::networking::routing::{NodeId, RoutingTable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use serde_bytes::ByteBuf;
use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Parallelism of iterative lookups (Kademlia alpha).
const LOOKUP_ALPHA: usize = 3;
/// Nodes an announce targets after a lookup converges.
const ANNOUNCE_TARGETS: usize = 8;
/// Candidate pool bound during a lookup.
const LOOKUP_POOL: usize = 32;
/// Largest datagram accepted from the wire.
const MAX_DATAGRAM: usize = 2048;

/// DHT client errors.
#[derive(Debug, Error)]
pub enum DhtError {
    /// UDP socket could not be bound.
    #[error("dht bind: {0}")]
    Bind(std::io::Error),
    /// Datagram send failed.
    #[error("dht send")]
    Send,
    /// No reply within the per-query timeout.
    #[error("dht query timeout")]
    Timeout,
    /// Bootstrap seed did not resolve.
    #[error("cannot resolve bootstrap node {0}")]
    Resolve(String),
    /// The client has been stopped.
    #[error("dht client stopped")]
    Stopped,
    /// The DHT subsystem is disabled by configuration.
    #[error("dht disabled")]
    Disabled,
}

/// Runtime configuration for the DHT client.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// UDP port to bind (1024-65535).
    pub port: u16,
    /// Seed `host:port` addresses.
    pub bootstrap_nodes: Vec<String>,
    /// Per-query reply timeout.
    pub query_timeout: Duration,
    /// Interval between bootstrap retries while the table is empty.
    pub bootstrap_retry: Duration,
}

impl DhtConfig {
    /// Config with the standard timeouts.
    pub fn new(port: u16, bootstrap_nodes: Vec<String>) -> Self {
        Self {
            port,
            bootstrap_nodes,
            query_timeout: Duration::from_secs(5),
            bootstrap_retry: Duration::from_secs(300),
        }
    }
}

/// Snapshot of DHT activity counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DhtStats {
    /// Nodes currently in the routing table.
    pub nodes: usize,
    /// Good nodes in the routing table.
    pub good_nodes: usize,
    /// Queries sent.
    pub queries_sent: u64,
    /// Responses received.
    pub responses_received: u64,
    /// Announce campaigns completed.
    pub announces: u64,
    /// Peer lookups completed.
    pub lookups: u64,
    /// Query-level failures (timeouts, send errors, remote errors).
    pub errors: u64,
    /// Time of the last bootstrap attempt.
    pub last_bootstrap: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StatsInner {
    queries_sent: u64,
    responses_received: u64,
    announces: u64,
    lookups: u64,
    errors: u64,
    last_bootstrap: Option<DateTime<Utc>>,
}

/// The operations the announcer and discovery layers need from a DHT
/// backend. Production uses [`DhtClient`]; tests use a scripted fake.
#[async_trait]
pub trait DhtService: Send + Sync {
    /// Advertise this host as a peer for `info_hash`; returns how many
    /// nodes acknowledged.
    async fn announce(&self, info_hash: [u8; 20], local_port: u16) -> Result<usize, DhtError>;

    /// Collect peers for `info_hash`, returning on first success or when
    /// `timeout` elapses.
    async fn get_peers(
        &self,
        info_hash: [u8; 20],
        timeout: Duration,
    ) -> Result<Vec<SocketAddrV4>, DhtError>;

    /// Ping a single node.
    async fn ping(&self, addr: SocketAddr) -> Result<(), DhtError>;

    /// Activity counters.
    fn stats(&self) -> DhtStats;
}

struct LookupOutcome {
    peers: Vec<SocketAddrV4>,
    /// Closest responders with their write tokens, nearest first.
    responders: Vec<(NodeId, SocketAddrV4, Option<Vec<u8>>)>,
}

/// UDP mainline DHT client.
pub struct DhtClient {
    cfg: DhtConfig,
    node_id: NodeId,
    socket: Arc<UdpSocket>,
    routing: Mutex<RoutingTable>,
    pending: Mutex<HashMap<u16, oneshot::Sender<KrpcMessage>>>,
    next_txn: AtomicU16,
    stats: Mutex<StatsInner>,
    peers: Arc<PeerManager>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DhtClient {
    /// Bind the UDP endpoint. The client is inert until [`DhtClient::start`].
    pub async fn bind(cfg: DhtConfig, peers: Arc<PeerManager>) -> Result<Arc<Self>, DhtError> {
        let socket =
            UdpSocket::bind(("0.0.0.0", cfg.port)).await.map_err(DhtError::Bind)?;
        let node_id = NodeId::random();
        info!(port = cfg.port, node_id = %node_id.to_hex(), "dht endpoint bound");
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            cfg,
            node_id,
            socket: Arc::new(socket),
            routing: Mutex::new(RoutingTable::new(node_id)),
            pending: Mutex::new(HashMap::new()),
            next_txn: AtomicU16::new(rand::thread_rng().next_u32() as u16),
            stats: Mutex::new(StatsInner::default()),
            peers,
            started: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Local node id.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Spawn the receive loop and the bootstrap task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let recv = {
            let client = Arc::clone(self);
            tokio::spawn(async move { client.recv_loop().await })
        };
        let boot = {
            let client = Arc::clone(self);
            tokio::spawn(async move { client.bootstrap_loop().await })
        };
        let mut tasks = self.tasks.lock().expect("dht task lock poisoned");
        tasks.push(recv);
        tasks.push(boot);
    }

    /// Stop background tasks and drain them.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("dht task lock poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        self.started.store(false, Ordering::SeqCst);
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(e) => {
                            debug!(err = %e, "udp receive failed");
                        }
                    }
                }
            }
        }
        debug!("dht receive loop stopped");
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let SocketAddr::V4(from_v4) = from else {
            return; // compact format is IPv4-only
        };
        let msg = match KrpcMessage::from_bytes(bytes) {
            Ok(msg) => msg,
            Err(_) => {
                debug!(%from, "undecodable dht datagram");
                return;
            }
        };

        self.peers.observe(SocketAddr::V4(from_v4));

        match msg.y.as_str() {
            "r" | "e" => {
                if msg.y == "e" {
                    let mut stats = self.stats.lock().expect("dht stats lock poisoned");
                    stats.errors += 1;
                }
                if let Some(r) = msg.r.as_ref() {
                    if let Some(id) = NodeId::from_bytes(r.id.as_ref()) {
                        let mut routing = self.routing.lock().expect("dht routing lock poisoned");
                        routing.insert(id, from_v4);
                        routing.mark_responded(&id);
                    }
                }
                let txn = match <[u8; 2]>::try_from(msg.t.as_ref()) {
                    Ok(t) => u16::from_be_bytes(t),
                    Err(_) => return,
                };
                let waiter = {
                    let mut pending = self.pending.lock().expect("dht pending lock poisoned");
                    pending.remove(&txn)
                };
                if let Some(tx) = waiter {
                    let _ = tx.send(msg);
                }
            }
            "q" => self.handle_query(msg, from_v4).await,
            other => debug!(%from, kind = other, "unknown krpc message kind"),
        }
    }

    async fn handle_query(&self, msg: KrpcMessage, from: SocketAddrV4) {
        let Some(args) = msg.a.as_ref() else {
            return;
        };
        if let Some(id) = NodeId::from_bytes(args.id.as_ref()) {
            let mut routing = self.routing.lock().expect("dht routing lock poisoned");
            routing.insert(id, from);
        }

        let reply = match msg.q.as_deref() {
            Some("ping") => KrpcMessage::response(msg.t.clone(), &self.node_id),
            Some("find_node") => {
                let target = args
                    .target
                    .as_ref()
                    .and_then(|t| NodeId::from_bytes(t.as_ref()))
                    .unwrap_or(self.node_id);
                let nodes = self.compact_closest(&target);
                KrpcMessage::response_with(
                    msg.t.clone(),
                    KrpcResponse {
                        id: ByteBuf::from(self.node_id.as_bytes().to_vec()),
                        nodes: Some(ByteBuf::from(nodes)),
                        ..Default::default()
                    },
                )
            }
            Some("get_peers") => {
                let target = args
                    .info_hash
                    .as_ref()
                    .and_then(|t| NodeId::from_bytes(t.as_ref()))
                    .unwrap_or(self.node_id);
                let nodes = self.compact_closest(&target);
                let mut token = vec![0u8; 8];
                rand::thread_rng().fill_bytes(&mut token);
                KrpcMessage::response_with(
                    msg.t.clone(),
                    KrpcResponse {
                        id: ByteBuf::from(self.node_id.as_bytes().to_vec()),
                        nodes: Some(ByteBuf::from(nodes)),
                        token: Some(ByteBuf::from(token)),
                        ..Default::default()
                    },
                )
            }
            Some("announce_peer") => {
                // Storing foreign announces is the data plane's job.
                KrpcMessage::error(msg.t.clone(), 203, "announces not accepted")
            }
            _ => KrpcMessage::error(msg.t.clone(), 204, "method unknown"),
        };

        if let Ok(bytes) = reply.to_bytes() {
            if let Err(e) = self.socket.send_to(&bytes, SocketAddr::V4(from)).await {
                debug!(%from, err = %e, "reply send failed");
            }
        }
    }

    fn compact_closest(&self, target: &NodeId) -> Vec<u8> {
        let closest: Vec<(NodeId, SocketAddrV4)> = {
            let routing = self.routing.lock().expect("dht routing lock poisoned");
            routing.closest(target, 8).into_iter().map(|e| (e.id, e.addr)).collect()
        };
        encode_compact_nodes(&closest)
    }

    async fn query(
        &self,
        addr: SocketAddrV4,
        build: impl FnOnce(Vec<u8>) -> KrpcMessage,
    ) -> Result<KrpcMessage, DhtError> {
        let txn = self.next_txn.fetch_add(1, Ordering::Relaxed);
        let msg = build(txn.to_be_bytes().to_vec());
        let bytes = msg.to_bytes().map_err(|_| DhtError::Send)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("dht pending lock poisoned");
            pending.insert(txn, tx);
        }
        {
            let mut stats = self.stats.lock().expect("dht stats lock poisoned");
            stats.queries_sent += 1;
        }

        if self.socket.send_to(&bytes, SocketAddr::V4(addr)).await.is_err() {
            let mut pending = self.pending.lock().expect("dht pending lock poisoned");
            pending.remove(&txn);
            let mut stats = self.stats.lock().expect("dht stats lock poisoned");
            stats.errors += 1;
            return Err(DhtError::Send);
        }

        match timeout(self.cfg.query_timeout, rx).await {
            Ok(Ok(reply)) => {
                let mut stats = self.stats.lock().expect("dht stats lock poisoned");
                stats.responses_received += 1;
                Ok(reply)
            }
            _ => {
                let mut pending = self.pending.lock().expect("dht pending lock poisoned");
                pending.remove(&txn);
                drop(pending);
                let mut stats = self.stats.lock().expect("dht stats lock poisoned");
                stats.errors += 1;
                Err(DhtError::Timeout)
            }
        }
    }

    async fn bootstrap_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            self.bootstrap().await;

            let empty = {
                let routing = self.routing.lock().expect("dht routing lock poisoned");
                routing.is_empty()
            };
            if empty {
                warn!("routing table still empty after bootstrap; will retry");
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.cfg.bootstrap_retry) => {}
            }

            let empty = {
                let routing = self.routing.lock().expect("dht routing lock poisoned");
                routing.is_empty()
            };
            if !empty {
                // Table is populated; periodic maintenance takes over.
                break;
            }
        }
    }

    /// Resolve the seed nodes and walk towards our own id to populate the
    /// routing table. Safe to call repeatedly.
    pub async fn bootstrap(&self) {
        {
            let mut stats = self.stats.lock().expect("dht stats lock poisoned");
            stats.last_bootstrap = Some(Utc::now());
        }

        let mut seeds: Vec<SocketAddrV4> = Vec::new();
        for node in &self.cfg.bootstrap_nodes {
            match tokio::net::lookup_host(node.as_str()).await {
                Ok(addrs) => {
                    seeds.extend(addrs.filter_map(|a| match a {
                        SocketAddr::V4(v4) => Some(v4),
                        SocketAddr::V6(_) => None,
                    }));
                }
                Err(e) => {
                    warn!(node = %node, err = %e, "bootstrap node did not resolve");
                }
            }
        }

        let futures = seeds.iter().map(|addr| {
            let addr = *addr;
            async move {
                let reply = self
                    .query(addr, |t| KrpcMessage::find_node(t, &self.node_id, &self.node_id))
                    .await;
                if let Ok(msg) = reply {
                    self.absorb_nodes(&msg);
                }
            }
        });
        futures::future::join_all(futures).await;

        // A few refinement rounds toward our own id.
        let deadline = Instant::now() + self.cfg.query_timeout * 3;
        let _ = self.iterative_find(self.node_id, None, deadline, false).await;

        let (len, good) = {
            let routing = self.routing.lock().expect("dht routing lock poisoned");
            (routing.len(), routing.good_len())
        };
        info!(nodes = len, good, "dht bootstrap round finished");
    }

    fn absorb_nodes(&self, msg: &KrpcMessage) {
        let Some(r) = msg.r.as_ref() else {
            return;
        };
        let Some(nodes) = r.nodes.as_ref() else {
            return;
        };
        let mut routing = self.routing.lock().expect("dht routing lock poisoned");
        for (id, addr) in decode_compact_nodes(nodes.as_ref()) {
            routing.insert(id, addr);
        }
    }

    async fn iterative_find(
        &self,
        target: NodeId,
        info_hash: Option<[u8; 20]>,
        deadline: Instant,
        stop_on_peers: bool,
    ) -> LookupOutcome {
        let mut candidates: Vec<(NodeId, SocketAddrV4)> = {
            let routing = self.routing.lock().expect("dht routing lock poisoned");
            routing.closest(&target, LOOKUP_POOL).into_iter().map(|e| (e.id, e.addr)).collect()
        };
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut responders: Vec<(NodeId, SocketAddrV4, Option<Vec<u8>>)> = Vec::new();
        let mut peers: Vec<SocketAddrV4> = Vec::new();

        while Instant::now() < deadline {
            let batch: Vec<(NodeId, SocketAddrV4)> = candidates
                .iter()
                .filter(|(id, _)| !queried.contains(id))
                .take(LOOKUP_ALPHA)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }

            let replies = futures::future::join_all(batch.iter().map(|(id, addr)| {
                let id = *id;
                let addr = *addr;
                async move {
                    let reply = match info_hash {
                        Some(ih) => {
                            self.query(addr, |t| KrpcMessage::get_peers(t, &self.node_id, &ih))
                                .await
                        }
                        None => {
                            self.query(addr, |t| KrpcMessage::find_node(t, &self.node_id, &target))
                                .await
                        }
                    };
                    (id, addr, reply)
                }
            }))
            .await;

            for (id, addr, reply) in replies {
                queried.insert(id);
                match reply {
                    Ok(msg) => {
                        self.absorb_nodes(&msg);
                        if let Some(r) = msg.r.as_ref() {
                            responders.push((id, addr, r.token.as_ref().map(|t| t.to_vec())));
                            if let Some(values) = r.values.as_ref() {
                                peers.extend(decode_compact_peers(values));
                            }
                            if let Some(nodes) = r.nodes.as_ref() {
                                for pair in decode_compact_nodes(nodes.as_ref()) {
                                    if !candidates.contains(&pair) {
                                        candidates.push(pair);
                                    }
                                }
                            }
                        }
                    }
                    Err(_) => {
                        let mut routing = self.routing.lock().expect("dht routing lock poisoned");
                        routing.mark_failed(&id);
                    }
                }
            }

            peers.sort();
            peers.dedup();
            if stop_on_peers && !peers.is_empty() {
                break;
            }

            candidates.sort_by_key(|(id, _)| id.distance(&target));
            candidates.truncate(LOOKUP_POOL);
        }

        responders.sort_by_key(|(id, _, _)| id.distance(&target));
        responders.truncate(ANNOUNCE_TARGETS);
        LookupOutcome { peers, responders }
    }
}

#[async_trait]
impl DhtService for DhtClient {
    async fn announce(&self, info_hash: [u8; 20], local_port: u16) -> Result<usize, DhtError> {
        let target = NodeId::from_bytes(&info_hash).ok_or(DhtError::Send)?;
        let deadline = Instant::now() + self.cfg.query_timeout * 3;
        let outcome = self.iterative_find(target, Some(info_hash), deadline, false).await;

        let mut acks = 0usize;
        for (_, addr, token) in &outcome.responders {
            let Some(token) = token else {
                continue;
            };
            let reply = self
                .query(*addr, |t| {
                    KrpcMessage::announce_peer(t, &self.node_id, &info_hash, local_port, token.clone())
                })
                .await;
            match reply {
                Ok(msg) if msg.is_response() => acks += 1,
                Ok(_) | Err(_) => {
                    debug!(%addr, "announce_peer not acknowledged");
                }
            }
        }

        let mut stats = self.stats.lock().expect("dht stats lock poisoned");
        stats.announces += 1;
        Ok(acks)
    }

    async fn get_peers(
        &self,
        info_hash: [u8; 20],
        timeout: Duration,
    ) -> Result<Vec<SocketAddrV4>, DhtError> {
        let target = NodeId::from_bytes(&info_hash).ok_or(DhtError::Send)?;
        let deadline = Instant::now() + timeout;
        let outcome = self.iterative_find(target, Some(info_hash), deadline, true).await;

        for peer in &outcome.peers {
            self.peers.observe(SocketAddr::V4(*peer));
        }

        let mut stats = self.stats.lock().expect("dht stats lock poisoned");
        stats.lookups += 1;
        Ok(outcome.peers)
    }

    async fn ping(&self, addr: SocketAddr) -> Result<(), DhtError> {
        let SocketAddr::V4(addr) = addr else {
            return Err(DhtError::Send);
        };
        self.query(addr, |t| KrpcMessage::ping(t, &self.node_id)).await.map(|_| ())
    }

    fn stats(&self) -> DhtStats {
        let (nodes, good_nodes) = {
            let routing = self.routing.lock().expect("dht routing lock poisoned");
            (routing.len(), routing.good_len())
        };
        let inner = self.stats.lock().expect("dht stats lock poisoned");
        DhtStats {
            nodes,
            good_nodes,
            queries_sent: inner.queries_sent,
            responses_received: inner.responses_received,
            announces: inner.announces,
            lookups: inner.lookups,
            errors: inner.errors,
            last_bootstrap: inner.last_bootstrap,
        }
    }
}
