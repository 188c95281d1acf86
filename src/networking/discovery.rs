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

//! Peer discovery with a bounded TTL cache, and liveness tracking for
//! every peer this daemon has observed.

use crate::networking::dht::{DhtError, DhtService};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// How often expired discovery entries are swept.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A peer observed through discovery, announce replies or inbound traffic.
#[derive(Clone, Debug, Serialize)]
pub struct PeerContact {
    /// Peer IP address.
    pub ip: std::net::IpAddr,
    /// Peer port.
    pub port: u16,
    /// Last time any message from this peer was observed.
    pub last_seen: DateTime<Utc>,
    /// Infohashes (hex) the peer has shown interest in.
    pub packages_interested_in: BTreeSet<String>,
}

/// One cached lookup result.
#[derive(Clone, Debug, Serialize)]
pub struct DiscoveryCacheEntry {
    /// Infohash the entry answers for, lowercase hex.
    pub info_hash: String,
    /// Peers found for it.
    pub peers: Vec<PeerContact>,
    /// When the lookup ran.
    pub fetched_at: DateTime<Utc>,
    /// When the entry stops being served.
    pub expires_at: DateTime<Utc>,
}

impl DiscoveryCacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Discovery cache counters.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheStats {
    /// Lookups answered from cache.
    pub hits: u64,
    /// Lookups that went to the DHT.
    pub misses: u64,
    /// Entries currently cached.
    pub cached: usize,
    /// Entries dropped by the sweeper.
    pub evictions: u64,
}

struct DiscoveryInner {
    dht: Arc<dyn DhtService>,
    cache_ttl: ChronoDuration,
    cache: Mutex<HashMap<[u8; 20], DiscoveryCacheEntry>>,
    hits: Mutex<(u64, u64, u64)>, // (hits, misses, evictions)
    peer_manager: Arc<PeerManager>,
}

impl DiscoveryInner {
    fn sweep(&self) {
        let now = Utc::now();
        let dropped = {
            let mut cache = self.cache.lock().expect("discovery cache lock poisoned");
            let before = cache.len();
            cache.retain(|_, entry| !entry.is_expired(now));
            (before - cache.len()) as u64
        };
        if dropped > 0 {
            debug!(dropped, "discovery cache sweep");
            let mut counters = self.hits.lock().expect("discovery stats lock poisoned");
            counters.2 += dropped;
        }
    }
}

/// Peer discovery front-end over the DHT with a TTL cache.
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    /// Create a discovery layer over a borrowed DHT backend.
    pub fn new(
        dht: Arc<dyn DhtService>,
        cache_ttl: Duration,
        peer_manager: Arc<PeerManager>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(DiscoveryInner {
                dht,
                cache_ttl: ChronoDuration::from_std(cache_ttl)
                    .unwrap_or_else(|_| ChronoDuration::minutes(15)),
                cache: Mutex::new(HashMap::new()),
                hits: Mutex::new((0, 0, 0)),
                peer_manager,
            }),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Launch the periodic expiry sweeper. Calling twice is a no-op.
    pub fn start_sweeper(&self) {
        let mut task = self.task.lock().expect("discovery task lock poisoned");
        if task.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => inner.sweep(),
                }
            }
        }));
    }

    /// Stop the sweeper task.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = {
            let mut task = self.task.lock().expect("discovery task lock poisoned");
            task.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Find peers for `info_hash`: a fresh cache entry answers immediately;
    /// otherwise the DHT is queried and the result cached.
    pub async fn find_peers(
        &self,
        info_hash: [u8; 20],
        timeout: Duration,
    ) -> Result<Vec<PeerContact>, DhtError> {
        let now = Utc::now();
        {
            let cache = self.inner.cache.lock().expect("discovery cache lock poisoned");
            if let Some(entry) = cache.get(&info_hash) {
                if !entry.is_expired(now) {
                    let mut counters = self.inner.hits.lock().expect("discovery stats lock poisoned");
                    counters.0 += 1;
                    return Ok(entry.peers.clone());
                }
            }
        }
        {
            let mut counters = self.inner.hits.lock().expect("discovery stats lock poisoned");
            counters.1 += 1;
        }

        let found = self.inner.dht.get_peers(info_hash, timeout).await?;
        let hex_hash = hex::encode(info_hash);
        let peers: Vec<PeerContact> = found
            .iter()
            .map(|addr| {
                self.inner.peer_manager.observe_interested(SocketAddr::V4(*addr), &hex_hash);
                PeerContact {
                    ip: std::net::IpAddr::V4(*addr.ip()),
                    port: addr.port(),
                    last_seen: Utc::now(),
                    packages_interested_in: BTreeSet::from([hex_hash.clone()]),
                }
            })
            .collect();

        let fetched_at = Utc::now();
        let entry = DiscoveryCacheEntry {
            info_hash: hex_hash,
            peers: peers.clone(),
            fetched_at,
            expires_at: fetched_at + self.inner.cache_ttl,
        };
        {
            let mut cache = self.inner.cache.lock().expect("discovery cache lock poisoned");
            cache.insert(info_hash, entry);
        }
        Ok(peers)
    }

    /// Snapshot of all non-expired cache entries.
    pub fn get_all_results(&self) -> Vec<DiscoveryCacheEntry> {
        let now = Utc::now();
        let cache = self.inner.cache.lock().expect("discovery cache lock poisoned");
        cache.values().filter(|e| !e.is_expired(now)).cloned().collect()
    }

    /// Cache counters.
    pub fn stats(&self) -> CacheStats {
        let (hits, misses, evictions) = *self.inner.hits.lock().expect("discovery stats lock poisoned");
        let cached = self.inner.cache.lock().expect("discovery cache lock poisoned").len();
        CacheStats { hits, misses, cached, evictions }
    }
}

/// Peer-manager counters.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PeerStats {
    /// Peers currently tracked.
    pub tracked: u64,
    /// Peers ever observed.
    pub total_observed: u64,
    /// Peers dropped as stale.
    pub stale_removed: u64,
}

struct PeerManagerInner {
    peers: HashMap<SocketAddr, PeerContact>,
    total_observed: u64,
    stale_removed: u64,
}

/// Tracks every peer observed through discovery, announce replies or
/// inbound DHT traffic, and evicts the ones that have gone quiet.
pub struct PeerManager {
    inner: Mutex<PeerManagerInner>,
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PeerManagerInner {
                peers: HashMap::new(),
                total_observed: 0,
                stale_removed: 0,
            }),
        }
    }

    /// Record a sighting of `addr`, creating the contact on first sight.
    pub fn observe(&self, addr: SocketAddr) {
        self.observe_inner(addr, None);
    }

    /// Record a sighting of `addr` interested in `info_hash_hex`.
    pub fn observe_interested(&self, addr: SocketAddr, info_hash_hex: &str) {
        self.observe_inner(addr, Some(info_hash_hex));
    }

    fn observe_inner(&self, addr: SocketAddr, interest: Option<&str>) {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("peer lock poisoned");
        match inner.peers.get_mut(&addr) {
            Some(contact) => {
                contact.last_seen = now;
                if let Some(hash) = interest {
                    contact.packages_interested_in.insert(hash.to_string());
                }
            }
            None => {
                let mut interested = BTreeSet::new();
                if let Some(hash) = interest {
                    interested.insert(hash.to_string());
                }
                inner.peers.insert(
                    addr,
                    PeerContact {
                        ip: addr.ip(),
                        port: addr.port(),
                        last_seen: now,
                        packages_interested_in: interested,
                    },
                );
                inner.total_observed += 1;
            }
        }
    }

    /// Explicitly add a peer by IPv4 endpoint.
    pub fn add_peer(&self, addr: SocketAddrV4) {
        self.observe(SocketAddr::V4(addr));
    }

    /// Refresh a peer's `last_seen`; unknown peers are ignored.
    pub fn update_last_seen(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().expect("peer lock poisoned");
        if let Some(contact) = inner.peers.get_mut(&addr) {
            contact.last_seen = Utc::now();
        }
    }

    /// Snapshot of all tracked peers.
    pub fn get_all_peers(&self) -> Vec<PeerContact> {
        let inner = self.inner.lock().expect("peer lock poisoned");
        inner.peers.values().cloned().collect()
    }

    /// Counters.
    pub fn get_stats(&self) -> PeerStats {
        let inner = self.inner.lock().expect("peer lock poisoned");
        PeerStats {
            tracked: inner.peers.len() as u64,
            total_observed: inner.total_observed,
            stale_removed: inner.stale_removed,
        }
    }

    /// Drop peers not seen within `threshold`; returns how many.
    pub fn remove_stale_peers(&self, threshold: Duration) -> usize {
        let threshold = ChronoDuration::from_std(threshold)
            .unwrap_or_else(|_| ChronoDuration::minutes(5));
        let cutoff = Utc::now() - threshold;
        let mut inner = self.inner.lock().expect("peer lock poisoned");
        let before = inner.peers.len();
        inner.peers.retain(|_, contact| contact.last_seen > cutoff);
        let removed = before - inner.peers.len();
        inner.stale_removed += removed as u64;
        removed
    }
}
