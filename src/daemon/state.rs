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

//! Thread-safe daemon runtime state and statistics. Snapshots are returned
//! by value; callers never hold the locks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::RwLock;
use std::time::Instant;

/// Daemon lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonStatus {
    /// Startup sequence running.
    Starting,
    /// All subsystems up.
    Running,
    /// Shutdown sequence running.
    Stopping,
    /// Fully stopped.
    Stopped,
    /// A non-recoverable error was recorded.
    Error,
}

/// Snapshot of the daemon state.
#[derive(Clone, Debug, Serialize)]
pub struct StateSnapshot {
    /// Current status.
    pub status: DaemonStatus,
    /// When the daemon started.
    pub start_time: DateTime<Utc>,
    /// Seconds since `start_time`.
    pub uptime_secs: i64,
    /// Packages currently registered.
    pub active_packages: u64,
    /// Peers currently tracked.
    pub total_peers: u64,
    /// Nodes in the DHT routing table.
    pub dht_nodes: u64,
    /// Most recent non-recoverable error, if any.
    pub last_error: Option<String>,
}

struct StateInner {
    status: DaemonStatus,
    start_time: DateTime<Utc>,
    active_packages: u64,
    total_peers: u64,
    dht_nodes: u64,
    last_error: Option<String>,
}

/// Shared daemon state.
pub struct DaemonState {
    inner: RwLock<StateInner>,
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonState {
    /// Fresh state in `Stopped`.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StateInner {
                status: DaemonStatus::Stopped,
                start_time: Utc::now(),
                active_packages: 0,
                total_peers: 0,
                dht_nodes: 0,
                last_error: None,
            }),
        }
    }

    /// Current status.
    pub fn status(&self) -> DaemonStatus {
        self.inner.read().expect("state lock poisoned").status
    }

    /// Transition to `status`; entering `Starting` stamps `start_time`.
    pub fn set_status(&self, status: DaemonStatus) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        if status == DaemonStatus::Starting {
            inner.start_time = Utc::now();
        }
        inner.status = status;
    }

    /// Record a non-recoverable error and flip the status.
    pub fn record_error(&self, message: &str) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.status = DaemonStatus::Error;
        inner.last_error = Some(message.to_string());
    }

    /// Update the package counter.
    pub fn set_active_packages(&self, count: u64) {
        self.inner.write().expect("state lock poisoned").active_packages = count;
    }

    /// Update the peer and DHT-node counters.
    pub fn set_network_counts(&self, total_peers: u64, dht_nodes: u64) {
        let mut inner = self.inner.write().expect("state lock poisoned");
        inner.total_peers = total_peers;
        inner.dht_nodes = dht_nodes;
    }

    /// Snapshot by value.
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read().expect("state lock poisoned");
        StateSnapshot {
            status: inner.status,
            start_time: inner.start_time,
            uptime_secs: (Utc::now() - inner.start_time).num_seconds().max(0),
            active_packages: inner.active_packages,
            total_peers: inner.total_peers,
            dht_nodes: inner.dht_nodes,
            last_error: inner.last_error.clone(),
        }
    }
}

/// Snapshot of cumulative and rolling transfer statistics.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct StatisticsSnapshot {
    /// Total bytes served to peers.
    pub total_bytes_uploaded: u64,
    /// Total bytes received from peers.
    pub total_bytes_downloaded: u64,
    /// Packages ever seeded by this daemon.
    pub total_packages_seeded: u64,
    /// Peers ever connected.
    pub total_peers_connected: u64,
    /// Upload rate over the last tick, bytes/s.
    pub current_upload_rate: u64,
    /// Download rate over the last tick, bytes/s.
    pub current_download_rate: u64,
    /// Highest observed upload rate, bytes/s.
    pub peak_upload_rate: u64,
    /// Highest observed download rate, bytes/s.
    pub peak_download_rate: u64,
}

struct StatisticsInner {
    snapshot: StatisticsSnapshot,
    last_uploaded: u64,
    last_downloaded: u64,
    last_tick: Instant,
}

/// Cumulative counters plus rolling rates, updated by a periodic tick.
pub struct DaemonStatistics {
    inner: RwLock<StatisticsInner>,
}

impl Default for DaemonStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonStatistics {
    /// Zeroed statistics.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StatisticsInner {
                snapshot: StatisticsSnapshot::default(),
                last_uploaded: 0,
                last_downloaded: 0,
                last_tick: Instant::now(),
            }),
        }
    }

    /// Count bytes served.
    pub fn add_uploaded(&self, bytes: u64) {
        let mut inner = self.inner.write().expect("stats lock poisoned");
        inner.snapshot.total_bytes_uploaded += bytes;
    }

    /// Count bytes received.
    pub fn add_downloaded(&self, bytes: u64) {
        let mut inner = self.inner.write().expect("stats lock poisoned");
        inner.snapshot.total_bytes_downloaded += bytes;
    }

    /// Count a newly seeded package.
    pub fn incr_packages_seeded(&self) {
        let mut inner = self.inner.write().expect("stats lock poisoned");
        inner.snapshot.total_packages_seeded += 1;
    }

    /// Count a newly connected peer.
    pub fn incr_peers_connected(&self) {
        let mut inner = self.inner.write().expect("stats lock poisoned");
        inner.snapshot.total_peers_connected += 1;
    }

    /// Recompute rolling rates from the byte deltas since the last tick.
    pub fn tick(&self) {
        let mut inner = self.inner.write().expect("stats lock poisoned");
        let elapsed = inner.last_tick.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }

        let up_delta = inner.snapshot.total_bytes_uploaded - inner.last_uploaded;
        let down_delta = inner.snapshot.total_bytes_downloaded - inner.last_downloaded;
        let up_rate = (up_delta as f64 / elapsed) as u64;
        let down_rate = (down_delta as f64 / elapsed) as u64;

        inner.snapshot.current_upload_rate = up_rate;
        inner.snapshot.current_download_rate = down_rate;
        inner.snapshot.peak_upload_rate = inner.snapshot.peak_upload_rate.max(up_rate);
        inner.snapshot.peak_download_rate = inner.snapshot.peak_download_rate.max(down_rate);

        inner.last_uploaded = inner.snapshot.total_bytes_uploaded;
        inner.last_downloaded = inner.snapshot.total_bytes_downloaded;
        inner.last_tick = Instant::now();
    }

    /// Snapshot by value.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.inner.read().expect("stats lock poisoned").snapshot
    }
}
