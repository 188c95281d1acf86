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

//! Periodic DHT re-announce loop for registered packages.
//!
//! The announcer borrows the DHT client and never closes it. Each tick
//! sleeps for the configured interval with ±10% jitter, then re-announces
//! every tracked package. A failed announce leaves the entry tracked; the
//! next tick retries it.

use crate::networking::dht::DhtService;
use crate::registry::packages::PackageManager;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One package tracked for periodic announce.
#[derive(Clone, Debug, Serialize)]
pub struct AnnouncedPackage {
    /// Infohash announced on the DHT, lowercase hex.
    pub info_hash: String,
    /// Package name, for introspection.
    pub package_name: String,
    /// Creator key fingerprint.
    pub creator_fingerprint: String,
    /// Maintainer key fingerprint.
    pub maintainer_fingerprint: String,
    /// Time of the most recent successful announce.
    pub last_announced: Option<DateTime<Utc>>,
    /// Number of successful announces.
    pub announce_count: u64,
}

struct AnnouncerInner {
    dht: Arc<dyn DhtService>,
    local_port: u16,
    interval: Duration,
    packages: Mutex<HashMap<[u8; 20], AnnouncedPackage>>,
    /// Used to reflect announce status back into the catalog.
    registry: Option<Arc<PackageManager>>,
}

impl AnnouncerInner {
    async fn announce_one(&self, info_hash: [u8; 20]) {
        let name = {
            let packages = self.packages.lock().expect("announcer lock poisoned");
            match packages.get(&info_hash) {
                Some(entry) => entry.package_name.clone(),
                None => return, // removed meanwhile
            }
        };

        match self.dht.announce(info_hash, self.local_port).await {
            Ok(acks) => {
                debug!(package = %name, acks, "announced");
                let now = Utc::now();
                {
                    let mut packages = self.packages.lock().expect("announcer lock poisoned");
                    if let Some(entry) = packages.get_mut(&info_hash) {
                        entry.last_announced = Some(now);
                        entry.announce_count += 1;
                    }
                }
                self.record_in_registry(&info_hash);
            }
            Err(e) => {
                warn!(package = %name, err = %e, "announce failed; will retry next tick");
            }
        }
    }

    fn record_in_registry(&self, info_hash: &[u8; 20]) {
        let Some(registry) = self.registry.as_ref() else {
            return;
        };
        // The catalog id starts with the infohash hex.
        let prefix = hex::encode(info_hash);
        let matching: Vec<String> = registry
            .list_packages()
            .into_iter()
            .filter(|p| p.package_id.starts_with(&prefix))
            .map(|p| p.package_id)
            .collect();
        for package_id in matching {
            if let Err(e) = registry.update_announcement_status(&package_id, true) {
                warn!(package_id, err = %e, "failed to record announce in catalog");
            }
        }
    }

    async fn announce_all(&self) {
        let hashes: Vec<[u8; 20]> = {
            let packages = self.packages.lock().expect("announcer lock poisoned");
            packages.keys().copied().collect()
        };
        if hashes.is_empty() {
            return;
        }
        debug!(count = hashes.len(), "re-announce tick");
        for info_hash in hashes {
            self.announce_one(info_hash).await;
        }
    }
}

/// Periodic announce driver. Construct once, [`Announcer::start`], and
/// feed it packages as they are ingested.
pub struct Announcer {
    inner: Arc<AnnouncerInner>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Announcer {
    /// Create an announcer over a borrowed DHT backend. `registry`, when
    /// given, receives announcement-status updates.
    pub fn new(
        dht: Arc<dyn DhtService>,
        local_port: u16,
        interval: Duration,
        registry: Option<Arc<PackageManager>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(AnnouncerInner {
                dht,
                local_port,
                interval,
                packages: Mutex::new(HashMap::new()),
                registry,
            }),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Launch the background re-announce loop. Calling twice is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock().expect("announcer task lock poisoned");
        if task.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            info!(interval_secs = inner.interval.as_secs(), "announcer started");
            loop {
                let sleep_for = jittered(inner.interval);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                inner.announce_all().await;
            }
            debug!("announcer stopped");
        }));
    }

    /// Cancel the background task and wait for it to drain. The DHT client
    /// stays open; its ownership is upstream.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = {
            let mut task = self.task.lock().expect("announcer task lock poisoned");
            task.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Track a package and trigger an immediate announce attempt in the
    /// background. A failed first attempt keeps the package tracked.
    pub fn add_package(
        &self,
        info_hash: [u8; 20],
        package_name: &str,
        creator_fingerprint: &str,
        maintainer_fingerprint: &str,
    ) {
        {
            let mut packages = self.inner.packages.lock().expect("announcer lock poisoned");
            packages.insert(
                info_hash,
                AnnouncedPackage {
                    info_hash: hex::encode(info_hash),
                    package_name: package_name.to_string(),
                    creator_fingerprint: creator_fingerprint.to_string(),
                    maintainer_fingerprint: maintainer_fingerprint.to_string(),
                    last_announced: None,
                    announce_count: 0,
                },
            );
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.announce_one(info_hash).await;
        });
    }

    /// Stop announcing a package. The running tick simply skips it.
    pub fn remove_package(&self, info_hash: &[u8; 20]) {
        let mut packages = self.inner.packages.lock().expect("announcer lock poisoned");
        packages.remove(info_hash);
    }

    /// Snapshot of tracked packages.
    pub fn get_packages(&self) -> Vec<AnnouncedPackage> {
        let packages = self.inner.packages.lock().expect("announcer lock poisoned");
        packages.values().cloned().collect()
    }

    /// Number of tracked packages.
    pub fn len(&self) -> usize {
        let packages = self.inner.packages.lock().expect("announcer lock poisoned");
        packages.len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn jittered(interval: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.9..=1.1);
    interval.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(100);
        for _ in 0..64 {
            let j = jittered(base);
            assert!(j >= Duration::from_secs(90));
            assert!(j <= Duration::from_secs(110));
        }
    }
}
