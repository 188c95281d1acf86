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

//! Daemon lifecycle: wiring of all subsystems, ordered startup/shutdown
//! and the background maintenance loop.

pub mod api;
pub mod state;

use crate::core::config::{ConfigError, DaemonConfig};
use crate::core::hostkey::{HostKeyError, HostKeyManager};
use crate::core::package::info_hash_from_package_id;
use crate::monitoring::metrics::Metrics;
use crate::networking::announcer::Announcer;
use crate::networking::dht::{DhtClient, DhtConfig, DhtError, DhtService};
use crate::networking::discovery::{Discovery, PeerManager};
use crate::registry::maintainers::{MaintainerError, MaintainerRegistry};
use crate::registry::packages::{PackageManager, RegistryError};
use self::state::{DaemonState, DaemonStatistics, DaemonStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Peers go stale after this much silence.
pub const PEER_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);
/// Discovery cache entries live this long.
pub const DISCOVERY_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
/// Period of the maintenance/statistics tick.
const MAINTENANCE_TICK: Duration = Duration::from_secs(10);
/// Bounded wait for the maintenance loop to acknowledge shutdown.
const MAINTENANCE_STOP_WAIT: Duration = Duration::from_millis(100);

/// Daemon lifecycle errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// `start` called while already running.
    #[error("daemon already running")]
    AlreadyRunning,
    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Host keypair could not be loaded or created.
    #[error("host key: {0}")]
    HostKey(#[from] HostKeyError),
    /// Package catalog failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Maintainer registry failure.
    #[error(transparent)]
    Maintainer(#[from] MaintainerError),
    /// DHT subsystem failure.
    #[error(transparent)]
    Dht(#[from] DhtError),
    /// Filesystem failure outside the registries.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Prometheus registry setup failed.
    #[error("metrics init failed")]
    Metrics,
}

/// The assembled daemon. Owns every long-lived subsystem for the duration
/// of its run.
pub struct Daemon {
    cfg: DaemonConfig,
    state: Arc<DaemonState>,
    stats: Arc<DaemonStatistics>,
    metrics: Arc<Metrics>,
    host_key: Arc<HostKeyManager>,
    packages: Arc<PackageManager>,
    maintainers: Arc<MaintainerRegistry>,
    peer_manager: Arc<PeerManager>,
    dht_override: Option<Arc<dyn DhtService>>,
    dht_client: Mutex<Option<Arc<DhtClient>>>,
    dht: Mutex<Option<Arc<dyn DhtService>>>,
    announcer: Mutex<Option<Arc<Announcer>>>,
    discovery: Mutex<Option<Arc<Discovery>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    shutdown_requested: Arc<Notify>,
}

impl Daemon {
    /// Validate the configuration, prepare storage and load persisted state.
    /// Network subsystems come up in [`Daemon::start`].
    pub fn new(cfg: DaemonConfig) -> Result<Self, DaemonError> {
        Self::with_dht_backend(cfg, None)
    }

    /// Like [`Daemon::new`] but with an injected DHT backend instead of a
    /// live UDP client.
    pub fn with_dht_backend(
        cfg: DaemonConfig,
        dht_override: Option<Arc<dyn DhtService>>,
    ) -> Result<Self, DaemonError> {
        cfg.validate()?;

        ensure_dir(&cfg.storage_dir, 0o755)?;
        ensure_dir(&cfg.packages_dir(), 0o755)?;
        ensure_dir(&cfg.keys_dir(), 0o700)?;

        let host_key = Arc::new(HostKeyManager::open(&cfg.keys_dir())?);
        info!(fingerprint = %host_key.fingerprint(), "host key ready");

        let packages =
            Arc::new(PackageManager::new(cfg.catalog_path(), cfg.packages_dir()));
        packages.load_state()?;
        let maintainers = Arc::new(MaintainerRegistry::new(cfg.maintainers_path()));
        maintainers.load_state()?;
        info!(
            packages = packages.len(),
            maintainers = maintainers.list().len(),
            "registries loaded"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            cfg,
            state: Arc::new(DaemonState::new()),
            stats: Arc::new(DaemonStatistics::new()),
            metrics: Arc::new(Metrics::new().map_err(|_| DaemonError::Metrics)?),
            host_key,
            packages,
            maintainers,
            peer_manager: Arc::new(PeerManager::new()),
            dht_override,
            dht_client: Mutex::new(None),
            dht: Mutex::new(None),
            announcer: Mutex::new(None),
            discovery: Mutex::new(None),
            maintenance: Mutex::new(None),
            shutdown,
            shutdown_requested: Arc::new(Notify::new()),
        })
    }

    /// Run the ordered startup sequence.
    pub async fn start(self: &Arc<Self>) -> Result<(), DaemonError> {
        match self.state.status() {
            DaemonStatus::Running | DaemonStatus::Starting => {
                return Err(DaemonError::AlreadyRunning);
            }
            _ => {}
        }
        self.state.set_status(DaemonStatus::Starting);

        if self.cfg.enable_dht {
            let service: Arc<dyn DhtService> = match &self.dht_override {
                Some(service) => Arc::clone(service),
                None => {
                    let client = match DhtClient::bind(
                        DhtConfig::new(self.cfg.dht_port, self.cfg.dht_bootstrap_nodes.clone()),
                        Arc::clone(&self.peer_manager),
                    )
                    .await
                    {
                        Ok(client) => client,
                        Err(e) => {
                            self.state.record_error(&e.to_string());
                            return Err(e.into());
                        }
                    };
                    client.start();
                    let service: Arc<dyn DhtService> = client.clone();
                    *self.dht_client.lock().expect("daemon lock poisoned") = Some(client);
                    service
                }
            };
            *self.dht.lock().expect("daemon lock poisoned") = Some(Arc::clone(&service));

            let announcer = Arc::new(Announcer::new(
                Arc::clone(&service),
                self.cfg.dht_port,
                self.cfg.announce_interval(),
                Some(Arc::clone(&self.packages)),
            ));
            let synced = self.sync_registry_into_announcer(&announcer);
            info!(synced, "registry synchronized into announcer");
            announcer.start();
            *self.announcer.lock().expect("daemon lock poisoned") = Some(announcer);

            let discovery = Arc::new(Discovery::new(
                service,
                DISCOVERY_CACHE_TTL,
                Arc::clone(&self.peer_manager),
            ));
            discovery.start_sweeper();
            *self.discovery.lock().expect("daemon lock poisoned") = Some(discovery);
        } else {
            info!("dht disabled; announcer and discovery stay down");
        }

        self.start_maintenance();
        self.write_pid_file()?;

        self.state.set_active_packages(self.packages.len() as u64);
        self.state.set_status(DaemonStatus::Running);
        info!(listen = %self.cfg.listen_addr, "daemon running");
        Ok(())
    }

    /// Run the ordered shutdown sequence. A no-op when already stopping
    /// or stopped.
    pub async fn stop(&self) {
        match self.state.status() {
            DaemonStatus::Stopped | DaemonStatus::Stopping => return,
            _ => {}
        }
        self.state.set_status(DaemonStatus::Stopping);
        info!("daemon stopping");

        let _ = self.shutdown.send(true);
        let maintenance = {
            let mut guard = self.maintenance.lock().expect("daemon lock poisoned");
            guard.take()
        };
        if let Some(handle) = maintenance {
            if tokio::time::timeout(MAINTENANCE_STOP_WAIT, handle).await.is_err() {
                debug!("maintenance loop did not drain in time");
            }
        }

        let announcer = {
            let mut guard = self.announcer.lock().expect("daemon lock poisoned");
            guard.take()
        };
        if let Some(announcer) = announcer {
            announcer.stop().await;
        }

        let discovery = {
            let mut guard = self.discovery.lock().expect("daemon lock poisoned");
            guard.take()
        };
        if let Some(discovery) = discovery {
            discovery.stop().await;
        }

        let client = {
            let mut guard = self.dht_client.lock().expect("daemon lock poisoned");
            guard.take()
        };
        if let Some(client) = client {
            client.stop().await;
        }
        *self.dht.lock().expect("daemon lock poisoned") = None;

        self.remove_pid_file();
        self.state.set_status(DaemonStatus::Stopped);
        info!("daemon stopped");
    }

    /// Decode each catalog entry's infohash and register it with the
    /// announcer. Malformed ids are skipped with a warning; startup never
    /// fails over them. Returns how many packages were registered.
    fn sync_registry_into_announcer(&self, announcer: &Announcer) -> usize {
        let mut synced = 0;
        for info in self.packages.list_packages() {
            match info_hash_from_package_id(&info.package_id) {
                Ok(info_hash) => {
                    announcer.add_package(
                        info_hash,
                        &info.name,
                        &info.creator_fingerprint,
                        &info.maintainer_fingerprint,
                    );
                    synced += 1;
                }
                Err(_) => {
                    warn!(
                        package_id = %info.package_id,
                        name = %info.name,
                        "catalog entry has a malformed package id; not announcing"
                    );
                }
            }
        }
        synced
    }

    fn start_maintenance(self: &Arc<Self>) {
        let daemon = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(MAINTENANCE_TICK) => {}
                }
                daemon.maintenance_tick();
            }
            debug!("maintenance loop stopped");
        });
        *self.maintenance.lock().expect("daemon lock poisoned") = Some(handle);
    }

    /// One pass of periodic upkeep. Errors are logged, never propagated.
    fn maintenance_tick(&self) {
        self.stats.tick();

        match self.maintainers.cleanup_expired() {
            Ok(0) => {}
            Ok(n) => debug!(expired = n, "pending co-signatures swept"),
            Err(e) => warn!(err = %e, "pending sweep failed"),
        }

        let stale = self.peer_manager.remove_stale_peers(PEER_STALE_THRESHOLD);
        if stale > 0 {
            debug!(stale, "stale peers evicted");
        }

        let dht_nodes = self
            .dht
            .lock()
            .expect("daemon lock poisoned")
            .as_ref()
            .map(|d| d.stats().nodes as u64)
            .unwrap_or(0);
        self.state.set_active_packages(self.packages.len() as u64);
        self.state
            .set_network_counts(self.peer_manager.get_stats().tracked, dht_nodes);
    }

    fn write_pid_file(&self) -> Result<(), DaemonError> {
        let contents = format!("{}:{}\n", std::process::id(), self.cfg.listen_addr);
        std::fs::write(self.cfg.pid_path(), contents)?;
        Ok(())
    }

    fn remove_pid_file(&self) {
        if let Err(e) = std::fs::remove_file(self.cfg.pid_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(err = %e, "pid file removal failed");
            }
        }
    }

    /// Configuration this daemon runs with.
    pub fn config(&self) -> &DaemonConfig {
        &self.cfg
    }

    /// Runtime state.
    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    /// Transfer statistics.
    pub fn statistics(&self) -> &DaemonStatistics {
        &self.stats
    }

    /// Prometheus metrics container.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Host identity.
    pub fn host_key(&self) -> &HostKeyManager {
        &self.host_key
    }

    /// Package catalog.
    pub fn packages(&self) -> &Arc<PackageManager> {
        &self.packages
    }

    /// Maintainer registry.
    pub fn maintainers(&self) -> &Arc<MaintainerRegistry> {
        &self.maintainers
    }

    /// Peer liveness tracker.
    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    /// Active DHT backend, if the subsystem is up.
    pub fn dht(&self) -> Option<Arc<dyn DhtService>> {
        self.dht.lock().expect("daemon lock poisoned").clone()
    }

    /// Announcer, if the DHT subsystem is up.
    pub fn announcer(&self) -> Option<Arc<Announcer>> {
        self.announcer.lock().expect("daemon lock poisoned").clone()
    }

    /// Discovery layer, if the DHT subsystem is up.
    pub fn discovery(&self) -> Option<Arc<Discovery>> {
        self.discovery.lock().expect("daemon lock poisoned").clone()
    }

    /// Notified when an external shutdown request arrives.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown_requested)
    }

    /// Ask the daemon to shut down (used by `POST /shutdown` and signals).
    pub fn request_shutdown(&self) {
        self.shutdown_requested.notify_waiters();
    }
}

fn ensure_dir(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}
