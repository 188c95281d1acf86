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
#![warn(missing_docs)]

use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Registered packages gauge.
    pub packages: IntGauge,
    /// Tracked peers gauge.
    pub peers: IntGauge,
    /// DHT routing-table nodes gauge.
    pub dht_nodes: IntGauge,

    /// Packages ingested.
    pub ingests_total: IntCounter,
    /// Packages removed.
    pub removals_total: IntCounter,
    /// Containers rejected (parse or signature failure).
    pub rejects_total: IntCounter,
    /// Co-signatures applied.
    pub cosigns_total: IntCounter,

    /// DHT queries sent (mirrored at scrape time).
    pub dht_queries: IntGauge,
    /// DHT responses received (mirrored at scrape time).
    pub dht_responses: IntGauge,
    /// DHT announce campaigns (mirrored at scrape time).
    pub dht_announces: IntGauge,
    /// DHT lookups (mirrored at scrape time).
    pub dht_lookups: IntGauge,
    /// DHT query errors (mirrored at scrape time).
    pub dht_errors: IntGauge,
    /// Discovery cache hits (mirrored at scrape time).
    pub cache_hits: IntGauge,
    /// Discovery cache misses (mirrored at scrape time).
    pub cache_misses: IntGauge,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let packages = IntGauge::new("libreseed_packages", "Registered packages")
            .map_err(|_| MetricsError::Prom)?;
        let peers =
            IntGauge::new("libreseed_peers", "Tracked peers").map_err(|_| MetricsError::Prom)?;
        let dht_nodes = IntGauge::new("libreseed_dht_nodes", "DHT routing-table nodes")
            .map_err(|_| MetricsError::Prom)?;

        let ingests_total = IntCounter::new("libreseed_ingests_total", "Packages ingested")
            .map_err(|_| MetricsError::Prom)?;
        let removals_total = IntCounter::new("libreseed_removals_total", "Packages removed")
            .map_err(|_| MetricsError::Prom)?;
        let rejects_total =
            IntCounter::new("libreseed_rejects_total", "Containers rejected at ingest")
                .map_err(|_| MetricsError::Prom)?;
        let cosigns_total = IntCounter::new("libreseed_cosigns_total", "Co-signatures applied")
            .map_err(|_| MetricsError::Prom)?;

        let dht_queries = IntGauge::new("libreseed_dht_queries", "DHT queries sent")
            .map_err(|_| MetricsError::Prom)?;
        let dht_responses = IntGauge::new("libreseed_dht_responses", "DHT responses received")
            .map_err(|_| MetricsError::Prom)?;
        let dht_announces = IntGauge::new("libreseed_dht_announces", "DHT announce campaigns")
            .map_err(|_| MetricsError::Prom)?;
        let dht_lookups = IntGauge::new("libreseed_dht_lookups", "DHT peer lookups")
            .map_err(|_| MetricsError::Prom)?;
        let dht_errors = IntGauge::new("libreseed_dht_errors", "DHT query errors")
            .map_err(|_| MetricsError::Prom)?;
        let cache_hits = IntGauge::new("libreseed_cache_hits", "Discovery cache hits")
            .map_err(|_| MetricsError::Prom)?;
        let cache_misses = IntGauge::new("libreseed_cache_misses", "Discovery cache misses")
            .map_err(|_| MetricsError::Prom)?;

        for gauge in [
            &packages,
            &peers,
            &dht_nodes,
            &dht_queries,
            &dht_responses,
            &dht_announces,
            &dht_lookups,
            &dht_errors,
            &cache_hits,
            &cache_misses,
        ] {
            registry.register(Box::new(gauge.clone())).map_err(|_| MetricsError::Prom)?;
        }
        for counter in [&ingests_total, &removals_total, &rejects_total, &cosigns_total] {
            registry.register(Box::new(counter.clone())).map_err(|_| MetricsError::Prom)?;
        }

        Ok(Self {
            registry,
            packages,
            peers,
            dht_nodes,
            ingests_total,
            removals_total,
            rejects_total,
            cosigns_total,
            dht_queries,
            dht_responses,
            dht_announces,
            dht_lookups,
            dht_errors,
            cache_hits,
            cache_misses,
        })
    }

    /// Render the Prometheus text exposition.
    pub fn render(&self) -> String {
        TextEncoder::new().encode_to_string(&self.registry.gather()).unwrap_or_default()
    }
}
