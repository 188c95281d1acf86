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

//! LibreSeed - decentralized software package distribution daemon.
//!
//! This crate provides:
//! - Dual-signed (creator + maintainer) package containers with a
//!   deterministic canonical encoding and content-addressed identifiers
//! - Crash-safe package and maintainer registries (atomic YAML persistence)
//! - A mainline-DHT client (KRPC over UDP) with bootstrap, iterative
//!   lookups, periodic re-announce and peer discovery
//! - A daemon assembling the above, exposed over a loopback HTTP surface
//! - Monitoring via Prometheus metrics and structured logging

/// Core primitives (crypto, package format, config, host identity).
pub mod core;
/// Daemon lifecycle and the HTTP request surface.
pub mod daemon;
/// Observability (metrics).
pub mod monitoring;
/// DHT networking stack (client, announcer, discovery).
pub mod networking;
/// Persistent registries (packages, maintainers).
pub mod registry;
