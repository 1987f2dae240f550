// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ambient configuration knobs for the network manager.
//!
//! This is deliberately not a `named.conf` parser — the configuration
//! language is an explicit external collaborator (§1). It is the small,
//! typed set of tunables every embedding needs: worker count, accept
//! backlog, quota thresholds, timeouts, HTTP/2 stream limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Typed configuration for a [`crate::manager::NetworkManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetmgrConfig {
    /// Number of I/O worker threads. `0` means "one per available core".
    pub workers: usize,
    /// `listen(2)` backlog for listening sockets.
    pub backlog: i32,
    /// Hard quota limit for accepted TCP connections (`tcp-clients`).
    pub tcp_clients_hard: usize,
    /// Soft quota threshold; `<= tcp_clients_hard`.
    pub tcp_clients_soft: usize,
    /// Read-idle timeout in milliseconds.
    pub idle_timeout_ms: u64,
    /// Read timeout in milliseconds while `keepalive` is set on the socket.
    pub keepalive_timeout_ms: u64,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Maximum concurrent HTTP/2 streams per DoH session.
    pub http2_max_concurrent_streams: u32,
    /// Whether `listen_tcp`/`listen_tls`/`listen_http` bind one replica
    /// listener per worker via `SO_REUSEPORT` (§11) instead of a single
    /// listener that redistributes accepted children across workers.
    pub reuseport: bool,
}

impl Default for NetmgrConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            backlog: 128,
            tcp_clients_hard: 1000,
            tcp_clients_soft: 800,
            idle_timeout_ms: 30_000,
            keepalive_timeout_ms: 30_000,
            connect_timeout_ms: 30_000,
            http2_max_concurrent_streams: 100,
            reuseport: cfg!(target_os = "linux"),
        }
    }
}

impl NetmgrConfig {
    /// Parses a configuration from TOML text, falling back to defaults for
    /// any field the document omits.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Resolves `workers == 0` against the host's available parallelism.
    pub fn resolved_worker_count(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        }
    }

    /// Read timeout to arm for a socket, selecting `keepalive` vs `idle`
    /// per §4.3.
    pub fn read_timeout(&self, keepalive: bool) -> Duration {
        if keepalive {
            Duration::from_millis(self.keepalive_timeout_ms)
        } else {
            Duration::from_millis(self.idle_timeout_ms)
        }
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_soft_does_not_exceed_hard() {
        let cfg = NetmgrConfig::default();
        assert!(cfg.tcp_clients_soft <= cfg.tcp_clients_hard);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg = NetmgrConfig::from_toml("backlog = 64\n").unwrap();
        assert_eq!(cfg.backlog, 64);
        assert_eq!(cfg.tcp_clients_hard, NetmgrConfig::default().tcp_clients_hard);
    }

    #[test]
    fn worker_count_zero_resolves_to_available_parallelism() {
        let cfg = NetmgrConfig::default();
        assert!(cfg.resolved_worker_count() >= 1);
    }
}
