// SPDX-License-Identifier: GPL-3.0-or-later

//! Posttroll global configuration - single source of truth.
//!
//! Two levels:
//!
//! - **Static**: compile-time defaults (ports, multicast group, intervals).
//! - **Dynamic**: the process-wide [`Config`] store, seeded from the
//!   defaults and `POSTTROLL_*` environment variables, with stack-disciplined
//!   scoped overrides for tests and embedded components.
//!
//! ```ignore
//! use posttroll::config;
//!
//! let backend = config::global().get_or("backend", "zmq");
//!
//! // Scoped override, restored when the guard drops:
//! let _scope = config::global().scoped(&[("nameserver_port", "15557")])?;
//! ```

use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

// =======================================================================
// Well-known ports and addresses
// =======================================================================

/// Multicast group used for advertisement broadcasts.
///
/// 224.0.0.0/24 is reserved for administrative tasks, so the default sits
/// above it.
pub const DEFAULT_MC_GROUP: &str = "225.0.0.212";

/// UDP port advertisements are broadcast on.
pub const DEFAULT_BROADCAST_PORT: u16 = 21200;

/// TCP port the nameserver reply socket listens on.
pub const DEFAULT_NAMESERVER_PORT: u16 = 5557;

/// TCP port the nameserver's add/remove event publisher binds.
pub const DEFAULT_ADDRESS_PUBLISH_PORT: u16 = 16543;

/// Multicast time-to-live, local network only (<32).
pub const DEFAULT_MC_TTL: u32 = 31;

/// Random publisher ports are picked from this range (inclusive start,
/// exclusive end), mirroring the IANA ephemeral range.
pub const DEFAULT_PUB_MIN_PORT: u16 = 49152;
/// See [`DEFAULT_PUB_MIN_PORT`].
pub const DEFAULT_PUB_MAX_PORT: u32 = 65536;

// =======================================================================
// Timing defaults
// =======================================================================

/// Interval between two advertisement broadcasts.
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

/// Age after which a publisher advertisement is evicted from the
/// nameserver's address table.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10);

/// Interval between two nameserver polls of the subscriber's
/// address-listener thread.
pub const ADDR_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline for the initial address lookup when a subscriber starts.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

// =======================================================================
// Message protocol versions
// =======================================================================

/// Current message protocol version (timezone-aware timestamps).
pub const MESSAGE_VERSION_CURRENT: &str = "v1.02";

/// Legacy message protocol version (naive UTC timestamps).
pub const MESSAGE_VERSION_LEGACY: &str = "v1.01";

/// Configuration keys the store accepts.
///
/// Every key can also be supplied through the environment as
/// `POSTTROLL_<KEY-IN-UPPERCASE>`.
pub const KNOWN_KEYS: &[&str] = &[
    "backend",
    "tcp_keepalive",
    "tcp_keepalive_cnt",
    "tcp_keepalive_idle",
    "tcp_keepalive_intvl",
    "multicast_interface",
    "mc_group",
    "mc_ttl",
    "nameservers",
    "broadcast_port",
    "nameserver_port",
    "address_publish_port",
    "pub_min_port",
    "pub_max_port",
    "message_version",
    "server_public_key_file",
    "server_secret_key_file",
    "client_public_key_file",
    "client_secret_key_file",
    "clients_public_keys_directory",
];

const ENV_PREFIX: &str = "POSTTROLL_";

// =======================================================================
// Store
// =======================================================================

/// Process-wide, read-mostly configuration store.
///
/// Reads and writes are lock-free (`DashMap`); components read it at socket
/// creation time, not on the hot path. Scoped overrides ([`Config::scoped`])
/// restore the previous values when the returned guard drops, on every exit
/// path.
pub struct Config {
    entries: DashMap<Arc<str>, Arc<str>>,
}

static GLOBAL: OnceLock<Config> = OnceLock::new();

/// The process-wide configuration, created on first use.
pub fn global() -> &'static Config {
    GLOBAL.get_or_init(Config::from_env)
}

impl Config {
    /// Create a store holding only the built-in defaults.
    #[must_use]
    pub fn new() -> Self {
        let config = Self {
            entries: DashMap::new(),
        };
        config.insert("backend", "zmq");
        config.insert("mc_group", DEFAULT_MC_GROUP);
        config.insert("mc_ttl", &DEFAULT_MC_TTL.to_string());
        config.insert("broadcast_port", &DEFAULT_BROADCAST_PORT.to_string());
        config.insert("nameserver_port", &DEFAULT_NAMESERVER_PORT.to_string());
        config.insert(
            "address_publish_port",
            &DEFAULT_ADDRESS_PUBLISH_PORT.to_string(),
        );
        config.insert("pub_min_port", &DEFAULT_PUB_MIN_PORT.to_string());
        config.insert("pub_max_port", &DEFAULT_PUB_MAX_PORT.to_string());
        config.insert("message_version", MESSAGE_VERSION_CURRENT);
        config
    }

    /// Create a store from the defaults plus `POSTTROLL_*` environment
    /// variables.
    ///
    /// Unknown `POSTTROLL_*` variables are logged and skipped (fail-safe).
    #[must_use]
    pub fn from_env() -> Self {
        let config = Self::new();
        for (name, value) in std::env::vars() {
            let Some(suffix) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = suffix.to_ascii_lowercase();
            if KNOWN_KEYS.contains(&key.as_str()) {
                config.insert(&key, &value);
            } else {
                log::warn!("[config] unknown environment variable {name}, skipping");
            }
        }
        config
    }

    fn insert(&self, key: &str, value: &str) {
        self.entries.insert(Arc::from(key), Arc::from(value));
    }

    /// Look up a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.to_string())
    }

    /// Look up a key, falling back to `default`.
    #[must_use]
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Look up an integer-valued key, falling back to `default` when the key
    /// is absent or unparsable.
    #[must_use]
    pub fn get_u64_or(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Look up a port-valued key.
    #[must_use]
    pub fn get_port_or(&self, key: &str, default: u16) -> u16 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// The configured nameservers, comma-separated in the store.
    #[must_use]
    pub fn nameservers(&self) -> Vec<String> {
        match self.get("nameservers") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Set a key, rejecting unknown keys.
    pub fn set(&self, key: &str, value: &str) -> crate::Result<()> {
        if !KNOWN_KEYS.contains(&key) {
            return Err(crate::Error::Config(format!(
                "unknown configuration key '{key}'"
            )));
        }
        self.insert(key, value);
        Ok(())
    }

    /// Install a scoped override.
    ///
    /// The previous values of every overridden key are restored when the
    /// returned guard drops, in reverse installation order (stack
    /// discipline).
    pub fn scoped(&self, overrides: &[(&str, &str)]) -> crate::Result<ScopedConfig<'_>> {
        let mut saved = Vec::with_capacity(overrides.len());
        for (key, value) in overrides {
            if !KNOWN_KEYS.contains(key) {
                // Roll back what was already installed before bailing out.
                drop(ScopedConfig {
                    config: self,
                    saved,
                });
                return Err(crate::Error::Config(format!(
                    "unknown configuration key '{key}'"
                )));
            }
            let previous = self.entries.get(*key).map(|v| Arc::clone(&v));
            saved.push((Arc::<str>::from(*key), previous));
            self.insert(key, value);
        }
        Ok(ScopedConfig {
            config: self,
            saved,
        })
    }

    /// Number of entries in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard restoring overridden configuration values on drop.
pub struct ScopedConfig<'a> {
    config: &'a Config,
    saved: Vec<(Arc<str>, Option<Arc<str>>)>,
}

impl Drop for ScopedConfig<'_> {
    fn drop(&mut self) {
        while let Some((key, previous)) = self.saved.pop() {
            match previous {
                Some(value) => {
                    self.config.entries.insert(key, value);
                }
                None => {
                    self.config.entries.remove(&key);
                }
            }
        }
    }
}
