// SPDX-License-Identifier: GPL-3.0-or-later

//! Receive broadcasted addresses in standard pytroll messages.
//!
//! The [`AddressBook`] is the pure table mapping one address to its
//! advertisement record; the [`AddressReceiver`] wraps it with the
//! ingestion threads (multicast listener, staleness eviction) and an event
//! publisher announcing additions and removals on the `address_receiver`
//! service, so interested subscribers learn about publishers coming and
//! going without polling.
//!
//! Advertisements look like:
//!
//! ```text
//! pytroll://address/<name> info ... {"URI": "tcp://host:port", "service": [...], "status": true}
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{self, DEFAULT_ADDRESS_PUBLISH_PORT, DEFAULT_BROADCAST_INTERVAL, DEFAULT_MAX_AGE};
use crate::mcast::{configured_broadcast_port, local_ipv4_addresses, MulticastReceiver};
use crate::message::{Message, MessageData};
use crate::publisher::NoisyPublisher;
use crate::Result;

const ADDRESS_SUBJECT: &str = "/address";
const HEARTBEAT_MIN_INTERVAL: Duration = Duration::from_secs(29);
const EVICTION_POLL_FLOOR: Duration = Duration::from_millis(50);
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// =======================================================================
// The pure table
// =======================================================================

struct RecordEntry {
    metadata: Map<String, Value>,
    last_seen: Instant,
    receive_time: DateTime<Utc>,
}

/// Table of live publisher advertisements, keyed by address.
#[derive(Default)]
pub struct AddressBook {
    entries: HashMap<String, RecordEntry>,
}

impl AddressBook {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh the record under `address`.
    ///
    /// Two advertisements of the same address never create duplicates; a
    /// conflicting advertisement is last-writer-wins. Returns whether the
    /// address was newly added.
    pub fn register(&mut self, address: &str, metadata: Map<String, Value>) -> bool {
        let newly_added = !self.entries.contains_key(address);
        self.entries.insert(
            address.to_string(),
            RecordEntry {
                metadata,
                last_seen: Instant::now(),
                receive_time: Utc::now(),
            },
        );
        newly_added
    }

    /// Drop the record under `address`. Idempotent.
    pub fn remove(&mut self, address: &str) -> Option<Map<String, Value>> {
        self.entries.remove(address).map(|entry| entry.metadata)
    }

    /// Drop every record older than `max_age`, returning the evicted
    /// `(address, metadata)` pairs.
    pub fn sweep(&mut self, max_age: Duration) -> Vec<(String, Map<String, Value>)> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.last_seen.elapsed() > max_age)
            .map(|(address, _)| address.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|address| {
                self.remove(&address)
                    .map(|metadata| (address, metadata))
            })
            .collect()
    }

    /// Records whose primary name or aliases contain `service`;
    /// `service == ""` returns everything.
    #[must_use]
    pub fn get(&self, service: &str) -> Vec<Value> {
        self.entries
            .values()
            .filter(|entry| service.is_empty() || service_matches(&entry.metadata, service))
            .map(|entry| {
                let mut record = entry.metadata.clone();
                record.insert(
                    "receive_time".into(),
                    Value::String(
                        entry
                            .receive_time
                            .to_rfc3339_opts(SecondsFormat::Micros, true),
                    ),
                );
                Value::Object(record)
            })
            .collect()
    }

    /// All live addresses.
    #[must_use]
    pub fn active_addresses(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn service_matches(metadata: &Map<String, Value>, service: &str) -> bool {
    match metadata.get("service") {
        Some(Value::Array(names)) => names.iter().any(|n| n.as_str() == Some(service)),
        Some(Value::String(name)) => name == service,
        _ => false,
    }
}

// =======================================================================
// The threaded receiver
// =======================================================================

/// Long-running aggregator of publisher advertisements.
pub struct AddressReceiver {
    book: Arc<Mutex<AddressBook>>,
    publisher: Option<Arc<NoisyPublisher>>,
    max_age: Duration,
    multicast_enabled: bool,
    restrict_to_localhost: bool,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    running: bool,
}

impl AddressReceiver {
    /// Create a receiver evicting records older than the default max-age.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_age(DEFAULT_MAX_AGE)
    }

    /// Create a receiver with an explicit max-age.
    #[must_use]
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            book: Arc::new(Mutex::new(AddressBook::new())),
            publisher: None,
            max_age,
            multicast_enabled: true,
            restrict_to_localhost: false,
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            running: false,
        }
    }

    /// Disable or enable the multicast listener (direct pushes keep
    /// working either way).
    #[must_use]
    pub fn multicast_enabled(mut self, enabled: bool) -> Self {
        self.multicast_enabled = enabled;
        self
    }

    /// Discard multicast advertisements from non-local source addresses.
    #[must_use]
    pub fn restrict_to_localhost(mut self, restrict: bool) -> Self {
        self.restrict_to_localhost = restrict;
        self
    }

    /// Start the event publisher, the multicast listener (when enabled)
    /// and the eviction loop.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.stop.store(false, Ordering::Relaxed);

        // The add/remove event publisher registers itself like any other
        // publisher: over multicast normally, by direct push to the local
        // nameserver when multicast is off.
        let port =
            config::global().get_port_or("address_publish_port", DEFAULT_ADDRESS_PUBLISH_PORT);
        let nameservers = if self.multicast_enabled {
            Vec::new()
        } else {
            vec!["localhost".to_string()]
        };
        let publisher = Arc::new(NoisyPublisher::new(
            "address_receiver",
            port,
            &["addresses".to_string()],
            DEFAULT_BROADCAST_INTERVAL,
            &nameservers,
        ));
        publisher.start()?;
        self.publisher = Some(Arc::clone(&publisher));

        if self.multicast_enabled {
            let receiver = MulticastReceiver::new(configured_broadcast_port())?;
            receiver.set_timeout(Some(RECV_TIMEOUT))?;
            log::info!("[address-receiver] multicast receiver initialized");
            let book = Arc::clone(&self.book);
            let publisher = Arc::clone(&publisher);
            let stop = Arc::clone(&self.stop);
            let local_only = self.restrict_to_localhost;
            self.threads.push(thread::spawn(move || {
                listen_loop(&receiver, &book, &publisher, &stop, local_only);
            }));
        }

        let book = Arc::clone(&self.book);
        let stop = Arc::clone(&self.stop);
        let max_age = self.max_age;
        self.threads.push(thread::spawn(move || {
            eviction_loop(&book, &publisher, &stop, max_age);
        }));

        self.running = true;
        Ok(())
    }

    /// Stop all threads and the event publisher. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(publisher) = self.publisher.take() {
            publisher.stop();
        }
        self.running = false;
    }

    /// Whether the receiver threads are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The live records matching `service` (`""` means all).
    #[must_use]
    pub fn get(&self, service: &str) -> Vec<Value> {
        let records = self.book.lock().get(service);
        log::debug!("[address-receiver] return {} record(s) for '{service}'", records.len());
        records
    }

    /// All live addresses.
    #[must_use]
    pub fn get_active_addresses(&self) -> Vec<String> {
        self.book.lock().active_addresses()
    }

    /// Feed one advertisement message into the table.
    ///
    /// Used by the multicast listener and by the nameserver's reply socket
    /// for publishers that cannot multicast.
    pub fn ingest(&self, message: &Message) {
        ingest(&self.book, self.publisher.as_deref(), message);
    }
}

impl Default for AddressReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AddressReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen_loop(
    receiver: &MulticastReceiver,
    book: &Mutex<AddressBook>,
    publisher: &NoisyPublisher,
    stop: &AtomicBool,
    local_only: bool,
) {
    let local_ips = local_ipv4_addresses();
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let (data, source) = match receiver.recv() {
            Ok(received) => received,
            Err(ref e) if crate::net::is_timeout(e) => continue,
            Err(e) => {
                if !stop.load(Ordering::Relaxed) {
                    log::error!("[address-receiver] multicast receive failed: {e}");
                }
                continue;
            }
        };
        if local_only {
            let is_local = match source.ip() {
                IpAddr::V4(v4) => local_ips.contains(&v4),
                IpAddr::V6(_) => false,
            };
            if !is_local {
                log::debug!("[address-receiver] discarding external message from {source}");
                continue;
            }
        }
        match Message::decode(&data) {
            Ok(message) => ingest(book, Some(publisher), &message),
            Err(e) => {
                log::warn!("[address-receiver] undecodable advertisement: {e}");
            }
        }
    }
}

fn eviction_loop(
    book: &Mutex<AddressBook>,
    publisher: &NoisyPublisher,
    stop: &AtomicBool,
    max_age: Duration,
) {
    let interval = (max_age / 20).clamp(EVICTION_POLL_FLOOR, Duration::from_secs(1));
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let evicted = book.lock().sweep(max_age);
        for (address, metadata) in evicted {
            publish_removal(Some(publisher), &address, &metadata);
        }
        if let Err(e) = publisher.heartbeat(HEARTBEAT_MIN_INTERVAL) {
            log::debug!("[address-receiver] heartbeat failed: {e}");
        }
        thread::sleep(interval);
    }
}

fn ingest(book: &Mutex<AddressBook>, publisher: Option<&NoisyPublisher>, message: &Message) {
    if !message
        .subject
        .to_lowercase()
        .starts_with(ADDRESS_SUBJECT)
    {
        return;
    }
    let MessageData::Json(Value::Object(data)) = &message.data else {
        log::warn!("[address-receiver] advertisement without record payload: {message}");
        return;
    };
    let Some(address) = data.get("URI").and_then(Value::as_str).map(str::to_string) else {
        log::warn!("[address-receiver] advertisement without URI: {message}");
        return;
    };
    let name = message
        .subject
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();

    let revoked = matches!(message.mtype.as_str(), "stop" | "stop_address")
        || data.get("status").and_then(Value::as_bool) == Some(false);
    if revoked {
        let removed = book.lock().remove(&address);
        if let Some(metadata) = removed {
            log::info!("[address-receiver] removing address {address} ({name})");
            publish_removal(publisher, &address, &metadata);
        }
        return;
    }

    if !matches!(message.mtype.as_str(), "info" | "have_address") {
        return;
    }
    let mut metadata = data.clone();
    metadata.insert("status".into(), Value::Bool(true));
    metadata.insert("name".into(), Value::String(name.clone()));
    log::debug!("[address-receiver] receiving address {address} ({name})");
    let newly_added = book.lock().register(&address, metadata);
    if newly_added {
        log::info!("[address-receiver] publish add '{message}'");
        if let Some(publisher) = publisher {
            if let Err(e) = publisher.send(&message.encode()) {
                log::debug!("[address-receiver] add event not published: {e}");
            }
        }
    }
}

fn publish_removal(
    publisher: Option<&NoisyPublisher>,
    address: &str,
    metadata: &Map<String, Value>,
) {
    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let record = serde_json::json!({
        "status": false,
        "URI": address,
        "service": metadata.get("service").cloned().unwrap_or(Value::Null),
    });
    match Message::new(&format!("{ADDRESS_SUBJECT}/{name}"), "info", record.into()) {
        Ok(message) => {
            log::info!("[address-receiver] publish remove '{message}'");
            if let Some(publisher) = publisher {
                if let Err(e) = publisher.send(&message.encode()) {
                    log::debug!("[address-receiver] remove event not published: {e}");
                }
            }
        }
        Err(e) => log::warn!("[address-receiver] could not build removal event: {e}"),
    }
}

// =======================================================================
// Tests
// =======================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(services: &[&str]) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert(
            "service".into(),
            Value::Array(services.iter().map(|s| Value::String((*s).into())).collect()),
        );
        metadata.insert("status".into(), Value::Bool(true));
        metadata
    }

    #[test]
    fn test_register_and_get() {
        let mut book = AddressBook::new();
        assert!(book.register("tcp://a:1", record(&["alpha"])));
        assert!(book.register("tcp://b:2", record(&["beta", "greek"])));

        assert_eq!(book.get("alpha").len(), 1);
        assert_eq!(book.get("greek").len(), 1);
        assert_eq!(book.get("").len(), 2);
        assert!(book.get("gamma").is_empty());

        let records = book.get("alpha");
        assert!(records[0]["receive_time"].is_string());
    }

    #[test]
    fn test_reregistration_does_not_duplicate() {
        let mut book = AddressBook::new();
        assert!(book.register("tcp://a:1", record(&["alpha"])));
        assert!(!book.register("tcp://a:1", record(&["alpha"])));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_same_address_last_writer_wins() {
        let mut book = AddressBook::new();
        book.register("tcp://a:1", record(&["alpha"]));
        book.register("tcp://a:1", record(&["beta"]));
        assert!(book.get("alpha").is_empty());
        assert_eq!(book.get("beta").len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut book = AddressBook::new();
        book.register("tcp://a:1", record(&["alpha"]));
        assert!(book.remove("tcp://a:1").is_some());
        assert!(book.remove("tcp://a:1").is_none());
        assert!(book.is_empty());
    }

    #[test]
    fn test_sweep_evicts_stale_records() {
        let mut book = AddressBook::new();
        book.register("tcp://old:1", record(&["alpha"]));
        // Backdate the entry.
        book.entries.get_mut("tcp://old:1").unwrap().last_seen =
            Instant::now() - Duration::from_secs(100);
        book.register("tcp://fresh:2", record(&["beta"]));

        let evicted = book.sweep(Duration::from_secs(30));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "tcp://old:1");
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_sweep_with_zero_max_age_evicts_everything() {
        let mut book = AddressBook::new();
        book.register("tcp://a:1", record(&["alpha"]));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(book.sweep(Duration::ZERO).len(), 1);
        assert!(book.is_empty());
    }

    #[test]
    fn test_refresh_resets_age() {
        let mut book = AddressBook::new();
        book.register("tcp://a:1", record(&["alpha"]));
        book.entries.get_mut("tcp://a:1").unwrap().last_seen =
            Instant::now() - Duration::from_secs(100);
        book.register("tcp://a:1", record(&["alpha"]));
        assert!(book.sweep(Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn test_service_match_string_form() {
        let mut metadata = Map::new();
        metadata.insert("service".into(), Value::String("solo".into()));
        assert!(service_matches(&metadata, "solo"));
        assert!(!service_matches(&metadata, "other"));
    }
}
