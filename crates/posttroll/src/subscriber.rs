// SPDX-License-Identifier: GPL-3.0-or-later

//! Subscribe to message streams.
//!
//! [`Subscriber`] consumes explicit publisher addresses. [`NsSubscriber`]
//! adds discovery: an address-listener thread keeps the connection set in
//! sync with the nameserver, opening connections to appearing publishers
//! and closing the vanished ones. [`Subscribe`] is the scoped-acquisition
//! variant:
//!
//! ```rust,no_run
//! use posttroll::subscriber::{Subscribe, SubscribeSettings};
//!
//! # fn main() -> posttroll::Result<()> {
//! let settings = SubscribeSettings {
//!     services: Some(vec!["a_service".into()]),
//!     topics: vec!["my_topic".into()],
//!     ..Default::default()
//! };
//! let subscription = Subscribe::open(settings)?;
//! for message in subscription.iter() {
//!     println!("{message}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Subject filtering happens on the receive side: a message passes when its
//! encoded form starts with one of the subscribed topic prefixes (the
//! `pytroll://` magic is prepended to bare topics). An optional
//! `message_filter` discriminates further.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{self, ADDR_REFRESH_INTERVAL, DEFAULT_ADDRESS_PUBLISH_PORT,
    DEFAULT_LOOKUP_TIMEOUT};
use crate::message::{Message, MessageData, MAGIC};
use crate::nameserver::get_pub_address;
use crate::net::plain::{SubFrame, SubSocket};
use crate::Result;

const ITER_POLL: Duration = Duration::from_millis(500);
const PUSH_POLL: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Callback discriminating messages on the subscriber side.
pub type MessageFilter = Box<dyn Fn(&Message) -> bool + Send + Sync>;

// =======================================================================
// Plain subscriber
// =======================================================================

/// Consumes messages from a set of publisher addresses.
pub struct Subscriber {
    topics: Vec<String>,
    message_filter: Option<MessageFilter>,
    connections: Mutex<HashMap<String, SubSocket>>,
    tx: Sender<SubFrame>,
    rx: Receiver<SubFrame>,
    running: AtomicBool,
}

impl Subscriber {
    /// Subscribe to `addresses` for `topics` (empty topics = everything).
    pub fn new(addresses: &[String], topics: &[String]) -> Result<Self> {
        Self::with_filter(addresses, topics, None)
    }

    /// Like [`new`](Self::new), with a message filter callback.
    pub fn with_filter(
        addresses: &[String],
        topics: &[String],
        message_filter: Option<MessageFilter>,
    ) -> Result<Self> {
        let (tx, rx) = unbounded();
        let subscriber = Self {
            topics: magickfy_topics(topics),
            message_filter,
            connections: Mutex::new(HashMap::new()),
            tx,
            rx,
            running: AtomicBool::new(true),
        };
        for address in addresses {
            subscriber.add(address)?;
        }
        Ok(subscriber)
    }

    /// Connect to one more publisher. Returns whether the address was new.
    pub fn add(&self, address: &str) -> Result<bool> {
        let mut connections = self.connections.lock();
        if connections.contains_key(address) {
            return Ok(false);
        }
        log::info!(
            "[subscriber] adding address {address} with topics {:?}",
            self.topics
        );
        let socket = SubSocket::connect(address, self.tx.clone())?;
        connections.insert(address.to_string(), socket);
        Ok(true)
    }

    /// Disconnect from one publisher. Returns whether it was connected.
    pub fn remove(&self, address: &str) -> bool {
        let socket = self.connections.lock().remove(address);
        match socket {
            Some(socket) => {
                log::info!("[subscriber] removing address {address}");
                socket.disconnect();
                true
            }
            None => false,
        }
    }

    /// Reconcile the connection set with `addresses`: connect to the new
    /// ones, disconnect from the vanished ones. Returns whether anything
    /// changed.
    pub fn update(&self, addresses: &[String]) -> bool {
        let current: HashSet<String> = self.addresses().into_iter().collect();
        let target: HashSet<String> = addresses.iter().cloned().collect();
        let mut changed = false;
        for address in current.difference(&target) {
            changed |= self.remove(address);
        }
        for address in target.difference(&current) {
            match self.add(address) {
                Ok(added) => changed |= added,
                Err(e) => {
                    log::warn!("[subscriber] could not connect to {address}: {e}");
                }
            }
        }
        changed
    }

    /// The currently connected addresses.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.connections.lock().keys().cloned().collect()
    }

    /// Receive one message, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` when the timeout elapses without a matching
    /// message. Messages failing the topic or user filter are skipped.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let (address, raw) = match self.rx.recv_timeout(remaining) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                    return Ok(None)
                }
            };
            if !self.topics.iter().any(|topic| raw.starts_with(topic)) {
                continue;
            }
            let message = match Message::decode(&raw) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("[subscriber] undecodable message from {address}: {e}");
                    continue;
                }
            };
            if let Some(filter) = &self.message_filter {
                if !filter(&message) {
                    continue;
                }
            }
            return Ok(Some(message));
        }
    }

    /// Blocking iterator over incoming messages, until [`stop`](Self::stop).
    #[must_use]
    pub fn iter(&self) -> MessageIter<'_> {
        MessageIter { subscriber: self }
    }

    /// Make [`iter`](Self::iter) return.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Stop and disconnect from every publisher.
    pub fn close(&self) {
        self.stop();
        let addresses = self.addresses();
        for address in addresses {
            self.remove(&address);
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close();
    }
}

/// Blocking message iterator; ends when the subscriber is stopped.
pub struct MessageIter<'a> {
    subscriber: &'a Subscriber,
}

impl Iterator for MessageIter<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        while self.subscriber.running.load(Ordering::Relaxed) {
            match self.subscriber.recv_timeout(ITER_POLL) {
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(e) => {
                    log::error!("[subscriber] receive failed: {e}");
                }
            }
        }
        None
    }
}

/// Prepend the magic word to bare topics; no topics means everything.
fn magickfy_topics(topics: &[String]) -> Vec<String> {
    if topics.is_empty() {
        return vec![MAGIC.to_string()];
    }
    topics
        .iter()
        .map(|topic| {
            if topic.starts_with(MAGIC) {
                topic.clone()
            } else if topic.starts_with('/') {
                format!("{MAGIC}{topic}")
            } else {
                format!("{MAGIC}/{topic}")
            }
        })
        .collect()
}

// =======================================================================
// Discovering subscriber
// =======================================================================

/// How to build an [`NsSubscriber`].
pub struct SubscribeSettings {
    /// Services to discover publishers for. `Some(vec!["".into()])` means
    /// every service; `None` disables discovery entirely (explicit
    /// `addresses` only).
    pub services: Option<Vec<String>>,
    /// Subject prefixes to let through (empty = everything).
    pub topics: Vec<String>,
    /// Explicit endpoints to connect to, bypassing discovery.
    pub addresses: Vec<String>,
    /// Host running the nameserver.
    pub nameserver: String,
    /// Also react to the nameserver's add/remove push events.
    pub addr_listener: bool,
    /// Timeout for each nameserver request.
    pub timeout: Duration,
}

impl Default for SubscribeSettings {
    fn default() -> Self {
        Self {
            services: Some(vec![String::new()]),
            topics: Vec::new(),
            addresses: Vec::new(),
            nameserver: "localhost".to_string(),
            addr_listener: false,
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }
}

/// Automatically subscribe to services via the nameserver.
pub struct NsSubscriber {
    subscriber: Arc<Subscriber>,
    stop: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl NsSubscriber {
    /// Start subscribing per `settings`.
    pub fn start(settings: SubscribeSettings) -> Result<Self> {
        Self::with_filter(settings, None)
    }

    /// Start with a message filter callback.
    pub fn with_filter(
        settings: SubscribeSettings,
        message_filter: Option<MessageFilter>,
    ) -> Result<Self> {
        let subscriber = Arc::new(Subscriber::with_filter(
            &[],
            &settings.topics,
            message_filter,
        )?);
        for address in &settings.addresses {
            if let Err(e) = subscriber.add(address) {
                log::warn!("[subscriber] could not connect to {address}: {e}");
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let listener = settings.services.clone().map(|services| {
            let subscriber = Arc::clone(&subscriber);
            let stop = Arc::clone(&stop);
            let static_addresses = settings.addresses.clone();
            let nameserver = settings.nameserver.clone();
            let enable_push = settings.addr_listener;
            let request_timeout = settings.timeout;
            thread::spawn(move || {
                address_listener_loop(
                    &subscriber,
                    &services,
                    &static_addresses,
                    &nameserver,
                    enable_push,
                    request_timeout,
                    &stop,
                );
            })
        });

        Ok(Self {
            subscriber,
            stop,
            listener,
        })
    }

    /// Stop the address listener and close every connection. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
        self.subscriber.close();
    }
}

impl Deref for NsSubscriber {
    type Target = Subscriber;

    fn deref(&self) -> &Subscriber {
        &self.subscriber
    }
}

impl Drop for NsSubscriber {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keep the connection set in sync with the nameserver.
///
/// Polls every [`ADDR_REFRESH_INTERVAL`]; lookup failures back off
/// exponentially (bounded) and never terminate the subscriber. Between
/// polls, push events from the nameserver's event publisher are applied
/// immediately when enabled.
fn address_listener_loop(
    subscriber: &Subscriber,
    services: &[String],
    static_addresses: &[String],
    nameserver: &str,
    enable_push: bool,
    request_timeout: Duration,
    stop: &AtomicBool,
) {
    let services: Vec<String> = if services.is_empty() {
        vec![String::new()]
    } else {
        services.to_vec()
    };

    let (push_tx, push_rx) = unbounded();
    let _push_socket = if enable_push {
        let port = config::global()
            .get_port_or("address_publish_port", DEFAULT_ADDRESS_PUBLISH_PORT);
        let address = format!("tcp://{nameserver}:{port}");
        match SubSocket::connect(&address, push_tx) {
            Ok(socket) => Some(socket),
            Err(e) => {
                log::warn!("[subscriber] address event stream unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    let mut wait = ADDR_REFRESH_INTERVAL;
    let mut first_poll = true;
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let mut desired: HashSet<String> = static_addresses.iter().cloned().collect();
        let mut complete = true;
        for service in &services {
            match get_pub_address(service, request_timeout, nameserver) {
                Ok(records) => {
                    if records.is_empty() && first_poll {
                        log::warn!("[subscriber] can't get any address for '{service}'");
                    }
                    for record in records {
                        if let Some(uri) = record.get("URI").and_then(Value::as_str) {
                            desired.insert(uri.to_string());
                        }
                    }
                }
                Err(e) => {
                    complete = false;
                    log::warn!("[subscriber] address lookup for '{service}' failed: {e}");
                }
            }
        }
        first_poll = false;

        if complete {
            // Only reconcile on a complete view, otherwise a nameserver
            // hiccup would disconnect live publishers.
            subscriber.update(&desired.into_iter().collect::<Vec<_>>());
            wait = ADDR_REFRESH_INTERVAL;
        } else {
            wait = (wait * 2).min(MAX_BACKOFF);
        }

        let wake_at = Instant::now() + wait;
        while Instant::now() < wake_at && !stop.load(Ordering::Relaxed) {
            let slice = wake_at
                .saturating_duration_since(Instant::now())
                .min(PUSH_POLL);
            match push_rx.recv_timeout(slice) {
                Ok((_, raw)) => handle_push_event(subscriber, &services, &raw),
                Err(RecvTimeoutError::Timeout) => {}
                // No push stream: plain sleep between polls.
                Err(RecvTimeoutError::Disconnected) => thread::sleep(slice),
            }
        }
    }
}

/// Apply one add/remove event from the nameserver's event publisher.
fn handle_push_event(subscriber: &Subscriber, services: &[String], raw: &str) {
    if !raw.starts_with("pytroll://address") {
        return;
    }
    let message = match Message::decode(raw) {
        Ok(message) => message,
        Err(e) => {
            log::debug!("[subscriber] undecodable address event: {e}");
            return;
        }
    };
    let MessageData::Json(Value::Object(data)) = &message.data else {
        return;
    };
    let Some(uri) = data.get("URI").and_then(Value::as_str) else {
        return;
    };
    let alive = data.get("status").and_then(Value::as_bool).unwrap_or(true);
    if !alive {
        log::debug!("[subscriber] removing address {uri}");
        subscriber.remove(uri);
        return;
    }
    let advertised: Vec<&str> = match data.get("service") {
        Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
        Some(Value::String(name)) => vec![name.as_str()],
        _ => Vec::new(),
    };
    for service in services {
        if service.is_empty() || advertised.contains(&service.as_str()) {
            log::debug!("[subscriber] adding address {uri} for '{service}'");
            if let Err(e) = subscriber.add(uri) {
                log::warn!("[subscriber] could not connect to {uri}: {e}");
            }
            break;
        }
    }
}

// =======================================================================
// Scoped acquisition
// =======================================================================

/// Subscriber context: a started [`NsSubscriber`] that is guaranteed to
/// stop and close every connection on every exit path.
pub struct Subscribe {
    inner: NsSubscriber,
}

impl Subscribe {
    /// Open a subscription per `settings`.
    pub fn open(settings: SubscribeSettings) -> Result<Self> {
        Ok(Self {
            inner: NsSubscriber::start(settings)?,
        })
    }

    /// Open with a message filter callback.
    pub fn with_filter(
        settings: SubscribeSettings,
        message_filter: MessageFilter,
    ) -> Result<Self> {
        Ok(Self {
            inner: NsSubscriber::with_filter(settings, Some(message_filter))?,
        })
    }
}

impl Deref for Subscribe {
    type Target = NsSubscriber;

    fn deref(&self) -> &NsSubscriber {
        &self.inner
    }
}

impl Drop for Subscribe {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

// Subscribe must stay usable from a consumer thread while the listener
// thread mutates the connection set.
#[allow(dead_code)]
fn assert_subscribers_are_shareable() {
    fn check<T: Send + Sync>() {}
    check::<Subscriber>();
    check::<NsSubscriber>();
}
