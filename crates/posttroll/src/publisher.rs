// SPDX-License-Identifier: GPL-3.0-or-later

//! High-level tools to publish messages on a port.
//!
//! [`Publisher`] is the silent endpoint: it binds a publish socket and
//! sends. [`NoisyPublisher`] adds the discovery announcer: a background
//! [`MessageBroadcaster`](crate::broadcaster::MessageBroadcaster)
//! advertising the endpoint's name, aliases and address, revoked on stop.
//! [`Publish`] is the scoped-acquisition variant callers normally use:
//!
//! ```rust,no_run
//! use posttroll::message::Message;
//! use posttroll::publisher::Publish;
//!
//! # fn main() -> posttroll::Result<()> {
//! let publisher = Publish::new("my_service", 9000)?;
//! let mut counter = 0;
//! loop {
//!     counter += 1;
//!     let message = Message::new("/counter", "info", counter.to_string().into())?;
//!     publisher.send(&message.encode())?;
//!     std::thread::sleep(std::time::Duration::from_secs(3));
//! }
//! # }
//! ```

use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::broadcaster::MessageBroadcaster;
use crate::config::DEFAULT_BROADCAST_INTERVAL;
use crate::message::Message;
use crate::net::plain::PubSocket;
use crate::net::{get_own_ip, parse_tcp_uri};
use crate::{Error, Result};

// =======================================================================
// Silent publisher
// =======================================================================

/// The publisher class.
///
/// Binds to `address` (e.g. `tcp://*:1234`); setting the port to 0 picks a
/// random free port from the configured range.
pub struct Publisher {
    name: String,
    socket: Mutex<PubSocket>,
    last_beat: Mutex<Option<Instant>>,
}

impl Publisher {
    /// Bind the publisher to `address`.
    pub fn bind(address: &str, name: &str) -> Result<Self> {
        let (host, port) = parse_tcp_uri(address)?;
        let socket = PubSocket::bind(&host, port)?;
        log::info!("[publisher] {name} started on port {}", socket.port());
        Ok(Self {
            name: name.to_string(),
            socket: Mutex::new(socket),
            last_beat: Mutex::new(None),
        })
    }

    /// The bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.socket.lock().port()
    }

    /// Send the given raw message to all connected subscribers.
    ///
    /// Safe to call from concurrent contexts; sends are serialized.
    pub fn send(&self, raw: &str) -> Result<()> {
        self.socket.lock().send(raw)
    }

    /// Send a heartbeat, but only if `min_interval` has passed since the
    /// last one.
    pub fn heartbeat(&self, min_interval: Duration) -> Result<()> {
        {
            let mut last = self.last_beat.lock();
            let due = min_interval.is_zero()
                || last.is_none_or(|at| at.elapsed() >= min_interval);
            if !due {
                return Ok(());
            }
            *last = Some(Instant::now());
        }
        log::debug!(
            "[publisher] heartbeat (min_interval is {:.1}s)",
            min_interval.as_secs_f64()
        );
        let beat = Message::new(
            &format!("/heartbeat/{}", self.name),
            "beat",
            serde_json::json!({"min_interval": min_interval.as_secs_f64()}).into(),
        )?;
        self.send(&beat.encode())
    }

    /// Close the publish socket, dropping all connections immediately.
    pub fn stop(&self) {
        self.socket.lock().stop();
    }
}

// =======================================================================
// Announced publisher
// =======================================================================

/// Same as [`Publisher`], but broadcasting its own name and address.
///
/// The *name* matters: it is what subscribers search for on the nameserver.
/// *aliases* are alternative service names. When *nameservers* is non-empty
/// multicasting is deactivated and the publisher registers on the listed
/// nameservers only.
pub struct NoisyPublisher {
    name: String,
    services: Vec<String>,
    port: u16,
    broadcast_interval: Duration,
    nameservers: Vec<String>,
    inner: Mutex<Option<Inner>>,
}

struct Inner {
    publisher: Publisher,
    broadcaster: MessageBroadcaster,
}

impl NoisyPublisher {
    /// Create the publisher; nothing is bound until [`start`](Self::start).
    #[must_use]
    pub fn new(
        name: &str,
        port: u16,
        aliases: &[String],
        broadcast_interval: Duration,
        nameservers: &[String],
    ) -> Self {
        let mut services = vec![name.to_string()];
        services.extend(aliases.iter().cloned());
        Self {
            name: name.to_string(),
            services,
            port,
            broadcast_interval,
            nameservers: nameservers.to_vec(),
            inner: Mutex::new(None),
        }
    }

    /// Bind the publish socket and launch the announcer.
    ///
    /// Returns the bound port. Starting an already started publisher is a
    /// no-op.
    pub fn start(&self) -> Result<u16> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.as_ref() {
            return Ok(existing.publisher.port());
        }
        let publisher = Publisher::bind(&format!("tcp://*:{}", self.port), &self.name)?;
        let port = publisher.port();
        let address = format!("tcp://{}:{port}", get_own_ip());
        log::debug!("[publisher] entering publish {address}");
        let broadcaster = MessageBroadcaster::advertise_service(
            &self.name,
            &address,
            &self.services,
            self.broadcast_interval,
            &self.nameservers,
        )?;
        *inner = Some(Inner {
            publisher,
            broadcaster,
        });
        Ok(port)
    }

    /// The bound port, if started.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.inner.lock().as_ref().map(|i| i.publisher.port())
    }

    /// Send a raw message.
    pub fn send(&self, raw: &str) -> Result<()> {
        match self.inner.lock().as_ref() {
            Some(inner) => inner.publisher.send(raw),
            None => Err(Error::Connection("publisher is not started".into())),
        }
    }

    /// Send a heartbeat, rate-limited to one per `min_interval`.
    pub fn heartbeat(&self, min_interval: Duration) -> Result<()> {
        match self.inner.lock().as_ref() {
            Some(inner) => inner.publisher.heartbeat(min_interval),
            None => Err(Error::Connection("publisher is not started".into())),
        }
    }

    /// Stop the announcer (emitting the stop advertisement), then close the
    /// publish socket. Idempotent.
    pub fn stop(&self) {
        if let Some(mut inner) = self.inner.lock().take() {
            log::debug!("[publisher] exiting publish");
            inner.broadcaster.stop();
            inner.publisher.stop();
        }
    }
}

impl Drop for NoisyPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

// =======================================================================
// Scoped acquisition
// =======================================================================

/// The publishing context: a started [`NoisyPublisher`] that is guaranteed
/// to stop on every exit path.
pub struct Publish {
    inner: Arc<NoisyPublisher>,
}

impl Publish {
    /// Start an announced publisher for `name` on `port` (0 = random).
    pub fn new(name: &str, port: u16) -> Result<Self> {
        Self::with_options(name, port, &[], &[])
    }

    /// Start with aliases and/or explicit nameservers.
    pub fn with_options(
        name: &str,
        port: u16,
        aliases: &[String],
        nameservers: &[String],
    ) -> Result<Self> {
        let inner = Arc::new(NoisyPublisher::new(
            name,
            port,
            aliases,
            DEFAULT_BROADCAST_INTERVAL,
            nameservers,
        ));
        inner.start()?;
        Ok(Self { inner })
    }

    /// A shareable handle to the underlying publisher.
    #[must_use]
    pub fn handle(&self) -> Arc<NoisyPublisher> {
        Arc::clone(&self.inner)
    }
}

impl Deref for Publish {
    type Target = NoisyPublisher;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Drop for Publish {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_random_port() {
        let publisher = Publisher::bind("tcp://127.0.0.1:0", "test").unwrap();
        assert!(publisher.port() >= crate::config::DEFAULT_PUB_MIN_PORT);
        publisher.stop();
    }

    #[test]
    fn test_noisy_start_stop_idempotent() {
        let publisher = NoisyPublisher::new("svc", 0, &[], Duration::ZERO, &[]);
        let port = publisher.start().unwrap();
        assert_eq!(publisher.start().unwrap(), port);
        publisher.stop();
        publisher.stop();
        assert!(publisher.send("x").is_err());
    }

    #[test]
    fn test_heartbeat_rate_limited() {
        let publisher = Publisher::bind("tcp://127.0.0.1:0", "beat-test").unwrap();
        publisher.heartbeat(Duration::from_secs(3600)).unwrap();
        let before = *publisher.last_beat.lock();
        publisher.heartbeat(Duration::from_secs(3600)).unwrap();
        assert_eq!(*publisher.last_beat.lock(), before);
        publisher.stop();
    }
}
