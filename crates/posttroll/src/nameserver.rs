// SPDX-License-Identifier: GPL-3.0-or-later

//! The name service: answering "who publishes service X right now?".
//!
//! The server side ([`NameServer`]) hosts one
//! [`AddressReceiver`](crate::address_receiver::AddressReceiver) and a reply
//! socket on the configured `nameserver_port` (default 5557). It answers
//! `request` messages with the live address list and accepts pushed
//! `have_address`/`stop_address` advertisements from publishers that cannot
//! multicast.
//!
//! The client side is [`get_pub_address`] and [`get_pub_addresses`].

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::address_receiver::AddressReceiver;
use crate::config::{self, DEFAULT_MAX_AGE, DEFAULT_NAMESERVER_PORT};
use crate::message::{Message, MessageData};
use crate::net::plain::RepSocket;
use crate::{Error, Result};

const REQUEST_SUBJECT: &str = "/oper/ns";

/// The nameserver port from config.
#[must_use]
pub fn configured_nameserver_port() -> u16 {
    config::global().get_port_or("nameserver_port", DEFAULT_NAMESERVER_PORT)
}

// =======================================================================
// Client functions
// =======================================================================

/// Ask `nameserver` for the addresses of the publishers of `service`.
///
/// `service == ""` asks for every live publisher. Returns the raw
/// advertisement records.
pub fn get_pub_address(service: &str, timeout: Duration, nameserver: &str) -> Result<Vec<Value>> {
    let address = format!("tcp://{nameserver}:{}", configured_nameserver_port());
    log::debug!("[nameserver] requesting '{service}' from {address}");
    let request = Message::new(
        REQUEST_SUBJECT,
        "request",
        serde_json::json!({"service": service}).into(),
    )?;
    let reply = crate::net::request(&address, &request, timeout)?;
    match reply.data {
        MessageData::Json(Value::Array(records)) => Ok(records),
        MessageData::Empty => Ok(Vec::new()),
        other => {
            log::warn!("[nameserver] unexpected reply payload: {other:?}");
            Ok(Vec::new())
        }
    }
}

/// Ask for several services at once, retrying until `timeout` elapses.
///
/// Fails with an address-not-found error when nothing is live by the
/// deadline.
pub fn get_pub_addresses(
    services: &[String],
    timeout: Duration,
    nameserver: &str,
) -> Result<Vec<Value>> {
    let all = vec![String::new()];
    let services = if services.is_empty() { &all } else { services };
    let deadline = Instant::now() + timeout;
    let pause = (timeout / 20).max(Duration::from_millis(50));
    loop {
        let mut records = Vec::new();
        for service in services {
            match get_pub_address(service, timeout, nameserver) {
                Ok(found) => records.extend(found),
                Err(e) => log::debug!("[nameserver] lookup of '{service}' failed: {e}"),
            }
        }
        if !records.is_empty() {
            return Ok(records);
        }
        if Instant::now() >= deadline {
            return Err(Error::AddressNotFound(format!(
                "no live addresses for [{}]",
                services.join(", ")
            )));
        }
        std::thread::sleep(pause);
    }
}

// =======================================================================
// Server side
// =======================================================================

/// Build the reply to one lookup request.
fn active_address_reply(service: &str, receiver: &AddressReceiver) -> Result<Message> {
    let records = receiver.get(service);
    Message::new(REQUEST_SUBJECT, "info", Value::Array(records).into())
}

/// The name server process.
pub struct NameServer {
    max_age: Duration,
    multicast_enabled: bool,
    restrict_to_localhost: bool,
    stop: Arc<AtomicBool>,
}

impl NameServer {
    /// Create a nameserver.
    ///
    /// `max_age` bounds advertisement staleness (default when `None`);
    /// `multicast_enabled: false` serves direct pushes only;
    /// `restrict_to_localhost` binds the reply socket to loopback and drops
    /// off-host multicast advertisements.
    #[must_use]
    pub fn new(
        max_age: Option<Duration>,
        multicast_enabled: bool,
        restrict_to_localhost: bool,
    ) -> Self {
        Self {
            max_age: max_age.unwrap_or(DEFAULT_MAX_AGE),
            multicast_enabled,
            restrict_to_localhost,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the address receiver and answer requests until [`stop`](Self::stop).
    ///
    /// Binding failures (port in use) are fatal and surface as errors.
    pub fn run(&self) -> Result<()> {
        let mut receiver = AddressReceiver::with_max_age(self.max_age)
            .multicast_enabled(self.multicast_enabled)
            .restrict_to_localhost(self.restrict_to_localhost);
        receiver.start()?;

        let host = if self.restrict_to_localhost {
            "127.0.0.1"
        } else {
            "*"
        };
        let reply_socket = match RepSocket::bind(host, configured_nameserver_port()) {
            Ok(socket) => socket,
            Err(e) => {
                receiver.stop();
                return Err(e);
            }
        };
        log::info!(
            "[nameserver] listening on port {}",
            reply_socket.port()
        );

        reply_socket.serve(&self.stop, |raw| handle_request(raw, &receiver));
        receiver.stop();
        Ok(())
    }

    /// Ask a running [`run`](Self::run) loop to wind down.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn handle_request(raw: &str, receiver: &AddressReceiver) -> String {
    let message = match Message::decode(raw) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("[nameserver] undecodable request: {e}");
            return "error".to_string();
        }
    };
    if message.mtype == "request" {
        let service = match &message.data {
            MessageData::Json(data) => data
                .get("service")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        };
        log::debug!("[nameserver] replying to request: {message}");
        return match active_address_reply(&service, receiver) {
            Ok(reply) => reply.encode(),
            Err(e) => {
                log::error!("[nameserver] could not build reply: {e}");
                "error".to_string()
            }
        };
    }
    // Anything else is a pushed advertisement (have_address/stop_address
    // or a plain info/stop payload from a designated-receiver broadcaster).
    receiver.ingest(&message);
    "ok".to_string()
}
