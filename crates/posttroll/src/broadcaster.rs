// SPDX-License-Identifier: GPL-3.0-or-later

//! Periodic advertisement broadcasting.
//!
//! A [`MessageBroadcaster`] emits a fixed payload every `interval` until
//! stopped; on stop it emits one final stop payload so receivers can evict
//! the advertised address immediately instead of waiting for max-age.
//!
//! Two delivery modes: UDP multicast (the default), or point-to-point
//! request/reply pushes to an explicit list of nameservers when multicast
//! is unavailable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{self, DEFAULT_NAMESERVER_PORT};
use crate::mcast::{configured_broadcast_port, MulticastSender};
use crate::message::Message;
use crate::net::request_raw;
use crate::Result;

const STOP_POLL: Duration = Duration::from_millis(50);
const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Background loop broadcasting one payload on a timer.
pub struct MessageBroadcaster {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl MessageBroadcaster {
    /// Start broadcasting `message` every `interval`.
    ///
    /// With a non-empty `nameservers` list the payload is pushed
    /// point-to-point to each listed `host[:port]` instead of multicast.
    /// `stop_message`, when given, is emitted once when the loop stops.
    /// A zero `interval` disables broadcasting entirely.
    pub fn start(
        message: String,
        stop_message: Option<String>,
        interval: Duration,
        nameservers: &[String],
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        if interval.is_zero() {
            return Ok(Self { handle: None, stop });
        }

        let sender = if nameservers.is_empty() {
            AdSender::Multicast(MulticastSender::new(configured_broadcast_port())?)
        } else {
            AdSender::Designated(DesignatedReceiversSender::new(nameservers))
        };

        let handle = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                broadcast_loop(&sender, &message, stop_message.as_deref(), interval, &stop);
            })
        };
        Ok(Self {
            handle: Some(handle),
            stop,
        })
    }

    /// Start advertising a service endpoint.
    ///
    /// The payload is an `info` message on `/address/<name>` carrying
    /// `{URI, service, status: true}`; the stop payload is the same address
    /// with type `stop` and `status: false`.
    pub fn advertise_service(
        name: &str,
        address: &str,
        services: &[String],
        interval: Duration,
        nameservers: &[String],
    ) -> Result<Self> {
        let subject = format!("/address/{name}");
        let advertisement = Message::new(
            &subject,
            "info",
            serde_json::json!({"URI": address, "service": services, "status": true}).into(),
        )?;
        let revocation = Message::new(
            &subject,
            "stop",
            serde_json::json!({"URI": address, "service": services, "status": false}).into(),
        )?;
        Self::start(
            advertisement.encode(),
            Some(revocation.encode()),
            interval,
            nameservers,
        )
    }

    /// Whether the broadcast thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop, emitting the stop payload, and join the thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MessageBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

fn broadcast_loop(
    sender: &AdSender,
    message: &str,
    stop_message: Option<&str>,
    interval: Duration,
    stop: &AtomicBool,
) {
    let mut network_fail = false;
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match sender.send(message) {
            Ok(()) => {
                if network_fail {
                    log::info!("[broadcaster] network connection re-established");
                    network_fail = false;
                }
            }
            Err(e) if is_unreachable(&e) => {
                log::error!(
                    "[broadcaster] network unreachable, trying again in {}s",
                    interval.as_secs()
                );
                network_fail = true;
            }
            Err(e) => {
                log::error!("[broadcaster] send failed: {e}");
            }
        }
        // Sleep in short slices so stop() takes effect promptly.
        let wake_at = Instant::now() + interval;
        while Instant::now() < wake_at {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(STOP_POLL);
        }
    }
    if let Some(stop_message) = stop_message {
        if let Err(e) = sender.send(stop_message) {
            log::debug!("[broadcaster] stop payload not delivered: {e}");
        }
    }
}

fn is_unreachable(e: &std::io::Error) -> bool {
    // ENETUNREACH / EHOSTUNREACH
    matches!(e.raw_os_error(), Some(101) | Some(113))
}

enum AdSender {
    Multicast(MulticastSender),
    Designated(DesignatedReceiversSender),
}

impl AdSender {
    fn send(&self, data: &str) -> std::io::Result<()> {
        match self {
            AdSender::Multicast(sender) => sender.send(data),
            AdSender::Designated(sender) => {
                sender.send(data);
                Ok(())
            }
        }
    }
}

/// Pushes a payload to a fixed list of nameservers over request/reply.
struct DesignatedReceiversSender {
    default_port: u16,
    receivers: Vec<String>,
}

impl DesignatedReceiversSender {
    fn new(receivers: &[String]) -> Self {
        Self {
            default_port: config::global().get_port_or("nameserver_port", DEFAULT_NAMESERVER_PORT),
            receivers: receivers.to_vec(),
        }
    }

    /// Push `data` to every receiver; failures are logged, not fatal.
    fn send(&self, data: &str) {
        for receiver in &self.receivers {
            let address = if receiver.contains(':') {
                format!("tcp://{receiver}")
            } else {
                format!("tcp://{receiver}:{}", self.default_port)
            };
            match request_raw(&address, data, PUSH_TIMEOUT) {
                Ok(ack) if ack == "ok" => {}
                Ok(ack) => {
                    log::warn!("[broadcaster] invalid acknowledge from {address}: {ack}");
                }
                Err(e) => {
                    log::warn!("[broadcaster] push to {address} failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_does_not_broadcast() {
        let mut broadcaster =
            MessageBroadcaster::start("payload".into(), None, Duration::ZERO, &[]).unwrap();
        assert!(!broadcaster.is_running());
        broadcaster.stop();
        broadcaster.stop();
    }

    #[test]
    fn test_stop_is_prompt() {
        let mut broadcaster = MessageBroadcaster::start(
            "payload".into(),
            None,
            Duration::from_secs(3600),
            &[],
        )
        .unwrap();
        assert!(broadcaster.is_running());
        let started = Instant::now();
        broadcaster.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
