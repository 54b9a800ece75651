// SPDX-License-Identifier: GPL-3.0-or-later

//! # posttroll - messaging for event-driven pipelines
//!
//! Posttroll lets independent processes exchange discrete, typed
//! notifications without knowing each other's addresses. Publishers announce
//! themselves on named *services*; subscribers ask for services and filter
//! the resulting message stream by *subject* prefix. A lightweight
//! nameserver aggregates publisher advertisements (UDP multicast or direct
//! pushes) and answers point-in-time lookups.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use posttroll::message::Message;
//! use posttroll::publisher::Publish;
//!
//! fn main() -> posttroll::Result<()> {
//!     let publisher = Publish::new("my_service", 9000)?;
//!     let message = Message::new("/counter", "info", "1".into())?;
//!     publisher.send(&message.encode())?;
//!     Ok(())
//! }
//! ```
//!
//! ```rust,no_run
//! use posttroll::subscriber::{Subscribe, SubscribeSettings};
//!
//! fn main() -> posttroll::Result<()> {
//!     let settings = SubscribeSettings {
//!         services: Some(vec!["my_service".into()]),
//!         topics: vec!["/counter".into()],
//!         ..Default::default()
//!     };
//!     let subscription = Subscribe::open(settings)?;
//!     for message in subscription.iter() {
//!         println!("{}", message);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |  Publisher --(advertise)--> Broadcaster --UDP--> Nameserver  |
//! |  Subscriber --(request)---> Nameserver --(addresses)-->      |
//! |  Subscriber --TCP--> Publisher: framed pytroll messages      |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`message`] - the wire envelope (start here)
//! - [`publisher`] / [`subscriber`] - the high-level endpoints
//! - [`nameserver`] / [`address_receiver`] - the discovery plane
//! - [`broadcaster`] / [`mcast`] - advertisement plumbing
//! - [`net`] - plain and authenticated transport backends
//! - [`config`] - process-wide configuration

/// Dynamic address table fed by publisher advertisements.
pub mod address_receiver;
/// Periodic advertisement loop with stop-revocation.
pub mod broadcaster;
/// Process-wide configuration with scoped overrides.
pub mod config;
/// UDP multicast/broadcast send and receive.
pub mod mcast;
/// The pytroll message envelope.
pub mod message;
/// Name service: discovery request/reply plus client lookups.
pub mod nameserver;
/// Transport backends: plain TCP and curve-authenticated TCP.
pub mod net;
/// Outbound message endpoints.
pub mod publisher;
/// Inbound message consumers with dynamic connections.
pub mod subscriber;

pub use message::Message;
pub use publisher::{NoisyPublisher, Publish, Publisher};
pub use subscriber::{NsSubscriber, Subscribe, SubscribeSettings, Subscriber};

use std::fmt;

/// Errors returned by posttroll operations.
#[derive(Debug)]
pub enum Error {
    /// Malformed envelope on decode, or invalid field on construction.
    Message(String),
    /// Request/reply or receive exceeded its deadline.
    Timeout(String),
    /// Transport bind/connect failed, or peer authentication was rejected.
    Connection(String),
    /// The requested service has zero live addresses.
    AddressNotFound(String),
    /// Unknown configuration key or impossible value combination.
    Config(String),
    /// I/O error with underlying cause.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Message(s) => write!(f, "message error: {s}"),
            Error::Timeout(s) => write!(f, "timed out: {s}"),
            Error::Connection(s) => write!(f, "connection error: {s}"),
            Error::AddressNotFound(s) => write!(f, "no address found: {s}"),
            Error::Config(s) => write!(f, "configuration error: {s}"),
            Error::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Posttroll version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
