// SPDX-License-Identifier: GPL-3.0-or-later

//! Transport layer: framed messages over TCP, plain or authenticated.
//!
//! The concrete socket roles (publish, subscribe, request, reply) live in
//! [`plain`]; they are backend-agnostic and wrap every connection in a
//! [`Stream`]. Which backend a stream uses is selected by name from the
//! `backend` configuration key at socket creation:
//!
//! | config value | backend |
//! |---|---|
//! | `zmq` (default) | plain TCP |
//! | `secure_zmq` | curve-authenticated TCP ([`secure`]) |
//!
//! TCP keepalive options from config are applied to every socket on
//! creation.

/// Length-prefix framing.
pub mod frame;
/// Curve key-pair files.
pub mod keys;
/// Publish/subscribe/request/reply socket roles.
pub mod plain;
/// Authenticated, encrypted streams.
pub mod secure;

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{self, DEFAULT_PUB_MAX_PORT, DEFAULT_PUB_MIN_PORT};
use crate::message::Message;
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const BIND_RETRIES: usize = 5;
const BIND_RETRY_PAUSE: Duration = Duration::from_millis(100);
const RANDOM_PORT_TRIES: usize = 100;

// =======================================================================
// Backend selection
// =======================================================================

/// Transport backend, selected by name from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Plain TCP, no authentication.
    Plain,
    /// Curve-authenticated TCP.
    Secure,
}

/// The backend named by the `backend` configuration key.
pub fn configured_backend() -> Result<Backend> {
    let name = config::global().get_or("backend", "zmq");
    match name.as_str() {
        "zmq" | "unsecure_zmq" => Ok(Backend::Plain),
        "secure_zmq" => Ok(Backend::Secure),
        other => Err(Error::Config(format!("unknown backend '{other}'"))),
    }
}

/// Server-side backend context, loaded once per bound socket.
///
/// Loading fails at socket creation when the secure backend is selected and
/// key files are missing or unreadable.
pub(crate) enum ServerContext {
    Plain,
    Secure(Arc<secure::ServerAuth>),
}

impl ServerContext {
    pub(crate) fn from_config() -> Result<Self> {
        match configured_backend()? {
            Backend::Plain => Ok(Self::Plain),
            Backend::Secure => {
                let secret_file = require_key("server_secret_key_file")?;
                let clients_dir = require_key("clients_public_keys_directory")?;
                let keypair = keys::load_key_pair(secret_file.as_ref())?;
                let accepted_clients = keys::load_client_keys(clients_dir.as_ref())?;
                Ok(Self::Secure(Arc::new(secure::ServerAuth {
                    keypair,
                    accepted_clients,
                })))
            }
        }
    }

    /// Wrap an accepted connection, running the handshake when secure.
    pub(crate) fn accept(&self, tcp: TcpStream) -> Result<Stream> {
        match self {
            Self::Plain => Ok(Stream::Plain(tcp)),
            Self::Secure(auth) => Ok(Stream::Secure(secure::server_handshake(tcp, auth)?)),
        }
    }
}

/// Client-side backend context.
pub(crate) enum ClientContext {
    Plain,
    Secure(Arc<secure::ClientAuth>),
}

impl ClientContext {
    pub(crate) fn from_config() -> Result<Self> {
        match configured_backend()? {
            Backend::Plain => Ok(Self::Plain),
            Backend::Secure => {
                let secret_file = require_key("client_secret_key_file")?;
                let server_key_file = require_key("server_public_key_file")?;
                let keypair = keys::load_key_pair(secret_file.as_ref())?;
                let server_public = keys::load_public_key(server_key_file.as_ref())?;
                Ok(Self::Secure(Arc::new(secure::ClientAuth {
                    keypair,
                    server_public,
                })))
            }
        }
    }

    fn wrap(&self, tcp: TcpStream) -> Result<Stream> {
        match self {
            Self::Plain => Ok(Stream::Plain(tcp)),
            Self::Secure(auth) => Ok(Stream::Secure(secure::client_handshake(tcp, auth)?)),
        }
    }
}

fn require_key(key: &str) -> Result<std::path::PathBuf> {
    config::global()
        .get(key)
        .map(std::path::PathBuf::from)
        .ok_or_else(|| Error::Config(format!("secure backend selected but '{key}' is not set")))
}

// =======================================================================
// Streams
// =======================================================================

/// One framed connection, plain or authenticated.
pub enum Stream {
    Plain(TcpStream),
    Secure(secure::SecureStream),
}

impl Stream {
    /// Write one frame.
    pub fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            Stream::Plain(tcp) => frame::write_frame(tcp, payload),
            Stream::Secure(s) => s.write_frame(payload),
        }
    }

    /// Read one frame; `Ok(None)` on clean close.
    pub fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self {
            Stream::Plain(tcp) => frame::read_frame(tcp),
            Stream::Secure(s) => s.read_frame(),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }

    /// A handle to the raw TCP stream, usable to unblock a reader.
    pub fn try_clone_tcp(&self) -> io::Result<TcpStream> {
        self.tcp().try_clone()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(tcp) => tcp,
            Stream::Secure(s) => s.tcp(),
        }
    }
}

/// Connect a framed stream to a `tcp://host:port` address with the
/// configured backend.
pub fn connect_stream(address: &str, timeout: Option<Duration>) -> Result<Stream> {
    let context = ClientContext::from_config()?;
    let socket_addr = resolve_tcp_uri(address)?;
    let tcp = match timeout {
        Some(t) => TcpStream::connect_timeout(&socket_addr, t),
        None => TcpStream::connect(socket_addr),
    }
    .map_err(|e| Error::Connection(format!("connect to {address} failed: {e}")))?;
    apply_socket_options(&tcp);
    context.wrap(tcp)
}

// =======================================================================
// Request/reply
// =======================================================================

/// One-shot request/reply exchange carrying raw strings.
pub fn request_raw(address: &str, payload: &str, timeout: Duration) -> Result<String> {
    let deadline = Instant::now() + timeout;
    let mut stream = connect_stream(address, Some(timeout))?;
    stream.set_read_timeout(Some(remaining(deadline)?))?;
    stream.write_frame(payload.as_bytes())?;
    match stream.read_frame() {
        Ok(Some(reply)) => Ok(String::from_utf8_lossy(&reply).into_owned()),
        Ok(None) => Err(Error::Connection(format!(
            "{address} closed the connection without replying"
        ))),
        Err(e) if is_timeout(&e) => Err(Error::Timeout(format!(
            "no reply from {address} within {timeout:?}"
        ))),
        Err(e) => Err(e.into()),
    }
}

/// One-shot request/reply exchange carrying messages.
pub fn request(address: &str, message: &Message, timeout: Duration) -> Result<Message> {
    let reply = request_raw(address, &message.encode(), timeout)?;
    Message::decode(&reply)
}

fn remaining(deadline: Instant) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(Error::Timeout("deadline expired".into()));
    }
    Ok(left)
}

pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

// =======================================================================
// Binding and socket options
// =======================================================================

/// Bind a TCP listener. Port 0 picks a random free port from the
/// configured `pub_min_port..pub_max_port` range; a fixed port is retried a
/// few times to ride out lingering sockets.
pub(crate) fn bind_listener(host: &str, port: u16) -> Result<(TcpListener, u16)> {
    let host = if host == "*" { "0.0.0.0" } else { host };
    if port != 0 {
        let mut last_error = None;
        for _ in 0..BIND_RETRIES {
            match TcpListener::bind((host, port)) {
                Ok(listener) => return Ok((listener, port)),
                Err(e) => {
                    last_error = Some(e);
                    std::thread::sleep(BIND_RETRY_PAUSE);
                }
            }
        }
        return Err(Error::Connection(format!(
            "could not bind {host}:{port} - {}",
            last_error.expect("bind attempted at least once")
        )));
    }

    let min_port = config::global().get_port_or("pub_min_port", DEFAULT_PUB_MIN_PORT);
    let max_port = config::global()
        .get_u64_or("pub_max_port", u64::from(DEFAULT_PUB_MAX_PORT))
        .min(u64::from(u16::MAX) + 1) as u32;
    let span = max_port.saturating_sub(u32::from(min_port)).max(1);
    for _ in 0..RANDOM_PORT_TRIES {
        let candidate = min_port + (rand::random::<u32>() % span) as u16;
        if let Ok(listener) = TcpListener::bind((host, candidate)) {
            return Ok((listener, candidate));
        }
    }
    Err(Error::Connection(format!(
        "no free port in range {min_port}..{max_port} on {host}"
    )))
}

/// Apply the configured TCP keepalive options to a socket.
pub(crate) fn apply_socket_options(stream: &TcpStream) {
    let cfg = config::global();
    if cfg.get_u64_or("tcp_keepalive", 0) == 0 {
        return;
    }
    let mut keepalive = TcpKeepalive::new();
    if let Some(idle) = cfg.get("tcp_keepalive_idle").and_then(|v| v.parse().ok()) {
        keepalive = keepalive.with_time(Duration::from_secs(idle));
    }
    if let Some(interval) = cfg.get("tcp_keepalive_intvl").and_then(|v| v.parse().ok()) {
        keepalive = keepalive.with_interval(Duration::from_secs(interval));
    }
    if let Some(count) = cfg.get("tcp_keepalive_cnt").and_then(|v| v.parse().ok()) {
        keepalive = keepalive.with_retries(count);
    }
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        log::warn!("[net] could not apply tcp keepalive options: {e}");
    }
}

// =======================================================================
// Addressing helpers
// =======================================================================

/// Split a `tcp://host:port` URI.
pub fn parse_tcp_uri(uri: &str) -> Result<(String, u16)> {
    let rest = uri.strip_prefix("tcp://").unwrap_or(uri);
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| Error::Connection(format!("no port in address '{uri}'")))?;
    let port = port
        .parse()
        .map_err(|_| Error::Connection(format!("bad port in address '{uri}'")))?;
    Ok((host.to_string(), port))
}

fn resolve_tcp_uri(uri: &str) -> Result<SocketAddr> {
    let (host, port) = parse_tcp_uri(uri)?;
    let host = if host == "*" { "0.0.0.0".to_string() } else { host };
    (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| Error::Connection(format!("cannot resolve '{uri}': {e}")))?
        .next()
        .ok_or_else(|| Error::Connection(format!("no address for '{uri}'")))
}

/// The host's outward-facing IP address.
///
/// Opens a UDP socket towards a public address (nothing is sent) and reads
/// the local address the kernel picked. Falls back to loopback.
#[must_use]
pub fn get_own_ip() -> IpAddr {
    let fallback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        return fallback;
    };
    if socket.connect(("8.8.8.8", 80)).is_err() {
        return fallback;
    }
    socket.local_addr().map(|a| a.ip()).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_uri() {
        assert_eq!(
            parse_tcp_uri("tcp://localhost:5557").unwrap(),
            ("localhost".to_string(), 5557)
        );
        assert_eq!(
            parse_tcp_uri("tcp://*:0").unwrap(),
            ("*".to_string(), 0)
        );
        assert!(parse_tcp_uri("tcp://noport").is_err());
    }

    #[test]
    fn test_bind_random_port_in_range() {
        let (listener, port) = bind_listener("127.0.0.1", 0).unwrap();
        assert!(port >= DEFAULT_PUB_MIN_PORT);
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_request_against_no_listener_fails() {
        let result = request_raw(
            "tcp://127.0.0.1:1",
            "ping",
            Duration::from_millis(200),
        );
        assert!(result.is_err());
    }
}
