// SPDX-License-Identifier: GPL-3.0-or-later

//! The four socket roles of the messaging plane.
//!
//! - [`PubSocket`]: bound listener fanning every sent frame out to all
//!   connected subscribers.
//! - [`SubSocket`]: one connection to a remote publisher, drained by a
//!   reader thread into a shared channel.
//! - [`RepSocket`]: accept loop serving one request/reply exchange per
//!   connection.
//! - The request side is the one-shot [`super::request`] /
//!   [`super::request_raw`] helpers.
//!
//! All roles are backend-agnostic: connections are wrapped into
//! [`super::Stream`]s by the configured backend at creation time.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{apply_socket_options, bind_listener, connect_stream, is_timeout, ServerContext, Stream};
use crate::Result;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READER_POLL: Duration = Duration::from_millis(500);
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// A frame received from a remote publisher: `(address, payload)`.
pub type SubFrame = (String, String);

// =======================================================================
// Publish socket
// =======================================================================

/// Bound fan-out socket: every frame sent goes to all connected peers.
pub struct PubSocket {
    peers: Arc<Mutex<Vec<Stream>>>,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    port: u16,
}

impl PubSocket {
    /// Bind on `host:port`; port 0 picks from the configured range.
    pub fn bind(host: &str, port: u16) -> Result<Self> {
        let context = ServerContext::from_config()?;
        let (listener, port) = bind_listener(host, port)?;
        listener.set_nonblocking(true)?;

        let peers = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let accept_thread = {
            let peers = Arc::clone(&peers);
            let stop = Arc::clone(&stop);
            thread::spawn(move || accept_loop(&listener, &context, &peers, &stop))
        };

        Ok(Self {
            peers,
            stop,
            accept_thread: Some(accept_thread),
            port,
        })
    }

    /// The bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send one frame to every connected peer.
    ///
    /// Concurrent callers are serialized by the peer-table lock. Peers whose
    /// connection broke are dropped.
    pub fn send(&self, raw: &str) -> Result<()> {
        let mut peers = self.peers.lock();
        peers.retain_mut(|stream| match stream.write_frame(raw.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("[net] dropping subscriber connection: {e}");
                false
            }
        });
        Ok(())
    }

    /// Number of currently connected peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Stop accepting and drop all connections. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        self.peers.lock().clear();
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: &TcpListener,
    context: &ServerContext,
    peers: &Mutex<Vec<Stream>>,
    stop: &AtomicBool,
) {
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((tcp, peer_addr)) => {
                if let Err(e) = tcp.set_nonblocking(false) {
                    log::warn!("[net] could not configure accepted socket: {e}");
                    continue;
                }
                apply_socket_options(&tcp);
                match context.accept(tcp) {
                    Ok(stream) => {
                        log::debug!("[net] subscriber connected from {peer_addr}");
                        peers.lock().push(stream);
                    }
                    Err(e) => {
                        log::warn!("[net] rejected connection from {peer_addr}: {e}");
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::warn!("[net] accept failed: {e}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

// =======================================================================
// Subscribe socket
// =======================================================================

/// One subscription connection, drained into a shared channel.
pub struct SubSocket {
    address: String,
    stop: Arc<AtomicBool>,
    tcp: TcpStream,
    reader: Option<JoinHandle<()>>,
}

impl SubSocket {
    /// Connect to a publisher at `tcp://host:port`, delivering every frame
    /// into `tx` tagged with the address.
    pub fn connect(address: &str, tx: Sender<SubFrame>) -> Result<Self> {
        let stream = connect_stream(address, Some(super::CONNECT_TIMEOUT))?;
        let tcp = stream.try_clone_tcp()?;
        stream.set_read_timeout(Some(READER_POLL))?;

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop = Arc::clone(&stop);
            let address = address.to_string();
            thread::spawn(move || reader_loop(stream, &address, &tx, &stop))
        };

        Ok(Self {
            address: address.to_string(),
            stop,
            tcp,
            reader: Some(reader),
        })
    }

    /// The remote address this socket is connected to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Shut the connection down and join the reader thread.
    pub fn disconnect(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.tcp.shutdown(Shutdown::Both);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SubSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reader_loop(mut stream: Stream, address: &str, tx: &Sender<SubFrame>, stop: &AtomicBool) {
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match stream.read_frame() {
            Ok(Some(payload)) => {
                let raw = String::from_utf8_lossy(&payload).into_owned();
                if tx.send((address.to_string(), raw)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                log::debug!("[net] publisher at {address} closed the connection");
                break;
            }
            Err(ref e) if is_timeout(e) => {}
            Err(e) => {
                if !stop.load(Ordering::Relaxed) {
                    log::debug!("[net] receive from {address} failed: {e}");
                }
                break;
            }
        }
    }
}

// =======================================================================
// Reply socket
// =======================================================================

/// Bound reply socket serving one request/reply exchange per connection.
pub struct RepSocket {
    listener: TcpListener,
    context: ServerContext,
    port: u16,
}

impl RepSocket {
    /// Bind on `host:port`.
    pub fn bind(host: &str, port: u16) -> Result<Self> {
        let context = ServerContext::from_config()?;
        let (listener, port) = bind_listener(host, port)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            context,
            port,
        })
    }

    /// The bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve requests until `stop` is set.
    ///
    /// The handler maps one raw request string to one raw reply string.
    pub fn serve<F>(&self, stop: &AtomicBool, mut handler: F)
    where
        F: FnMut(&str) -> String,
    {
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match self.listener.accept() {
                Ok((tcp, peer_addr)) => {
                    if tcp.set_nonblocking(false).is_err() {
                        continue;
                    }
                    apply_socket_options(&tcp);
                    match self.context.accept(tcp) {
                        Ok(stream) => serve_one(stream, peer_addr, &mut handler),
                        Err(e) => {
                            log::warn!("[net] rejected requester {peer_addr}: {e}");
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log::warn!("[net] accept failed: {e}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }
}

fn serve_one<F>(mut stream: Stream, peer_addr: std::net::SocketAddr, handler: &mut F)
where
    F: FnMut(&str) -> String,
{
    if stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT)).is_err() {
        return;
    }
    match stream.read_frame() {
        Ok(Some(request)) => {
            let raw = String::from_utf8_lossy(&request);
            let reply = handler(&raw);
            if let Err(e) = stream.write_frame(reply.as_bytes()) {
                log::debug!("[net] reply to {peer_addr} failed: {e}");
            }
        }
        Ok(None) => {}
        Err(e) => {
            log::debug!("[net] request read from {peer_addr} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::request_raw;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_pub_sub_frames_flow() {
        let mut publisher = PubSocket::bind("127.0.0.1", 0).unwrap();
        let address = format!("tcp://127.0.0.1:{}", publisher.port());

        let (tx, rx) = unbounded();
        let subscription = SubSocket::connect(&address, tx).unwrap();

        // Wait until the accept thread picked the connection up.
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while publisher.peer_count() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(publisher.peer_count(), 1);

        publisher.send("first frame").unwrap();
        publisher.send("second frame").unwrap();

        let (from, raw) = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(from, address);
        assert_eq!(raw, "first frame");
        let (_, raw) = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(raw, "second frame");

        subscription.disconnect();
        publisher.stop();
        publisher.stop(); // idempotent
    }

    #[test]
    fn test_rep_socket_round_trip() {
        let rep = RepSocket::bind("127.0.0.1", 0).unwrap();
        let address = format!("tcp://127.0.0.1:{}", rep.port());
        let stop = Arc::new(AtomicBool::new(false));

        let server = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                rep.serve(&stop, |request| format!("echo: {request}"));
            })
        };

        let reply = request_raw(&address, "ping", Duration::from_secs(3)).unwrap();
        assert_eq!(reply, "echo: ping");

        stop.store(true, Ordering::Relaxed);
        server.join().unwrap();
    }
}
