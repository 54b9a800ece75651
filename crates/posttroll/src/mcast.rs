// SPDX-License-Identifier: GPL-3.0-or-later

//! Send and receive UDP multicast (or broadcast) packets.
//!
//! Requires that the OS kernel supports IP multicast. A multicast receiver
//! also receives broadcast traffic on the same port, which is what the
//! advertisement plane relies on when `mc_group` resolves to a broadcast
//! address.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use crate::config::{self, DEFAULT_BROADCAST_PORT, DEFAULT_MC_GROUP, DEFAULT_MC_TTL};
use crate::{Error, Result};

const RECV_BUFSIZE: usize = 4096;

/// The UDP port advertisements travel on, from config.
#[must_use]
pub fn configured_broadcast_port() -> u16 {
    config::global().get_port_or("broadcast_port", DEFAULT_BROADCAST_PORT)
}

// =======================================================================
// Sender
// =======================================================================

/// Multicast (or broadcast) sender towards `group:port`.
pub struct MulticastSender {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl MulticastSender {
    /// Create a sender for the configured group.
    pub fn new(port: u16) -> Result<Self> {
        let group = config::global().get_or("mc_group", DEFAULT_MC_GROUP);
        Self::with_group(port, &group)
    }

    /// Create a sender for an explicit group.
    pub fn with_group(port: u16, group: &str) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let destination = if is_broadcast_group(group) {
            socket.set_broadcast(true)?;
            SocketAddr::from((Ipv4Addr::BROADCAST, port))
        } else {
            let group_addr = resolve_group(group)?;
            validate_multicast_group(group_addr)?;
            let ttl = config::global().get_u64_or("mc_ttl", u64::from(DEFAULT_MC_TTL));
            socket.set_multicast_ttl_v4(ttl as u32)?;
            let iface = configured_interface();
            if !iface.is_unspecified() {
                socket.set_multicast_if_v4(&iface)?;
            }
            socket.set_multicast_loop_v4(true)?;
            SocketAddr::from((group_addr, port))
        };
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
        log::debug!("[mcast] sender ready for group {group}:{port}");
        Ok(Self {
            socket: socket.into(),
            destination,
        })
    }

    /// Send one payload to the group.
    pub fn send(&self, data: &str) -> io::Result<()> {
        self.socket.send_to(data.as_bytes(), self.destination)?;
        Ok(())
    }
}

// =======================================================================
// Receiver
// =======================================================================

/// Multicast receiver on `port` for the advertisement group.
pub struct MulticastReceiver {
    socket: UdpSocket,
}

impl MulticastReceiver {
    /// Create a receiver joined to the configured group.
    pub fn new(port: u16) -> Result<Self> {
        let group = config::global().get_or("mc_group", DEFAULT_MC_GROUP);
        Self::with_group(port, &group)
    }

    /// Create a receiver joined to an explicit group.
    pub fn with_group(port: u16, group: &str) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        // Allow multiple receivers of the advertisement stream on one host.
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
        let socket: UdpSocket = socket.into();

        if !is_broadcast_group(group) {
            let group_addr = resolve_group(group)?;
            validate_multicast_group(group_addr)?;
            join_group_on_all_interfaces(&socket, group_addr)?;
            socket.set_multicast_loop_v4(true)?;
        }
        log::debug!("[mcast] receiver bound on port {port} (group {group})");
        Ok(Self { socket })
    }

    /// Set the receive timeout; a timeout surfaces as `WouldBlock`/`TimedOut`.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    /// Receive one packet, returning the payload text and the sender.
    pub fn recv(&self) -> io::Result<(String, SocketAddr)> {
        let mut buf = [0u8; RECV_BUFSIZE];
        let (n, sender) = self.socket.recv_from(&mut buf)?;
        Ok((String::from_utf8_lossy(&buf[..n]).into_owned(), sender))
    }
}

/// Join the group on every local interface, falling back to UNSPECIFIED.
///
/// Individual join failures are non-fatal (virtual interfaces often cannot
/// join); at least one membership must succeed.
fn join_group_on_all_interfaces(socket: &UdpSocket, group: Ipv4Addr) -> Result<()> {
    let interfaces = local_ipv4_addresses();
    let mut joined = false;
    for iface in &interfaces {
        match socket.join_multicast_v4(&group, iface) {
            Ok(()) => {
                log::debug!("[mcast] joined {group} on interface {iface}");
                joined = true;
            }
            Err(e) => {
                log::debug!("[mcast] join {group} on {iface} failed (non-fatal): {e}");
            }
        }
    }
    if !joined {
        socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| {
                Error::Connection(format!("could not join multicast group {group}: {e}"))
            })?;
    }
    Ok(())
}

// =======================================================================
// Small helpers
// =======================================================================

/// Whether `group` selects broadcast rather than multicast mode.
#[must_use]
pub fn is_broadcast_group(group: &str) -> bool {
    if group.is_empty() {
        return true;
    }
    matches!(
        resolve_group(group),
        Ok(addr) if addr.is_unspecified() || addr.is_broadcast()
    )
}

fn resolve_group(group: &str) -> Result<Ipv4Addr> {
    if let Ok(addr) = group.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    let mut addrs = (group, 0u16)
        .to_socket_addrs()
        .map_err(|e| Error::Connection(format!("cannot resolve group '{group}': {e}")))?;
    addrs
        .find_map(|a| match a {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::Connection(format!("no IPv4 address for group '{group}'")))
}

fn validate_multicast_group(addr: Ipv4Addr) -> Result<()> {
    let first = addr.octets()[0];
    if !(224..=239).contains(&first) {
        return Err(Error::Connection(format!("invalid multicast address {addr}")));
    }
    Ok(())
}

fn configured_interface() -> Ipv4Addr {
    config::global()
        .get("multicast_interface")
        .and_then(|s| s.parse().ok())
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}

/// All local IPv4 addresses, loopback included.
///
/// Parses `ip -4 addr show` output; falls back to loopback only when the
/// command is unavailable (e.g. minimal containers).
#[must_use]
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let mut addresses = vec![Ipv4Addr::LOCALHOST];
    let output = match std::process::Command::new("ip")
        .args(["-4", "addr", "show"])
        .output()
    {
        Ok(o) => o,
        Err(_) => return addresses,
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if let Some(inet_part) = line.trim().strip_prefix("inet ") {
            if let Some(addr_str) = inet_part.split('/').next() {
                if let Ok(addr) = addr_str.trim().parse::<Ipv4Addr>() {
                    if !addresses.contains(&addr) {
                        addresses.push(addr);
                    }
                }
            }
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_group_detection() {
        assert!(is_broadcast_group(""));
        assert!(is_broadcast_group("0.0.0.0"));
        assert!(is_broadcast_group("255.255.255.255"));
        assert!(!is_broadcast_group("225.0.0.212"));
    }

    #[test]
    fn test_group_validation() {
        assert!(validate_multicast_group("225.0.0.212".parse().unwrap()).is_ok());
        assert!(validate_multicast_group("239.255.0.1".parse().unwrap()).is_ok());
        assert!(validate_multicast_group("240.0.0.1".parse().unwrap()).is_err());
        assert!(validate_multicast_group("10.0.0.1".parse().unwrap()).is_err());
    }

    #[test]
    fn test_local_addresses_include_loopback() {
        let addrs = local_ipv4_addresses();
        assert!(addrs.contains(&Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_sender_receiver_loopback() {
        // Loopback round-trip over an ephemeral-ish port; skipped silently
        // when the kernel lacks multicast support.
        let port = 29_217;
        let Ok(receiver) = MulticastReceiver::with_group(port, "225.0.0.212") else {
            return;
        };
        receiver.set_timeout(Some(Duration::from_secs(2))).unwrap();
        let sender = MulticastSender::with_group(port, "225.0.0.212").unwrap();
        sender.send("ping").unwrap();
        if let Ok((data, _from)) = receiver.recv() {
            assert_eq!(data, "ping");
        }
    }
}
