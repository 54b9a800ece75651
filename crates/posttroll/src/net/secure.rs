// SPDX-License-Identifier: GPL-3.0-or-later

//! Curve-authenticated transport streams.
//!
//! Every TCP connection of the secure backend starts with a two-message
//! handshake binding both peers' static curve keys:
//!
//! ```text
//! client -> server : e, enc(s_client), tag      (98 bytes)
//! server -> client : e, tag                     (49 bytes)
//! ```
//!
//! ECDH results (`es`, `ss`, `ee`, `se`) are mixed into an HKDF-SHA256
//! chaining key as they become available; the final split yields one
//! ChaCha20-Poly1305 cipher per direction. The server rejects clients whose
//! static key is not in its accepted set, and the trailing tags prove
//! possession of the static secrets on both sides.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io;
use std::net::TcpStream;
use std::time::Duration;

use super::frame;
use super::keys::KeyPair;
use crate::{Error, Result};

const PROTOCOL_NAME: &[u8] = b"posttroll-curve-chachapoly-sha256";

/// Compressed secp256k1 public key size.
const PUBKEY_SIZE: usize = 33;
/// Poly1305 authentication tag size.
const TAG_SIZE: usize = 16;

const MSG1_SIZE: usize = PUBKEY_SIZE + PUBKEY_SIZE + TAG_SIZE + TAG_SIZE;
const MSG2_SIZE: usize = PUBKEY_SIZE + TAG_SIZE;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-side credentials: own key pair plus the accepted client keys.
pub struct ServerAuth {
    pub keypair: KeyPair,
    pub accepted_clients: HashSet<PublicKey>,
}

/// Client-side credentials: own key pair plus the pinned server key.
pub struct ClientAuth {
    pub keypair: KeyPair,
    pub server_public: PublicKey,
}

// =======================================================================
// Cipher state
// =======================================================================

/// One AEAD direction: key plus monotonically increasing nonce.
struct CipherState {
    cipher: Option<ChaCha20Poly1305>,
    nonce: u64,
}

impl CipherState {
    fn empty() -> Self {
        Self {
            cipher: None,
            nonce: 0,
        }
    }

    fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Some(ChaCha20Poly1305::new(Key::from_slice(&key))),
            nonce: 0,
        }
    }

    fn initialize_key(&mut self, key: [u8; 32]) {
        self.cipher = Some(ChaCha20Poly1305::new(Key::from_slice(&key)));
        self.nonce = 0;
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce += 1;
        *Nonce::from_slice(&bytes)
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| Error::Connection("cipher not initialized".into()))?;
        cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Connection("encryption failed".into()))
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| Error::Connection("cipher not initialized".into()))?;
        cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| Error::Connection("peer authentication failed (bad ciphertext)".into()))
    }
}

// =======================================================================
// Symmetric handshake state
// =======================================================================

/// Chaining key, transcript hash and current handshake cipher.
struct SymmetricState {
    ck: [u8; 32],
    h: [u8; 32],
    cipher: CipherState,
}

impl SymmetricState {
    fn initialize() -> Self {
        let mut hasher = Sha256::new();
        hasher.update(PROTOCOL_NAME);
        let h: [u8; 32] = hasher.finalize().into();
        Self {
            ck: h,
            h,
            cipher: CipherState::empty(),
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    fn mix_key(&mut self, input_key_material: &[u8]) {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), input_key_material);
        let mut output = [0u8; 64];
        hk.expand(&[], &mut output)
            .expect("64 bytes is a valid hkdf output length");
        self.ck.copy_from_slice(&output[..32]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&output[32..64]);
        self.cipher.initialize_key(key);
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = self.cipher.encrypt(plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = self.cipher.decrypt(ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    fn split(&self) -> (CipherState, CipherState) {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), &[]);
        let mut output = [0u8; 64];
        hk.expand(&[], &mut output)
            .expect("64 bytes is a valid hkdf output length");
        let mut k1 = [0u8; 32];
        let mut k2 = [0u8; 32];
        k1.copy_from_slice(&output[..32]);
        k2.copy_from_slice(&output[32..64]);
        (CipherState::new(k1), CipherState::new(k2))
    }
}

fn ecdh(secret: &SecretKey, public: &PublicKey) -> [u8; 32] {
    SharedSecret::new(public, secret).secret_bytes()
}

// =======================================================================
// Handshake
// =======================================================================

/// Run the client side of the handshake over a fresh TCP connection.
pub fn client_handshake(tcp: TcpStream, auth: &ClientAuth) -> Result<SecureStream> {
    let mut tcp = tcp;
    tcp.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

    let mut sym = SymmetricState::initialize();
    sym.mix_hash(&auth.server_public.serialize());

    let ephemeral = KeyPair::generate();
    let e_pub = ephemeral.public.serialize();

    let mut msg1 = Vec::with_capacity(MSG1_SIZE);
    msg1.extend_from_slice(&e_pub);
    sym.mix_hash(&e_pub);
    sym.mix_key(&ecdh(&ephemeral.secret, &auth.server_public));
    let enc_static = sym.encrypt_and_hash(&auth.keypair.public.serialize())?;
    msg1.extend_from_slice(&enc_static);
    sym.mix_key(&ecdh(&auth.keypair.secret, &auth.server_public));
    let tag = sym.encrypt_and_hash(&[])?;
    msg1.extend_from_slice(&tag);
    frame::write_frame(&mut tcp, &msg1)?;

    let msg2 = read_handshake_frame(&mut tcp, MSG2_SIZE)?;
    let remote_ephemeral = PublicKey::from_slice(&msg2[..PUBKEY_SIZE])
        .map_err(|_| Error::Connection("invalid server ephemeral key".into()))?;
    sym.mix_hash(&msg2[..PUBKEY_SIZE]);
    sym.mix_key(&ecdh(&ephemeral.secret, &remote_ephemeral));
    sym.mix_key(&ecdh(&ephemeral.secret, &auth.server_public));
    sym.decrypt_and_hash(&msg2[PUBKEY_SIZE..])
        .map_err(|_| Error::Connection("server authentication failed".into()))?;

    let (c1, c2) = sym.split();
    tcp.set_read_timeout(None)?;
    Ok(SecureStream {
        tcp,
        send: c1,
        recv: c2,
    })
}

/// Run the server side of the handshake over an accepted TCP connection.
///
/// Rejects clients whose static key is not in the accepted set.
pub fn server_handshake(tcp: TcpStream, auth: &ServerAuth) -> Result<SecureStream> {
    let mut tcp = tcp;
    tcp.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

    let mut sym = SymmetricState::initialize();
    sym.mix_hash(&auth.keypair.public.serialize());

    let msg1 = read_handshake_frame(&mut tcp, MSG1_SIZE)?;
    let remote_ephemeral = PublicKey::from_slice(&msg1[..PUBKEY_SIZE])
        .map_err(|_| Error::Connection("invalid client ephemeral key".into()))?;
    sym.mix_hash(&msg1[..PUBKEY_SIZE]);
    sym.mix_key(&ecdh(&auth.keypair.secret, &remote_ephemeral));
    let enc_static_end = PUBKEY_SIZE + PUBKEY_SIZE + TAG_SIZE;
    let client_static_raw = sym.decrypt_and_hash(&msg1[PUBKEY_SIZE..enc_static_end])?;
    let client_static = PublicKey::from_slice(&client_static_raw)
        .map_err(|_| Error::Connection("invalid client static key".into()))?;
    if !auth.accepted_clients.contains(&client_static) {
        return Err(Error::Connection("client key not authorized".into()));
    }
    sym.mix_key(&ecdh(&auth.keypair.secret, &client_static));
    sym.decrypt_and_hash(&msg1[enc_static_end..])
        .map_err(|_| Error::Connection("client authentication failed".into()))?;

    let ephemeral = KeyPair::generate();
    let e_pub = ephemeral.public.serialize();
    let mut msg2 = Vec::with_capacity(MSG2_SIZE);
    msg2.extend_from_slice(&e_pub);
    sym.mix_hash(&e_pub);
    sym.mix_key(&ecdh(&ephemeral.secret, &remote_ephemeral));
    sym.mix_key(&ecdh(&auth.keypair.secret, &remote_ephemeral));
    let tag = sym.encrypt_and_hash(&[])?;
    msg2.extend_from_slice(&tag);
    frame::write_frame(&mut tcp, &msg2)?;

    let (c1, c2) = sym.split();
    tcp.set_read_timeout(None)?;
    Ok(SecureStream {
        tcp,
        send: c2,
        recv: c1,
    })
}

fn read_handshake_frame(tcp: &mut TcpStream, expected: usize) -> Result<Vec<u8>> {
    let payload = frame::read_frame(tcp)?
        .ok_or_else(|| Error::Connection("peer closed during handshake".into()))?;
    if payload.len() != expected {
        return Err(Error::Connection(format!(
            "handshake message of {} bytes, expected {expected}",
            payload.len()
        )));
    }
    Ok(payload)
}

// =======================================================================
// Transport stream
// =======================================================================

/// An authenticated, encrypted frame stream.
pub struct SecureStream {
    tcp: TcpStream,
    send: CipherState,
    recv: CipherState,
}

impl SecureStream {
    /// Encrypt and write one frame.
    pub fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        let ciphertext = self
            .send
            .encrypt(payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        frame::write_frame(&mut self.tcp, &ciphertext)
    }

    /// Read and decrypt one frame; `Ok(None)` on clean close.
    pub fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let Some(ciphertext) = frame::read_frame(&mut self.tcp)? else {
            return Ok(None);
        };
        self.recv
            .decrypt(&ciphertext)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    /// The underlying TCP stream (timeouts, shutdown).
    #[must_use]
    pub fn tcp(&self) -> &TcpStream {
        &self.tcp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn auth_pair() -> (ServerAuth, ClientAuth) {
        let server = KeyPair::generate();
        let client = KeyPair::generate();
        let server_auth = ServerAuth {
            keypair: server.clone(),
            accepted_clients: HashSet::from([client.public]),
        };
        let client_auth = ClientAuth {
            keypair: client,
            server_public: server.public,
        };
        (server_auth, client_auth)
    }

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_handshake_and_frames() {
        let (server_auth, client_auth) = auth_pair();
        let (client_tcp, server_tcp) = tcp_pair();

        let server_thread = std::thread::spawn(move || {
            let mut stream = server_handshake(server_tcp, &server_auth).unwrap();
            let frame = stream.read_frame().unwrap().unwrap();
            assert_eq!(frame, b"hello over curve");
            stream.write_frame(b"hello back").unwrap();
        });

        let mut stream = client_handshake(client_tcp, &client_auth).unwrap();
        stream.write_frame(b"hello over curve").unwrap();
        let reply = stream.read_frame().unwrap().unwrap();
        assert_eq!(reply, b"hello back");
        server_thread.join().unwrap();
    }

    #[test]
    fn test_unauthorized_client_rejected() {
        let (mut server_auth, _) = auth_pair();
        // Server accepts nobody.
        server_auth.accepted_clients.clear();
        let intruder = ClientAuth {
            keypair: KeyPair::generate(),
            server_public: server_auth.keypair.public,
        };
        let (client_tcp, server_tcp) = tcp_pair();

        let server_thread =
            std::thread::spawn(move || server_handshake(server_tcp, &server_auth));
        let _ = client_handshake(client_tcp, &intruder);
        let result = server_thread.join().unwrap();
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[test]
    fn test_wrong_server_key_fails() {
        let (server_auth, mut client_auth) = auth_pair();
        // Client pins a key that is not the server's.
        client_auth.server_public = KeyPair::generate().public;
        let (client_tcp, server_tcp) = tcp_pair();

        let server_thread =
            std::thread::spawn(move || server_handshake(server_tcp, &server_auth));
        let client_result = client_handshake(client_tcp, &client_auth);
        let server_result = server_thread.join().unwrap();
        assert!(client_result.is_err() || server_result.is_err());
    }
}
