// SPDX-License-Identifier: GPL-3.0-or-later

//! Curve key pairs for the secure backend.
//!
//! A key pair is stored as two small text files: `NAME.key` holds the
//! public key, `NAME.key_secret` holds both halves. Servers point
//! `clients_public_keys_directory` at a directory of `*.key` files to
//! define which clients they accept.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// A static curve key pair.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generate a fresh key pair.
    #[must_use]
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            // from_slice rejects the few out-of-range scalars; retry.
            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                let public = PublicKey::from_secret_key(&secp, &secret);
                return Self { public, secret };
            }
        }
    }
}

/// Generate a key pair and write `NAME.key` / `NAME.key_secret` under
/// `directory`. Returns both paths (public first).
pub fn generate_key_files(directory: &Path, name: &str) -> Result<(PathBuf, PathBuf)> {
    let pair = KeyPair::generate();
    let public_b64 = BASE64.encode(pair.public.serialize());
    let secret_b64 = BASE64.encode(pair.secret.secret_bytes());

    let public_path = directory.join(format!("{name}.key"));
    let secret_path = directory.join(format!("{name}.key_secret"));

    fs::write(
        &public_path,
        format!(
            "#   **** posttroll curve public key ****\n\
             public-key = \"{public_b64}\"\n"
        ),
    )?;
    fs::write(
        &secret_path,
        format!(
            "#   **** posttroll curve key pair ****\n\
             #   Keep this file private.\n\
             public-key = \"{public_b64}\"\n\
             secret-key = \"{secret_b64}\"\n"
        ),
    )?;
    Ok((public_path, secret_path))
}

/// Load the public key from a `.key` (or `.key_secret`) file.
pub fn load_public_key(path: &Path) -> Result<PublicKey> {
    let fields = read_key_file(path)?;
    let raw = fields
        .iter()
        .find(|(k, _)| k == "public-key")
        .map(|(_, v)| v.clone())
        .ok_or_else(|| Error::Config(format!("no public-key entry in {}", path.display())))?;
    decode_public(&raw, path)
}

/// Load a full key pair from a `.key_secret` file.
pub fn load_key_pair(path: &Path) -> Result<KeyPair> {
    let fields = read_key_file(path)?;
    let mut public = None;
    let mut secret = None;
    for (key, value) in fields {
        match key.as_str() {
            "public-key" => public = Some(decode_public(&value, path)?),
            "secret-key" => secret = Some(decode_secret(&value, path)?),
            _ => {}
        }
    }
    let secret = secret
        .ok_or_else(|| Error::Config(format!("no secret-key entry in {}", path.display())))?;
    let public = match public {
        Some(p) => p,
        None => PublicKey::from_secret_key(&Secp256k1::new(), &secret),
    };
    Ok(KeyPair { public, secret })
}

/// Load every `*.key` file in `directory` into an accepted-clients set.
pub fn load_client_keys(directory: &Path) -> Result<HashSet<PublicKey>> {
    let mut keys = HashSet::new();
    let entries = fs::read_dir(directory).map_err(|e| {
        Error::Config(format!(
            "cannot read clients key directory {}: {e}",
            directory.display()
        ))
    })?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "key") {
            keys.insert(load_public_key(&path)?);
        }
    }
    Ok(keys)
}

fn read_key_file(path: &Path) -> Result<Vec<(String, String)>> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read key file {}: {e}", path.display())))?;
    let mut fields = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            fields.push((
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            ));
        }
    }
    Ok(fields)
}

fn decode_public(raw: &str, path: &Path) -> Result<PublicKey> {
    let bytes = BASE64
        .decode(raw)
        .map_err(|_| Error::Config(format!("bad public key encoding in {}", path.display())))?;
    PublicKey::from_slice(&bytes)
        .map_err(|_| Error::Config(format!("bad public key in {}", path.display())))
}

fn decode_secret(raw: &str, path: &Path) -> Result<SecretKey> {
    let bytes = BASE64
        .decode(raw)
        .map_err(|_| Error::Config(format!("bad secret key encoding in {}", path.display())))?;
    SecretKey::from_slice(&bytes)
        .map_err(|_| Error::Config(format!("bad secret key in {}", path.display())))
}
