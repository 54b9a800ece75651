// SPDX-License-Identifier: GPL-3.0-or-later

//! Secure backend end-to-end: matched key pairs talk, mismatched ones are
//! rejected at connection time, and missing key files are fatal at socket
//! creation.

use posttroll::config;
use posttroll::message::{Message, MessageData};
use posttroll::net::keys::generate_key_files;
use posttroll::publisher::Publisher;
use posttroll::subscriber::Subscriber;
use posttroll::Error;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn serialize_test() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

struct KeySet {
    _dir: tempfile::TempDir,
    server_secret: PathBuf,
    server_public: PathBuf,
    clients_dir: PathBuf,
    client_secret: PathBuf,
}

fn make_keys() -> KeySet {
    let dir = tempfile::tempdir().unwrap();
    let server_dir = dir.path().join("server");
    let clients_dir = dir.path().join("clients");
    std::fs::create_dir(&server_dir).unwrap();
    std::fs::create_dir(&clients_dir).unwrap();
    let (server_public, server_secret) = generate_key_files(&server_dir, "server").unwrap();
    let (_, client_secret) = generate_key_files(&clients_dir, "client").unwrap();
    KeySet {
        _dir: dir,
        server_secret,
        server_public,
        clients_dir,
        client_secret,
    }
}

#[test]
fn matched_keys_deliver_messages() {
    let _guard = serialize_test();
    let keys = make_keys();
    let _scope = config::global()
        .scoped(&[
            ("backend", "secure_zmq"),
            ("server_secret_key_file", keys.server_secret.to_str().unwrap()),
            ("server_public_key_file", keys.server_public.to_str().unwrap()),
            ("clients_public_keys_directory", keys.clients_dir.to_str().unwrap()),
            ("client_secret_key_file", keys.client_secret.to_str().unwrap()),
        ])
        .unwrap();

    let publisher = Publisher::bind("tcp://127.0.0.1:0", "secure-svc").unwrap();
    let address = format!("tcp://127.0.0.1:{}", publisher.port());
    let subscriber = Subscriber::new(&[address], &[]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = None;
    while received.is_none() {
        assert!(Instant::now() < deadline, "nothing received over secure link");
        let message = Message::new("/secure/topic", "info", "speak friend".into()).unwrap();
        publisher.send(&message.encode()).unwrap();
        received = subscriber.recv_timeout(Duration::from_millis(200)).unwrap();
    }
    let message = received.unwrap();
    assert_eq!(message.subject, "/secure/topic");
    assert_eq!(message.data, MessageData::Text("speak friend".into()));
    publisher.stop();
}

#[test]
fn unauthorized_client_key_is_rejected() {
    let _guard = serialize_test();
    let keys = make_keys();
    // A valid key pair, but not present in the server's clients directory.
    let rogue_dir = tempfile::tempdir().unwrap();
    let (_, rogue_secret) = generate_key_files(rogue_dir.path(), "rogue").unwrap();

    let _scope = config::global()
        .scoped(&[
            ("backend", "secure_zmq"),
            ("server_secret_key_file", keys.server_secret.to_str().unwrap()),
            ("server_public_key_file", keys.server_public.to_str().unwrap()),
            ("clients_public_keys_directory", keys.clients_dir.to_str().unwrap()),
            ("client_secret_key_file", rogue_secret.to_str().unwrap()),
        ])
        .unwrap();

    let publisher = Publisher::bind("tcp://127.0.0.1:0", "secure-svc").unwrap();
    let address = format!("tcp://127.0.0.1:{}", publisher.port());

    let started = Instant::now();
    let result = Subscriber::new(&[address], &[]);
    assert!(
        matches!(result, Err(Error::Connection(_))),
        "unauthorized client was not rejected"
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    publisher.stop();
}

#[test]
fn missing_key_files_are_fatal_at_socket_creation() {
    let _guard = serialize_test();
    let _scope = config::global()
        .scoped(&[("backend", "secure_zmq")])
        .unwrap();
    // No key files configured at all.
    let result = Publisher::bind("tcp://127.0.0.1:0", "secure-svc");
    assert!(matches!(result, Err(Error::Config(_))));
}
