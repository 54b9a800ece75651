// SPDX-License-Identifier: GPL-3.0-or-later

//! End-to-end loopback scenarios: nameserver, publishers and subscribers
//! wired together over the direct (no-multicast) discovery path.
//!
//! The global configuration is process-wide, so every test takes the test
//! lock and installs its ports through a scoped override.

use posttroll::config;
use posttroll::message::{Message, MessageData};
use posttroll::nameserver::{get_pub_address, NameServer};
use posttroll::net::request_raw;
use posttroll::publisher::{Publish, Publisher};
use posttroll::subscriber::{Subscribe, SubscribeSettings, Subscriber};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn serialize_test() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A nameserver running in a background thread, stopped on drop.
struct TestNameServer {
    nameserver: Arc<NameServer>,
    runner: Option<thread::JoinHandle<posttroll::Result<()>>>,
}

impl TestNameServer {
    fn start(max_age: Duration) -> Self {
        let nameserver = Arc::new(NameServer::new(Some(max_age), false, false));
        let runner = {
            let nameserver = Arc::clone(&nameserver);
            thread::spawn(move || nameserver.run())
        };
        // Give the reply socket time to bind.
        thread::sleep(Duration::from_millis(300));
        Self {
            nameserver,
            runner: Some(runner),
        }
    }
}

impl Drop for TestNameServer {
    fn drop(&mut self) {
        self.nameserver.stop();
        if let Some(runner) = self.runner.take() {
            let _ = runner.join();
        }
    }
}

#[test]
fn loopback_pub_sub_without_multicast() {
    let _guard = serialize_test();
    let _scope = config::global()
        .scoped(&[
            ("nameserver_port", "17701"),
            ("address_publish_port", "17702"),
        ])
        .unwrap();

    let _nameserver = TestNameServer::start(Duration::from_secs(10));
    let publisher =
        Publish::with_options("svc", 0, &[], &["localhost:17701".to_string()]).unwrap();
    thread::sleep(Duration::from_millis(500));

    let subscription = Subscribe::open(SubscribeSettings {
        services: Some(vec!["svc".to_string()]),
        topics: vec!["/c".to_string()],
        timeout: Duration::from_secs(2),
        ..Default::default()
    })
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut received = None;
    while Instant::now() < deadline && received.is_none() {
        let message = Message::new("/counter", "info", "1".into()).unwrap();
        publisher.send(&message.encode()).unwrap();
        received = subscription.recv_timeout(Duration::from_millis(300)).unwrap();
    }

    let message = received.expect("no message received over loopback");
    assert_eq!(message.subject, "/counter");
    assert_eq!(message.mtype, "info");
    assert_eq!(message.data, MessageData::Text("1".into()));
}

#[test]
fn subscriber_only_connects_to_requested_service() {
    let _guard = serialize_test();
    let _scope = config::global()
        .scoped(&[
            ("nameserver_port", "17711"),
            ("address_publish_port", "17712"),
        ])
        .unwrap();

    let _nameserver = TestNameServer::start(Duration::from_secs(10));
    let nameservers = vec!["localhost:17711".to_string()];
    let alpha = Publish::with_options("alpha", 0, &[], &nameservers).unwrap();
    let beta = Publish::with_options("beta", 0, &[], &nameservers).unwrap();
    thread::sleep(Duration::from_millis(500));

    let subscription = Subscribe::open(SubscribeSettings {
        services: Some(vec!["alpha".to_string()]),
        timeout: Duration::from_secs(2),
        ..Default::default()
    })
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut from_alpha = 0;
    while Instant::now() < deadline && from_alpha < 3 {
        alpha
            .send(&Message::new("/from/alpha", "info", "a".into()).unwrap().encode())
            .unwrap();
        beta.send(&Message::new("/from/beta", "info", "b".into()).unwrap().encode())
            .unwrap();
        while let Some(message) = subscription.recv_timeout(Duration::from_millis(200)).unwrap()
        {
            assert!(
                message.subject.starts_with("/from/alpha"),
                "received from the wrong publisher: {message}"
            );
            from_alpha += 1;
        }
    }
    assert!(from_alpha >= 3, "never heard from alpha");

    // The connection set holds alpha's port only.
    let alpha_port = alpha.port().unwrap();
    let beta_port = beta.port().unwrap();
    let addresses = subscription.addresses();
    assert!(addresses.iter().all(|a| a.ends_with(&format!(":{alpha_port}"))));
    assert!(!addresses.iter().any(|a| a.ends_with(&format!(":{beta_port}"))));
}

#[test]
fn pushed_addresses_are_listed_and_evicted() {
    let _guard = serialize_test();
    let _scope = config::global()
        .scoped(&[
            ("nameserver_port", "17721"),
            ("address_publish_port", "17722"),
        ])
        .unwrap();

    let _nameserver = TestNameServer::start(Duration::from_millis(500));
    let advertisement = Message::new(
        "/address/evictee",
        "have_address",
        serde_json::json!({
            "URI": "tcp://127.0.0.1:9999",
            "service": ["evictsvc"],
            "status": true,
        })
        .into(),
    )
    .unwrap();

    let ack = request_raw(
        "tcp://localhost:17721",
        &advertisement.encode(),
        Duration::from_secs(2),
    )
    .unwrap();
    assert_eq!(ack, "ok");

    let records =
        get_pub_address("evictsvc", Duration::from_secs(2), "localhost").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["URI"], "tcp://127.0.0.1:9999");
    assert_eq!(records[0]["name"], "evictee");

    // A refresh of the same address must not create a duplicate.
    request_raw(
        "tcp://localhost:17721",
        &advertisement.encode(),
        Duration::from_secs(2),
    )
    .unwrap();
    let records =
        get_pub_address("evictsvc", Duration::from_secs(2), "localhost").unwrap();
    assert_eq!(records.len(), 1);

    // Past max-age the record is swept.
    thread::sleep(Duration::from_millis(1500));
    let records =
        get_pub_address("evictsvc", Duration::from_secs(2), "localhost").unwrap();
    assert!(records.is_empty(), "stale record not evicted: {records:?}");
}

#[test]
fn explicit_stop_advertisement_evicts_immediately() {
    let _guard = serialize_test();
    let _scope = config::global()
        .scoped(&[
            ("nameserver_port", "17731"),
            ("address_publish_port", "17732"),
        ])
        .unwrap();

    let _nameserver = TestNameServer::start(Duration::from_secs(30));
    let register = Message::new(
        "/address/shortlived",
        "have_address",
        serde_json::json!({"URI": "tcp://127.0.0.1:9998", "service": ["gone"], "status": true})
            .into(),
    )
    .unwrap();
    request_raw("tcp://localhost:17731", &register.encode(), Duration::from_secs(2)).unwrap();
    assert_eq!(
        get_pub_address("gone", Duration::from_secs(2), "localhost")
            .unwrap()
            .len(),
        1
    );

    let revoke = Message::new(
        "/address/shortlived",
        "stop_address",
        serde_json::json!({"URI": "tcp://127.0.0.1:9998", "service": ["gone"], "status": false})
            .into(),
    )
    .unwrap();
    request_raw("tcp://localhost:17731", &revoke.encode(), Duration::from_secs(2)).unwrap();
    assert!(get_pub_address("gone", Duration::from_secs(2), "localhost")
        .unwrap()
        .is_empty());
}

#[test]
fn concurrent_sends_arrive_intact() {
    let _guard = serialize_test();

    let publisher = Arc::new(Publisher::bind("tcp://127.0.0.1:0", "many").unwrap());
    let address = format!("tcp://127.0.0.1:{}", publisher.port());
    let subscriber = Subscriber::new(&[address], &[]).unwrap();

    // Wait for the connection to be picked up: probes flow once it is.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "subscriber never connected");
        let probe = Message::new("/probe", "info", MessageData::Empty).unwrap();
        publisher.send(&probe.encode()).unwrap();
        if subscriber
            .recv_timeout(Duration::from_millis(100))
            .unwrap()
            .is_some()
        {
            break;
        }
    }

    const THREADS: usize = 4;
    const PER_THREAD: usize = 25;
    let sent = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let publisher = Arc::clone(&publisher);
            let sent = Arc::clone(&sent);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let message =
                        Message::new(&format!("/data/{t}"), "info", format!("{t}:{i}").into())
                            .unwrap();
                    publisher.send(&message.encode()).unwrap();
                    sent.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(sent.load(Ordering::Relaxed), THREADS * PER_THREAD);

    let mut payloads = std::collections::HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while payloads.len() < THREADS * PER_THREAD && Instant::now() < deadline {
        match subscriber.recv_timeout(Duration::from_millis(500)).unwrap() {
            Some(message) if message.subject.starts_with("/data/") => {
                match message.data {
                    MessageData::Text(payload) => {
                        payloads.insert(payload);
                    }
                    other => panic!("garbled payload: {other:?}"),
                }
            }
            _ => {}
        }
    }
    assert_eq!(payloads.len(), THREADS * PER_THREAD, "messages lost or garbled");
}

#[test]
fn stopping_twice_is_safe_and_ports_are_released() {
    let _guard = serialize_test();
    let _scope = config::global()
        .scoped(&[
            ("nameserver_port", "17741"),
            ("address_publish_port", "17742"),
        ])
        .unwrap();

    {
        let nameserver = TestNameServer::start(Duration::from_secs(10));
        nameserver.nameserver.stop();
        nameserver.nameserver.stop();
    }
    // The ports are free again: a second nameserver can bind them.
    let _nameserver = TestNameServer::start(Duration::from_secs(10));
    let publisher = Publish::with_options("again", 0, &[], &["localhost:17741".to_string()]);
    assert!(publisher.is_ok());
}
