mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{loopback_config, loopback_session, wait_for};
use serial_term_lib::serial::{SessionError, SessionEvent};

fn collect_data(session: &serial_term_lib::serial::SerialSession) -> (Arc<Mutex<Vec<u8>>>, Arc<Mutex<usize>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(Mutex::new(0usize));
    let (r, c) = (received.clone(), calls.clone());
    session.on_data(move |bytes| {
        r.lock().unwrap().extend_from_slice(bytes);
        *c.lock().unwrap() += 1;
    });
    (received, calls)
}

#[test]
fn test_ping_is_echoed() {
    let (session, _opener) = loopback_session();
    let (received, _) = collect_data(&session);
    session.open(loopback_config()).expect("open");

    session.send(b"ping").expect("send");
    assert!(wait_for(|| received.lock().unwrap().as_slice() == b"ping"));
    assert_eq!(session.bytes_received_total(), 4);
}

#[test]
fn test_sends_arrive_in_order_without_duplicates() {
    let (session, opener) = loopback_session();
    let (received, calls) = collect_data(&session);
    session.open(loopback_config()).expect("open");

    session.send(b"ABC").expect("send ABC");
    session.send(b"D").expect("send D");

    assert!(wait_for(|| received.lock().unwrap().len() >= 4));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(received.lock().unwrap().as_slice(), b"ABCD");
    assert!(*calls.lock().unwrap() >= 1);
    assert_eq!(opener.written(), b"ABCD");
}

#[test]
fn test_counter_matches_bytes_delivered() {
    let (session, opener) = loopback_session();
    let (received, calls) = collect_data(&session);
    session.open(loopback_config()).expect("open");

    let mut expected = Vec::new();
    for i in 0..50u8 {
        let chunk = vec![i; (i as usize % 7) + 1];
        opener.inject(&chunk);
        expected.extend_from_slice(&chunk);
        if i % 10 == 0 {
            thread::sleep(Duration::from_millis(3));
        }
    }

    assert!(wait_for(|| received.lock().unwrap().len() == expected.len()));
    assert_eq!(*received.lock().unwrap(), expected);
    assert_eq!(session.bytes_received_total(), expected.len() as u64);
    assert!(*calls.lock().unwrap() <= expected.len());
}

#[test]
fn test_counter_survives_reopen() {
    let (session, opener) = loopback_session();
    session.open(loopback_config()).expect("open");
    opener.inject(b"abc");
    assert!(wait_for(|| session.bytes_received_total() == 3));

    session.close();
    session.open(loopback_config()).expect("reopen");
    opener.inject(b"de");
    assert!(wait_for(|| session.bytes_received_total() == 5));
}

#[test]
fn test_replacing_data_callback() {
    let (session, opener) = loopback_session();
    let (first, _) = collect_data(&session);
    session.open(loopback_config()).expect("open");

    opener.inject(b"one");
    assert!(wait_for(|| first.lock().unwrap().len() == 3));

    let (second, _) = collect_data(&session);
    opener.inject(b"two");
    assert!(wait_for(|| second.lock().unwrap().len() == 3));
    assert_eq!(first.lock().unwrap().as_slice(), b"one");
    assert_eq!(second.lock().unwrap().as_slice(), b"two");
}

#[test]
fn test_write_timeout_is_reported() {
    let (session, opener) = loopback_session();
    session.open(loopback_config()).expect("open");
    opener.set_stall_writes(true);

    let err = session.send(b"x").expect_err("stalled");
    assert!(matches!(err, SessionError::WriteTimeout));
    assert!(err.is_transient());
    assert!(session.is_open());
}

#[test]
fn test_concurrent_send_and_close() {
    let (session, opener) = loopback_session();
    opener.set_echo(false);
    let session = Arc::new(session);
    session.open(loopback_config()).expect("open");

    let writer = {
        let session = session.clone();
        thread::spawn(move || {
            let mut sent = 0usize;
            loop {
                match session.send(b"z") {
                    Ok(()) => sent += 1,
                    Err(SessionError::NotOpen) => return sent,
                    Err(e) => panic!("unexpected send error: {:?}", e),
                }
            }
        })
    };

    thread::sleep(Duration::from_millis(20));
    session.close();
    let sent = writer.join().expect("writer thread");

    assert_eq!(opener.written().len(), sent, "every successful send completed before release");
    assert_eq!(opener.live_handles(), 0);
}

#[tokio::test]
async fn test_event_channel_delivers_data() {
    let (session, opener) = loopback_session();
    let mut events = session.event_channel();
    session.open(loopback_config()).expect("open");
    opener.inject(b"hello");

    let mut collected = Vec::new();
    while collected.len() < 5 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        match event {
            SessionEvent::Data(bytes) => collected.extend_from_slice(&bytes),
            SessionEvent::Error(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(collected, b"hello");
}
