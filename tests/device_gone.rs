mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{loopback_config, loopback_session, wait_for};
use serial_term_lib::serial::{SessionError, SessionEvent, SessionState};

#[test]
fn test_device_removal_reports_once() {
    let (session, opener) = loopback_session();
    let errors: Arc<Mutex<Vec<SessionError>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    session.on_error(move |err| sink.lock().unwrap().push(err));
    session.open(loopback_config()).expect("open");

    opener.disconnect();
    assert!(wait_for(|| !errors.lock().unwrap().is_empty()));
    thread::sleep(Duration::from_millis(30));

    {
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1, "DeviceGone must fire exactly once");
        assert!(matches!(errors[0], SessionError::DeviceGone(_)));
    }
    assert!(session.device_gone().is_some());
    // reader has exited and released its clone; the write handle waits for close
    assert_eq!(opener.live_handles(), 1);
    assert_eq!(session.state(), SessionState::Open);

    assert!(matches!(session.send(b"x"), Err(SessionError::DeviceGone(_))));

    session.close();
    assert_eq!(opener.live_handles(), 0);
    assert!(matches!(session.send(b"x"), Err(SessionError::NotOpen)));
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[test]
fn test_reopen_after_device_returns() {
    let (session, opener) = loopback_session();
    session.open(loopback_config()).expect("open");
    opener.disconnect();
    assert!(wait_for(|| session.device_gone().is_some()));
    session.close();

    assert!(matches!(session.open(loopback_config()), Err(SessionError::OpenFailed(_))));
    assert_eq!(session.state(), SessionState::Closed);

    opener.reconnect();
    session.open(loopback_config()).expect("reopen");
    assert!(session.device_gone().is_none());
    session.send(b"back").expect("send after reopen");
    assert!(wait_for(|| session.bytes_received_total() == 4));
}

#[test]
fn test_user_close_is_not_device_loss() {
    let (session, _opener) = loopback_session();
    let fired = Arc::new(Mutex::new(0usize));
    let counter = fired.clone();
    session.on_error(move |_| *counter.lock().unwrap() += 1);

    session.open(loopback_config()).expect("open");
    session.close();
    thread::sleep(Duration::from_millis(20));

    assert_eq!(*fired.lock().unwrap(), 0);
    assert!(session.device_gone().is_none());
}

#[tokio::test]
async fn test_device_gone_through_event_channel() {
    let (session, opener) = loopback_session();
    let mut events = session.event_channel();
    session.open(loopback_config()).expect("open");
    opener.disconnect();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("channel open");
    assert!(matches!(event, SessionEvent::Error(SessionError::DeviceGone(_))));
    session.close();
}
