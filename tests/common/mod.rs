#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serial_term_lib::serial::loopback::LOOPBACK_PORT_NAME;
use serial_term_lib::serial::{LoopbackOpener, PortConfig, SerialSession};

pub fn loopback_config() -> PortConfig {
    PortConfig::new(LOOPBACK_PORT_NAME, 115200)
}

pub fn loopback_session() -> (SerialSession, LoopbackOpener) {
    let opener = LoopbackOpener::default();
    let session = SerialSession::with_opener(loopback_config(), Arc::new(opener.clone()));
    (session, opener)
}

/// Poll `cond` for up to two seconds
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
