//! In-memory loopback device.
//!
//! Everything written is echoed back to the read side, like a serial
//! adapter with TX wired to RX. The opener doubles as a controller for
//! tests: it can inject device-originated bytes, stall writes, simulate
//! the device being unplugged, and report how many handles are alive.
//! The timeout is one setting for the whole port, as on a real adapter
//! where every handle shares the driver's timeouts.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::config::PortConfig;
use super::device::{PortOpener, SerialDevice, BLOCKING_TIMEOUT};
use super::{Result, SessionError};

pub const LOOPBACK_PORT_NAME: &str = "loop0";

#[derive(Default)]
struct LoopbackState {
    rx: VecDeque<u8>,
    written: Vec<u8>,
    gone: bool,
    stall_writes: bool,
    echo_disabled: bool,
    timeout: Option<Duration>,
    shared_timeouts: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<LoopbackState>,
    live_handles: AtomicUsize,
    opens: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Opener and controller for a single loopback port
#[derive(Clone)]
pub struct LoopbackOpener {
    port_name: String,
    shared: Arc<Shared>,
}

impl LoopbackOpener {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Queue bytes as if the device had sent them
    pub fn inject(&self, data: &[u8]) {
        self.shared.lock().rx.extend(data.iter().copied());
    }

    /// Simulate the device disappearing; every handle starts failing
    pub fn disconnect(&self) {
        self.shared.lock().gone = true;
    }

    /// Plug the device back in so it can be opened again
    pub fn reconnect(&self) {
        let mut state = self.shared.lock();
        state.gone = false;
        state.rx.clear();
    }

    /// Make every write fail with a timeout until cleared
    pub fn set_stall_writes(&self, stall: bool) {
        self.shared.lock().stall_writes = stall;
    }

    /// Stop echoing writes back to the read side
    pub fn set_echo(&self, echo: bool) {
        self.shared.lock().echo_disabled = !echo;
    }

    /// Report timeouts as device-wide, the way Windows COM handles behave
    pub fn set_shared_timeouts(&self, shared: bool) {
        self.shared.lock().shared_timeouts = shared;
    }

    /// Timeout currently applied to the port
    pub fn timeout(&self) -> Duration {
        self.shared.lock().timeout.unwrap_or(BLOCKING_TIMEOUT)
    }

    /// Every byte successfully written so far, in write order
    pub fn written(&self) -> Vec<u8> {
        self.shared.lock().written.clone()
    }

    /// Device handles currently alive (opened or cloned, not yet dropped)
    pub fn live_handles(&self) -> usize {
        self.shared.live_handles.load(Ordering::SeqCst)
    }

    /// How many times the port has been successfully opened
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackOpener {
    fn default() -> Self {
        Self::new(LOOPBACK_PORT_NAME)
    }
}

impl PortOpener for LoopbackOpener {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn SerialDevice>> {
        if config.port_name != self.port_name {
            return Err(SessionError::OpenFailed(format!("{}: no such device", config.port_name)));
        }
        {
            let mut state = self.shared.lock();
            if state.gone {
                return Err(SessionError::OpenFailed(format!("{}: device unavailable", config.port_name)));
            }
            state.timeout = config.write_timeout;
        }
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackDevice::attach(self.shared.clone())))
    }
}

/// A live handle onto the loopback port
pub struct LoopbackDevice {
    shared: Arc<Shared>,
}

impl LoopbackDevice {
    fn attach(shared: Arc<Shared>) -> Self {
        shared.live_handles.fetch_add(1, Ordering::SeqCst);
        Self { shared }
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        self.shared.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

fn device_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "loopback device removed")
}

impl SerialDevice for LoopbackDevice {
    fn bytes_to_read(&self) -> io::Result<u32> {
        let state = self.shared.lock();
        if state.gone {
            return Err(device_gone());
        }
        Ok(u32::try_from(state.rx.len()).unwrap_or(u32::MAX))
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.shared.lock();
        if state.gone {
            return Err(device_gone());
        }
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.shared.lock();
        if state.gone {
            return Err(device_gone());
        }
        if state.stall_writes {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write stalled"));
        }
        state.written.extend_from_slice(data);
        if !state.echo_disabled {
            state.rx.extend(data.iter().copied());
        }
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.shared.lock().timeout = Some(timeout);
        Ok(())
    }

    fn shares_timeouts(&self) -> bool {
        self.shared.lock().shared_timeouts
    }

    fn try_clone(&self) -> io::Result<Box<dyn SerialDevice>> {
        if self.shared.lock().gone {
            return Err(device_gone());
        }
        Ok(Box::new(LoopbackDevice::attach(self.shared.clone())))
    }
}
