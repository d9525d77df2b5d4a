use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use super::config::PortConfig;
use super::device::{PortOpener, SerialDevice, SystemPortOpener, DEFAULT_READ_TIMEOUT};
use super::reader::{self, lock, Callbacks, ReaderContext};
use super::{Result, SessionError};

pub const READER_THREAD_NAME: &str = "serial-reader";

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Closed = 0,
    Open = 1,
    Closing = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Snapshot for status displays, built without touching the device
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub port_name: String,
    pub baud_rate: u32,
    pub line: String,
    pub state: SessionState,
    pub bytes_received_total: u64,
    pub device_gone: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Reader output forwarded through `SerialSession::event_channel`
#[derive(Debug)]
pub enum SessionEvent {
    Data(Vec<u8>),
    Error(SessionError),
}

/// A running reader and the stop flag that belongs to it alone
struct ReaderHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Owner of one serial device and its background reader.
///
/// All methods take `&self`; the session can be shared behind an `Arc`
/// between a writer and whoever drives the lifecycle.
pub struct SerialSession {
    opener: Arc<dyn PortOpener>,
    config: Mutex<PortConfig>,
    state: AtomicU8,
    // Serializes open/close; holds the reader while open
    lifecycle: Mutex<Option<ReaderHandle>>,
    // Write direction; close takes it under the same lock `send` writes under
    writer: Mutex<Option<Box<dyn SerialDevice>>>,
    fault: Arc<Mutex<Option<String>>>,
    bytes_received: Arc<AtomicU64>,
    callbacks: Arc<Callbacks>,
    opened_at: Mutex<Option<DateTime<Utc>>>,
}

impl SerialSession {
    /// Session over real serial ports
    pub fn new(config: PortConfig) -> Self {
        Self::with_opener(config, Arc::new(SystemPortOpener))
    }

    pub fn with_opener(config: PortConfig, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            opener,
            config: Mutex::new(config),
            state: AtomicU8::new(SessionState::Closed as u8),
            lifecycle: Mutex::new(None),
            writer: Mutex::new(None),
            fault: Arc::new(Mutex::new(None)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            callbacks: Arc::new(Callbacks::default()),
            opened_at: Mutex::new(None),
        }
    }

    /// Open the device described by `config` and start the reader.
    ///
    /// An already open session is closed first. On error the session is
    /// left closed with no handle and no reader.
    pub fn open(&self, config: PortConfig) -> Result<()> {
        config.validate()?;

        let mut reader_slot = lock(&self.lifecycle);
        self.close_locked(&mut reader_slot);

        let device = self.opener.open(&config)?;
        let mut read_half = device
            .try_clone()
            .map_err(|e| SessionError::OpenFailed(format!("{}: cannot split handle: {}", config.port_name, e)))?;
        if read_half.shares_timeouts() {
            log::debug!(
                "{}: timeouts are device-wide, keeping the write timeout for the reader",
                config.port_name
            );
        } else {
            read_half
                .set_timeout(config.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT))
                .map_err(|e| SessionError::OpenFailed(format!("{}: {}", config.port_name, e)))?;
        }

        *lock(&self.fault) = None;
        // One flag per open; a reader orphaned by a close from its own callback stays stopped
        let stop = Arc::new(AtomicBool::new(true));

        let ctx = ReaderContext {
            port_name: config.port_name.clone(),
            device: read_half,
            running: stop.clone(),
            bytes_received: self.bytes_received.clone(),
            fault: self.fault.clone(),
            callbacks: self.callbacks.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("{}:{}", READER_THREAD_NAME, config.port_name))
            .spawn(move || reader::run(ctx))
            .map_err(|e: io::Error| {
                SessionError::OpenFailed(format!("{}: cannot start reader: {}", config.port_name, e))
            })?;

        *lock(&self.writer) = Some(device);
        *reader_slot = Some(ReaderHandle { stop, thread: handle });
        *lock(&self.opened_at) = Some(Utc::now());
        log::info!(
            "Opened {} at {} baud ({})",
            config.port_name,
            config.baud_rate,
            config.line_summary()
        );
        *lock(&self.config) = config;
        self.set_state(SessionState::Open);
        Ok(())
    }

    /// Stop the reader, wait for it to exit, then release the device. No-op when closed.
    pub fn close(&self) {
        let mut reader_slot = lock(&self.lifecycle);
        self.close_locked(&mut reader_slot);
    }

    fn close_locked(&self, reader_slot: &mut Option<ReaderHandle>) {
        let reader = reader_slot.take();
        if reader.is_none() && lock(&self.writer).is_none() {
            return;
        }

        self.set_state(SessionState::Closing);

        if let Some(ReaderHandle { stop, thread: handle }) = reader {
            stop.store(false, Ordering::SeqCst);
            if handle.thread().id() == thread::current().id() {
                // Called from a callback; the loop exits as soon as the callback returns
                log::warn!("close() called from the reader thread; not waiting for it");
            } else if handle.join().is_err() {
                log::error!("Reader thread panicked");
            }
        }

        // Blocks until any in-flight send has finished with the handle
        let device = lock(&self.writer).take();
        drop(device);

        *lock(&self.opened_at) = None;
        self.set_state(SessionState::Closed);
        log::info!("Closed {}", lock(&self.config).port_name);
    }

    /// Write `data` as one independent write.
    ///
    /// Concurrent callers are not ordered relative to each other.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let mut writer = lock(&self.writer);
        let device = writer.as_mut().ok_or(SessionError::NotOpen)?;
        if let Some(reason) = lock(&self.fault).clone() {
            return Err(SessionError::DeviceGone(reason));
        }
        if data.is_empty() {
            return Ok(());
        }
        device.write_all(data).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => SessionError::WriteTimeout,
            _ => SessionError::Io(e),
        })
    }

    /// Register the consumer for received bytes, replacing any previous one.
    ///
    /// Runs on the reader thread, once per read, in device order.
    pub fn on_data<F>(&self, callback: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        *lock(&self.callbacks.data) = Some(Box::new(callback));
    }

    /// Register the consumer for asynchronous failures (`DeviceGone`), replacing any previous one
    pub fn on_error<F>(&self, callback: F)
    where
        F: FnMut(SessionError) + Send + 'static,
    {
        *lock(&self.callbacks.error) = Some(Box::new(callback));
    }

    /// Route both callbacks into a channel for async consumers
    pub fn event_channel(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let data_tx = tx.clone();
        self.on_data(move |bytes| {
            let _ = data_tx.send(SessionEvent::Data(bytes.to_vec()));
        });
        self.on_error(move |err| {
            let _ = tx.send(SessionEvent::Error(err));
        });
        rx
    }

    pub fn bytes_received_total(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Reason the reader stopped on its own, if it did
    pub fn device_gone(&self) -> Option<String> {
        lock(&self.fault).clone()
    }

    /// Configuration of the current (or most recent) open
    pub fn config(&self) -> PortConfig {
        lock(&self.config).clone()
    }

    pub fn status(&self) -> SessionStatus {
        let config = self.config();
        SessionStatus {
            line: config.line_summary(),
            port_name: config.port_name,
            baud_rate: config.baud_rate,
            state: self.state(),
            bytes_received_total: self.bytes_received_total(),
            device_gone: self.device_gone(),
            opened_at: *lock(&self.opened_at),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl Default for SerialSession {
    fn default() -> Self {
        Self::new(PortConfig::default())
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SerialSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialSession")
            .field("port_name", &lock(&self.config).port_name)
            .field("state", &self.state())
            .field("bytes_received_total", &self.bytes_received_total())
            .finish()
    }
}
