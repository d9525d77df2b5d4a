//! Background read loop owned by an open `SerialSession`.
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::device::SerialDevice;
use super::SessionError;

/// Sleep between polls when the device has nothing buffered
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Upper bound on a single read; anything beyond is picked up on the next pass without sleeping
pub const MAX_READ_CHUNK: usize = 64 * 1024;

pub(crate) type DataCallback = Box<dyn FnMut(&[u8]) + Send>;
pub(crate) type ErrorCallback = Box<dyn FnMut(SessionError) + Send>;

/// Consumer slots shared between the session and its reader; at most one of each
#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) data: Mutex<Option<DataCallback>>,
    pub(crate) error: Mutex<Option<ErrorCallback>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct ReaderContext {
    pub(crate) port_name: String,
    pub(crate) device: Box<dyn SerialDevice>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) bytes_received: Arc<AtomicU64>,
    pub(crate) fault: Arc<Mutex<Option<String>>>,
    pub(crate) callbacks: Arc<Callbacks>,
}

fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Poll the device until `running` drops or the device fails.
///
/// The device handle is dropped when this returns, so joining the thread
/// guarantees no further access to it.
pub(crate) fn run(mut ctx: ReaderContext) {
    log::debug!("Reader started for {}", ctx.port_name);
    let mut buf: Vec<u8> = Vec::new();
    let mut deliveries: u64 = 0;

    while ctx.running.load(Ordering::SeqCst) {
        let available = match ctx.device.bytes_to_read() {
            Ok(n) => n as usize,
            Err(e) => {
                report_failure(&ctx, e);
                break;
            }
        };
        if available == 0 {
            thread::sleep(POLL_INTERVAL);
            continue;
        }

        buf.resize(available.min(MAX_READ_CHUNK), 0);
        match ctx.device.read(&mut buf) {
            Ok(0) => thread::sleep(POLL_INTERVAL),
            Ok(n) => {
                deliver(&ctx, &buf[..n]);
                deliveries += 1;
            }
            Err(ref e) if is_benign(e) => {}
            Err(e) => {
                report_failure(&ctx, e);
                break;
            }
        }
    }

    log::debug!(
        "Reader for {} exiting after {} deliveries ({} bytes total)",
        ctx.port_name,
        deliveries,
        ctx.bytes_received.load(Ordering::SeqCst)
    );
}

fn deliver(ctx: &ReaderContext, data: &[u8]) {
    ctx.bytes_received.fetch_add(data.len() as u64, Ordering::SeqCst);
    if let Some(callback) = lock(&ctx.callbacks.data).as_mut() {
        callback(data);
    }
}

fn report_failure(ctx: &ReaderContext, err: io::Error) {
    // A failure racing a user close is not a device loss
    if !ctx.running.load(Ordering::SeqCst) {
        log::debug!("Ignoring read error on {} during close: {}", ctx.port_name, err);
        return;
    }
    let reason = format!("{}: {}", ctx.port_name, err);
    log::warn!("Device lost, stopping reader: {}", reason);
    *lock(&ctx.fault) = Some(reason.clone());
    if let Some(callback) = lock(&ctx.callbacks.error).as_mut() {
        callback(SessionError::DeviceGone(reason));
    }
}
