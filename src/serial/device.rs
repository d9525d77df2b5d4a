use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use super::config::{
    to_serialport_data_bits, to_serialport_flow_control, to_serialport_parity, to_serialport_stop_bits,
    PortConfig,
};
use super::{Result, SessionError};

/// Stand-in for "no timeout": long enough to behave as blocking, short enough for every backend
pub const BLOCKING_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Read-side timeout when none is configured; the reader only asks for bytes already buffered
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// One open serial device, or one direction of it after `try_clone`.
///
/// Implementations must tolerate a read on one clone concurrently with a
/// write on another.
pub trait SerialDevice: Send {
    /// Number of received bytes waiting in the input buffer
    fn bytes_to_read(&self) -> io::Result<u32>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer; `TimedOut` if the write timeout elapses first
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// True when `set_timeout` on one clone changes the timeouts of every clone
    fn shares_timeouts(&self) -> bool {
        false
    }

    /// Second handle onto the same device, used to split reads from writes
    fn try_clone(&self) -> io::Result<Box<dyn SerialDevice>>;
}

/// Acquires devices for a session
pub trait PortOpener: Send + Sync {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn SerialDevice>>;
}

/// Opens real ports through the `serialport` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOpener;

impl PortOpener for SystemPortOpener {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn SerialDevice>> {
        let stop_bits = to_serialport_stop_bits(config.stop_bits)?;
        let parity = to_serialport_parity(config.parity)?;

        let port = serialport::new(config.port_name.as_str(), config.baud_rate)
            .data_bits(to_serialport_data_bits(config.byte_size))
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(to_serialport_flow_control(config.flow_control))
            .timeout(config.write_timeout.unwrap_or(BLOCKING_TIMEOUT))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => {
                    SessionError::OpenFailed(format!("{}: device not found or busy ({})", config.port_name, e))
                }
                serialport::ErrorKind::InvalidInput => {
                    SessionError::OpenFailed(format!("{}: parameters rejected ({})", config.port_name, e))
                }
                _ => SessionError::OpenFailed(format!("{}: {}", config.port_name, e)),
            })?;

        log::debug!(
            "Opened {} at {} baud ({}, flow control: {})",
            config.port_name,
            config.baud_rate,
            config.line_summary(),
            if config.flow_control { "xon/xoff" } else { "off" }
        );

        Ok(Box::new(SystemDevice { port }))
    }
}

struct SystemDevice {
    port: Box<dyn SerialPort>,
}

impl SerialDevice for SystemDevice {
    fn bytes_to_read(&self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(io::Error::from)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::from)
    }

    // `try_clone` duplicates the COM handle and SetCommTimeouts applies to the device
    fn shares_timeouts(&self) -> bool {
        cfg!(windows)
    }

    fn try_clone(&self) -> io::Result<Box<dyn SerialDevice>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(SystemDevice { port }))
    }
}
