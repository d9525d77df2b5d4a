pub mod config;
pub mod device;
pub mod loopback;
pub mod reader;
pub mod session;

pub use config::{ByteSize, Parity, PortConfig, StopBits};
pub use device::{PortOpener, SerialDevice, SystemPortOpener};
pub use loopback::{LoopbackDevice, LoopbackOpener};
pub use session::{SerialSession, SessionEvent, SessionState, SessionStatus};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid port configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to open port: {0}")]
    OpenFailed(String),

    #[error("Session is not open")]
    NotOpen,

    #[error("Write timed out")]
    WriteTimeout,

    #[error("Device gone: {0}")]
    DeviceGone(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Port enumeration failed: {0}")]
    Enumeration(#[from] serialport::Error),
}

impl SessionError {
    /// True for failures the caller may simply retry (currently only write timeouts)
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::WriteTimeout)
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
