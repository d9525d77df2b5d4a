// Line parameters for one open attempt and their mapping onto the serialport crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Result, SessionError};

pub const DEFAULT_BAUD_RATE: u32 = 9600;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

/// Data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteSize {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Serial communication parameters for one open attempt.
///
/// `flow_control` selects software (XON/XOFF) flow control. A missing
/// timeout means the corresponding direction may block indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub stop_bits: StopBits,
    pub byte_size: ByteSize,
    pub parity: Parity,
    pub flow_control: bool,
    #[serde(rename = "read_timeout_ms", with = "duration_ms")]
    pub read_timeout: Option<Duration>,
    #[serde(rename = "write_timeout_ms", with = "duration_ms")]
    pub write_timeout: Option<Duration>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            stop_bits: StopBits::One,
            byte_size: ByteSize::Eight,
            parity: Parity::None,
            flow_control: false,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl PortConfig {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Self::default()
        }
    }

    /// Caller-side validation; device-level rejections surface later as `OpenFailed`
    pub fn validate(&self) -> Result<()> {
        if self.port_name.trim().is_empty() {
            return Err(SessionError::InvalidConfig("port name is empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(SessionError::InvalidConfig("baud rate must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Parse a JSON document, filling unspecified fields with defaults
    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Short "8N1"-style line summary used in logs and status output
    pub fn line_summary(&self) -> String {
        let data = match self.byte_size {
            ByteSize::Five => '5',
            ByteSize::Six => '6',
            ByteSize::Seven => '7',
            ByteSize::Eight => '8',
        };
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        };
        let stop = match self.stop_bits {
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        };
        format!("{}{}{}", data, parity, stop)
    }
}

impl std::str::FromStr for StopBits {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "1" => Ok(StopBits::One),
            "1.5" => Ok(StopBits::OnePointFive),
            "2" => Ok(StopBits::Two),
            other => Err(format!("unsupported stop bits: {}", other)),
        }
    }
}

impl TryFrom<u8> for ByteSize {
    type Error = String;

    fn try_from(bits: u8) -> std::result::Result<Self, Self::Error> {
        match bits {
            5 => Ok(ByteSize::Five),
            6 => Ok(ByteSize::Six),
            7 => Ok(ByteSize::Seven),
            8 => Ok(ByteSize::Eight),
            other => Err(format!("unsupported byte size: {}", other)),
        }
    }
}

impl std::str::FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "odd" | "o" => Ok(Parity::Odd),
            "even" | "e" => Ok(Parity::Even),
            "mark" | "m" => Ok(Parity::Mark),
            "space" | "s" => Ok(Parity::Space),
            other => Err(format!("unsupported parity: {}", other)),
        }
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Stop bits as understood by the serialport crate; 1.5 has no equivalent there
pub fn to_serialport_stop_bits(bits: StopBits) -> Result<serialport::StopBits> {
    match bits {
        StopBits::One => Ok(serialport::StopBits::One),
        StopBits::Two => Ok(serialport::StopBits::Two),
        StopBits::OnePointFive => Err(SessionError::OpenFailed(
            "1.5 stop bits are not supported by this platform backend".to_string(),
        )),
    }
}

pub fn to_serialport_data_bits(size: ByteSize) -> serialport::DataBits {
    match size {
        ByteSize::Five => serialport::DataBits::Five,
        ByteSize::Six => serialport::DataBits::Six,
        ByteSize::Seven => serialport::DataBits::Seven,
        ByteSize::Eight => serialport::DataBits::Eight,
    }
}

/// Parity as understood by the serialport crate; mark/space have no equivalent there
pub fn to_serialport_parity(parity: Parity) -> Result<serialport::Parity> {
    match parity {
        Parity::None => Ok(serialport::Parity::None),
        Parity::Odd => Ok(serialport::Parity::Odd),
        Parity::Even => Ok(serialport::Parity::Even),
        Parity::Mark | Parity::Space => Err(SessionError::OpenFailed(format!(
            "{:?} parity is not supported by this platform backend",
            parity
        ))),
    }
}

pub fn to_serialport_flow_control(enabled: bool) -> serialport::FlowControl {
    if enabled {
        serialport::FlowControl::Software
    } else {
        serialport::FlowControl::None
    }
}

/// Optional durations as integer milliseconds in JSON
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_terminal_settings() {
        let config = PortConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.byte_size, ByteSize::Eight);
        assert_eq!(config.parity, Parity::None);
        assert!(!config.flow_control);
        assert!(config.read_timeout.is_none());
        assert!(config.write_timeout.is_none());
        assert_eq!(config.line_summary(), "8N1");
    }

    #[test]
    fn test_validate_rejects_empty_port_name() {
        let config = PortConfig::new("   ", 115200);
        assert!(matches!(config.validate(), Err(SessionError::InvalidConfig(_))));

        let config = PortConfig::new("/dev/ttyUSB0", 0);
        assert!(matches!(config.validate(), Err(SessionError::InvalidConfig(_))));

        assert!(PortConfig::new("COM3", 115200).validate().is_ok());
    }

    #[test]
    fn test_json_uses_millisecond_timeouts() {
        let config = PortConfig::from_json(
            r#"{"port_name": "COM4", "baud_rate": 57600, "parity": "even", "write_timeout_ms": 250}"#,
        )
        .expect("parse");
        assert_eq!(config.port_name, "COM4");
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.byte_size, ByteSize::Eight);
        assert_eq!(config.write_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.read_timeout, None);

        let json = serde_json::to_value(&config).expect("serialize");
        assert_eq!(json["write_timeout_ms"], 250);
        assert!(json["read_timeout_ms"].is_null());
    }

    #[test]
    fn test_parse_line_settings() {
        assert_eq!("1.5".parse::<StopBits>(), Ok(StopBits::OnePointFive));
        assert!("3".parse::<StopBits>().is_err());
        assert_eq!("Mark".parse::<Parity>(), Ok(Parity::Mark));
        assert_eq!(ByteSize::try_from(7), Ok(ByteSize::Seven));
        assert!(ByteSize::try_from(9).is_err());
    }

    #[test]
    fn test_unsupported_backend_settings_fail_open() {
        assert!(matches!(
            to_serialport_stop_bits(StopBits::OnePointFive),
            Err(SessionError::OpenFailed(_))
        ));
        assert!(matches!(to_serialport_parity(Parity::Space), Err(SessionError::OpenFailed(_))));
        assert!(matches!(to_serialport_parity(Parity::Odd), Ok(serialport::Parity::Odd)));
        assert!(matches!(to_serialport_flow_control(true), serialport::FlowControl::Software));
        assert!(matches!(to_serialport_data_bits(ByteSize::Five), serialport::DataBits::Five));
    }
}
