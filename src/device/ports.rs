use serde::{Deserialize, Serialize};
use serialport::SerialPortType;

use crate::serial::Result;

/// An enumerated serial port and whatever the OS knows about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub port_name: String,
    pub port_type: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl PortInfo {
    fn from_serialport(port: serialport::SerialPortInfo) -> Self {
        let (port_type, vid, pid, serial_number, manufacturer, product) = match port.port_type {
            SerialPortType::UsbPort(usb) => (
                "USB",
                Some(usb.vid),
                Some(usb.pid),
                usb.serial_number,
                usb.manufacturer,
                usb.product,
            ),
            SerialPortType::BluetoothPort => ("Bluetooth", None, None, None, None, None),
            SerialPortType::PciPort => ("PCI", None, None, None, None, None),
            SerialPortType::Unknown => ("Unknown", None, None, None, None, None),
        };
        Self {
            port_name: port.port_name,
            port_type: port_type.to_string(),
            vid,
            pid,
            serial_number,
            manufacturer,
            product,
        }
    }

    /// One-line description for listings
    pub fn describe(&self) -> String {
        let mut line = format!("{} ({})", self.port_name, self.port_type);
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            line.push_str(&format!(" {:04x}:{:04x}", vid, pid));
        }
        let label: Vec<&str> = [self.manufacturer.as_deref(), self.product.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if !label.is_empty() {
            line.push_str(&format!(" {}", label.join(" ")));
        }
        line
    }
}

/// Keep only ports worth offering to a user
fn is_listed(_port_name: &str) -> bool {
    // On macOS the tty.* nodes block on open waiting for carrier detect; cu.* are the usable ones
    #[cfg(target_os = "macos")]
    {
        !_port_name.starts_with("/dev/tty.")
    }
    #[cfg(not(target_os = "macos"))]
    {
        true
    }
}

/// Enumerate ports with their USB metadata, sorted by name
pub fn discover_ports() -> Result<Vec<PortInfo>> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()?
        .into_iter()
        .filter(|p| is_listed(&p.port_name))
        .map(PortInfo::from_serialport)
        .collect();
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    log::debug!("Discovered {} serial ports", ports.len());
    Ok(ports)
}

/// Names usable as `PortConfig::port_name`
pub fn list_available_ports() -> Result<Vec<String>> {
    Ok(discover_ports()?.into_iter().map(|p| p.port_name).collect())
}
